//! SSH server glue built on `russh`.
//!
//! The listener accepts TCP connections and runs the SSH handshake for each
//! one in its own task, so a failing connection never affects the listener or
//! any other connection.
//!
//! # Connection flow
//!
//! 1. Every authentication method is accepted; the SSH username names the
//!    target container.
//! 2. Once authenticated, the [`ProviderFactory`] builds the connection's
//!    backend and a [`Bridge`] is spawned for it.
//! 3. russh callbacks are translated into the bridge's inputs: channel opens
//!    become [`NewChannel`]s, channel requests are queued on the channel's
//!    request stream in arrival order, and global requests go to the bridge's
//!    global request loop.
//! 4. Exit statuses and channel closes travel back through the russh session
//!    [`Handle`].
//!
//! # Request replies
//!
//! russh remembers only whether the *latest* request on a channel wanted a
//! reply, and checks that flag when `channel_success`/`channel_failure` is
//! sent. Each request callback therefore waits for its own outcome and
//! answers through the [`Session`] before returning, so the next request
//! cannot take over its reply. The wait is bounded by
//! [`REQUEST_REPLY_TIMEOUT`]; a request still pending after that is answered
//! with failure. `window-change` never carries a reply and is queued without
//! waiting.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::PrivateKey;
use russh::server::{self, Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, Pty};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{Instrument, Span, debug, info, info_span, warn};
use uuid::Uuid;

use super::channel::{
    Bridge, ChannelControl, ChannelOpen, GlobalRequest, NewChannel, Transport,
};
use super::config::{BridgeConfig, SshdConfig};
use super::error::{BridgeError, SshdError};
use super::provider::{ExecIo, ProviderFactory};
use super::request::{
    ChannelRequest, DirectTcpip, PtyRequest, SessionRequest, WindowChange,
};

/// Pending channel opens and global requests buffered per connection.
const CONNECTION_BACKLOG: usize = 16;

/// Longest a request callback waits for the channel to process the request.
pub const REQUEST_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Load the server's host key (OpenSSH private key format).
pub fn load_host_key(path: &Path) -> Result<PrivateKey, SshdError> {
    info!("Loading host key from {}", path.display());
    Ok(russh::keys::load_secret_key(path, None)?)
}

/// russh server settings.
///
/// A zero `inactivity_timeout` disables the idle timeout.
pub fn server_config(keys: Vec<PrivateKey>, inactivity_timeout: Duration) -> server::Config {
    server::Config {
        inactivity_timeout: (!inactivity_timeout.is_zero()).then_some(inactivity_timeout),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys,
        ..Default::default()
    }
}

/// Bind the configured address and serve connections forever.
pub async fn run_server(
    config: &SshdConfig,
    factory: Arc<dyn ProviderFactory>,
) -> Result<(), SshdError> {
    let key = load_host_key(&config.host_key_path)?;
    let russh_config = Arc::new(server_config(vec![key], config.inactivity_timeout));
    let bridge_config = Arc::new(config.bridge_config());

    let listener = TcpListener::bind(config.listen_address()).await?;
    info!("container-sshd listening on {}", listener.local_addr()?);

    serve(listener, russh_config, factory, bridge_config).await
}

/// Accept connections on `listener` until the process exits.
pub async fn serve(
    listener: TcpListener,
    russh_config: Arc<server::Config>,
    factory: Arc<dyn ProviderFactory>,
    bridge_config: Arc<BridgeConfig>,
) -> Result<(), SshdError> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let handler = ConnectionHandler::new(Some(peer), factory.clone(), bridge_config.clone());
        let span = handler.span();
        let russh_config = russh_config.clone();

        tokio::spawn(
            async move {
                debug!("Accepted connection");
                match server::run_stream(russh_config, stream, handler).await {
                    Ok(session) => match session.await {
                        Ok(()) => info!("Connection closed"),
                        Err(e) => warn!("SSH session error: {}", e),
                    },
                    Err(e) => warn!("Failed to establish ssh connection: {}", e),
                }
            }
            .instrument(span),
        );
    }
}

/// [`ChannelControl`] over a russh session handle.
struct RusshChannel {
    handle: Handle,
    id: ChannelId,
}

#[async_trait]
impl ChannelControl for RusshChannel {
    async fn send_exit_status(&self, exit_status: u32) -> Result<(), BridgeError> {
        self.handle
            .exit_status_request(self.id, exit_status)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }

    async fn close(&self) -> Result<(), BridgeError> {
        let _ = self.handle.eof(self.id).await;
        self.handle
            .close(self.id)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

/// [`Transport`] over a russh session handle.
struct RusshTransport {
    handle: Handle,
}

#[async_trait]
impl Transport for RusshTransport {
    async fn close(&self) -> Result<(), BridgeError> {
        self.handle
            .disconnect(
                Disconnect::ByApplication,
                "connection closed by server".into(),
                "en".into(),
            )
            .await
            .map_err(|_| BridgeError::ConnectionClosed)
    }
}

/// Per-connection russh handler.
pub struct ConnectionHandler {
    span: Span,
    user: Option<String>,
    factory: Arc<dyn ProviderFactory>,
    bridge_config: Arc<BridgeConfig>,
    channels: Option<mpsc::Sender<NewChannel>>,
    global_requests: Option<mpsc::Sender<GlobalRequest>>,
    requests: HashMap<ChannelId, mpsc::UnboundedSender<ChannelRequest>>,
}

impl ConnectionHandler {
    pub fn new(
        peer: Option<SocketAddr>,
        factory: Arc<dyn ProviderFactory>,
        bridge_config: Arc<BridgeConfig>,
    ) -> Self {
        let id = Uuid::new_v4();
        let span = info_span!(
            "connection",
            id = %id,
            peer = ?peer,
            user = tracing::field::Empty
        );
        Self {
            span,
            user: None,
            factory,
            bridge_config,
            channels: None,
            global_requests: None,
            requests: HashMap::new(),
        }
    }

    /// Span covering this connection's log records.
    pub fn span(&self) -> Span {
        self.span.clone()
    }

    fn accept_user(&mut self, user: &str) -> Auth {
        self.span.record("user", user);
        self.user = Some(user.to_string());
        Auth::Accept
    }

    /// Build the backend for the authenticated user and spawn the bridge.
    fn start_bridge(&mut self, transport: Arc<dyn Transport>) -> Result<(), SshdError> {
        let user = self.user.clone().unwrap_or_default();
        let provider = self.factory.create(&user)?;

        let (channels_tx, channels_rx) = mpsc::channel(CONNECTION_BACKLOG);
        let (global_tx, global_rx) = mpsc::channel(CONNECTION_BACKLOG);
        let mut bridge = Bridge::new(
            transport,
            channels_rx,
            global_rx,
            provider,
            self.bridge_config.clone(),
        );
        tokio::spawn(async move { bridge.start().await }.instrument(self.span.clone()));

        self.channels = Some(channels_tx);
        self.global_requests = Some(global_tx);
        info!("Bridging connection to container [{}]", user);
        Ok(())
    }

    /// Offer a channel to the bridge; returns its request stream if accepted.
    async fn open_channel(
        &self,
        label: String,
        open: ChannelOpen,
        io: ExecIo,
        control: Arc<dyn ChannelControl>,
    ) -> Option<mpsc::UnboundedSender<ChannelRequest>> {
        let Some(channels) = &self.channels else {
            warn!("Channel open before the connection was bridged");
            return None;
        };

        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (channel, decision) = NewChannel::new(label, open, io, control, requests_rx);
        if channels.send(channel).await.is_err() {
            return None;
        }

        match decision.await {
            Ok(Ok(())) => Some(requests),
            Ok(Err(e)) => {
                info!("Channel open refused: {}", e);
                None
            }
            Err(_) => None,
        }
    }

    async fn accept_channel(
        &mut self,
        channel: Channel<Msg>,
        open: ChannelOpen,
        session: &mut Session,
    ) -> bool {
        let id = channel.id();
        let control = Arc::new(RusshChannel {
            handle: session.handle(),
            id,
        });
        let io = ExecIo::from_stream(channel.into_stream());

        match self.open_channel(format!("{:?}", id), open, io, control).await {
            Some(requests) => {
                self.requests.insert(id, requests);
                true
            }
            None => false,
        }
    }

    /// Ask the bridge's global request loop for an answer.
    async fn global_request(&self, kind: &str) -> bool {
        let Some(global) = &self.global_requests else {
            return false;
        };
        let (request, reply) = GlobalRequest::new(kind, true);
        if global.send(request).await.is_err() {
            return false;
        }
        reply.await.unwrap_or(false)
    }

    /// Queue a request on its channel and answer it once the channel is done
    /// with it. Unknown channels get a failure.
    async fn forward_request(&self, id: ChannelId, request: SessionRequest, session: &mut Session) {
        let success = self.process_request(id, request).await;
        let answered = if success {
            session.channel_success(id)
        } else {
            session.channel_failure(id)
        };
        if let Err(e) = answered {
            debug!("Could not answer request on channel {:?}: {}", id, e);
        }
    }

    /// Hand a request to its channel task and wait for the outcome.
    async fn process_request(&self, id: ChannelId, request: SessionRequest) -> bool {
        let Some(requests) = self.requests.get(&id) else {
            debug!("Request for unknown channel {:?}", id);
            return false;
        };

        let kind = request.kind().to_string();
        let (request, outcome) = ChannelRequest::new(request);
        if requests.send(request).is_err() {
            return false;
        }

        match tokio::time::timeout(REQUEST_REPLY_TIMEOUT, outcome).await {
            Ok(Ok(success)) => success,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(
                    "{} request on channel {:?} still pending after {:?}",
                    kind, id, REQUEST_REPLY_TIMEOUT
                );
                false
            }
        }
    }

    /// Queue a request that never carries a reply.
    fn queue_request(&self, id: ChannelId, request: SessionRequest) {
        let queued = self
            .requests
            .get(&id)
            .is_some_and(|requests| requests.send(ChannelRequest::without_reply(request)).is_ok());
        if !queued {
            debug!("Request for unknown channel {:?}", id);
        }
    }
}

impl server::Handler for ConnectionHandler {
    type Error = SshdError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        Ok(self.accept_user(user))
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(self.accept_user(user))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.accept_user(user))
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let transport = Arc::new(RusshTransport {
            handle: session.handle(),
        });
        self.start_bridge(transport)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.accept_channel(channel, ChannelOpen::Session, session).await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let open = ChannelOpen::DirectTcpip(DirectTcpip {
            host_to_connect: host_to_connect.to_string(),
            port_to_connect,
            originator_ip: originator_address.to_string(),
            originator_port,
        });
        Ok(self.accept_channel(channel, open, session).await)
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let open = ChannelOpen::Other("x11".to_string());
        Ok(self.accept_channel(channel, open, session).await)
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let open = ChannelOpen::Other("forwarded-tcpip".to_string());
        Ok(self.accept_channel(channel, open, session).await)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel {:?} closed by client", channel);
        self.requests.remove(&channel);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = SessionRequest::PtyReq(PtyRequest {
            term: term.to_string(),
            width: col_width,
            height: row_height,
            pixel_width: pix_width,
            pixel_height: pix_height,
            modes: modes.iter().map(|(mode, arg)| (*mode as u8, *arg)).collect(),
        });
        self.forward_request(channel, request, session).await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = SessionRequest::WindowChange(WindowChange {
            width: col_width,
            height: row_height,
            pixel_width: pix_width,
            pixel_height: pix_height,
        });
        self.queue_request(channel, request);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = SessionRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.forward_request(channel, request, session).await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, SessionRequest::Shell, session)
            .await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = SessionRequest::Exec {
            command: data.to_vec(),
        };
        self.forward_request(channel, request, session).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Subsystem {} requested on channel {:?}", name, channel);
        self.forward_request(
            channel,
            SessionRequest::Other("subsystem".to_string()),
            session,
        )
        .await;
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("tcpip-forward requested for {}:{}", address, port);
        Ok(self.global_request("tcpip-forward").await)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("cancel-tcpip-forward requested for {}:{}", address, port);
        Ok(self.global_request("cancel-tcpip-forward").await)
    }
}
