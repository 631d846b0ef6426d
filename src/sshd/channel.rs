//! Channel demultiplexing for one SSH connection.
//!
//! A [`Bridge`] sits between the SSH transport and a [`SessionProvider`]. The
//! transport hands it every channel-open as a [`NewChannel`] and every
//! connection-level request as a [`GlobalRequest`]. Channel types are looked up
//! in a fixed registry:
//!
//! - `session`: interactive shell or command execution ([`super::session`])
//! - `direct-tcpip`: local port forwarding through a relay command inside the
//!   container (only with the `port_forward` feature)
//!
//! Any other type is rejected with "unknown channel type"; the connection and
//! its other channels keep working. Each accepted channel runs in its own
//! task, so a slow backend on one channel never stalls another.
//!
//! Global requests are drained by a separate task for the whole life of the
//! connection. `keepalive@openssh.com` is answered with success, everything
//! else with failure.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::config::BridgeConfig;
use super::error::BridgeError;
use super::provider::{ExecIo, SessionProvider};
use super::request::{ChannelRequest, DirectTcpip, KEEPALIVE_REQUEST};
use super::session::Session;

/// Per-channel operations the bridge needs from the SSH transport.
#[async_trait]
pub trait ChannelControl: Send + Sync {
    /// Send an `exit-status` request.
    async fn send_exit_status(&self, exit_status: u32) -> Result<(), BridgeError>;

    /// Send EOF and close the channel.
    async fn close(&self) -> Result<(), BridgeError>;
}

/// Connection-level operations the bridge needs from the SSH transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Tear down the whole connection.
    async fn close(&self) -> Result<(), BridgeError>;
}

/// Channel type and open parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpen {
    Session,
    DirectTcpip(DirectTcpip),
    /// Any other channel type, by wire name.
    Other(String),
}

impl ChannelOpen {
    pub fn channel_type(&self) -> &str {
        match self {
            ChannelOpen::Session => "session",
            ChannelOpen::DirectTcpip(_) => "direct-tcpip",
            ChannelOpen::Other(name) => name,
        }
    }
}

/// A channel the client asked to open, waiting for the bridge's decision.
pub struct NewChannel {
    id: String,
    open: ChannelOpen,
    io: ExecIo,
    control: Arc<dyn ChannelControl>,
    requests: mpsc::UnboundedReceiver<ChannelRequest>,
    decision: oneshot::Sender<Result<(), BridgeError>>,
}

impl NewChannel {
    /// Returns the channel and the receiver the transport awaits to learn
    /// whether the open was accepted.
    pub fn new(
        id: impl Into<String>,
        open: ChannelOpen,
        io: ExecIo,
        control: Arc<dyn ChannelControl>,
        requests: mpsc::UnboundedReceiver<ChannelRequest>,
    ) -> (Self, oneshot::Receiver<Result<(), BridgeError>>) {
        let (decision, rx) = oneshot::channel();
        (
            Self {
                id: id.into(),
                open,
                io,
                control,
                requests,
                decision,
            },
            rx,
        )
    }

    pub fn channel_type(&self) -> &str {
        self.open.channel_type()
    }

    fn reject(self, err: BridgeError) {
        let _ = self.decision.send(Err(err));
    }

    fn accept(self) -> (ChannelOpen, AcceptedChannel) {
        let _ = self.decision.send(Ok(()));
        (
            self.open,
            AcceptedChannel {
                id: self.id,
                io: self.io,
                control: self.control,
                requests: self.requests,
            },
        )
    }
}

/// An open channel handed to its type's handler.
pub struct AcceptedChannel {
    pub id: String,
    pub io: ExecIo,
    pub control: Arc<dyn ChannelControl>,
    pub requests: mpsc::UnboundedReceiver<ChannelRequest>,
}

/// A connection-level request.
#[derive(Debug)]
pub struct GlobalRequest {
    pub kind: String,
    pub want_reply: bool,
    reply: oneshot::Sender<bool>,
}

impl GlobalRequest {
    /// Returns the request and the receiver for its answer.
    pub fn new(kind: impl Into<String>, want_reply: bool) -> (Self, oneshot::Receiver<bool>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                kind: kind.into(),
                want_reply,
                reply,
            },
            rx,
        )
    }

    fn answer(self, ok: bool) {
        if self.want_reply {
            let _ = self.reply.send(ok);
        }
    }
}

/// Answer global requests until the stream ends.
pub async fn handle_global_requests(mut requests: mpsc::Receiver<GlobalRequest>) {
    while let Some(request) = requests.recv().await {
        if request.kind == KEEPALIVE_REQUEST {
            debug!("Answering keepalive");
            request.answer(true);
        } else {
            info!("Rejecting global request: {}", request.kind);
            request.answer(false);
        }
    }
    debug!("Global request stream ended");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelHandler {
    Session,
    #[cfg(feature = "port_forward")]
    DirectTcpip,
}

/// Registry of supported channel types.
fn lookup_handler(channel_type: &str) -> Option<ChannelHandler> {
    match channel_type {
        "session" => Some(ChannelHandler::Session),
        #[cfg(feature = "port_forward")]
        "direct-tcpip" => Some(ChannelHandler::DirectTcpip),
        _ => None,
    }
}

/// Serves all channels of one SSH connection against one backend.
pub struct Bridge {
    transport: Arc<dyn Transport>,
    provider: Arc<dyn SessionProvider>,
    config: Arc<BridgeConfig>,
    channels: mpsc::Receiver<NewChannel>,
    cancel: CancellationToken,
    global: JoinHandle<()>,
}

impl Bridge {
    /// Create the bridge and start answering global requests.
    pub fn new(
        transport: Arc<dyn Transport>,
        channels: mpsc::Receiver<NewChannel>,
        global_requests: mpsc::Receiver<GlobalRequest>,
        provider: Arc<dyn SessionProvider>,
        config: Arc<BridgeConfig>,
    ) -> Self {
        Self {
            transport,
            provider,
            config,
            channels,
            cancel: CancellationToken::new(),
            global: tokio::spawn(handle_global_requests(global_requests)),
        }
    }

    /// Token fired when the connection ends; every channel task derives from it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Dispatch channel opens until the stream ends, then cancel outstanding
    /// work and release the backend.
    pub async fn start(&mut self) {
        while let Some(channel) = self.channels.recv().await {
            self.dispatch(channel);
        }

        debug!("Channel stream ended, releasing backend");
        self.cancel.cancel();
        if let Err(e) = self.provider.close().await {
            warn!("Failed to release backend: {}", e);
        }
    }

    /// Cancel all channels and tear down the connection.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.cancel.cancel();
        self.global.abort();
        self.transport.close().await
    }

    fn dispatch(&self, channel: NewChannel) {
        let channel_type = channel.channel_type().to_string();
        let Some(handler) = lookup_handler(&channel_type) else {
            info!("Rejecting channel open: unknown channel type {}", channel_type);
            channel.reject(BridgeError::UnsupportedChannelType(channel_type));
            return;
        };

        let span = info_span!("channel", id = %channel.id, kind = %channel_type);
        let (open, accepted) = channel.accept();
        let cancel = self.cancel.child_token();
        let provider = self.provider.channel_scope();

        match (handler, open) {
            (ChannelHandler::Session, _) => {
                let AcceptedChannel {
                    io,
                    control,
                    requests,
                    ..
                } = accepted;
                let session = Session::new(
                    provider,
                    control,
                    io,
                    self.config.default_command.clone(),
                    cancel,
                );
                tokio::spawn(session.run(requests).instrument(span));
            }
            #[cfg(feature = "port_forward")]
            (ChannelHandler::DirectTcpip, ChannelOpen::DirectTcpip(params)) => {
                let relay_command = self.config.relay_command.clone();
                tokio::spawn(
                    super::forward::handle_direct_tcpip(
                        accepted,
                        params,
                        provider,
                        relay_command,
                        cancel,
                    )
                    .instrument(span),
                );
            }
            #[cfg(feature = "port_forward")]
            (ChannelHandler::DirectTcpip, _) => {
                warn!("direct-tcpip channel opened without destination");
                tokio::spawn(
                    async move {
                        if let Err(e) = accepted.control.close().await {
                            debug!("Could not close direct-tcpip channel: {}", e);
                        }
                    }
                    .instrument(span),
                );
            }
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.global.abort();
    }
}
