//! `session` channel request handling.
//!
//! Requests on a session channel are processed strictly in arrival order by
//! [`Session::run`]. Each request updates per-channel state (pty flag,
//! environment, terminal size) or starts the single command the channel is
//! allowed to run. Failures are logged and answered with a failed reply;
//! they never close the channel on their own.
//!
//! | Request         | Effect                                               | Reply            |
//! |-----------------|------------------------------------------------------|------------------|
//! | `pty-req`       | marks the channel as tty, records and applies size   | success          |
//! | `window-change` | records size, applies it if the command is running   | success          |
//! | `env`           | appends `NAME=value`                                 | success          |
//! | `shell`         | starts the default command                           | start outcome    |
//! | `exec`          | starts the requested command                         | start outcome    |
//! | anything else   | logged                                               | failure          |

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::ChannelControl;
use super::error::BridgeError;
use super::exec::{CommandSpec, ExecLifecycle};
use super::provider::{ExecIo, SessionProvider, TerminalSize};
use super::request::{
    ChannelRequest, PtyRequest, SessionRequest, WindowChange, format_env, parse_exec_command,
    split_command,
};
use super::resize::ResizeCoordinator;

/// State of one `session` channel.
pub struct Session {
    default_command: String,
    pty_requested: bool,
    env: Vec<String>,
    resize: ResizeCoordinator,
    exec: ExecLifecycle,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        control: Arc<dyn ChannelControl>,
        io: ExecIo,
        default_command: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            exec: ExecLifecycle::new(provider, control, io, cancel.clone()),
            default_command: default_command.into(),
            pty_requested: false,
            env: Vec::new(),
            resize: ResizeCoordinator::new(),
            cancel,
        }
    }

    /// Process requests until the stream ends, then cancel the channel.
    pub async fn run(mut self, mut requests: mpsc::UnboundedReceiver<ChannelRequest>) {
        while let Some(ChannelRequest { request, reply }) = requests.recv().await {
            let kind = request.kind().to_string();
            let ok = match self.handle(request).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("{} request failed: {}", kind, e);
                    false
                }
            };
            if let Some(reply) = reply {
                reply.send(ok);
            }
        }
        debug!("Request stream ended");
        self.cancel.cancel();
    }

    /// Apply one request to the session.
    pub async fn handle(&mut self, request: SessionRequest) -> Result<(), BridgeError> {
        match request {
            SessionRequest::PtyReq(pty) => self.pty_request(pty).await,
            SessionRequest::WindowChange(change) => self.window_change(change).await,
            SessionRequest::Env { name, value } => {
                self.env.push(format_env(&name, &value)?);
                Ok(())
            }
            SessionRequest::Shell => {
                let argv = split_command(&self.default_command)?;
                self.start(argv).await
            }
            SessionRequest::Exec { command } => {
                let argv = parse_exec_command(&command)?;
                self.start(argv).await
            }
            SessionRequest::Other(kind) => {
                info!("Ignoring unsupported request type: {}", kind);
                Err(BridgeError::UnknownRequest(kind))
            }
        }
    }

    async fn pty_request(&mut self, pty: PtyRequest) -> Result<(), BridgeError> {
        debug!(
            "pty-req term={} size={}x{} modes={}",
            pty.term,
            pty.width,
            pty.height,
            pty.modes.len()
        );
        self.pty_requested = true;
        self.resize_to(TerminalSize::new(pty.width, pty.height)).await;
        Ok(())
    }

    async fn window_change(&mut self, change: WindowChange) -> Result<(), BridgeError> {
        self.resize_to(TerminalSize::new(change.width, change.height))
            .await;
        Ok(())
    }

    /// Record a size and push it to the running command, if any. Failures
    /// leave it pending for the next attempt.
    async fn resize_to(&self, size: TerminalSize) {
        self.resize.record(size);
        if let Err(e) = self
            .resize
            .apply_if_pending(self.exec.provider(), self.exec.is_running(), &self.cancel)
            .await
        {
            warn!("Failed to resize terminal: {}", e);
        }
    }

    async fn start(&mut self, argv: Vec<String>) -> Result<(), BridgeError> {
        let command = CommandSpec {
            argv,
            env: self.env.clone(),
            tty: self.pty_requested,
        };
        self.exec.start(command, &self.resize).await?;
        Ok(())
    }
}
