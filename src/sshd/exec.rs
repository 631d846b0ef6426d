//! Command lifecycle for one channel.
//!
//! [`ExecLifecycle`] owns the channel's byte stream until a command claims it.
//! It enforces that at most one command is ever started per channel (shell
//! and exec share the same guard), applies a deferred terminal size once the
//! command is running, and spawns the watcher that reports the command's
//! exit status and then closes the channel.
//!
//! The guard is taken before the backend is called, so a start that fails
//! still counts: the client gets a failed reply and any further shell or exec
//! on the same channel is refused without reaching the backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::ChannelControl;
use super::error::{BridgeError, exit_status_code};
use super::provider::{ExecCompletion, ExecConfig, ExecIo, SessionProvider};
use super::resize::ResizeCoordinator;

/// A command ready to be launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    /// `NAME=value` entries.
    pub env: Vec<String>,
    pub tty: bool,
}

/// Single-start command state for one channel.
pub struct ExecLifecycle {
    provider: Arc<dyn SessionProvider>,
    control: Arc<dyn ChannelControl>,
    io: Mutex<Option<ExecIo>>,
    cancel: CancellationToken,
    started: AtomicBool,
    running: AtomicBool,
}

impl ExecLifecycle {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        control: Arc<dyn ChannelControl>,
        io: ExecIo,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            control,
            io: Mutex::new(Some(io)),
            cancel,
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Whether a start has been attempted, successful or not.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether the backend accepted the command.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn provider(&self) -> &dyn SessionProvider {
        self.provider.as_ref()
    }

    /// Launch `command` on the backend.
    ///
    /// On success the deferred terminal size (if any) is applied and the exit
    /// watcher is spawned; its handle is returned for callers that want to
    /// wait on it.
    pub async fn start(
        &self,
        command: CommandSpec,
        resize: &ResizeCoordinator,
    ) -> Result<JoinHandle<()>, BridgeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyStarted);
        }

        let io = self
            .io
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BridgeError::ChannelClosed)?;

        let label = command.argv.join(" ");
        info!("Starting command [{}] (tty: {})", label, command.tty);

        let completion = self
            .provider
            .exec(ExecConfig {
                argv: command.argv,
                env: command.env,
                tty: command.tty,
                io,
                cancel: self.cancel.clone(),
            })
            .await?;
        self.running.store(true, Ordering::SeqCst);

        if let Err(e) = resize
            .apply_if_pending(self.provider(), true, &self.cancel)
            .await
        {
            warn!("Failed to apply pending terminal size: {}", e);
        }

        Ok(spawn_exit_watcher(completion, self.control.clone(), label))
    }
}

/// Wait for `completion`, report exactly one `exit-status`, then close the
/// channel.
pub fn spawn_exit_watcher(
    completion: ExecCompletion,
    control: Arc<dyn ChannelControl>,
    label: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = completion.wait().await;
        if let Some(e) = &result.error {
            warn!("Command [{}] ended with error: {}", label, e);
        }
        info!("Command [{}] exited with code {}", label, result.exit_code);

        if let Err(e) = control
            .send_exit_status(exit_status_code(result.exit_code))
            .await
        {
            debug!("Could not send exit status for [{}]: {}", label, e);
        }
        if let Err(e) = control.close().await {
            debug!("Could not close channel for [{}]: {}", label, e);
        }
    })
}
