//! Backend capability contract.
//!
//! A [`SessionProvider`] is the narrow surface the bridge needs from a
//! container runtime: start a command with the channel's streams attached,
//! resize the active command's pseudo-terminal, and release resources.
//! Each runtime adapter is an independent implementation chosen when the
//! connection is set up (see [`ProviderFactory`]); the bridge never looks
//! past this trait.
//!
//! # Completion
//!
//! Starting a command yields an [`ExecCompletion`], a one-shot signal that
//! resolves to the command's [`ExecResult`]. Adapters with a push-based
//! completion (a stream that ends with the exit code) complete it directly.
//! Adapters that can only inspect the command poll through
//! [`super::completion::poll_exit_code`] and complete it with the outcome, so
//! the exec lifecycle never needs to know which strategy is in use.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::error::{ProviderError, UNKNOWN_EXIT_CODE};

/// Read side handed to the backend as the command's stdin.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write side handed to the backend as the command's stdout and stderr.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The channel's byte stream, split into the command's input and output.
pub struct ExecIo {
    pub input: BoxedReader,
    pub output: BoxedWriter,
}

impl ExecIo {
    pub fn new(input: BoxedReader, output: BoxedWriter) -> Self {
        Self { input, output }
    }

    /// Split a duplex stream (an SSH channel) into command input and output.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self {
            input: Box::new(read),
            output: Box::new(write),
        }
    }
}

impl fmt::Debug for ExecIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExecIo { .. }")
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TerminalSize {
    pub width: u32,
    pub height: u32,
}

impl TerminalSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Zero in either dimension means "no size", as SSH sends on teardown.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Everything a backend needs to start one command.
#[derive(Debug)]
pub struct ExecConfig {
    /// Command and arguments.
    pub argv: Vec<String>,
    /// Environment as `NAME=value` entries, in the order they were requested.
    pub env: Vec<String>,
    /// Whether to allocate a pseudo-terminal.
    pub tty: bool,
    /// Channel streams wired to the command.
    pub io: ExecIo,
    /// Fired when the channel goes away; backends stop pumping and release
    /// the command when it does.
    pub cancel: CancellationToken,
}

/// Final outcome of a started command.
#[derive(Debug)]
pub struct ExecResult {
    /// Exit code; [`UNKNOWN_EXIT_CODE`] when it could not be determined.
    pub exit_code: i32,
    /// Runtime failure (stream copy error, inspect failure), if any.
    pub error: Option<ProviderError>,
}

impl ExecResult {
    /// The command ran to completion and reported `exit_code`.
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            error: None,
        }
    }

    /// The command ended with a runtime error after it had started.
    pub fn failed(exit_code: i32, error: ProviderError) -> Self {
        Self {
            exit_code,
            error: Some(error),
        }
    }

    /// The final status is unknown.
    pub fn unknown(error: ProviderError) -> Self {
        Self::failed(UNKNOWN_EXIT_CODE, error)
    }
}

/// Backend side of an [`ExecCompletion`].
#[derive(Debug)]
pub struct CompletionSender {
    tx: oneshot::Sender<ExecResult>,
}

impl CompletionSender {
    /// Report the outcome. Ignored if nobody is waiting any more.
    pub fn complete(self, result: ExecResult) {
        let _ = self.tx.send(result);
    }
}

/// Completion signal for a started command.
#[derive(Debug)]
pub struct ExecCompletion {
    rx: oneshot::Receiver<ExecResult>,
}

impl ExecCompletion {
    /// Create a completion signal and the sender the backend resolves it with.
    pub fn channel() -> (CompletionSender, ExecCompletion) {
        let (tx, rx) = oneshot::channel();
        (CompletionSender { tx }, ExecCompletion { rx })
    }

    /// A completion that is already resolved.
    pub fn ready(result: ExecResult) -> Self {
        let (tx, completion) = Self::channel();
        tx.complete(result);
        completion
    }

    /// Wait for the command to finish.
    ///
    /// If the backend drops its sender without reporting, the result carries
    /// [`UNKNOWN_EXIT_CODE`] so a status is still delivered.
    pub async fn wait(self) -> ExecResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => ExecResult::unknown(ProviderError::Abandoned),
        }
    }
}

/// A container runtime adapter.
///
/// The factory builds one instance per SSH connection, and each channel works
/// through its own [`SessionProvider::channel_scope`]. Implementations must be
/// safe to call concurrently for distinct commands.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Start a command. Called at most once per channel.
    ///
    /// An `Err` means the command never ran; once `Ok` is returned every
    /// outcome, including runtime failures, is reported through the
    /// completion.
    async fn exec(&self, config: ExecConfig) -> Result<ExecCompletion, ProviderError>;

    /// Resize the active command's pseudo-terminal.
    ///
    /// May fail when no command is active; must tolerate repeated identical
    /// sizes.
    async fn resize(
        &self,
        size: TerminalSize,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    /// Release backend-held resources. Safe to call when nothing was started.
    async fn close(&self) -> Result<(), ProviderError>;

    /// Provider for a single channel.
    ///
    /// [`SessionProvider::resize`] on the returned scope only targets the
    /// command started through that scope, never one started by a sibling
    /// channel.
    fn channel_scope(&self) -> Arc<dyn SessionProvider>;
}

/// Builds the provider for a freshly authenticated connection.
pub trait ProviderFactory: Send + Sync {
    /// `user` is the SSH username, which names the target container.
    fn create(&self, user: &str) -> Result<Arc<dyn SessionProvider>, ProviderError>;
}
