//! Error taxonomy for the SSH bridge.
//!
//! Errors are split by the layer that raises them, because each layer maps
//! failures onto a different SSH-visible outcome:
//!
//! 1. **Backend errors** ([`ProviderError`]): raised by a container runtime
//!    adapter. A failure to *start* a command becomes a failed reply on the
//!    originating `exec`/`shell` request; a failure while the command runs
//!    becomes an exit code instead.
//!
//! 2. **Bridge errors** ([`BridgeError`]): protocol-level problems local to one
//!    request or channel (malformed payloads, unsupported channel types,
//!    a second `exec` on the same channel). They are logged and reflected as a
//!    failed reply or a channel rejection, never as a connection error.
//!
//! 3. **Server errors** ([`SshdError`]): process and transport level failures
//!    (listener, host key, handshake). They propagate to whoever owns the
//!    listener loop.

use std::error::Error as StdError;

use thiserror::Error;

/// Exit code reported when the final status of a command cannot be determined.
///
/// Used when polling times out, the backend drops its completion signal, or
/// the command is cancelled before reporting. Sent on the wire as `u32::MAX`.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Errors raised by a backend adapter.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The command could not be launched (missing binary, container not found).
    #[error("failed to start command: {0}")]
    Start(String),

    /// The terminal resize was rejected by the backend.
    #[error("failed to resize terminal: {0}")]
    Resize(String),

    /// The operation needs a running command and none is active.
    #[error("no active command")]
    NoActiveCommand,

    /// The operation was abandoned because its cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Polling did not observe the command finishing within the timeout.
    #[error("command status unknown after {0:?}")]
    StatusTimeout(std::time::Duration),

    /// The backend dropped the command without ever reporting a status.
    #[error("backend dropped the command without reporting a status")]
    Abandoned,

    /// Any other error reported by the runtime API client.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),
}

impl ProviderError {
    /// Wrap a runtime client error.
    pub fn backend(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

/// Errors raised while bridging SSH channels to a backend.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A command was already started on this channel.
    #[error("exec can only be called once per channel")]
    AlreadyStarted,

    /// The command line contained no words.
    #[error("empty command")]
    EmptyCommand,

    /// A request payload could not be interpreted.
    #[error("malformed {kind} request: {reason}")]
    MalformedRequest { kind: &'static str, reason: String },

    /// A session request type the bridge does not implement.
    #[error("unknown request type: {0}")]
    UnknownRequest(String),

    /// A channel type outside the registry.
    #[error("unknown channel type: {0}")]
    UnsupportedChannelType(String),

    /// The SSH channel went away before the operation completed.
    #[error("channel closed")]
    ChannelClosed,

    /// The SSH connection went away before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl BridgeError {
    pub(crate) fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedRequest {
            kind,
            reason: reason.into(),
        }
    }
}

/// Errors raised by the SSH server process.
#[derive(Debug, Error)]
pub enum SshdError {
    #[error("ssh error: {0}")]
    Russh(#[from] russh::Error),

    #[error("failed to load host key: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Convert a backend exit code to the `exit-status` wire value.
///
/// Negative sentinels keep their two's-complement bit pattern, so
/// [`UNKNOWN_EXIT_CODE`] is reported as `u32::MAX`.
pub fn exit_status_code(exit_code: i32) -> u32 {
    exit_code as u32
}
