//! Terminal resize coordination.
//!
//! Clients may send `pty-req` and `window-change` before the command starts,
//! while the backend can only resize a command that is running. The
//! coordinator records the most recent size and applies it once the command
//! is running, so early sizes are deferred rather than lost and later sizes
//! are forwarded straight away.
//!
//! At most one backend resize is in flight per session. A size recorded while
//! an apply is outstanding overwrites the stored value and stays pending, so
//! the newest size is always the one that ends up applied.

use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::ProviderError;
use super::provider::{SessionProvider, TerminalSize};

#[derive(Debug, Default)]
struct ResizeState {
    size: TerminalSize,
    pending: bool,
}

/// Tracks the latest requested terminal size for one session.
#[derive(Debug, Default)]
pub struct ResizeCoordinator {
    state: Mutex<ResizeState>,
    apply: tokio::sync::Mutex<()>,
}

impl ResizeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a requested size. An empty size clears any pending apply.
    pub fn record(&self, size: TerminalSize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.size = size;
        state.pending = !size.is_empty();
    }

    /// The size that would be applied next, if any.
    pub fn pending(&self) -> Option<TerminalSize> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending.then_some(state.size)
    }

    /// Push the pending size to the backend if a command is running.
    ///
    /// Returns the size that was applied, or `None` when there was nothing to
    /// do. On error the size stays pending and a later call retries it.
    pub async fn apply_if_pending(
        &self,
        provider: &dyn SessionProvider,
        command_running: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<TerminalSize>, ProviderError> {
        if !command_running {
            return Ok(None);
        }

        let _apply = self.apply.lock().await;
        let Some(size) = self.pending() else {
            return Ok(None);
        };

        debug!("Resizing terminal to {}x{}", size.width, size.height);
        provider.resize(size, cancel).await?;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.size == size {
            state.pending = false;
        }
        Ok(Some(size))
    }
}
