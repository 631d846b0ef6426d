//! Polling fallback for backends without a push-based completion signal.
//!
//! Some runtimes only report a command's exit code through an inspect call
//! (Docker's `exec inspect`, for example) and may still report the command as
//! running for a moment after its streams have closed. [`poll_exit_code`]
//! repeatedly probes such a backend at a fixed interval until it reports an
//! exit code, and gives up after a bounded timeout with
//! [`UNKNOWN_EXIT_CODE`](super::error::UNKNOWN_EXIT_CODE) instead of hanging.
//!
//! ## Retry Strategy
//!
//! Probing uses a constant backoff via the `backon` crate:
//!
//! - **Interval**: [`PollPolicy::interval`] (default: 1 second)
//! - **Maximum attempts**: one initial probe plus `timeout / interval` retries
//! - **Hard bound**: the whole loop is abandoned after `timeout + interval`,
//!   even if a single probe hangs
//! - **Cancellation**: the loop stops as soon as the parent token fires
//!
//! Probe errors are retried like a "still running" answer; if the attempts run
//! out the last probe error is reported.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::ProviderError;
use super::provider::ExecResult;

/// Default interval between status probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound on how long to wait for a final status.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// How often and for how long to poll for an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Number of retries after the first probe.
    fn max_retries(&self) -> usize {
        if self.interval.is_zero() {
            return 0;
        }
        (self.timeout.as_nanos() / self.interval.as_nanos()) as usize
    }

    /// Upper bound on the whole polling loop.
    pub fn deadline(&self) -> Duration {
        self.timeout + self.interval
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }
}

/// What a single status probe observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    Exited(i32),
}

/// A backend command whose status can be inspected.
#[async_trait]
pub trait ExitProbe: Send + Sync {
    async fn probe(&self) -> Result<ExitState, ProviderError>;
}

#[derive(Debug)]
enum PollError {
    StillRunning,
    Probe(ProviderError),
}

/// Poll `probe` until it reports an exit code, the policy runs out, or
/// `cancel` fires.
///
/// Always resolves: an exhausted or cancelled poll yields an
/// [`ExecResult`] carrying [`UNKNOWN_EXIT_CODE`](super::error::UNKNOWN_EXIT_CODE).
pub async fn poll_exit_code<P>(
    probe: &P,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> ExecResult
where
    P: ExitProbe + ?Sized,
{
    let backoff = ConstantBuilder::default()
        .with_delay(policy.interval)
        .with_max_times(policy.max_retries());

    let polling = (|| async {
        match probe.probe().await {
            Ok(ExitState::Exited(code)) => Ok(code),
            Ok(ExitState::Running) => Err(PollError::StillRunning),
            Err(e) => Err(PollError::Probe(e)),
        }
    })
    .retry(backoff)
    .notify(|err: &PollError, dur: Duration| match err {
        PollError::StillRunning => debug!("Command still running, probing again in {:?}", dur),
        PollError::Probe(e) => warn!("Status probe failed: {}. Retrying in {:?}", e, dur),
    });

    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            debug!("Status polling cancelled");
            ExecResult::unknown(ProviderError::Cancelled)
        }

        outcome = tokio::time::timeout(policy.deadline(), polling) => match outcome {
            Ok(Ok(code)) => ExecResult::exited(code),
            Ok(Err(PollError::Probe(e))) => {
                warn!("Giving up on command status after probe error: {}", e);
                ExecResult::unknown(e)
            }
            Ok(Err(PollError::StillRunning)) | Err(_) => {
                warn!(
                    "Command is still running or status unknown after {:?} timeout",
                    policy.timeout
                );
                ExecResult::unknown(ProviderError::StatusTimeout(policy.timeout))
            }
        },
    }
}
