//! In-memory doubles for the backend and the SSH transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::channel::{ChannelControl, Transport};
use super::completion::{ExitProbe, ExitState, PollPolicy, poll_exit_code};
use super::error::{BridgeError, ProviderError};
use super::provider::{
    CompletionSender, ExecCompletion, ExecConfig, ExecIo, ExecResult, ProviderFactory,
    SessionProvider, TerminalSize,
};

/// Channel streams that read nothing and discard writes.
pub(crate) fn null_io() -> ExecIo {
    ExecIo::new(Box::new(tokio::io::empty()), Box::new(tokio::io::sink()))
}

/// What the backend was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedExec {
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub tty: bool,
}

struct AlwaysRunning;

#[async_trait]
impl ExitProbe for AlwaysRunning {
    async fn probe(&self) -> Result<ExitState, ProviderError> {
        Ok(ExitState::Running)
    }
}

#[derive(Default)]
struct FakeState {
    execs: Mutex<Vec<RecordedExec>>,
    exec_tokens: Mutex<Vec<CancellationToken>>,
    resizes: Mutex<Vec<TerminalSize>>,
    running: Mutex<VecDeque<CompletionSender>>,
    exec_error: Mutex<Option<String>>,
    resize_failures: AtomicUsize,
    scopes: AtomicUsize,
    never_exits: bool,
    closed: AtomicBool,
}

/// Records calls; commands finish when the test says so.
///
/// Channel scopes share the recorded state with the provider they came from.
#[derive(Clone, Default)]
pub(crate) struct FakeProvider {
    state: Arc<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command polls for a status that never arrives.
    pub fn never_exits() -> Self {
        Self {
            state: Arc::new(FakeState {
                never_exits: true,
                ..FakeState::default()
            }),
        }
    }

    pub fn fail_exec(&self, reason: &str) {
        *self.state.exec_error.lock().unwrap() = Some(reason.to_string());
    }

    pub fn fail_next_resizes(&self, count: usize) {
        self.state.resize_failures.store(count, Ordering::SeqCst);
    }

    /// Complete the oldest running command.
    pub fn finish(&self, exit_code: i32) {
        let sender = self.state.running.lock().unwrap().pop_front();
        sender
            .expect("no running command to finish")
            .complete(ExecResult::exited(exit_code));
    }

    pub fn exec_calls(&self) -> Vec<RecordedExec> {
        self.state.execs.lock().unwrap().clone()
    }

    /// Cancellation tokens handed to each started command.
    pub fn exec_tokens(&self) -> Vec<CancellationToken> {
        self.state.exec_tokens.lock().unwrap().clone()
    }

    pub fn resize_calls(&self) -> Vec<TerminalSize> {
        self.state.resizes.lock().unwrap().clone()
    }

    /// Number of channel scopes handed out.
    pub fn scope_count(&self) -> usize {
        self.state.scopes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    async fn exec(&self, config: ExecConfig) -> Result<ExecCompletion, ProviderError> {
        let state = &self.state;
        state.execs.lock().unwrap().push(RecordedExec {
            argv: config.argv.clone(),
            env: config.env.clone(),
            tty: config.tty,
        });
        state.exec_tokens.lock().unwrap().push(config.cancel.clone());
        if let Some(reason) = state.exec_error.lock().unwrap().clone() {
            return Err(ProviderError::Start(reason));
        }

        let (tx, completion) = ExecCompletion::channel();
        if state.never_exits {
            let cancel = config.cancel.clone();
            tokio::spawn(async move {
                let result = poll_exit_code(&AlwaysRunning, PollPolicy::default(), &cancel).await;
                tx.complete(result);
            });
        } else {
            state.running.lock().unwrap().push_back(tx);
        }
        Ok(completion)
    }

    async fn resize(
        &self,
        size: TerminalSize,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let failures = self.state.resize_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.state
                .resize_failures
                .store(failures - 1, Ordering::SeqCst);
            return Err(ProviderError::Resize("injected failure".to_string()));
        }
        self.state.resizes.lock().unwrap().push(size);
        Ok(())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn channel_scope(&self) -> Arc<dyn SessionProvider> {
        self.state.scopes.fetch_add(1, Ordering::SeqCst);
        Arc::new(self.clone())
    }
}

/// Hands out one shared [`FakeProvider`], or fails for a given user.
pub(crate) struct FakeFactory {
    pub provider: Arc<FakeProvider>,
    pub reject_user: Option<String>,
}

impl ProviderFactory for FakeFactory {
    fn create(&self, user: &str) -> Result<Arc<dyn SessionProvider>, ProviderError> {
        if self.reject_user.as_deref() == Some(user) {
            return Err(ProviderError::Start(format!("no such container: {}", user)));
        }
        Ok(self.provider.clone())
    }
}

/// Observable effect of a [`ChannelControl`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChannelEvent {
    ExitStatus(u32),
    Close,
}

/// Records channel control calls as an ordered event stream.
pub(crate) struct FakeChannel {
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl FakeChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events }), rx)
    }

    fn record(&self, event: ChannelEvent) -> Result<(), BridgeError> {
        self.events
            .send(event)
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

#[async_trait]
impl ChannelControl for FakeChannel {
    async fn send_exit_status(&self, exit_status: u32) -> Result<(), BridgeError> {
        self.record(ChannelEvent::ExitStatus(exit_status))
    }

    async fn close(&self) -> Result<(), BridgeError> {
        self.record(ChannelEvent::Close)
    }
}

/// Connection double that only remembers being closed.
#[derive(Default)]
pub(crate) struct FakeTransport {
    closed: CancellationToken,
}

impl FakeTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn close(&self) -> Result<(), BridgeError> {
        self.closed.cancel();
        Ok(())
    }
}
