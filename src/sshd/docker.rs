//! Docker Engine backend.
//!
//! Each SSH connection gets a [`DockerProvider`] bound to the container named
//! by the SSH username. Commands run as Docker execs with stdin, stdout and
//! stderr attached; the exec stream is pumped to and from the SSH channel.
//!
//! Docker only reports an exec's exit code through `exec inspect`, and may
//! still report it as running briefly after its streams close, so completion
//! goes through [`poll_exit_code`] once the pump ends.
//!
//! Every channel works through its own [`DockerProvider`] scope, and resizes
//! target the exec started through that scope. A forwarding relay or a
//! second session on the same connection never receives another channel's
//! resize.
//!
//! # Feature Gate
//!
//! This module is only compiled when the `docker` feature is enabled.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::completion::{ExitProbe, ExitState, PollPolicy, poll_exit_code};
use super::error::ProviderError;
use super::provider::{
    ExecCompletion, ExecConfig, ExecIo, ProviderFactory, SessionProvider, TerminalSize,
};

type ExecOutput = Pin<Box<dyn Stream<Item = Result<LogOutput, DockerError>> + Send>>;
type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Builds a [`DockerProvider`] per connection from one shared client.
pub struct DockerProviderFactory {
    docker: Docker,
    policy: PollPolicy,
}

impl DockerProviderFactory {
    pub fn new(docker: Docker, policy: PollPolicy) -> Self {
        Self { docker, policy }
    }

    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect(policy: PollPolicy) -> Result<Self, ProviderError> {
        let docker = Docker::connect_with_local_defaults().map_err(ProviderError::backend)?;
        Ok(Self::new(docker, policy))
    }
}

impl ProviderFactory for DockerProviderFactory {
    fn create(&self, user: &str) -> Result<Arc<dyn SessionProvider>, ProviderError> {
        if user.is_empty() {
            return Err(ProviderError::Start("no container name given".to_string()));
        }
        Ok(Arc::new(DockerProvider::new(
            self.docker.clone(),
            user,
            self.policy,
        )))
    }
}

/// Runs commands inside one container.
pub struct DockerProvider {
    docker: Docker,
    container: String,
    policy: PollPolicy,
    active_exec: Mutex<Option<String>>,
}

impl DockerProvider {
    pub fn new(docker: Docker, container: impl Into<String>, policy: PollPolicy) -> Self {
        Self {
            docker,
            container: container.into(),
            policy,
            active_exec: Mutex::new(None),
        }
    }

    fn active_exec(&self) -> Option<String> {
        self.active_exec
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_active_exec(&self, exec_id: Option<String>) {
        *self
            .active_exec
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = exec_id;
    }
}

#[async_trait]
impl SessionProvider for DockerProvider {
    async fn exec(&self, config: ExecConfig) -> Result<ExecCompletion, ProviderError> {
        let ExecConfig {
            argv,
            env,
            tty,
            io,
            cancel,
        } = config;
        info!("docker exec {:?} in container [{}]", argv, self.container);

        let created = self
            .docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(tty),
                    env: Some(env),
                    cmd: Some(argv),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ProviderError::Start(e.to_string()))?;

        let started = self
            .docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    tty,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| ProviderError::Start(e.to_string()))?;

        let StartExecResults::Attached { output, input } = started else {
            return Err(ProviderError::Start(
                "exec started detached, no streams attached".to_string(),
            ));
        };

        self.set_active_exec(Some(created.id.clone()));

        let (completion_tx, completion) = ExecCompletion::channel();
        let probe = ExecProbe {
            docker: self.docker.clone(),
            exec_id: created.id,
        };
        let policy = self.policy;
        tokio::spawn(async move {
            let pumped = pump(io, output, input, &cancel).await;
            if let Err(e) = &pumped {
                debug!("exec [{}] stream ended: {}", probe.exec_id, e);
            }
            let mut result = poll_exit_code(&probe, policy, &cancel).await;
            if result.error.is_none() {
                result.error = pumped.err();
            }
            completion_tx.complete(result);
        });

        Ok(completion)
    }

    async fn resize(
        &self,
        size: TerminalSize,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let exec_id = self.active_exec().ok_or(ProviderError::NoActiveCommand)?;
        let options = ResizeExecOptions {
            height: clamp_dimension(size.height),
            width: clamp_dimension(size.width),
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = self.docker.resize_exec(&exec_id, options) => {
                result.map_err(|e| ProviderError::Resize(e.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.set_active_exec(None);
        Ok(())
    }

    fn channel_scope(&self) -> Arc<dyn SessionProvider> {
        Arc::new(DockerProvider::new(
            self.docker.clone(),
            self.container.clone(),
            self.policy,
        ))
    }
}

/// Inspects one exec for its exit code.
struct ExecProbe {
    docker: Docker,
    exec_id: String,
}

#[async_trait]
impl ExitProbe for ExecProbe {
    async fn probe(&self) -> Result<ExitState, ProviderError> {
        let inspect = self
            .docker
            .inspect_exec(&self.exec_id)
            .await
            .map_err(ProviderError::backend)?;
        Ok(exit_state(inspect.running, inspect.exit_code))
    }
}

fn exit_state(running: Option<bool>, exit_code: Option<i64>) -> ExitState {
    match (running, exit_code) {
        (Some(true), _) => ExitState::Running,
        (_, Some(code)) => ExitState::Exited(i32::try_from(code).unwrap_or(i32::MAX)),
        (_, None) => ExitState::Running,
    }
}

fn clamp_dimension(cells: u32) -> u16 {
    u16::try_from(cells).unwrap_or(u16::MAX)
}

/// Copy between the SSH channel and the exec until the exec's output ends.
///
/// End of input from the client half-closes the exec's stdin and keeps the
/// output flowing; an error in either direction ends the pump.
async fn pump(
    io: ExecIo,
    mut output: ExecOutput,
    mut input: ExecInput,
    cancel: &CancellationToken,
) -> Result<(), ProviderError> {
    let ExecIo {
        input: mut channel_in,
        output: mut channel_out,
    } = io;

    let upload = async {
        tokio::io::copy(&mut channel_in, &mut input).await?;
        input.shutdown().await?;
        Ok::<(), std::io::Error>(())
    };
    let download = async {
        while let Some(chunk) = output.next().await {
            let chunk = chunk.map_err(ProviderError::backend)?;
            channel_out
                .write_all(&chunk.into_bytes())
                .await
                .map_err(ProviderError::backend)?;
        }
        channel_out.flush().await.map_err(ProviderError::backend)?;
        Ok::<(), ProviderError>(())
    };
    tokio::pin!(upload);
    tokio::pin!(download);

    let mut upload_done = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            result = &mut download => return result,
            result = &mut upload, if !upload_done => match result {
                Ok(()) => {
                    debug!("Client closed stdin");
                    upload_done = true;
                }
                Err(e) => return Err(ProviderError::backend(e)),
            },
        }
    }
}
