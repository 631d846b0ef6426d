//! Port forwarding (`direct-tcpip`) through the container.
//!
//! The bridge cannot open sockets from inside the container's network
//! namespace itself, so a forwarding channel is served by running a relay
//! command (by default `nc <host> <port>`) in the container and wiring the
//! channel's byte stream to it. Data then flows in both directions:
//!
//! - SSH client -> channel -> relay stdin -> destination
//! - destination -> relay stdout -> channel -> SSH client
//!
//! The channel closes once the relay finishes, whichever direction ends it.
//! When the client closes the channel first, the relay is cancelled. Session
//! requests sent on a forwarding channel are refused.
//!
//! # Feature Gate
//!
//! This module is only compiled when the `port_forward` feature is enabled.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{AcceptedChannel, ChannelControl};
use super::error::BridgeError;
use super::provider::{ExecConfig, SessionProvider};
use super::request::{DirectTcpip, split_command};

/// Relay argv for a destination: the relay command's words, then host and port.
pub fn relay_argv(relay_command: &str, params: &DirectTcpip) -> Result<Vec<String>, BridgeError> {
    let (host, port) = params.destination()?;
    let mut argv = split_command(relay_command)?;
    argv.push(host.to_string());
    argv.push(port.to_string());
    Ok(argv)
}

/// Serve one `direct-tcpip` channel until the relay ends.
pub async fn handle_direct_tcpip(
    channel: AcceptedChannel,
    params: DirectTcpip,
    provider: Arc<dyn SessionProvider>,
    relay_command: String,
    cancel: CancellationToken,
) {
    let AcceptedChannel {
        io,
        control,
        mut requests,
        ..
    } = channel;

    let closed = cancel.clone();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            debug!("Refusing {} request on forwarding channel", request.request.kind());
            if let Some(reply) = request.reply {
                reply.send(false);
            }
        }
        debug!("Forwarding channel closed by client");
        closed.cancel();
    });

    let argv = match relay_argv(&relay_command, &params) {
        Ok(argv) => argv,
        Err(e) => {
            warn!(
                "Rejecting direct-tcpip from {}:{}: {}",
                params.originator_ip, params.originator_port, e
            );
            close(control.as_ref()).await;
            return;
        }
    };

    info!(
        "Forwarding {}:{} -> {}:{}",
        params.originator_ip,
        params.originator_port,
        params.host_to_connect,
        params.port_to_connect
    );

    let started = provider
        .exec(ExecConfig {
            argv,
            env: Vec::new(),
            tty: false,
            io,
            cancel,
        })
        .await;

    match started {
        Ok(completion) => {
            let result = completion.wait().await;
            if let Some(e) = result.error {
                warn!("direct-tcpip relay ended with error: {}", e);
            } else {
                debug!("direct-tcpip relay exited with code {}", result.exit_code);
            }
        }
        Err(e) => {
            error!(
                "direct-tcpip requires [{}] installed inside the container, launch failed: {}",
                relay_command, e
            );
        }
    }

    close(control.as_ref()).await;
}

async fn close(control: &dyn ChannelControl) {
    if let Err(e) = control.close().await {
        debug!("Could not close forwarding channel: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sshd::error::UNKNOWN_EXIT_CODE;
    use crate::sshd::request::{ChannelRequest, SessionRequest};
    use std::time::Duration;
    use crate::sshd::testing::{ChannelEvent, FakeChannel, FakeProvider, null_io};
    use tokio::sync::mpsc;

    fn params(host: &str, port: u32) -> DirectTcpip {
        DirectTcpip {
            host_to_connect: host.to_string(),
            port_to_connect: port,
            originator_ip: "10.0.0.5".to_string(),
            originator_port: 40222,
        }
    }

    fn accepted(
        control: Arc<FakeChannel>,
    ) -> (AcceptedChannel, mpsc::UnboundedSender<ChannelRequest>) {
        let (tx, requests) = mpsc::unbounded_channel();
        (
            AcceptedChannel {
                id: "7".to_string(),
                io: null_io(),
                control,
                requests,
            },
            tx,
        )
    }

    mod argv {
        use super::*;

        #[test]
        fn test_default_relay() {
            assert_eq!(
                relay_argv("nc", &params("localhost", 5432)).unwrap(),
                vec!["nc", "localhost", "5432"]
            );
        }

        #[test]
        fn test_relay_with_arguments() {
            assert_eq!(
                relay_argv("socat -", &params("db", 3306)).unwrap(),
                vec!["socat", "-", "db", "3306"]
            );
        }

        #[test]
        fn test_invalid_port() {
            assert!(relay_argv("nc", &params("db", 65536)).is_err());
        }
    }

    mod relay {
        use super::*;

        #[tokio::test]
        async fn test_runs_relay_without_tty() {
            let provider = Arc::new(FakeProvider::new());
            let (control, mut events) = FakeChannel::new();
            let (channel, _requests) = accepted(control);

            let task = tokio::spawn(handle_direct_tcpip(
                channel,
                params("redis", 6379),
                provider.clone(),
                "nc".to_string(),
                CancellationToken::new(),
            ));

            while provider.exec_calls().is_empty() {
                tokio::task::yield_now().await;
            }
            let calls = provider.exec_calls();
            let call = &calls[0];
            assert_eq!(call.argv, vec!["nc", "redis", "6379"]);
            assert!(!call.tty);
            assert!(call.env.is_empty());

            provider.finish(0);
            task.await.unwrap();
            assert_eq!(events.recv().await, Some(ChannelEvent::Close));
        }

        #[tokio::test]
        async fn test_launch_failure_closes_channel() {
            let provider = Arc::new(FakeProvider::new());
            provider.fail_exec("executable file not found in $PATH");
            let (control, mut events) = FakeChannel::new();
            let (channel, _requests) = accepted(control);

            handle_direct_tcpip(
                channel,
                params("localhost", 80),
                provider.clone(),
                "nc".to_string(),
                CancellationToken::new(),
            )
            .await;

            assert_eq!(events.recv().await, Some(ChannelEvent::Close));
            assert_eq!(provider.exec_calls().len(), 1);
        }

        #[tokio::test]
        async fn test_bad_destination_skips_backend() {
            let provider = Arc::new(FakeProvider::new());
            let (control, mut events) = FakeChannel::new();
            let (channel, _requests) = accepted(control);

            handle_direct_tcpip(
                channel,
                params("", 80),
                provider.clone(),
                "nc".to_string(),
                CancellationToken::new(),
            )
            .await;

            assert_eq!(events.recv().await, Some(ChannelEvent::Close));
            assert!(provider.exec_calls().is_empty());
        }

        #[tokio::test]
        async fn test_session_requests_are_refused() {
            let provider = Arc::new(FakeProvider::new());
            let (control, _events) = FakeChannel::new();
            let (channel, requests) = accepted(control);

            let task = tokio::spawn(handle_direct_tcpip(
                channel,
                params("localhost", 8080),
                provider.clone(),
                "nc".to_string(),
                CancellationToken::new(),
            ));

            let (request, outcome) = ChannelRequest::new(SessionRequest::Shell);
            requests.send(request).unwrap();
            assert!(!outcome.await.unwrap());

            while provider.exec_calls().is_empty() {
                tokio::task::yield_now().await;
            }
            provider.finish(0);
            task.await.unwrap();
        }

        #[tokio::test]
        async fn test_client_close_cancels_relay() {
            let provider = Arc::new(FakeProvider::new());
            let (control, _events) = FakeChannel::new();
            let (channel, requests) = accepted(control);

            let task = tokio::spawn(handle_direct_tcpip(
                channel,
                params("localhost", 8080),
                provider.clone(),
                "nc".to_string(),
                CancellationToken::new(),
            ));
            while provider.exec_tokens().is_empty() {
                tokio::task::yield_now().await;
            }
            let relay = provider.exec_tokens().remove(0);
            assert!(!relay.is_cancelled());

            drop(requests);
            tokio::time::timeout(Duration::from_secs(5), relay.cancelled())
                .await
                .unwrap();

            provider.finish(UNKNOWN_EXIT_CODE);
            task.await.unwrap();
        }
    }
}
