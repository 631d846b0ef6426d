//! Typed SSH channel requests and open parameters.
//!
//! The transport layer decodes RFC 4254 payloads into these types and feeds
//! them to the bridge in arrival order. Interpreting the decoded fields (argv
//! splitting, environment validation, destination checks) happens here, so a
//! malformed value fails the single request that carried it and nothing else.

use tokio::sync::oneshot;

use super::error::BridgeError;

/// Wire name of the keepalive global request sent by OpenSSH clients.
pub const KEEPALIVE_REQUEST: &str = "keepalive@openssh.com";

/// `pty-req` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// TERM value requested by the client; kept for logging only.
    pub term: String,
    pub width: u32,
    pub height: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    /// Encoded terminal modes as (opcode, argument) pairs.
    pub modes: Vec<(u8, u32)>,
}

/// `window-change` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowChange {
    pub width: u32,
    pub height: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

/// A request on a `session` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    PtyReq(PtyRequest),
    WindowChange(WindowChange),
    Env { name: String, value: String },
    Shell,
    /// Raw command bytes; decoded by the session.
    Exec { command: Vec<u8> },
    /// Any request type the bridge does not implement.
    Other(String),
}

impl SessionRequest {
    /// The request type as named on the wire.
    pub fn kind(&self) -> &str {
        match self {
            SessionRequest::PtyReq(_) => "pty-req",
            SessionRequest::WindowChange(_) => "window-change",
            SessionRequest::Env { .. } => "env",
            SessionRequest::Shell => "shell",
            SessionRequest::Exec { .. } => "exec",
            SessionRequest::Other(kind) => kind,
        }
    }
}

/// Answers exactly one channel request.
#[derive(Debug)]
pub struct RequestReply(oneshot::Sender<bool>);

impl RequestReply {
    /// Report the request's outcome. Ignored if the transport stopped waiting.
    pub fn send(self, success: bool) {
        let _ = self.0.send(success);
    }
}

/// A channel request, with a reply handle when the client wants an answer.
#[derive(Debug)]
pub struct ChannelRequest {
    pub request: SessionRequest,
    pub reply: Option<RequestReply>,
}

impl ChannelRequest {
    /// A request the client wants answered; the receiver yields the outcome.
    pub fn new(request: SessionRequest) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                reply: Some(RequestReply(tx)),
            },
            rx,
        )
    }

    /// A request sent with `want_reply` false.
    pub fn without_reply(request: SessionRequest) -> Self {
        Self {
            request,
            reply: None,
        }
    }

    pub fn wants_reply(&self) -> bool {
        self.reply.is_some()
    }
}

/// `direct-tcpip` channel open payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectTcpip {
    pub host_to_connect: String,
    pub port_to_connect: u32,
    pub originator_ip: String,
    pub originator_port: u32,
}

impl DirectTcpip {
    /// Validated destination host and port.
    pub fn destination(&self) -> Result<(&str, u16), BridgeError> {
        let host = self.host_to_connect.trim();
        if host.is_empty() {
            return Err(BridgeError::malformed("direct-tcpip", "empty destination host"));
        }
        let port = u16::try_from(self.port_to_connect).map_err(|_| {
            BridgeError::malformed(
                "direct-tcpip",
                format!("destination port {} out of range", self.port_to_connect),
            )
        })?;
        Ok((host, port))
    }
}

/// Split a command line into argv on whitespace.
///
/// There is no quoting or escaping: `sh -c "echo hi"` becomes
/// `["sh", "-c", "\"echo", "hi\""]`. Clients rely on this behaviour.
pub fn split_command(line: &str) -> Result<Vec<String>, BridgeError> {
    let argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(BridgeError::EmptyCommand);
    }
    Ok(argv)
}

/// Decode an `exec` payload into argv.
pub fn parse_exec_command(command: &[u8]) -> Result<Vec<String>, BridgeError> {
    let line = std::str::from_utf8(command)
        .map_err(|e| BridgeError::malformed("exec", format!("command is not UTF-8: {}", e)))?;
    split_command(line)
}

/// Render one `env` request as a `NAME=value` entry.
pub fn format_env(name: &str, value: &str) -> Result<String, BridgeError> {
    if name.is_empty() {
        return Err(BridgeError::malformed("env", "empty variable name"));
    }
    if name.contains('=') || name.contains('\0') || value.contains('\0') {
        return Err(BridgeError::malformed(
            "env",
            format!("invalid variable name or value for {:?}", name),
        ));
    }
    Ok(format!("{}={}", name, value))
}
