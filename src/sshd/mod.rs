//! SSH bridge exposing containers as SSH hosts.
//!
//! This module is organized into the following submodules:
//!
//! - `provider`: Backend capability contract implemented by container runtimes
//! - `completion`: Exit status polling for backends without a completion stream
//! - `request`: Typed channel requests and their validation
//! - `resize`: Deferred terminal resize coordination
//! - `exec`: Single-start command lifecycle and exit status reporting
//! - `session`: `session` channel request handling
//! - `channel`: Channel demultiplexing and global requests for one connection
//! - `forward`: `direct-tcpip` port forwarding (feature-gated)
//! - `server`: russh listener and connection handler
//! - `docker`: Docker Engine backend (feature-gated)
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error types shared by all layers

pub mod channel;
pub mod completion;
pub mod config;
#[cfg(feature = "docker")]
pub mod docker;
pub mod error;
pub mod exec;
#[cfg(feature = "port_forward")]
pub mod forward;
pub mod provider;
pub mod request;
pub mod resize;
pub mod server;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;

pub use channel::{Bridge, ChannelControl, Transport};
pub use config::{BridgeConfig, SshdConfig};
pub use error::{BridgeError, ProviderError, SshdError, UNKNOWN_EXIT_CODE};
pub use provider::{ProviderFactory, SessionProvider};
pub use server::run_server;
