//! Configuration resolution for the SSH bridge server.
//!
//! Every value is resolved once at startup with a two-tier priority:
//!
//! 1. **Environment Variable** - Value from environment variable
//! 2. **Default** - Built-in default value
//!
//! A value that is set but does not parse falls back to the default.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSHD_LISTEN_ADDR` | `0.0.0.0` | Listening address |
//! | `SSHD_PORT` | 2232 | Listening port |
//! | `SSHD_HOST_KEY` | `/etc/ssh/ssh_host_ed25519_key` | Host private key (OpenSSH format) |
//! | `SSHD_COMMAND` | `/bin/sh` | Command started for `shell` requests |
//! | `SSHD_RELAY_COMMAND` | `nc` | Relay used inside the container for `direct-tcpip` |
//! | `SSHD_EXEC_TIMEOUT` | 10s | Bound on waiting for a command's exit status |
//! | `SSHD_POLL_INTERVAL_MS` | 1000ms | Interval between exit status probes |
//! | `SSHD_INACTIVITY_TIMEOUT` | 3600s | Idle connection timeout |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::completion::PollPolicy;

/// Default listening address
pub(crate) const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0";

/// Default listening port
pub(crate) const DEFAULT_PORT: u16 = 2232;

/// Default host key path
pub(crate) const DEFAULT_HOST_KEY_PATH: &str = "/etc/ssh/ssh_host_ed25519_key";

/// Default command for `shell` requests
pub(crate) const DEFAULT_COMMAND: &str = "/bin/sh";

/// Default relay command for `direct-tcpip` channels
pub(crate) const DEFAULT_RELAY_COMMAND: &str = "nc";

/// Default exit status wait bound in seconds
pub(crate) const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 10;

/// Default exit status probe interval in milliseconds
pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default idle connection timeout in seconds
pub(crate) const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 3600;

/// Environment variable name for the listening address
pub(crate) const LISTEN_ADDR_ENV_VAR: &str = "SSHD_LISTEN_ADDR";

/// Environment variable name for the listening port
pub(crate) const PORT_ENV_VAR: &str = "SSHD_PORT";

/// Environment variable name for the host key path
pub(crate) const HOST_KEY_ENV_VAR: &str = "SSHD_HOST_KEY";

/// Environment variable name for the default shell command
pub(crate) const COMMAND_ENV_VAR: &str = "SSHD_COMMAND";

/// Environment variable name for the port-forward relay command
pub(crate) const RELAY_COMMAND_ENV_VAR: &str = "SSHD_RELAY_COMMAND";

/// Environment variable name for the exit status wait bound in seconds
pub(crate) const EXEC_TIMEOUT_ENV_VAR: &str = "SSHD_EXEC_TIMEOUT";

/// Environment variable name for the probe interval in milliseconds
pub(crate) const POLL_INTERVAL_MS_ENV_VAR: &str = "SSHD_POLL_INTERVAL_MS";

/// Environment variable name for the idle connection timeout in seconds
pub(crate) const INACTIVITY_TIMEOUT_ENV_VAR: &str = "SSHD_INACTIVITY_TIMEOUT";

/// Resolve a parsed value: env var -> default
fn resolve<T: FromStr>(var: &str, default: T) -> T {
    if let Ok(raw) = env::var(var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }
    default
}

/// Resolve a string value: non-blank env var -> default
fn resolve_string(var: &str, default: &str) -> String {
    if let Ok(raw) = env::var(var)
        && !raw.trim().is_empty()
    {
        return raw.trim().to_string();
    }
    default.to_string()
}

/// Settings each connection's bridge needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Command line started for `shell` requests.
    pub default_command: String,
    /// Relay command line for `direct-tcpip`; host and port are appended.
    pub relay_command: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_command: DEFAULT_COMMAND.to_string(),
            relay_command: DEFAULT_RELAY_COMMAND.to_string(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshdConfig {
    pub listen_addr: String,
    pub port: u16,
    pub host_key_path: PathBuf,
    pub default_command: String,
    pub relay_command: String,
    pub exec_timeout: Duration,
    pub poll_interval: Duration,
    pub inactivity_timeout: Duration,
}

impl SshdConfig {
    /// Read the configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            listen_addr: resolve_string(LISTEN_ADDR_ENV_VAR, DEFAULT_LISTEN_ADDR),
            port: resolve(PORT_ENV_VAR, DEFAULT_PORT),
            host_key_path: PathBuf::from(resolve_string(HOST_KEY_ENV_VAR, DEFAULT_HOST_KEY_PATH)),
            default_command: resolve_string(COMMAND_ENV_VAR, DEFAULT_COMMAND),
            relay_command: resolve_string(RELAY_COMMAND_ENV_VAR, DEFAULT_RELAY_COMMAND),
            exec_timeout: Duration::from_secs(resolve(
                EXEC_TIMEOUT_ENV_VAR,
                DEFAULT_EXEC_TIMEOUT_SECS,
            )),
            poll_interval: Duration::from_millis(resolve(
                POLL_INTERVAL_MS_ENV_VAR,
                DEFAULT_POLL_INTERVAL_MS,
            )),
            inactivity_timeout: Duration::from_secs(resolve(
                INACTIVITY_TIMEOUT_ENV_VAR,
                DEFAULT_INACTIVITY_TIMEOUT_SECS,
            )),
        }
    }

    /// `host:port` to bind.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            default_command: self.default_command.clone(),
            relay_command: self.relay_command.clone(),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.exec_timeout)
    }
}

impl Default for SshdConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            port: DEFAULT_PORT,
            host_key_path: PathBuf::from(DEFAULT_HOST_KEY_PATH),
            default_command: DEFAULT_COMMAND.to_string(),
            relay_command: DEFAULT_RELAY_COMMAND.to_string(),
            exec_timeout: Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            inactivity_timeout: Duration::from_secs(DEFAULT_INACTIVITY_TIMEOUT_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // SAFETY: Tests are serialized via ENV_TEST_MUTEX to prevent data races
    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    const ALL_ENV_VARS: [&str; 8] = [
        LISTEN_ADDR_ENV_VAR,
        PORT_ENV_VAR,
        HOST_KEY_ENV_VAR,
        COMMAND_ENV_VAR,
        RELAY_COMMAND_ENV_VAR,
        EXEC_TIMEOUT_ENV_VAR,
        POLL_INTERVAL_MS_ENV_VAR,
        INACTIVITY_TIMEOUT_ENV_VAR,
    ];

    /// Helper to set an environment variable safely within tests.
    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn set_env(key: &str, value: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::set_var(key, value) };
    }

    /// Helper to remove an environment variable safely within tests.
    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn remove_env(key: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::remove_var(key) };
    }

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX.
    unsafe fn clear_all() {
        for key in ALL_ENV_VARS {
            // SAFETY: Caller ensures ENV_TEST_MUTEX is held
            unsafe { remove_env(key) };
        }
    }

    mod defaults {
        use super::*;

        #[test]
        fn test_from_env_without_variables() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                clear_all();
            }
            let config = SshdConfig::from_env();
            assert_eq!(config, SshdConfig::default());
            assert_eq!(config.listen_address(), "0.0.0.0:2232");
        }

        #[test]
        fn test_default_poll_policy() {
            let policy = SshdConfig::default().poll_policy();
            assert_eq!(policy, PollPolicy::default());
        }

        #[test]
        fn test_default_bridge_config() {
            assert_eq!(SshdConfig::default().bridge_config(), BridgeConfig::default());
        }
    }

    mod env_resolution {
        use super::*;

        #[test]
        fn test_numeric_values_from_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                clear_all();
                set_env(PORT_ENV_VAR, "2022");
                set_env(EXEC_TIMEOUT_ENV_VAR, "30");
                set_env(POLL_INTERVAL_MS_ENV_VAR, "250");
                set_env(INACTIVITY_TIMEOUT_ENV_VAR, " 60 ");
            }
            let config = SshdConfig::from_env();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                clear_all();
            }
            assert_eq!(config.port, 2022);
            assert_eq!(config.exec_timeout, Duration::from_secs(30));
            assert_eq!(config.poll_interval, Duration::from_millis(250));
            assert_eq!(config.inactivity_timeout, Duration::from_secs(60));
            assert_eq!(
                config.poll_policy(),
                PollPolicy::new(Duration::from_millis(250), Duration::from_secs(30))
            );
        }

        #[test]
        fn test_invalid_numbers_fall_back() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                clear_all();
                set_env(PORT_ENV_VAR, "99999");
                set_env(EXEC_TIMEOUT_ENV_VAR, "soon");
            }
            let config = SshdConfig::from_env();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                clear_all();
            }
            assert_eq!(config.port, DEFAULT_PORT);
            assert_eq!(
                config.exec_timeout,
                Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS)
            );
        }

        #[test]
        fn test_string_values_from_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                clear_all();
                set_env(LISTEN_ADDR_ENV_VAR, "127.0.0.1");
                set_env(HOST_KEY_ENV_VAR, "/run/secrets/host_key");
                set_env(COMMAND_ENV_VAR, "/bin/bash -l");
                set_env(RELAY_COMMAND_ENV_VAR, "socat -");
            }
            let config = SshdConfig::from_env();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                clear_all();
            }
            assert_eq!(config.listen_address(), "127.0.0.1:2232");
            assert_eq!(config.host_key_path, PathBuf::from("/run/secrets/host_key"));
            assert_eq!(
                config.bridge_config(),
                BridgeConfig {
                    default_command: "/bin/bash -l".to_string(),
                    relay_command: "socat -".to_string(),
                }
            );
        }

        #[test]
        fn test_blank_string_falls_back() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                clear_all();
                set_env(COMMAND_ENV_VAR, "   ");
            }
            let config = SshdConfig::from_env();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                clear_all();
            }
            assert_eq!(config.default_command, DEFAULT_COMMAND);
        }
    }
}
