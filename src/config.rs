//! Runner configuration.
//!
//! Everything is read from the environment:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `SOCKET_RUNNER_ADDR` | `unix:<path>`, `tcp:<host:port>` or a bare socket path | see [`default_socket_path`] |
//! | `SOCKET_RUNNER_TIMEOUT` | connect/command timeout in seconds | `10` |
//! | `SOCKET_RUNNER_TIMEOUT_POLICY` | `abort` or `error` | `abort` |
//! | `SOCKET_RUNNER_LOG_MODE` | `normal`, `default` or `verbose` | `normal` |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default connect/command timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// How long `shutdown` waits for the channel to close.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub const ADDR_ENV: &str = "SOCKET_RUNNER_ADDR";
pub const TIMEOUT_ENV: &str = "SOCKET_RUNNER_TIMEOUT";
pub const TIMEOUT_POLICY_ENV: &str = "SOCKET_RUNNER_TIMEOUT_POLICY";
pub const LOG_MODE_ENV: &str = "SOCKET_RUNNER_LOG_MODE";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {var} value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Where the worker process listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAddress {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for ChannelAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("address is empty".to_string());
        }
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err("unix socket path is empty".to_string());
            }
            return Ok(ChannelAddress::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            if !addr.contains(':') {
                return Err("tcp address must be host:port".to_string());
            }
            return Ok(ChannelAddress::Tcp(addr.to_string()));
        }
        Ok(ChannelAddress::Unix(PathBuf::from(s)))
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            ChannelAddress::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// Resolve the default socket path for the worker process.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR/socket-runner.sock` (Linux standard)
/// 2. `~/Library/Caches/socket-runner.sock` (macOS)
/// 3. `/tmp/socket-runner.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("socket-runner.sock");
    }

    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join("socket-runner.sock");
    }

    PathBuf::from("/tmp/socket-runner.sock")
}

/// Verbosity of the runner's log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    /// Only always-on messages.
    #[default]
    Normal,
    /// Always-on plus verbose-only messages.
    Verbose,
}

impl FromStr for LogMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "normal" | "default" => Ok(LogMode::Normal),
            "verbose" => Ok(LogMode::Verbose),
            _ => Err("expected 'normal', 'default' or 'verbose'".to_string()),
        }
    }
}

impl LogMode {
    /// Default `EnvFilter` directive when `RUST_LOG` is not set.
    pub fn filter_directive(&self) -> &'static str {
        match self {
            LogMode::Normal => "socket_runner=info",
            LogMode::Verbose => "socket_runner=debug",
        }
    }
}

/// What the bridge does when a connect or command wait times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Log and terminate the process.
    #[default]
    Abort,
    /// Return a timeout error to the caller.
    ReturnError,
}

impl FromStr for TimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "abort" => Ok(TimeoutPolicy::Abort),
            "error" => Ok(TimeoutPolicy::ReturnError),
            _ => Err("expected 'abort' or 'error'".to_string()),
        }
    }
}

/// Configuration for a `Bridge` and its socket channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub address: ChannelAddress,
    /// Timeout for both opening the channel and each command.
    pub connect_timeout: Duration,
    /// Upper bound on how long `shutdown` blocks.
    pub shutdown_timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
    pub log_mode: LogMode,
    /// Log mode value that was not recognized and fell back to `Normal`.
    pub unrecognized_log_mode: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            address: ChannelAddress::Unix(default_socket_path()),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            timeout_policy: TimeoutPolicy::default(),
            log_mode: LogMode::default(),
            unrecognized_log_mode: None,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ADDR_ENV) {
            config.address = value.parse().map_err(|reason| ConfigError::Invalid {
                var: ADDR_ENV,
                value: value.clone(),
                reason,
            })?;
        }

        if let Some(value) = lookup(TIMEOUT_ENV) {
            let secs: u64 = value.trim().parse().map_err(|e| ConfigError::Invalid {
                var: TIMEOUT_ENV,
                value: value.clone(),
                reason: format!("{}", e),
            })?;
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var: TIMEOUT_ENV,
                    value,
                    reason: "timeout must be at least one second".to_string(),
                });
            }
            config.connect_timeout = Duration::from_secs(secs);
        }

        if let Some(value) = lookup(TIMEOUT_POLICY_ENV) {
            config.timeout_policy = value.parse().map_err(|reason| ConfigError::Invalid {
                var: TIMEOUT_POLICY_ENV,
                value: value.clone(),
                reason,
            })?;
        }

        if let Some(value) = lookup(LOG_MODE_ENV) {
            match value.parse() {
                Ok(mode) => config.log_mode = mode,
                Err(_) => config.unrecognized_log_mode = Some(value),
            }
        }

        Ok(config)
    }

    /// Log settings that fell back to a default. Call once logging is installed.
    pub fn report_fallbacks(&self) {
        if let Some(value) = &self.unrecognized_log_mode {
            tracing::info!("unrecognized log mode: {}, defaulting to 'normal'", value.trim());
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }
}
