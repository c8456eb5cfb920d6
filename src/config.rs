//! Configuration for the `handover-server` binary.

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::graceful::RunOptions;
use crate::policy::ShutdownPolicy;
use crate::upgrader::DEFAULT_UPGRADE_TIMEOUT;

/// CLI arguments for the handover server.
#[derive(Parser, Debug)]
#[command(name = "handover-server")]
#[command(about = "HTTP server with zero-downtime restarts on SIGHUP")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG")]
    config: Option<PathBuf>,
}

/// Server configuration.
///
/// Fields use serde defaults that fall back to environment variables,
/// then to hardcoded defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default = "config_defaults::default_pid_file")]
    pid_file: Option<PathBuf>,
    /// Seconds; zero or negative waits for connections indefinitely.
    #[serde(default = "config_defaults::default_shutdown_timeout")]
    shutdown_timeout: f64,
    /// Seconds a successor gets to become ready.
    #[serde(default = "config_defaults::default_upgrade_timeout")]
    upgrade_timeout: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            pid_file: config_defaults::default_pid_file(),
            shutdown_timeout: config_defaults::default_shutdown_timeout(),
            upgrade_timeout: config_defaults::default_upgrade_timeout(),
        }
    }
}

pub mod config_defaults {
    use std::env;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;

    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: f64 = 3.0;
    pub const DEFAULT_UPGRADE_TIMEOUT_SECS: f64 = 60.0;

    fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
        env::var(key).ok().and_then(|s| s.parse().ok())
    }

    /// Returns the default port value with fallback: $PORT env var -> 8080
    pub fn default_port() -> u16 {
        parsed("PORT").unwrap_or(DEFAULT_PORT)
    }

    /// Returns the default host value with fallback: $HOST env var -> "0.0.0.0"
    pub fn default_host() -> IpAddr {
        parsed("HOST").unwrap_or(DEFAULT_HOST)
    }

    /// Returns the PID file path from $PID_FILE, if set
    pub fn default_pid_file() -> Option<PathBuf> {
        env::var_os("PID_FILE")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }

    /// Returns the shutdown timeout with fallback: $SHUTDOWN_TIMEOUT env var -> 3 seconds
    pub fn default_shutdown_timeout() -> f64 {
        parsed("SHUTDOWN_TIMEOUT").unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
    }

    /// Returns the upgrade timeout with fallback: $UPGRADE_TIMEOUT env var -> 60 seconds
    pub fn default_upgrade_timeout() -> f64 {
        parsed("UPGRADE_TIMEOUT").unwrap_or(DEFAULT_UPGRADE_TIMEOUT_SECS)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// The address the server listens on.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_deref()
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        ShutdownPolicy::from_secs_f64(self.shutdown_timeout)
    }

    /// Non-positive or unparseable values fall back to the default.
    pub fn upgrade_timeout(&self) -> Duration {
        if self.upgrade_timeout.is_finite() && self.upgrade_timeout > 0.0 {
            Duration::try_from_secs_f64(self.upgrade_timeout).unwrap_or(DEFAULT_UPGRADE_TIMEOUT)
        } else {
            DEFAULT_UPGRADE_TIMEOUT
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            pid_file: self.pid_file.clone(),
            shutdown: self.shutdown_policy(),
            upgrade_timeout: self.upgrade_timeout(),
            on_upgrade_failure: None,
        }
    }

    /// Load configuration from CLI arguments and an optional JSON file.
    ///
    /// Without `--config` (or `$CONFIG`) every value comes from the environment or the
    /// built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        match cli_args.config {
            Some(path) => Self::load_from_path(path),
            None => Ok(Self::default()),
        }
    }

    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}
