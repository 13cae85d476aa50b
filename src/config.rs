//! Configuration parsing and structures

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::env::substitute_env_vars;

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Node identifier; falls back to `$NODE_ID`, then `$HOSTNAME`
    pub node_id: Option<String>,

    /// Mounting daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Mount option defaults
    #[serde(default)]
    pub mount: MountDefaults,

    /// Drain behaviour on unpublish
    #[serde(default)]
    pub drain: DrainConfig,

    /// Provisioning behaviour
    #[serde(default)]
    pub controller: ControllerConfig,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub node_id: String,
    pub daemon: DaemonConfig,
    pub mount: MountDefaults,
    pub drain: DrainConfig,
    pub controller: ControllerConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Settings for the background remote-control daemon
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Daemon executable
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Loopback address the control endpoint listens on
    #[serde(default = "default_address")]
    pub address: String,

    /// Per-request timeout for control calls
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How long to wait for the control endpoint after spawning
    #[serde(default = "default_startup_timeout", with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Root of the daemon's on-disk VFS cache
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Daemon log file; stderr is captured when unset
    pub log_file: Option<PathBuf>,

    /// Extra command-line arguments appended verbatim
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Daemon flags exported as `RCLONE_*` environment variables
    #[serde(default)]
    pub flags: HashMap<String, String>,
}

fn default_binary() -> String {
    "rclone".to_string()
}

fn default_address() -> String {
    "127.0.0.1:5572".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/tmp/csi-rclone/cache")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            address: default_address(),
            request_timeout: default_request_timeout(),
            startup_timeout: default_startup_timeout(),
            cache_dir: default_cache_dir(),
            log_file: None,
            extra_args: Vec::new(),
            flags: HashMap::new(),
        }
    }
}

/// Defaults applied to every mount request
#[derive(Debug, Clone, Deserialize)]
pub struct MountDefaults {
    /// VFS cache mode (off, minimal, writes, full)
    #[serde(default = "default_cache_mode")]
    pub cache_mode: String,

    /// Directory listing cache lifetime
    #[serde(default = "default_dir_cache_time", with = "humantime_serde")]
    pub dir_cache_time: Duration,

    #[serde(default = "default_true")]
    pub allow_other: bool,

    #[serde(default = "default_true")]
    pub allow_non_empty: bool,
}

fn default_cache_mode() -> String {
    "writes".to_string()
}

fn default_dir_cache_time() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

impl Default for MountDefaults {
    fn default() -> Self {
        Self {
            cache_mode: default_cache_mode(),
            dir_cache_time: default_dir_cache_time(),
            allow_other: true,
            allow_non_empty: true,
        }
    }
}

/// Write-back drain settings used before unmounting
#[derive(Debug, Clone, Deserialize)]
pub struct DrainConfig {
    /// Interval between stats polls
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Hard ceiling after which unmount proceeds regardless
    #[serde(default = "default_max_wait", with = "humantime_serde")]
    pub max_wait: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_wait() -> Duration {
    Duration::from_secs(60 * 60)
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_wait: default_max_wait(),
        }
    }
}

/// Provisioning behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Create the remote path on CreateVolume (best-effort)
    #[serde(default = "default_true")]
    pub create_remote_dir: bool,

    /// Purge the remote path on DeleteVolume
    #[serde(default = "default_true")]
    pub purge_on_delete: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            create_remote_dir: true,
            purge_on_delete: true,
        }
    }
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config, filling in the node identity
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let node_id = self
            .node_id
            .filter(|id| !id.is_empty())
            .or_else(|| std::env::var("NODE_ID").ok())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .ok_or_else(|| {
                ConfigError::ValidationError(
                    "node_id not set and neither NODE_ID nor HOSTNAME is available".to_string(),
                )
            })?;

        Ok(Config {
            logging: self.logging,
            node_id,
            daemon: self.daemon,
            mount: self.mount,
            drain: self.drain,
            controller: self.controller,
        })
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.clone(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, substituting `${VAR}` references
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        let raw: RawConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "node_id cannot be empty".to_string(),
            ));
        }

        if self.daemon.binary.is_empty() {
            return Err(ConfigError::ValidationError(
                "daemon.binary cannot be empty".to_string(),
            ));
        }

        if self.daemon.address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "daemon.address must be host:port, got {:?}",
                self.daemon.address
            )));
        }

        if self.drain.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "drain.poll_interval must be greater than zero".to_string(),
            ));
        }

        if self.drain.max_wait < self.drain.poll_interval {
            return Err(ConfigError::ValidationError(format!(
                "drain.max_wait ({:?}) is shorter than drain.poll_interval ({:?})",
                self.drain.max_wait, self.drain.poll_interval
            )));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
