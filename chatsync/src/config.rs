//! Configuration system for the `ChatSync` engine.
//!
//! Supports layered configuration with the following priority (highest
//! first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use chatsync_proto::message::UserId;

use crate::session::{ReconnectPolicy, SessionConfig};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    reconnect: ReconnectFileConfig,
    sync: SyncFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    ws_url: Option<String>,
    http_url: Option<String>,
    user_id: Option<String>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    max_attempts: Option<u32>,
    delay_secs: Option<u64>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    page_size: Option<usize>,
    notification_ttl_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    upload_timeout_secs: Option<u64>,
    probe_timeout_ms: Option<u64>,
    channel_capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // -- Server --
    /// Event channel WebSocket URL.
    pub ws_url: Option<String>,
    /// Request/response base URL.
    pub http_url: Option<String>,
    /// The authenticating user.
    pub user_id: Option<String>,
    /// Deadline for establishing the WebSocket connection.
    pub connect_timeout: Duration,
    /// Deadline for the handshake acknowledgment.
    pub handshake_timeout: Duration,

    // -- Reconnect --
    /// Bounded reconnection budget.
    pub reconnect_attempts: u32,
    /// Fixed delay before each reconnection attempt.
    pub reconnect_delay: Duration,

    // -- Sync --
    /// History page size; `has_more` is inferred from full pages.
    pub page_size: usize,
    /// Notification time-to-live.
    pub notification_ttl: Duration,
    /// Deadline for a history or roster fetch.
    pub request_timeout: Duration,
    /// Deadline for a single upload attempt.
    pub upload_timeout: Duration,
    /// Deadline for clip duration probing.
    pub probe_timeout: Duration,
    /// Capacity for command/event mpsc channels.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            http_url: None,
            user_id: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
            page_size: 50,
            notification_ttl: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            upload_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_millis(2000),
            channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read or
    /// parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve an `EngineConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` to enable
    /// unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            ws_url: cli.ws_url.clone().or_else(|| file.server.ws_url.clone()),
            http_url: cli
                .http_url
                .clone()
                .or_else(|| file.server.http_url.clone()),
            user_id: cli.user.clone().or_else(|| file.server.user_id.clone()),
            connect_timeout: file
                .server
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            handshake_timeout: file
                .server
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            reconnect_attempts: file
                .reconnect
                .max_attempts
                .unwrap_or(defaults.reconnect_attempts),
            reconnect_delay: file
                .reconnect
                .delay_secs
                .map_or(defaults.reconnect_delay, Duration::from_secs),
            page_size: file.sync.page_size.unwrap_or(defaults.page_size),
            notification_ttl: file
                .sync
                .notification_ttl_secs
                .map_or(defaults.notification_ttl, Duration::from_secs),
            request_timeout: file
                .sync
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            upload_timeout: file
                .sync
                .upload_timeout_secs
                .map_or(defaults.upload_timeout, Duration::from_secs),
            probe_timeout: file
                .sync
                .probe_timeout_ms
                .map_or(defaults.probe_timeout, Duration::from_millis),
            channel_capacity: file
                .sync
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
        }
    }

    /// Build a [`SessionConfig`] from this configuration, if the required
    /// server fields are present.
    #[must_use]
    pub fn to_session_config(&self) -> Option<SessionConfig> {
        let ws_url = self.ws_url.clone()?;
        let user_id = self.user_id.clone()?;
        if user_id.is_empty() {
            return None;
        }

        let mut session = SessionConfig::new(ws_url, UserId::new(user_id));
        session.connect_timeout = self.connect_timeout;
        session.handshake_timeout = self.handshake_timeout;
        session.reconnect = ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            delay: self.reconnect_delay,
        };
        session.event_buffer = self.channel_capacity;
        Some(session)
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "ChatSync synchronization engine")]
pub struct CliArgs {
    /// WebSocket URL of the backend event channel.
    #[arg(long, env = "CHATSYNC_WS_URL")]
    pub ws_url: Option<String>,

    /// Base URL for request/response calls.
    #[arg(long, env = "CHATSYNC_HTTP_URL")]
    pub http_url: Option<String>,

    /// User id to authenticate as.
    #[arg(long, env = "CHATSYNC_USER")]
    pub user: Option<String>,

    /// Path to config file (default: `~/.config/chatsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATSYNC_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("chatsync").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
