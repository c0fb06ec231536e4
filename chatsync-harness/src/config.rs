//! Configuration system for the `ChatSync` harness server.
//!
//! Supports layered configuration with the following priority (highest
//! first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatsync-harness/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

use chatsync_proto::api::MAX_UPLOAD_SIZE;

/// Errors that can occur when loading harness configuration.
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

/// Top-level TOML config file structure for the harness.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HarnessConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section of the harness config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_upload_size: Option<u64>,
}

/// CLI arguments for the harness server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "ChatSync backend harness")]
pub struct HarnessCliArgs {
    /// Address to bind the harness server to.
    #[arg(short, long, env = "CHATSYNC_HARNESS_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/chatsync-harness/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum upload size in bytes.
    #[arg(long)]
    pub max_upload_size: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATSYNC_HARNESS_LOG")]
    pub log_level: String,
}

/// Fully resolved harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:8001`).
    pub bind_addr: String,
    /// Maximum accepted upload size in bytes.
    pub max_upload_size: u64,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8001".to_string(),
            max_upload_size: MAX_UPLOAD_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read or
    /// parsed.
    pub fn load(cli: &HarnessCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    fn resolve(cli: &HarnessCliArgs, file: &HarnessConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_upload_size: cli
                .max_upload_size
                .or(file.server.max_upload_size)
                .unwrap_or(defaults.max_upload_size),
            log_level: cli.log_level.clone(),
        }
    }
}

/// Load and parse a TOML config file; a missing default-path file is fine.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<HarnessConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(HarnessConfigFile::default());
        };
        config_dir.join("chatsync-harness").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HarnessConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
