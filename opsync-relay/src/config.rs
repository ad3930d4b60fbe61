//! Relay server configuration.
//!
//! Values come from, highest priority first: CLI flags, environment
//! variables (through clap's `env`), `~/.config/opsync-relay/config.toml`,
//! then compiled defaults.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9000"
//!
//! [limits]
//! max_frame_size = 4194304
//! max_fetch_rows = 1000
//! ```

use std::path::{Path, PathBuf};

use crate::relay::Limits;

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";

/// Errors raised while loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("invalid relay config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// On-disk layout. Every field is optional so a file may set only a few.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileLayer {
    server: ServerSection,
    limits: LimitsSection,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    bind_addr: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LimitsSection {
    max_frame_size: Option<usize>,
    max_fetch_rows: Option<usize>,
}

/// Command-line flags for `opsync-relay`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Reference realtime row store for opsync clients")]
pub struct RelayCliArgs {
    /// Listen address, e.g. `127.0.0.1:9000`.
    #[arg(short, long, env = "OPSYNC_RELAY_ADDR")]
    pub bind: Option<String>,

    /// Config file to read instead of the default location.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest request frame accepted, in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Most rows returned by one fetch.
    #[arg(long)]
    pub max_fetch_rows: Option<usize>,

    /// Fallback log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "OPSYNC_RELAY_LOG")]
    pub log_level: String,
}

/// Effective relay settings after layering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Listen address.
    pub bind_addr: String,
    /// Request limits handed to [`crate::relay::RelayState`].
    pub limits: Limits,
    /// Fallback log filter.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            limits: Limits::default(),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Layers `cli` over the config file over defaults.
    ///
    /// A missing file at the default location counts as empty; a missing
    /// file named by `--config` is an error.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = match cli.config.as_deref() {
            Some(path) => read_layer(path)?,
            None => default_path()
                .map(|path| read_optional_layer(&path))
                .transpose()?
                .unwrap_or_default(),
        };
        Ok(Self::layered(cli, file))
    }

    fn layered(cli: &RelayCliArgs, file: FileLayer) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: layer(cli.bind.clone(), file.server.bind_addr, defaults.bind_addr),
            limits: Limits {
                max_frame_size: layer(
                    cli.max_frame_size,
                    file.limits.max_frame_size,
                    defaults.limits.max_frame_size,
                ),
                max_fetch_rows: layer(
                    cli.max_fetch_rows,
                    file.limits.max_fetch_rows,
                    defaults.limits.max_fetch_rows,
                ),
            },
            log_level: cli.log_level.clone(),
        }
    }
}

fn layer<T>(cli: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(file).unwrap_or(default)
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("opsync-relay").join("config.toml"))
}

fn read_layer(path: &Path) -> Result<FileLayer, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

fn read_optional_layer(path: &Path) -> Result<FileLayer, ConfigError> {
    match read_layer(path) {
        Err(ConfigError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            Ok(FileLayer::default())
        }
        other => other,
    }
}
