//! Configuration system for the `opsync` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/opsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::identity::Identity;
use crate::sync::RetentionPolicy;

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

    /// A value parsed but is not usable.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    identity: IdentityFileConfig,
    store: StoreFileConfig,
    remote: RemoteFileConfig,
    peer: PeerFileConfig,
    retention: RetentionFileConfig,
    messages: MessagesFileConfig,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    user_id: Option<String>,
    display_name: Option<String>,
    role: Option<String>,
}

/// `[store]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StoreFileConfig {
    data_dir: Option<PathBuf>,
    sqlite: Option<bool>,
}

/// `[remote]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RemoteFileConfig {
    url: Option<String>,
    timeout_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    fetch_limit: Option<u32>,
}

/// `[peer]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PeerFileConfig {
    enabled: Option<bool>,
    group: Option<Ipv4Addr>,
    port: Option<u16>,
}

/// `[retention]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RetentionFileConfig {
    archive_days: Option<i64>,
    visibility_days: Option<i64>,
}

/// `[messages]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct MessagesFileConfig {
    dedup_window_secs: Option<u64>,
    history_limit: Option<usize>,
    max_task_text_len: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Remote realtime store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// WebSocket URL of the remote store. `None` runs local + peer only.
    pub url: Option<String>,
    /// Bound on every remote call, connect included.
    pub timeout: Duration,
    /// Interval of the fallback pull while the push feed is down.
    pub poll_interval: Duration,
    /// Maximum rows fetched per pull.
    pub fetch_limit: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(20),
            fetch_limit: 500,
        }
    }
}

/// Peer broadcast channel settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Whether to join the multicast group at all.
    pub enabled: bool,
    /// IPv4 multicast group.
    pub group: Ipv4Addr,
    /// UDP port shared by every peer.
    pub port: u16,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: Ipv4Addr::new(239, 255, 42, 99),
            port: 47474,
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    // -- Identity --
    /// Acting user.
    pub identity: Identity,

    // -- Store --
    /// Directory holding the blob store and the `SQLite` database.
    pub data_dir: PathBuf,
    /// Whether to open the queryable `SQLite` store.
    pub sqlite: bool,

    // -- Transports --
    /// Remote store settings.
    pub remote: RemoteConfig,
    /// Peer channel settings.
    pub peer: PeerConfig,

    // -- Merge --
    /// Archive and visibility windows.
    pub retention: RetentionPolicy,
    /// Window within which a remote message is matched to an optimistic copy.
    pub dedup_window: Duration,
    /// Maximum messages returned by the messages view.
    pub history_limit: usize,
    /// Maximum task text length in characters.
    pub max_task_text_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            identity: Identity::default(),
            data_dir: dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("opsync"),
            sqlite: true,
            remote: RemoteConfig::default(),
            peer: PeerConfig::default(),
            retention: RetentionPolicy::default(),
            dedup_window: Duration::from_secs(5),
            history_limit: 500,
            max_task_text_len: 1000,
        }
    }
}

impl SyncConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/opsync/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if a retention window is negative.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `SyncConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let archive_days = file
            .retention
            .archive_days
            .unwrap_or(RetentionPolicy::DEFAULT_ARCHIVE_DAYS);
        let visibility_days = file
            .retention
            .visibility_days
            .unwrap_or(RetentionPolicy::DEFAULT_VISIBILITY_DAYS);
        if archive_days < 0 {
            return Err(ConfigError::Invalid {
                field: "retention.archive_days",
                reason: format!("{archive_days} is negative"),
            });
        }
        if visibility_days < 0 {
            return Err(ConfigError::Invalid {
                field: "retention.visibility_days",
                reason: format!("{visibility_days} is negative"),
            });
        }

        Ok(Self {
            identity: Identity {
                user_id: cli
                    .user_id
                    .clone()
                    .or_else(|| file.identity.user_id.clone())
                    .unwrap_or(defaults.identity.user_id),
                display_name: cli
                    .display_name
                    .clone()
                    .or_else(|| file.identity.display_name.clone())
                    .unwrap_or(defaults.identity.display_name),
                role: cli
                    .role
                    .clone()
                    .or_else(|| file.identity.role.clone())
                    .unwrap_or(defaults.identity.role),
            },
            data_dir: cli
                .data_dir
                .clone()
                .or_else(|| file.store.data_dir.clone())
                .unwrap_or(defaults.data_dir),
            sqlite: !cli.no_sqlite && file.store.sqlite.unwrap_or(defaults.sqlite),
            remote: RemoteConfig {
                url: cli.remote_url.clone().or_else(|| file.remote.url.clone()),
                timeout: file
                    .remote
                    .timeout_secs
                    .map_or(defaults.remote.timeout, Duration::from_secs),
                poll_interval: file
                    .remote
                    .poll_interval_secs
                    .map_or(defaults.remote.poll_interval, Duration::from_secs),
                fetch_limit: file
                    .remote
                    .fetch_limit
                    .unwrap_or(defaults.remote.fetch_limit),
            },
            peer: PeerConfig {
                enabled: !cli.no_peer && file.peer.enabled.unwrap_or(defaults.peer.enabled),
                group: file.peer.group.unwrap_or(defaults.peer.group),
                port: file.peer.port.unwrap_or(defaults.peer.port),
            },
            retention: RetentionPolicy::from_days(archive_days, visibility_days),
            dedup_window: file
                .messages
                .dedup_window_secs
                .map_or(defaults.dedup_window, Duration::from_secs),
            history_limit: file
                .messages
                .history_limit
                .unwrap_or(defaults.history_limit),
            max_task_text_len: file
                .messages
                .max_task_text_len
                .unwrap_or(defaults.max_task_text_len),
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Offline-first shared tasks and messages")]
pub struct CliArgs {
    /// WebSocket URL of the remote store.
    #[arg(long, env = "OPSYNC_REMOTE_URL")]
    pub remote_url: Option<String>,

    /// Acting user id (a UUID for remote attribution).
    #[arg(long, env = "OPSYNC_USER_ID")]
    pub user_id: Option<String>,

    /// Display name shown on sent messages.
    #[arg(long, env = "OPSYNC_DISPLAY_NAME")]
    pub display_name: Option<String>,

    /// Role tag used for task routing.
    #[arg(long, env = "OPSYNC_ROLE")]
    pub role: Option<String>,

    /// Directory for local stores (default: platform data dir + `opsync`).
    #[arg(long, env = "OPSYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Disable the same-network peer channel.
    #[arg(long)]
    pub no_peer: bool,

    /// Disable the queryable `SQLite` store (blob store only).
    #[arg(long)]
    pub no_sqlite: bool,

    /// Path to config file (default: `~/.config/opsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "OPSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/opsync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// What to do. Defaults to listing tasks.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List visible tasks.
    Tasks {
        /// Only tasks routed to this role (or to everyone).
        #[arg(long)]
        role: Option<String>,
    },
    /// Create a task.
    Add {
        /// Task text.
        text: String,
        /// Assignee label.
        #[arg(long, default_value = "")]
        assignee: String,
        /// Target role tag.
        #[arg(long, default_value = opsync_proto::task::ROLE_ALL)]
        role: String,
    },
    /// Mark a task completed (or open again with `--open`).
    Toggle {
        /// Task id.
        id: String,
        /// Reopen instead of completing.
        #[arg(long)]
        open: bool,
    },
    /// Replace a task's text.
    Edit {
        /// Task id.
        id: String,
        /// New text.
        text: String,
    },
    /// Delete a task.
    Delete {
        /// Task id.
        id: String,
    },
    /// List recent messages.
    Messages {
        /// How many of the newest messages to show.
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Send a message.
    Send {
        /// Message body.
        content: String,
        /// Recipient user id; omit for the whole group.
        #[arg(long)]
        to: Option<String>,
        /// Payload kind (text, image, file, audio).
        #[arg(long, default_value = "text")]
        kind: opsync_proto::MessageKind,
    },
    /// Print every change until interrupted.
    Watch,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
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
        config_dir.join("opsync").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
