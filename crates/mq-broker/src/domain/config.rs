//! TOML configuration for the broker.
//!
//! The broker reads `mq.toml` (or the path given with `--config`) at
//! startup.  When the file does not exist a default one is written so the
//! operator has something to edit:
//!
//! ```toml
//! [database]
//! address = "sqlite://data"
//! name = "mq_server"
//! queue_table = "mq_data"
//! directory_table = "device_info"
//! log_table = "log_records"
//!
//! [database.reset]
//! drop_database = false
//! drop_tables = ["mq_data", "device_info", "log_records"]
//!
//! [server]
//! bind_address = "0.0.0.0"
//! port = 8500
//! enabled = true
//! ```
//!
//! Every field carries a `#[serde(default = "...")]`, so a partial file is
//! completed with defaults instead of being rejected.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// `database.address` names a backend this build does not provide.
    #[error("unsupported database address '{0}' (expected memory:// or sqlite://<dir>)")]
    UnsupportedDatabase(String),

    /// `server.bind_address` and `server.port` do not form a socket address.
    #[error("invalid bind address '{0}'")]
    InvalidBindAddress(String),

    /// A timing setting is zero; timers and intervals need a positive period.
    #[error("server.{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level broker configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Where the queue, directory and audit log live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// `memory://` or `sqlite://<directory>`.
    #[serde(default = "default_database_address")]
    pub address: String,
    /// Database name; the SQLite file is `<directory>/<name>.db`.
    #[serde(default = "default_database_name")]
    pub name: String,
    #[serde(default = "default_queue_table")]
    pub queue_table: String,
    #[serde(default = "default_directory_table")]
    pub directory_table: String,
    #[serde(default = "default_log_table")]
    pub log_table: String,
    /// What to wipe at startup.
    #[serde(default)]
    pub reset: ResetConfig,
}

/// Startup reset settings.
///
/// Directory rows describe live connections, so by default every table is
/// dropped when the broker starts; rows from a previous run would otherwise
/// point at peers that no longer exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResetConfig {
    /// Delete the whole database (the SQLite file) before opening it.
    #[serde(default)]
    pub drop_database: bool,
    /// Tables to drop and recreate, by name.
    #[serde(default = "default_drop_tables")]
    pub drop_tables: Vec<String>,
}

/// Listener and connection timing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// IP address to bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// When `false` the broker prepares its database and exits without
    /// serving.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Limit for the WebSocket upgrade of a new connection.
    #[serde(default = "default_two")]
    pub connect_timeout_secs: u64,
    /// Interval between keepalive pings.
    #[serde(default = "default_two")]
    pub ping_interval_secs: u64,
    /// How long a ping may stay unanswered before the connection is dropped.
    #[serde(default = "default_two")]
    pub pong_timeout_secs: u64,
    /// Limit for the closing handshake.
    #[serde(default = "default_two")]
    pub close_timeout_secs: u64,
    /// How long a new connection has to present its credential.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Fallback queue poll for authenticated sessions.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Queue and query limits.
///
/// The defaults impose no bound and no allow-list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    /// Maximum queued messages per destination; `0` means unbounded.
    #[serde(default)]
    pub max_pending_per_address: u64,
    /// Field paths a directory query may reference; empty allows any.
    #[serde(default)]
    pub query_fields: Vec<String>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_database_address() -> String {
    "sqlite://data".to_string()
}
fn default_database_name() -> String {
    "mq_server".to_string()
}
fn default_queue_table() -> String {
    "mq_data".to_string()
}
fn default_directory_table() -> String {
    "device_info".to_string()
}
fn default_log_table() -> String {
    "log_records".to_string()
}
fn default_drop_tables() -> Vec<String> {
    vec![
        default_queue_table(),
        default_directory_table(),
        default_log_table(),
    ]
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8500
}
fn default_true() -> bool {
    true
}
fn default_two() -> u64 {
    2
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_poll_interval() -> u64 {
    200
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            address: default_database_address(),
            name: default_database_name(),
            queue_table: default_queue_table(),
            directory_table: default_directory_table(),
            log_table: default_log_table(),
            reset: ResetConfig::default(),
        }
    }
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            drop_database: false,
            drop_tables: default_drop_tables(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            enabled: default_true(),
            connect_timeout_secs: default_two(),
            ping_interval_secs: default_two(),
            pong_timeout_secs: default_two(),
            close_timeout_secs: default_two(),
            handshake_timeout_secs: default_handshake_timeout(),
            poll_interval_ms: default_poll_interval(),
            log_level: default_log_level(),
        }
    }
}

// ── Derived settings ──────────────────────────────────────────────────────────

/// The storage backend selected by `database.address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    Sqlite(PathBuf),
}

/// The three logical tables of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Queue,
    Directory,
    Log,
}

impl DatabaseConfig {
    /// Resolves `address` and `name` into a backend location.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedDatabase`] for any other scheme.
    pub fn location(&self) -> Result<StoreLocation, ConfigError> {
        if self.address == "memory://" {
            return Ok(StoreLocation::Memory);
        }
        match self.address.strip_prefix("sqlite://") {
            Some(dir) if !dir.is_empty() => Ok(StoreLocation::Sqlite(
                Path::new(dir).join(format!("{}.db", self.name)),
            )),
            _ => Err(ConfigError::UnsupportedDatabase(self.address.clone())),
        }
    }

    /// Maps a configured table name back to its role.
    pub fn table_named(&self, name: &str) -> Option<Table> {
        if name == self.queue_table {
            Some(Table::Queue)
        } else if name == self.directory_table {
            Some(Table::Directory)
        } else if name == self.log_table {
            Some(Table::Log)
        } else {
            None
        }
    }
}

impl ServerConfig {
    /// The socket address to listen on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBindAddress`] if `bind_address` is not
    /// an IP literal.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let text = if self.bind_address.contains(':') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        };
        text.parse()
            .map_err(|_| ConfigError::InvalidBindAddress(text))
    }

    /// Rejects timing settings the connection loop cannot run with.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ZeroDuration`] naming the first zero setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timings = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("ping_interval_secs", self.ping_interval_secs),
            ("pong_timeout_secs", self.pong_timeout_secs),
            ("close_timeout_secs", self.close_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("poll_interval_ms", self.poll_interval_ms),
        ];
        match timings.into_iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::ZeroDuration(field)),
            None => Ok(()),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl PolicyConfig {
    /// The per-destination queue bound, if any.
    pub fn queue_limit(&self) -> Option<u64> {
        (self.max_pending_per_address > 0).then_some(self.max_pending_per_address)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Whether [`load_or_init`] found a file or had to write one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Loaded,
    Generated,
}

/// Loads the config at `path`, writing and returning the defaults when the
/// file does not exist yet.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed and
/// [`ConfigError::ZeroDuration`] for a zero timing setting.  A rejected file
/// is never overwritten.
pub fn load_or_init(path: &Path) -> Result<(BrokerConfig, ConfigSource), ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: BrokerConfig = toml::from_str(&content)?;
            cfg.server.validate()?;
            Ok((cfg, ConfigSource::Loaded))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let cfg = BrokerConfig::default();
            save_config(path, &cfg)?;
            Ok((cfg, ConfigSource::Generated))
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &BrokerConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timing_settings_are_rejected() {
        assert!(ServerConfig::default().validate().is_ok());

        let cfg = ServerConfig {
            poll_interval_ms: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ZeroDuration("poll_interval_ms"))
        ));

        let cfg = ServerConfig {
            ping_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ZeroDuration("ping_interval_secs"))
        ));
    }

    #[test]
    fn test_load_rejects_zero_interval_and_keeps_file() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mq.toml");
        let content = "[server]\nping_interval_secs = 0\n";
        std::fs::write(&path, content).unwrap();

        // Act
        let result = load_or_init(&path);

        // Assert
        assert!(matches!(
            result,
            Err(ConfigError::ZeroDuration("ping_interval_secs"))
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), content);
    }

    #[test]
    fn test_default_server_settings() {
        // Arrange / Act
        let cfg = ServerConfig::default();

        // Assert
        assert_eq!(cfg.bind_address, "0.0.0.0");
        assert_eq!(cfg.port, 8500);
        assert!(cfg.enabled);
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.ping_interval(), Duration::from_secs(2));
        assert_eq!(cfg.pong_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.close_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.poll_interval(), Duration::from_millis(200));
    }

    #[test]
    fn test_default_database_drops_all_tables() {
        let cfg = DatabaseConfig::default();
        assert_eq!(cfg.name, "mq_server");
        assert!(!cfg.reset.drop_database);
        assert_eq!(
            cfg.reset.drop_tables,
            vec!["mq_data", "device_info", "log_records"]
        );
    }

    #[test]
    fn test_default_policy_is_unbounded_passthrough() {
        let cfg = PolicyConfig::default();
        assert_eq!(cfg.queue_limit(), None);
        assert!(cfg.query_fields.is_empty());
    }

    #[test]
    fn test_queue_limit_when_set() {
        let cfg = PolicyConfig {
            max_pending_per_address: 5,
            ..PolicyConfig::default()
        };
        assert_eq!(cfg.queue_limit(), Some(5));
    }

    #[test]
    fn test_location_memory() {
        let cfg = DatabaseConfig {
            address: "memory://".to_string(),
            ..DatabaseConfig::default()
        };
        assert_eq!(cfg.location().unwrap(), StoreLocation::Memory);
    }

    #[test]
    fn test_location_sqlite_uses_name_as_file_stem() {
        let cfg = DatabaseConfig::default();
        assert_eq!(
            cfg.location().unwrap(),
            StoreLocation::Sqlite(PathBuf::from("data").join("mq_server.db"))
        );
    }

    #[test]
    fn test_location_rejects_other_schemes() {
        let cfg = DatabaseConfig {
            address: "mongodb://localhost:27017".to_string(),
            ..DatabaseConfig::default()
        };
        assert!(matches!(
            cfg.location(),
            Err(ConfigError::UnsupportedDatabase(_))
        ));
    }

    #[test]
    fn test_table_named() {
        let cfg = DatabaseConfig::default();
        assert_eq!(cfg.table_named("mq_data"), Some(Table::Queue));
        assert_eq!(cfg.table_named("device_info"), Some(Table::Directory));
        assert_eq!(cfg.table_named("log_records"), Some(Table::Log));
        assert_eq!(cfg.table_named("other"), None);
    }

    #[test]
    fn test_socket_addr_v4_and_v6() {
        let mut cfg = ServerConfig::default();
        assert_eq!(cfg.socket_addr().unwrap().to_string(), "0.0.0.0:8500");

        cfg.bind_address = "::1".to_string();
        assert_eq!(cfg.socket_addr().unwrap().to_string(), "[::1]:8500");

        cfg.bind_address = "not-an-ip".to_string();
        assert!(cfg.socket_addr().is_err());
    }

    #[test]
    fn test_deserialize_partial_toml_fills_defaults() {
        // Arrange
        let toml_str = r#"
[server]
port = 9000

[policy]
query_fields = ["parameters.type"]
"#;

        // Act
        let cfg: BrokerConfig = toml::from_str(toml_str).unwrap();

        // Assert
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.bind_address, "0.0.0.0");
        assert_eq!(cfg.database, DatabaseConfig::default());
        assert_eq!(cfg.policy.query_fields, vec!["parameters.type"]);
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut cfg = BrokerConfig::default();
        cfg.server.port = 1234;
        cfg.database.reset.drop_tables.clear();

        let text = toml::to_string_pretty(&cfg).unwrap();
        let restored: BrokerConfig = toml::from_str(&text).unwrap();

        assert_eq!(cfg, restored);
    }

    #[test]
    fn test_load_or_init_writes_defaults_when_absent() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mq.toml");

        // Act
        let (cfg, source) = load_or_init(&path).unwrap();

        // Assert
        assert_eq!(source, ConfigSource::Generated);
        assert_eq!(cfg, BrokerConfig::default());
        assert!(path.exists());

        let (again, source) = load_or_init(&path).unwrap();
        assert_eq!(source, ConfigSource::Loaded);
        assert_eq!(again, cfg);
    }

    #[test]
    fn test_load_or_init_keeps_malformed_file() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mq.toml");
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        // Act
        let result = load_or_init(&path);

        // Assert
        assert!(matches!(result, Err(ConfigError::Parse(_))));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[[[ not valid toml"
        );
    }
}
