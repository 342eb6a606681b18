//! Configuration management for rollcache
//!
//! TOML configuration file support with per-field defaults, environment
//! variable overrides and validation.
//!
//! ```toml
//! [server]
//! listen_addr = "127.0.0.1:4273"
//!
//! [storage]
//! dump_dir = "/var/lib/rollcache"
//!
//! [backend]
//! kind = "redis"
//! redis_url = "redis://127.0.0.1:6379"
//!
//! [collections]
//! default_expire_secs = 300
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Dump persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// Backend store selection and client tuning
    #[serde(default)]
    pub backend: BackendConfig,

    /// Defaults applied to new collections
    #[serde(default)]
    pub collections: CollectionsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Log level (error, warn, info, debug, trace), used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Dump persistence configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding `{kind}.{name}.dump` files
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,

    /// Restore collections from the dump directory at startup
    #[serde(default = "default_true")]
    pub restore_on_start: bool,

    /// Dump every collection on graceful shutdown
    #[serde(default = "default_true")]
    pub dump_on_shutdown: bool,
}

/// Which backend store implementation to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store
    #[default]
    Memory,
    /// Redis server
    Redis,
}

/// Backend store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Store implementation
    #[serde(default)]
    pub kind: BackendKind,

    /// Redis server URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Maximum in-flight Redis commands
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Retries of transient Redis failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Collection defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectionsConfig {
    /// Expiry applied when a collection is created without one
    #[serde(default = "default_expire_secs")]
    pub default_expire_secs: i64,

    /// Prefix of every backend key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

// Default value functions
fn default_listen_addr() -> String { "127.0.0.1:4273".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_dump_dir() -> PathBuf { PathBuf::from("/var/lib/rollcache") }
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_pool_size() -> u32 { 16 }
fn default_connection_timeout_ms() -> u64 { 5_000 }
fn default_command_timeout_ms() -> u64 { 1_000 }
fn default_max_retries() -> u32 { 3 }
fn default_expire_secs() -> i64 { 300 }
fn default_key_prefix() -> String { "rollcache".to_string() }
fn default_true() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dump_dir: default_dump_dir(),
            restore_on_start: true,
            dump_on_shutdown: true,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            redis_url: default_redis_url(),
            pool_size: default_pool_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for CollectionsConfig {
    fn default() -> Self {
        Self {
            default_expire_secs: default_expire_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        // Server
        if let Ok(addr) = std::env::var("ROLLCACHE_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.server.log_level = log_level;
        }

        // Storage
        if let Ok(dump_dir) = std::env::var("ROLLCACHE_DUMP_DIR") {
            self.storage.dump_dir = PathBuf::from(dump_dir);
        }

        // Backend
        if let Ok(kind) = std::env::var("ROLLCACHE_BACKEND") {
            match kind.to_ascii_lowercase().as_str() {
                "memory" => self.backend.kind = BackendKind::Memory,
                "redis" => self.backend.kind = BackendKind::Redis,
                _ => {},
            }
        }
        if let Ok(url) = std::env::var("ROLLCACHE_REDIS_URL") {
            self.backend.redis_url = url;
        }
        if let Ok(size) = std::env::var("ROLLCACHE_POOL_SIZE") {
            if let Ok(s) = size.parse() {
                self.backend.pool_size = s;
            }
        }

        // Collections
        if let Ok(expire) = std::env::var("ROLLCACHE_DEFAULT_EXPIRE") {
            if let Ok(e) = expire.parse() {
                self.collections.default_expire_secs = e;
            }
        }
        if let Ok(prefix) = std::env::var("ROLLCACHE_KEY_PREFIX") {
            self.collections.key_prefix = prefix;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| -> Result<()> { Err(Error::Configuration(msg.to_string())) };

        if self.server.listen_addr.is_empty() {
            return fail("Listen address cannot be empty");
        }
        if self.storage.dump_dir.as_os_str().is_empty() {
            return fail("Dump directory cannot be empty");
        }
        if self.backend.pool_size == 0 {
            return fail("Pool size must be > 0");
        }
        if self.backend.kind == BackendKind::Redis && self.backend.redis_url.is_empty() {
            return fail("Redis URL cannot be empty when the redis backend is selected");
        }
        if self.collections.default_expire_secs <= 0 {
            return fail("Default expire must be > 0");
        }
        if self.collections.key_prefix.is_empty() {
            return fail("Key prefix cannot be empty");
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)?;
        Ok(())
    }
}
