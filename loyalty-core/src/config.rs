//! Configuration for the loyalty ledger

use crate::types::CurrencyCode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Unit every raw amount is normalized into
    pub canonical_currency: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Ledger actor configuration
    pub ledger: LedgerConfig,

    /// Retry queue configuration
    pub queue: QueueConfig,

    /// Partner/rule cache configuration
    pub cache: CacheConfig,

    /// Exchange-rate lookups
    pub fx: FxConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/loyalty"),
            service_name: "loyalty-core".to_string(),
            canonical_currency: "PTS".to_string(),
            rocksdb: RocksDBConfig::default(),
            ledger: LedgerConfig::default(),
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
            fx: FxConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Ledger actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Actor mailbox capacity
    pub mailbox_size: usize,

    /// Deadline for a single commit (milliseconds)
    pub commit_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            mailbox_size: 1000,
            commit_timeout_ms: 2_000,
        }
    }
}

impl LedgerConfig {
    /// Commit deadline
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

/// Retry queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue file; `None` means `<data_dir>/pending_ops.json`
    pub path: Option<PathBuf>,

    /// Attempts before an operation is dead-lettered
    pub max_attempts: u32,

    /// First backoff step (milliseconds); 0 disables backoff
    pub backoff_base_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub backoff_max_ms: u64,

    /// Background drain period (milliseconds)
    pub drain_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_attempts: 10,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000, // 5 minutes
            drain_interval_ms: 5_000,
        }
    }
}

impl QueueConfig {
    /// Config with backoff disabled: every pending operation is due on every drain
    pub fn without_backoff() -> Self {
        Self {
            backoff_base_ms: 0,
            ..Self::default()
        }
    }

    /// Drain period
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Delay before the next attempt after `attempts` failures
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        if self.backoff_base_ms == 0 || attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempts.saturating_sub(1).min(32));
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Partner/rule cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cashback rule TTL (seconds)
    pub rules_ttl_secs: u64,

    /// Limit config TTL (seconds)
    pub limits_ttl_secs: u64,

    /// Per-partner override TTL (seconds)
    pub partner_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rules_ttl_secs: 300,
            limits_ttl_secs: 300,
            partner_ttl_secs: 60,
        }
    }
}

/// Exchange-rate lookups
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FxConfig {
    /// Deadline for a provider lookup (milliseconds)
    pub lookup_timeout_ms: u64,
}

impl Default for FxConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: 500,
        }
    }
}

impl FxConfig {
    /// Lookup deadline
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LOYALTY_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(path) = std::env::var("LOYALTY_QUEUE_PATH") {
            config.queue.path = Some(PathBuf::from(path));
        }

        if let Ok(currency) = std::env::var("LOYALTY_CANONICAL_CURRENCY") {
            config.canonical_currency = currency;
        }

        if let Ok(attempts) = std::env::var("LOYALTY_QUEUE_MAX_ATTEMPTS") {
            config.queue.max_attempts = attempts.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LOYALTY_QUEUE_MAX_ATTEMPTS: {}", e))
            })?;
        }

        Ok(config)
    }

    /// Canonical currency as a code
    pub fn canonical(&self) -> CurrencyCode {
        CurrencyCode::new(&self.canonical_currency)
    }

    /// Resolved queue file path
    pub fn queue_path(&self) -> PathBuf {
        self.queue
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("pending_ops.json"))
    }
}
