//! Configuration management for the lake services.
//!
//! Configuration lives in a single JSON file. Values resolve in priority
//! order:
//!
//! 1. Explicit config file values
//! 2. Environment variables (`LAKE_*` prefix)
//! 3. Default values
//!
//! The vendor credential is never stored in the file: only the *name* of the
//! environment variable holding it is configured, and the token is read once
//! at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration for the ingestion service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// On-disk layout of the data lake and queue store
    #[serde(default)]
    pub storage: StorageConfig,

    /// Vendor API endpoint and credentials
    #[serde(default)]
    pub vendor: VendorConfig,

    /// Per-task-type rate budgets
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Retry policy for transient task failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Worker pool sizing
    #[serde(default)]
    pub queues: QueueConfig,

    /// Plan expansion settings
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a specific path, with env overrides applied.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Default configuration with env overrides applied.
    pub fn load_default() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `LAKE_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("LAKE_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Ok(url) = std::env::var("LAKE_VENDOR_URL") {
            self.vendor.base_url = url;
        }
        if let Ok(level) = std::env::var("LAKE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }

    /// Read the vendor credential from the configured environment variable.
    ///
    /// Returns `None` when the variable is unset or empty. The token is held
    /// in memory only and never written back to disk.
    pub fn vendor_token(&self) -> Option<String> {
        std::env::var(&self.vendor.token_env)
            .ok()
            .filter(|t| !t.is_empty())
    }
}

/// On-disk paths for the data lake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the parquet data lake
    pub root: PathBuf,
    /// Path to the dataset catalogue (TOML)
    pub catalog_path: PathBuf,
    /// Path to the durable task-queue database
    pub queue_db: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/lake"),
            catalog_path: PathBuf::from("catalog.toml"),
            queue_db: PathBuf::from("data/task_queue.db"),
        }
    }
}

/// Vendor API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    /// API base URL
    pub base_url: String,
    /// Name of the environment variable holding the credential token
    pub token_env: String,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://api.tushare.pro".to_string(),
            token_env: "TUSHARE_TOKEN".to_string(),
            timeout_secs: 60,
            connect_timeout_secs: 30,
        }
    }
}

/// Per-task-type rate budgets (calls per rolling 60 s window).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Budget applied when a task type has no explicit entry
    pub default_per_minute: u32,
    /// Explicit budgets keyed by task name
    #[serde(default)]
    pub per_task: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_per_minute: 190,
            per_task: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Budget for a task type.
    pub fn budget_for(&self, task_name: &str) -> u32 {
        self.per_task
            .get(task_name)
            .copied()
            .unwrap_or(self.default_per_minute)
            .max(1)
    }
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts for a download task (first try included)
    pub max_attempts: u32,
    /// Maximum attempts for a persist task
    pub persist_max_attempts: u32,
    /// Base backoff delay in milliseconds, doubled per attempt
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            persist_max_attempts: 2,
            base_delay_ms: 500,
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Parallel workers on the download queue
    pub fast_workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { fast_workers: 8 }
    }
}

/// Plan expansion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Dataset holding the symbol universe
    pub symbol_dataset: String,
    /// Column of that dataset listing symbols
    pub symbol_column: String,
    /// When non-empty, used instead of the reference dataset
    #[serde(default)]
    pub symbol_override: Vec<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            symbol_dataset: "stock_basic".to_string(),
            symbol_column: "ts_code".to_string(),
            symbol_override: Vec::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}
