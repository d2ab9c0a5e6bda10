use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_TARGET_TIMEOUT_SECS: u64 = 300;
// slightly above the per-target timeout so the scheduler's own timeout fires first
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 330;

/// Top-level config (digest.toml + DIGEST_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigestConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Polling loop and failure-policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between ticks of the polling loop.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum number of due schedules processed per tick. Overflow waits
    /// for the next tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on a single summarizer call. A timed-out target is
    /// recorded as `failed`.
    #[serde(default = "default_target_timeout_secs")]
    pub target_timeout_secs: u64,
    /// Whether a run whose only non-success targets were `skipped` counts
    /// toward `fail_count` / `consecutive_failures` (and so auto-pause).
    ///
    /// When false such a run leaves both counters untouched.
    #[serde(default = "bool_true")]
    pub skipped_counts_as_failure: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            target_timeout_secs: DEFAULT_TARGET_TIMEOUT_SECS,
            skipped_counts_as_failure: true,
        }
    }
}

/// Remote summary service the daemon calls once per target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    #[serde(default = "default_summarizer_url")]
    pub base_url: String,
    /// Sent as `Authorization: Bearer <key>` when set.
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            base_url: default_summarizer_url(),
            api_key: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_target_timeout_secs() -> u64 {
    DEFAULT_TARGET_TIMEOUT_SECS
}
fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_summarizer_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.digest/digest.db", home)
}

impl DigestConfig {
    /// Load config from a TOML file with DIGEST_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.digest/digest.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: DigestConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("DIGEST_").split("__"))
            .extract()
            .map_err(|e| crate::error::DigestError::Config(e.to_string()))?;

        tracing::debug!(%path, "configuration loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.digest/digest.toml", home)
}
