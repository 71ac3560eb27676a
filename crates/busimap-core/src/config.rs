use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::Schedule;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_API_VERSION: &str = "1.0";
pub const DEFAULT_CACHE_URL: &str = "redis://127.0.0.1:6379/1";
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_BUDGET_MARGIN_MS: u64 = 500;

/// Top-level config (busimap.toml + BUSIMAP_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusimapConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Search index. When absent the search probe is not registered at all.
    #[serde(default)]
    pub search: Option<SearchConfig>,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Reported as `version` by `GET /health`.
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }
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

/// Redis cache used by the cache probe and the cache round-trip job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_url")]
    pub url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: default_cache_url(),
        }
    }
}

/// Elasticsearch-compatible search index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Base URL without trailing slash, e.g. `http://localhost:9200`.
    pub url: String,
    /// When true (default) an unhealthy index marks the whole service unhealthy.
    /// When false the result is reported but informational only.
    #[serde(default = "bool_true")]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Per-probe timeout applied to every dependency check.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Added to the slowest probe timeout to form the aggregate wall-clock budget.
    #[serde(default = "default_budget_margin_ms")]
    pub budget_margin_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            budget_margin_ms: DEFAULT_BUDGET_MARGIN_MS,
        }
    }
}

/// Scheduler and worker pool tuning. Timeouts and retry numbers are defaults
/// applied to every job unless its beat entry overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of handlers running at the same time.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Cooperative cancellation point; 0 disables it.
    #[serde(default = "default_soft_timeout_secs")]
    pub soft_timeout_secs: u64,
    /// Forced termination point; 0 disables it.
    #[serde(default = "default_hard_timeout_secs")]
    pub hard_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Delay before re-checking a job whose required dependency was unhealthy.
    #[serde(default = "default_admission_retry_secs")]
    pub admission_retry_secs: u64,
    /// Archived instance records older than this are purged by the maintenance job.
    #[serde(default = "default_archive_retention_days")]
    pub archive_retention_days: u32,
    /// Periodic schedule table keyed by job name.
    #[serde(default = "default_beat")]
    pub beat: HashMap<String, BeatEntry>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            tick_interval_secs: default_tick_interval_secs(),
            soft_timeout_secs: default_soft_timeout_secs(),
            hard_timeout_secs: default_hard_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            admission_retry_secs: default_admission_retry_secs(),
            archive_retention_days: default_archive_retention_days(),
            beat: default_beat(),
        }
    }
}

/// One row of the periodic schedule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeatEntry {
    pub schedule: Schedule,
    /// Allow a new firing while a previous instance is still active.
    #[serde(default)]
    pub reentrant: bool,
    /// Overrides `scheduler.max_retries` for this job.
    pub max_retries: Option<u32>,
    /// Probe names that must be healthy before an instance is admitted.
    #[serde(default)]
    pub requires: Vec<String>,
}

impl BeatEntry {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            reentrant: false,
            max_retries: None,
            requires: Vec::new(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}
fn default_cache_url() -> String {
    DEFAULT_CACHE_URL.to_string()
}
fn default_probe_timeout_secs() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}
fn default_budget_margin_ms() -> u64 {
    DEFAULT_BUDGET_MARGIN_MS
}
fn default_workers() -> usize {
    4
}
fn default_tick_interval_secs() -> u64 {
    1
}
fn default_soft_timeout_secs() -> u64 {
    300
}
fn default_hard_timeout_secs() -> u64 {
    360
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_secs() -> u64 {
    60
}
fn default_admission_retry_secs() -> u64 {
    30
}
fn default_archive_retention_days() -> u32 {
    30
}
fn default_beat() -> HashMap<String, BeatEntry> {
    let mut beat = HashMap::new();
    beat.insert(
        "common.health_snapshot".to_string(),
        BeatEntry::new(Schedule::Interval { every_secs: 300 }),
    );
    beat.insert(
        "maintenance.purge_archived".to_string(),
        BeatEntry::new(Schedule::Daily { hour: 3, minute: 0 }),
    );
    beat
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.busimap/busimap.db", home)
}

impl BusimapConfig {
    /// Load config from a TOML file with BUSIMAP_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `BUSIMAP_SCHEDULER__WORKERS=8`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.busimap/busimap.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("BUSIMAP_").split("__"))
            .extract()
            .map_err(|e| crate::error::BusimapError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.busimap/busimap.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> BusimapConfig {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .expect("config should parse")
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = from_toml("");
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.scheduler.soft_timeout_secs, 300);
        assert_eq!(cfg.scheduler.hard_timeout_secs, 360);
        assert!(cfg.search.is_none());
        assert!(cfg.scheduler.beat.contains_key("common.health_snapshot"));
    }

    #[test]
    fn search_section_defaults_to_required() {
        let cfg = from_toml(
            r#"
            [search]
            url = "http://localhost:9200"
            "#,
        );
        let search = cfg.search.expect("search configured");
        assert!(search.required);
    }

    #[test]
    fn beat_table_replaces_defaults() {
        let cfg = from_toml(
            r#"
            [scheduler.beat."common.add_numbers"]
            schedule = { kind = "interval", every_secs = 60 }
            reentrant = true
            max_retries = 1
            "#,
        );
        assert_eq!(cfg.scheduler.beat.len(), 1);
        let entry = &cfg.scheduler.beat["common.add_numbers"];
        assert!(entry.reentrant);
        assert_eq!(entry.max_retries, Some(1));
        assert!(matches!(entry.schedule, Schedule::Interval { every_secs: 60 }));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let cfg = BusimapConfig::load(Some("/nonexistent/busimap.toml")).expect("defaults");
        assert_eq!(cfg.gateway.bind, DEFAULT_BIND);
    }
}
