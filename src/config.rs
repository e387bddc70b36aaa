//! Service configuration types and loaders
//!
//! Each binary loads one YAML file into its config struct. Every
//! tunable has a serde default so a minimal file (URLs only) is a
//! valid deployment. Secrets (`DATABASE_URL`, `REDIS_URL`,
//! `KAFKA_BROKERS`) can be overridden from the environment and win
//! over the file.

use serde::Deserialize;

/// Logging configuration shared by both services
#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// "hourly", "daily" or anything else for a single file
    #[serde(default = "default_rotation")]
    pub rotation: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub use_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_file: default_log_file(),
            rotation: default_rotation(),
            log_level: default_log_level(),
            use_json: false,
        }
    }
}

fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_log_file() -> String {
    "magpie.log".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// External store endpoints shared by both services
#[derive(Debug, Deserialize, Clone)]
pub struct StoresConfig {
    pub database_url: String,
    pub redis_url: String,
    pub kafka_brokers: String,
    #[serde(default = "default_group_id")]
    pub kafka_group_id: String,
}

fn default_group_id() -> String {
    "magpie".to_string()
}

impl StoresConfig {
    /// Environment variables override the file for deployability
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database_url = v;
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.redis_url = v;
        }
        if let Ok(v) = std::env::var("KAFKA_BROKERS") {
            self.kafka_brokers = v;
        }
    }
}

// ============================================================
// FLASH-SALE SERVICE
// ============================================================

/// Admission gate tunables (token bucket per SKU)
#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionConfig {
    /// Tokens added per second
    #[serde(default = "default_token_rate")]
    pub token_rate: u32,
    /// Bucket capacity; queue depth is clamped at -capacity
    #[serde(default = "default_token_capacity")]
    pub token_capacity: u32,
    /// Eta hint returned when the fast store is unreachable
    #[serde(default = "default_degraded_eta_secs")]
    pub degraded_eta_secs: u32,
    /// Requests per user per minute before a captcha is demanded
    #[serde(default = "default_captcha_threshold")]
    pub captcha_threshold: u64,
    /// Lifetime of an issued captcha token
    #[serde(default = "default_captcha_ttl_secs")]
    pub captcha_ttl_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            token_rate: default_token_rate(),
            token_capacity: default_token_capacity(),
            degraded_eta_secs: default_degraded_eta_secs(),
            captcha_threshold: default_captcha_threshold(),
            captcha_ttl_secs: default_captcha_ttl_secs(),
        }
    }
}

fn default_token_rate() -> u32 {
    100
}
fn default_token_capacity() -> u32 {
    200
}
fn default_degraded_eta_secs() -> u32 {
    2
}
fn default_captcha_threshold() -> u64 {
    20
}
fn default_captcha_ttl_secs() -> u64 {
    300
}

/// Order lifecycle tunables
#[derive(Debug, Deserialize, Clone)]
pub struct OrderConfig {
    /// Seconds a PendingPayment order may live before the sweeper
    /// cancels it and restores stock
    #[serde(default = "default_payment_window_secs")]
    pub payment_window_secs: u64,
    /// Sweeper tick interval
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Max orders swept per tick
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: i64,
    /// Materializer batch size (B)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Materializer batch timeout (T)
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// TTL of the order_status cache entry
    #[serde(default = "default_order_status_ttl_secs")]
    pub order_status_ttl_secs: u64,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            payment_window_secs: default_payment_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_batch: default_sweep_batch(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            order_status_ttl_secs: default_order_status_ttl_secs(),
        }
    }
}

fn default_payment_window_secs() -> u64 {
    900
}
fn default_sweep_interval_secs() -> u64 {
    10
}
fn default_sweep_batch() -> i64 {
    200
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_timeout_ms() -> u64 {
    200
}
fn default_order_status_ttl_secs() -> u64 {
    86_400
}

/// Reconciler tunables
#[derive(Debug, Deserialize, Clone)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Lease on the per-SKU repair lock
    #[serde(default = "default_repair_lock_ttl_secs")]
    pub repair_lock_ttl_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            repair_lock_ttl_secs: default_repair_lock_ttl_secs(),
        }
    }
}

fn default_reconcile_interval_secs() -> u64 {
    60
}
fn default_repair_lock_ttl_secs() -> u64 {
    30
}

/// Activity lifecycle tunables
#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// State-machine tick interval
    #[serde(default = "default_lifecycle_tick_secs")]
    pub tick_secs: u64,
    /// How long fast-store keys of an Ended activity are kept for
    /// the reconciler before teardown deletes them
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_lifecycle_tick_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

fn default_lifecycle_tick_secs() -> u64 {
    1
}
fn default_retention_secs() -> u64 {
    3_600
}

/// Complete flash-sale service configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FlashSaleConfig {
    #[serde(default = "default_flashsale_port")]
    pub port: u16,
    pub stores: StoresConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub orders: OrderConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

fn default_flashsale_port() -> u16 {
    8080
}

impl FlashSaleConfig {
    /// Load configuration from a YAML file and apply env overrides
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: FlashSaleConfig = serde_yaml::from_str(&content)?;
        config.stores.apply_env_overrides();
        Ok(config)
    }
}

// ============================================================
// IM SERVICE
// ============================================================

/// Router tunables
#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// Gateway push attempts before falling back to the offline path
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff step; doubles each retry (1s, 2s, 4s, ...)
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Per-attempt push RPC deadline
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
    /// Max content length in bytes
    #[serde(default = "default_max_content_len")]
    pub max_content_len: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            push_timeout_ms: default_push_timeout_ms(),
            max_content_len: default_max_content_len(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_push_timeout_ms() -> u64 {
    2_000
}
fn default_max_content_len() -> usize {
    4_096
}

/// Presence registry tunables
#[derive(Debug, Deserialize, Clone)]
pub struct PresenceConfig {
    /// Lease duration; clients renew every ttl/3
    #[serde(default = "default_presence_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_presence_ttl_secs(),
        }
    }
}

fn default_presence_ttl_secs() -> u64 {
    90
}

/// Sequencer tunables
#[derive(Debug, Deserialize, Clone)]
pub struct SequencerConfig {
    /// Snapshot the counter every N increments; also the safety
    /// margin added when recovering from a snapshot
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            snapshot_every: default_snapshot_every(),
        }
    }
}

fn default_snapshot_every() -> u64 {
    10_000
}

/// Offline pipeline tunables
#[derive(Debug, Deserialize, Clone)]
pub struct OfflineConfig {
    /// Writer batch size (B)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Writer batch timeout (T)
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// Offline message and dedup-entry TTL
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
    /// Expired-row sweeper tick interval
    #[serde(default = "default_ttl_sweep_interval_secs")]
    pub ttl_sweep_interval_secs: u64,
    /// Max rows deleted per sweep tick
    #[serde(default = "default_ttl_sweep_batch")]
    pub ttl_sweep_batch: i64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            message_ttl_secs: default_message_ttl_secs(),
            ttl_sweep_interval_secs: default_ttl_sweep_interval_secs(),
            ttl_sweep_batch: default_ttl_sweep_batch(),
        }
    }
}

fn default_message_ttl_secs() -> u64 {
    7 * 86_400
}
fn default_ttl_sweep_interval_secs() -> u64 {
    60
}
fn default_ttl_sweep_batch() -> i64 {
    1_000
}

/// Content filter configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Word lists by action: block wins over replace wins over audit
    #[serde(default)]
    pub block_words: Vec<String>,
    #[serde(default)]
    pub replace_words: Vec<String>,
    #[serde(default)]
    pub audit_words: Vec<String>,
}

/// Complete IM service configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ImConfig {
    #[serde(default = "default_im_port")]
    pub port: u16,
    pub stores: StoresConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub sequencer: SequencerConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
    #[serde(default)]
    pub filter: FilterConfig,
}

fn default_im_port() -> u16 {
    8081
}

impl ImConfig {
    /// Load configuration from a YAML file and apply env overrides
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ImConfig = serde_yaml::from_str(&content)?;
        config.stores.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flashsale_config_minimal_yaml() {
        let yaml = r#"
stores:
  database_url: "postgres://localhost/magpie"
  redis_url: "redis://127.0.0.1:6379"
  kafka_brokers: "localhost:9092"
"#;
        let config: FlashSaleConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.admission.token_rate, 100);
        assert_eq!(config.admission.token_capacity, 200);
        assert_eq!(config.orders.payment_window_secs, 900);
        assert_eq!(config.orders.batch_size, 100);
        assert_eq!(config.reconciler.interval_secs, 60);
    }

    #[test]
    fn test_flashsale_config_overrides() {
        let yaml = r#"
port: 9090
stores:
  database_url: "postgres://localhost/magpie"
  redis_url: "redis://127.0.0.1:6379"
  kafka_brokers: "localhost:9092"
admission:
  token_rate: 500
  token_capacity: 1000
orders:
  payment_window_secs: 60
"#;
        let config: FlashSaleConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.port, 9090);
        assert_eq!(config.admission.token_rate, 500);
        assert_eq!(config.orders.payment_window_secs, 60);
        // Untouched sections keep defaults
        assert_eq!(config.orders.sweep_interval_secs, 10);
    }

    #[test]
    fn test_im_config_defaults() {
        let yaml = r#"
stores:
  database_url: "postgres://localhost/magpie"
  redis_url: "redis://127.0.0.1:6379"
  kafka_brokers: "localhost:9092"
filter:
  enabled: true
  block_words: ["forbidden"]
"#;
        let config: ImConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.port, 8081);
        assert_eq!(config.router.max_retries, 3);
        assert_eq!(config.presence.ttl_secs, 90);
        assert_eq!(config.sequencer.snapshot_every, 10_000);
        assert_eq!(config.offline.message_ttl_secs, 7 * 86_400);
        assert!(config.filter.enabled);
        assert_eq!(config.filter.block_words, vec!["forbidden"]);
    }
}
