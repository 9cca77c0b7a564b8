use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health server port; no server when unset
    #[serde(default)]
    pub health_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; the in-memory ledger is used when unset
    #[serde(default)]
    pub url: Option<String>,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub base_url: String,
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default = "default_broker_timeout_ms")]
    pub timeout_ms: u64,
    /// Without a live broker the scheduler runs in dry-run mode
    #[serde(default)]
    pub enabled: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: default_broker_url(),
            key_id: None,
            secret_key: None,
            timeout_ms: default_broker_timeout_ms(),
            enabled: false,
        }
    }
}

fn default_broker_url() -> String {
    "https://paper-api.alpaca.markets".to_string()
}

fn default_broker_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Seconds between periodic runs
    #[serde(default = "default_recon_interval")]
    pub interval_secs: u64,
    /// Lookback overlap subtracted from the high-water mark
    #[serde(default = "default_overlap")]
    pub overlap_secs: u64,
    /// Startup run deadline before the process reports not-ready
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    /// Grace window before an unconfirmed submission missing at the broker is failed
    #[serde(default = "default_grace")]
    pub submitted_unconfirmed_grace_secs: u64,
    /// Cap on per-order broker lookups in one run
    #[serde(default = "default_max_lookups")]
    pub max_individual_lookups: usize,
    /// Page size for broker order listings
    #[serde(default = "default_fetch_limit")]
    pub order_fetch_limit: usize,
    /// Strategy recorded on orphan orders
    #[serde(default = "default_orphan_strategy")]
    pub orphan_strategy_id: String,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_recon_interval(),
            overlap_secs: default_overlap(),
            startup_timeout_secs: default_startup_timeout(),
            submitted_unconfirmed_grace_secs: default_grace(),
            max_individual_lookups: default_max_lookups(),
            order_fetch_limit: default_fetch_limit(),
            orphan_strategy_id: default_orphan_strategy(),
        }
    }
}

impl ReconciliationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn overlap(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.overlap_secs as i64)
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.submitted_unconfirmed_grace_secs as i64)
    }
}

fn default_recon_interval() -> u64 {
    300
}

fn default_overlap() -> u64 {
    60
}

fn default_startup_timeout() -> u64 {
    300
}

fn default_grace() -> u64 {
    300
}

fn default_max_lookups() -> usize {
    100
}

fn default_fetch_limit() -> usize {
    500
}

fn default_orphan_strategy() -> String {
    "external".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Attempts for connection-class broker failures
    #[serde(default = "default_submit_attempts")]
    pub max_submit_attempts: u32,
    #[serde(default = "default_submit_initial_backoff")]
    pub submit_initial_backoff_ms: u64,
    #[serde(default = "default_submit_max_backoff")]
    pub submit_max_backoff_ms: u64,
    /// Attempts for the ledger write after broker acceptance
    #[serde(default = "default_ledger_attempts")]
    pub ledger_write_attempts: u32,
    #[serde(default = "default_ledger_backoff")]
    pub ledger_initial_backoff_ms: u64,
    /// How long a due slice waits for the reconciliation gate before failing
    #[serde(default = "default_readiness_wait")]
    pub readiness_wait_secs: u64,
}

impl SchedulerConfig {
    pub fn readiness_wait(&self) -> Duration {
        Duration::from_secs(self.readiness_wait_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_submit_attempts: default_submit_attempts(),
            submit_initial_backoff_ms: default_submit_initial_backoff(),
            submit_max_backoff_ms: default_submit_max_backoff(),
            ledger_write_attempts: default_ledger_attempts(),
            ledger_initial_backoff_ms: default_ledger_backoff(),
            readiness_wait_secs: default_readiness_wait(),
        }
    }
}

fn default_submit_attempts() -> u32 {
    3
}

fn default_submit_initial_backoff() -> u64 {
    1_000
}

fn default_submit_max_backoff() -> u64 {
    10_000
}

fn default_ledger_attempts() -> u32 {
    3
}

fn default_ledger_backoff() -> u64 {
    250
}

fn default_readiness_wait() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    /// Consecutive broker failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub breaker_recovery_timeout_secs: u64,
    /// Kill switch engaged while this file exists
    #[serde(default)]
    pub kill_switch_file: Option<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            breaker_failure_threshold: default_failure_threshold(),
            breaker_recovery_timeout_secs: default_recovery_timeout(),
            kill_switch_file: None,
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .set_default("reconciliation.interval_secs", 300)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific file, e.g. config/production.toml
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TALLY_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // TALLY_DATABASE__URL, TALLY_BROKER__KEY_ID, ...
            .add_source(
                Environment::with_prefix("TALLY")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be positive".to_string());
        }

        if self.broker.enabled {
            if self.broker.key_id.is_none() || self.broker.secret_key.is_none() {
                errors.push("broker.key_id and broker.secret_key are required when broker.enabled".to_string());
            }
            if self.broker.timeout_ms == 0 {
                errors.push("broker.timeout_ms must be positive".to_string());
            }
        }

        let recon = &self.reconciliation;
        if recon.interval_secs == 0 {
            errors.push("reconciliation.interval_secs must be positive".to_string());
        }
        if recon.startup_timeout_secs == 0 {
            errors.push("reconciliation.startup_timeout_secs must be positive".to_string());
        }
        if recon.order_fetch_limit == 0 {
            errors.push("reconciliation.order_fetch_limit must be positive".to_string());
        }
        if recon.orphan_strategy_id.trim().is_empty() {
            errors.push("reconciliation.orphan_strategy_id must not be empty".to_string());
        }

        let sched = &self.scheduler;
        if sched.max_submit_attempts == 0 {
            errors.push("scheduler.max_submit_attempts must be at least 1".to_string());
        }
        if sched.ledger_write_attempts == 0 {
            errors.push("scheduler.ledger_write_attempts must be at least 1".to_string());
        }
        if sched.submit_initial_backoff_ms > sched.submit_max_backoff_ms {
            errors.push(
                "scheduler.submit_initial_backoff_ms must not exceed submit_max_backoff_ms"
                    .to_string(),
            );
        }

        if self.safety.breaker_failure_threshold == 0 {
            errors.push("safety.breaker_failure_threshold must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
