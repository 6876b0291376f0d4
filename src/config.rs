use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub oracle: OracleConfig,
    pub execution: ExecutionConfig,
    pub fees: FeeConfig,
    pub transfers: TransferConfig,
    pub scheduler: SchedulerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health server port (default: 8080)
    #[serde(default)]
    pub health_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// REST endpoint of the last-traded-price feed
    pub url: String,
    /// Price fetch timeout in milliseconds
    #[serde(default = "default_oracle_timeout")]
    pub timeout_ms: u64,
}

fn default_oracle_timeout() -> u64 {
    2_000
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9100".to_string(),
            timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Idempotency key retention window in seconds
    #[serde(default = "default_idempotency_window")]
    pub idempotency_window_secs: u64,
    /// Interval between evaluator sweeps in milliseconds
    #[serde(default = "default_evaluator_interval")]
    pub evaluator_interval_ms: u64,
}

fn default_idempotency_window() -> u64 {
    86_400
}

fn default_evaluator_interval() -> u64 {
    1_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            idempotency_window_secs: 86_400,
            evaluator_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotificationConfig {
    /// Optional webhook endpoint; events go to the log stream otherwise
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    /// Flat commission per fill (e.g. 0.99)
    pub flat: Decimal,
    /// Basis points on fill notional (e.g. 10 = 0.10%)
    #[serde(default)]
    pub bps: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            flat: Decimal::new(99, 2),
            bps: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// REST endpoint of the settlement collaborator
    pub settlement_url: String,
    /// Mandatory delay after destination approval before withdrawals (hours)
    pub time_lock_hours: i64,
    /// Settlement collaborator timeout in milliseconds
    pub settlement_timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            settlement_url: "http://localhost:9200".to_string(),
            time_lock_hours: 24,
            settlement_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between recurring-buy sweeps in seconds
    #[serde(default = "default_recurring_interval")]
    pub recurring_interval_secs: u64,
}

fn default_recurring_interval() -> u64 {
    3_600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            recurring_interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Optional directory for daily-rolling log files
    #[serde(default)]
    pub directory: Option<String>,
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
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("execution.idempotency_window_secs", 86_400)?
            .set_default("execution.evaluator_interval_ms", 1_000)?
            .set_default("scheduler.recurring_interval_secs", 3_600)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TALLY_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TALLY_DATABASE__URL, etc.)
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

        if self.fees.flat < Decimal::ZERO {
            errors.push("fees.flat must not be negative".to_string());
        }

        if self.fees.bps < Decimal::ZERO {
            errors.push("fees.bps must not be negative".to_string());
        }

        if self.transfers.time_lock_hours <= 0 {
            errors.push("transfers.time_lock_hours must be positive".to_string());
        }

        if self.oracle.timeout_ms == 0 {
            errors.push("oracle.timeout_ms must be positive".to_string());
        }

        if self.transfers.settlement_timeout_ms == 0 {
            errors.push("transfers.settlement_timeout_ms must be positive".to_string());
        }

        if self.execution.evaluator_interval_ms == 0 {
            errors.push("execution.evaluator_interval_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            oracle: OracleConfig::default(),
            execution: ExecutionConfig::default(),
            fees: FeeConfig::default(),
            transfers: TransferConfig::default(),
            scheduler: SchedulerConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/tally".to_string(),
                max_connections: 5,
            },
            notifications: NotificationConfig::default(),
            logging: LoggingConfig::default(),
            health_port: Some(8080),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_collects_all_violations() {
        let mut config = AppConfig::default();
        config.fees.flat = dec!(-1);
        config.transfers.time_lock_hours = 0;
        config.oracle.timeout_ms = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
