//! Worker configuration

use std::env;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Schedules (6-field cron, seconds first)
    pub billing_cron: String,
    pub webhook_drain_cron: String,

    // Webhook queue
    pub webhook_batch_size: i64,
    pub webhook_retention_days: i32,

    pub log_format: LogFormat,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),

            billing_cron: env::var("BILLING_CRON").unwrap_or_else(|_| "0 0 3 * * *".to_string()),
            webhook_drain_cron: env::var("WEBHOOK_DRAIN_CRON")
                .unwrap_or_else(|_| "0 * * * * *".to_string()),

            webhook_batch_size: env::var("WEBHOOK_BATCH_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            webhook_retention_days: {
                let days: i32 = env::var("WEBHOOK_RETENTION_DAYS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .map_err(|_| ConfigError::Invalid("WEBHOOK_RETENTION_DAYS must be a number"))?;
                if days < 1 {
                    return Err(ConfigError::Invalid(
                        "WEBHOOK_RETENTION_DAYS must be at least 1",
                    ));
                }
                days
            },

            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Config tests share process env vars
    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn cleanup_config() {
        for name in [
            "DATABASE_URL",
            "BILLING_CRON",
            "WEBHOOK_DRAIN_CRON",
            "WEBHOOK_RETENTION_DAYS",
            "LOG_FORMAT",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://test");

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.billing_cron, "0 0 3 * * *");
        assert_eq!(config.webhook_drain_cron, "0 * * * * *");
        assert_eq!(config.webhook_retention_days, 30);
        assert_eq!(config.log_format, LogFormat::Pretty);

        cleanup_config();
    }

    #[test]
    fn test_missing_database_url() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();
        cleanup_config();

        let result = WorkerConfig::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("DATABASE_URL"))));
    }

    #[test]
    fn test_overrides_and_validation() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("LOG_FORMAT", "json");
        env::set_var("WEBHOOK_RETENTION_DAYS", "7");

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.webhook_retention_days, 7);

        env::set_var("WEBHOOK_RETENTION_DAYS", "0");
        assert!(matches!(
            WorkerConfig::from_env(),
            Err(ConfigError::Invalid(_))
        ));

        cleanup_config();
    }
}
