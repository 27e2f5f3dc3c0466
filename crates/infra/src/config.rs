//! Configuration loading and representation.
//!
//! Everything comes from environment variables. The worker binary primes the
//! environment from a `.env` file first; tests go through
//! [`TaskhubConfig::from_lookup`] with a map instead of the real environment.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use taskhub_observability::LogFormat;

use crate::jobs::RetryPolicy;
use crate::workers::{JobWorkerConfig, MAX_CONCURRENCY};

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_STREAM_KEY: &str = "taskhub:jobs";
pub const DEFAULT_CONSUMER_GROUP: &str = "taskhub-workers";
pub const DEFAULT_WORKER_CONCURRENCY: usize = 2;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Process configuration for a taskhub worker or producer.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskhubConfig {
    pub database_url: String,
    pub redis_url: String,
    pub stream_key: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub db_max_connections: u32,
    pub log_format: LogFormat,
}

impl TaskhubConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through `lookup`, which returns the raw value of a variable if set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            redis_url: get("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            stream_key: get("TASKHUB_STREAM_KEY").unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            consumer_group: get("TASKHUB_CONSUMER_GROUP")
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            consumer_name: get("TASKHUB_CONSUMER_NAME")
                .unwrap_or_else(|| format!("worker-{}", Uuid::now_v7())),
            worker_concurrency: parse_concurrency(get("TASKHUB_WORKER_CONCURRENCY"))?,
            max_attempts: parse_positive(
                "TASKHUB_MAX_ATTEMPTS",
                get("TASKHUB_MAX_ATTEMPTS"),
                DEFAULT_MAX_ATTEMPTS,
            )?,
            retry_base_delay: Duration::from_millis(parse_number(
                "TASKHUB_RETRY_BASE_DELAY_MS",
                get("TASKHUB_RETRY_BASE_DELAY_MS"),
                DEFAULT_RETRY_BASE_DELAY_MS,
            )?),
            db_max_connections: parse_positive(
                "TASKHUB_DB_MAX_CONNECTIONS",
                get("TASKHUB_DB_MAX_CONNECTIONS"),
                DEFAULT_DB_MAX_CONNECTIONS,
            )?,
            log_format: match get("LOG_FORMAT") {
                Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
                    key: "LOG_FORMAT",
                    message: format!("{e}"),
                })?,
                None => LogFormat::default(),
            },
        })
    }

    /// Exponential redelivery policy derived from the attempt settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.retry_base_delay,
            ..RetryPolicy::default()
        }
    }

    pub fn worker_config(&self) -> JobWorkerConfig {
        JobWorkerConfig::default()
            .with_name(self.consumer_name.clone())
            .with_concurrency(self.worker_concurrency)
    }

    #[cfg(feature = "redis")]
    pub fn redis_streams_config(&self) -> crate::transport::RedisStreamsConfig {
        crate::transport::RedisStreamsConfig::new(
            self.stream_key.clone(),
            self.consumer_group.clone(),
            self.consumer_name.clone(),
        )
        .with_retry_policy(self.retry_policy())
    }
}

fn parse_number<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            message: format!("{raw:?}: {e}"),
        }),
    }
}

fn parse_positive<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value = parse_number(key, raw, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_concurrency(raw: Option<String>) -> Result<usize, ConfigError> {
    let key = "TASKHUB_WORKER_CONCURRENCY";
    let value = parse_positive(key, raw, DEFAULT_WORKER_CONCURRENCY)?;
    if value > MAX_CONCURRENCY {
        return Err(ConfigError::Invalid {
            key,
            message: format!("must be at most {MAX_CONCURRENCY}"),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<TaskhubConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TaskhubConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/taskhub")]).unwrap();

        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.stream_key, "taskhub:jobs");
        assert_eq!(config.consumer_group, "taskhub-workers");
        assert!(config.consumer_name.starts_with("worker-"));
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_base_delay, Duration::from_millis(500));
        assert_eq!(config.db_max_connections, 5);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(load(&[]), Err(ConfigError::Missing("DATABASE_URL")));
        assert_eq!(
            load(&[("DATABASE_URL", "  ")]),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("DATABASE_URL", "postgres://db/taskhub"),
            ("REDIS_URL", "redis://cache:6380"),
            ("TASKHUB_CONSUMER_NAME", "worker-a"),
            ("TASKHUB_WORKER_CONCURRENCY", "8"),
            ("TASKHUB_MAX_ATTEMPTS", "3"),
            ("TASKHUB_RETRY_BASE_DELAY_MS", "250"),
            ("LOG_FORMAT", "pretty"),
        ])
        .unwrap();

        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.consumer_name, "worker-a");
        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.log_format, LogFormat::Pretty);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(250));

        let worker = config.worker_config();
        assert_eq!(worker.name, "worker-a");
        assert_eq!(worker.concurrency, 8);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = load(&[
            ("DATABASE_URL", "postgres://db/taskhub"),
            ("TASKHUB_WORKER_CONCURRENCY", "lots"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TASKHUB_WORKER_CONCURRENCY",
                ..
            }
        ));

        let err = load(&[
            ("DATABASE_URL", "postgres://db/taskhub"),
            ("TASKHUB_MAX_ATTEMPTS", "0"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TASKHUB_MAX_ATTEMPTS", .. }));

        let err = load(&[
            ("DATABASE_URL", "postgres://db/taskhub"),
            ("TASKHUB_WORKER_CONCURRENCY", "18446744073709551615"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TASKHUB_WORKER_CONCURRENCY",
                ..
            }
        ));
        let at_cap = MAX_CONCURRENCY.to_string();
        let config = load(&[
            ("DATABASE_URL", "postgres://db/taskhub"),
            ("TASKHUB_WORKER_CONCURRENCY", at_cap.as_str()),
        ])
        .unwrap();
        assert_eq!(config.worker_concurrency, MAX_CONCURRENCY);

        let err = load(&[("DATABASE_URL", "postgres://db/taskhub"), ("LOG_FORMAT", "xml")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LOG_FORMAT", .. }));
    }
}
