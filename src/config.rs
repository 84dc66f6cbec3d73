//! Operator configuration read from `DOMAIN_OPERATOR_*` environment variables
//!
//! Every setting has a default. A value that does not parse is logged and replaced by the
//! default so a typo never keeps the operator from starting.

use crate::calls::RetryTuning;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const ENV_PREFIX: &str = "DOMAIN_OPERATOR_";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Port of the health and metrics server
    pub health_port: u16,
    /// Runtime worker threads; `None` lets tokio size the pool
    pub worker_threads: Option<usize>,
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    pub retry: RetryTuning,
    pub call_timeout: Duration,
    /// Delay between readiness polls of rolling restarts and pod waits
    pub poll_delay: Duration,
    pub list_page_size: u32,
    /// Requeue interval after a successful reconcile
    pub resync_interval: Duration,
    /// Requeue interval after a failed reconcile
    pub error_requeue: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            health_port: 8080,
            worker_threads: None,
            namespace: None,
            retry: RetryTuning::default(),
            call_timeout: Duration::from_secs(30),
            poll_delay: Duration::from_secs(1),
            list_page_size: 500,
            resync_interval: Duration::from_secs(300),
            error_requeue: Duration::from_secs(10),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = OperatorConfig::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        OperatorConfig {
            health_port: setting(&get, "HEALTH_PORT", defaults.health_port),
            worker_threads: optional_setting(&get, "WORKER_THREADS").filter(|n| *n > 0),
            namespace: get("NAMESPACE").filter(|ns| !ns.trim().is_empty()),
            retry: RetryTuning {
                max_retries: setting(&get, "MAX_RETRIES", defaults.retry.max_retries),
                initial_backoff: millis(&get, "INITIAL_BACKOFF_MS", defaults.retry.initial_backoff),
                max_backoff: millis(&get, "MAX_BACKOFF_MS", defaults.retry.max_backoff),
            },
            call_timeout: seconds(&get, "CALL_TIMEOUT_SECS", defaults.call_timeout),
            poll_delay: millis(&get, "POLL_DELAY_MS", defaults.poll_delay),
            list_page_size: setting(&get, "LIST_PAGE_SIZE", defaults.list_page_size),
            resync_interval: seconds(&get, "RESYNC_SECS", defaults.resync_interval),
            error_requeue: seconds(&get, "ERROR_REQUEUE_SECS", defaults.error_requeue),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ConfigError::Inconsistent(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.retry.initial_backoff, self.retry.max_backoff
            )));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::Inconsistent(
                "call timeout must be positive".to_string(),
            ));
        }
        if self.poll_delay.is_zero() {
            return Err(ConfigError::Inconsistent(
                "poll delay must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse one variable; `Ok(None)` when it is unset
pub fn parse_var<T>(name: &str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{name}"),
                value,
                reason: e.to_string(),
            }),
    }
}

fn optional_setting<T>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match parse_var(name, get(name)) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Ignoring invalid setting, using default");
            None
        }
    }
}

fn setting<T>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_setting(get, name).unwrap_or(default)
}

fn millis(get: &impl Fn(&str) -> Option<String>, name: &str, default: Duration) -> Duration {
    optional_setting::<u64>(get, name)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn seconds(get: &impl Fn(&str) -> Option<String>, name: &str, default: Duration) -> Duration {
    optional_setting::<u64>(get, name)
        .map(Duration::from_secs)
        .unwrap_or(default)
}
