//! Configuration loading and representation.
//!
//! Everything is read from environment variables with defaults suitable for
//! development. `from_lookup` exists so tests can feed values without
//! touching the process environment.

use std::path::PathBuf;
use std::time::Duration;

use orderflow_core::{Money, PricePolicy};

use crate::queue::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Staging store settings.
#[derive(Debug, Clone)]
pub struct StagingConfig {
    pub dir: PathBuf,
    pub ttl: Duration,
    pub expiry_sweep_interval: Duration,
    pub flush_interval: Duration,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/staging"),
            ttl: Duration::from_secs(48 * 60 * 60),
            expiry_sweep_interval: Duration::from_secs(60 * 60),
            flush_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Durable queue worker settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Items stuck in `processing` longer than this are handed back to `pending`.
    pub stale_claim_after: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            stale_claim_after: Duration::from_secs(10 * 60),
        }
    }
}

/// Retry journal and sweeper settings.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub dir: PathBuf,
    pub sweep_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/retry-journal"),
            sweep_interval: Duration::from_secs(60),
            retry: RetryPolicy {
                max_attempts: 5,
                ..RetryPolicy::default()
            },
        }
    }
}

/// Top-level configuration for the pipeline process.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub staging: StagingConfig,
    pub queue: QueueConfig,
    pub journal: JournalConfig,
    pub pricing: PricePolicy,
    /// Kitchen intake address used when a restaurant has none configured.
    pub default_intake_email: Option<String>,
    /// Permanent store; when absent, in-memory stores are used (development only).
    pub database_url: Option<String>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = PipelineConfig::default();
        let vars = Vars { lookup: &lookup };

        if let Some(dir) = vars.string("ORDERFLOW_STAGING_DIR") {
            config.staging.dir = PathBuf::from(dir);
        }
        if let Some(ttl) = vars.secs("ORDERFLOW_STAGING_TTL_SECS")? {
            config.staging.ttl = ttl;
        }
        if let Some(v) = vars.secs("ORDERFLOW_STAGING_SWEEP_SECS")? {
            config.staging.expiry_sweep_interval = v;
        }
        if let Some(v) = vars.secs("ORDERFLOW_STAGING_FLUSH_SECS")? {
            config.staging.flush_interval = v;
        }

        if let Some(v) = vars.secs("ORDERFLOW_QUEUE_POLL_SECS")? {
            config.queue.poll_interval = v;
        }
        if let Some(v) = vars.number::<u32>("ORDERFLOW_QUEUE_MAX_ATTEMPTS")? {
            config.queue.retry.max_attempts = v;
        }
        if let Some(v) = vars.secs("ORDERFLOW_RETRY_BASE_DELAY_SECS")? {
            config.queue.retry.base_delay = v;
            config.journal.retry.base_delay = v;
        }
        if let Some(v) = vars.secs("ORDERFLOW_QUEUE_STALE_CLAIM_SECS")? {
            config.queue.stale_claim_after = v;
        }

        if let Some(dir) = vars.string("ORDERFLOW_JOURNAL_DIR") {
            config.journal.dir = PathBuf::from(dir);
        }
        if let Some(v) = vars.secs("ORDERFLOW_JOURNAL_SWEEP_SECS")? {
            config.journal.sweep_interval = v;
        }
        if let Some(v) = vars.number::<u32>("ORDERFLOW_JOURNAL_MAX_RETRIES")? {
            config.journal.retry.max_attempts = v;
        }

        if let Some(v) = vars.number::<u32>("ORDERFLOW_TAX_RATE_BPS")? {
            config.pricing.tax_rate_bps = v;
        }
        if let Some(v) = vars.number::<i64>("ORDERFLOW_SERVICE_FEE_CENTS")? {
            config.pricing.service_fee = Money::from_cents(v);
        }

        config.default_intake_email = vars.string("ORDERFLOW_DEFAULT_INTAKE_EMAIL");
        config.database_url = vars.string("DATABASE_URL");

        Ok(config)
    }
}

struct Vars<'a, F> {
    lookup: &'a F,
}

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &'static str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn number<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(var) {
            None => Ok(None),
            Some(value) => value.parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.number::<u64>(var)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.staging.ttl, Duration::from_secs(48 * 3600));
        assert_eq!(config.staging.expiry_sweep_interval, Duration::from_secs(3600));
        assert_eq!(config.staging.flush_interval, Duration::from_secs(300));
        assert_eq!(config.queue.poll_interval, Duration::from_secs(5));
        assert_eq!(config.queue.retry.max_attempts, 3);
        assert_eq!(config.journal.retry.max_attempts, 5);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("ORDERFLOW_STAGING_TTL_SECS", "60"),
            ("ORDERFLOW_QUEUE_MAX_ATTEMPTS", "7"),
            ("ORDERFLOW_RETRY_BASE_DELAY_SECS", "2"),
            ("ORDERFLOW_TAX_RATE_BPS", "1000"),
            ("ORDERFLOW_DEFAULT_INTAKE_EMAIL", " kitchen@example.com "),
            ("DATABASE_URL", "postgres://localhost/orders"),
        ]))
        .unwrap();

        assert_eq!(config.staging.ttl, Duration::from_secs(60));
        assert_eq!(config.queue.retry.max_attempts, 7);
        assert_eq!(config.queue.retry.base_delay, Duration::from_secs(2));
        assert_eq!(config.journal.retry.base_delay, Duration::from_secs(2));
        assert_eq!(config.pricing.tax_rate_bps, 1000);
        assert_eq!(config.default_intake_email.as_deref(), Some("kitchen@example.com"));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/orders"));
    }

    #[test]
    fn invalid_number_names_the_variable() {
        let err = PipelineConfig::from_lookup(lookup(&[("ORDERFLOW_QUEUE_POLL_SECS", "soon")]))
            .unwrap_err();

        match err {
            ConfigError::Invalid { var, value, .. } => {
                assert_eq!(var, "ORDERFLOW_QUEUE_POLL_SECS");
                assert_eq!(value, "soon");
            }
        }
    }
}
