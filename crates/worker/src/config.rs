use std::str::FromStr;
use std::time::Duration;

use conductor_backend::artifacts::DEFAULT_URL_TTL;
use conductor_backend::Backoff;
use conductor_core::idempotency::DEFAULT_IDEMPOTENCY_TTL;
use conductor_core::recovery::{default_stale_after, RecoveryPolicy, DEFAULT_MAX_REQUEUES};
use conductor_core::validation::DEFAULT_MAX_PAYLOAD_BYTES;
use conductor_db::memory::DEFAULT_VISIBILITY_TIMEOUT;
use conductor_pipeline::SubmissionConfig;

use crate::executor::ExecutorConfig;
use crate::pool::PoolConfig;
use crate::recovery::RecoveryConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error(
        "HEARTBEAT_STALE_SECS ({stale_after:?}) must exceed the backend call timeout plus \
         one poll interval ({minimum:?})"
    )]
    StaleThresholdTooShort { stale_after: Duration, minimum: Duration },
}

/// Worker process configuration loaded from environment variables.
///
/// All fields have defaults suitable for a single-process deployment with
/// in-memory stores.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL URL; in-memory stores when unset.
    pub database_url: Option<String>,
    pub concurrency: usize,
    pub worker_id_prefix: String,
    pub queue_pop_timeout: Duration,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub backend_call_timeout: Duration,
    pub max_backend_retries: u32,
    pub retry_base_delay: Duration,
    pub heartbeat_stale_after: Duration,
    pub sweep_interval: Duration,
    pub recovery_policy: RecoveryPolicy,
    pub queue_visibility_timeout: Duration,
    pub idempotency_ttl: Duration,
    pub max_payload_bytes: usize,
    /// Base URL of the compute backend; the process refuses to start without it.
    pub backend_url: Option<String>,
    /// S3 bucket for artifacts; in-memory artifact store when unset.
    pub artifact_bucket: Option<String>,
    pub artifact_url_ttl: Duration,
    pub metrics_host: String,
    pub metrics_port: u16,
    pub drain_timeout: Duration,
    pub progress_linger: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default                 |
    /// |---------------------------------|-------------------------|
    /// | `DATABASE_URL`                  | unset (in-memory)       |
    /// | `WORKER_CONCURRENCY`            | `4`                     |
    /// | `WORKER_ID_PREFIX`              | `worker`                |
    /// | `QUEUE_POP_TIMEOUT_MS`          | `1000`                  |
    /// | `POLL_INTERVAL_MS`              | `1000`                  |
    /// | `JOB_TIMEOUT_SECS`              | `900`                   |
    /// | `BACKEND_CALL_TIMEOUT_SECS`     | `30`                    |
    /// | `MAX_BACKEND_RETRIES`           | `1`                     |
    /// | `RETRY_BASE_DELAY_MS`           | `500`                   |
    /// | `HEARTBEAT_STALE_SECS`          | call timeout + 2 x poll |
    /// | `SWEEP_INTERVAL_SECS`           | `30`                    |
    /// | `RECOVERY_POLICY`               | `requeue`               |
    /// | `MAX_RECOVERY_REQUEUES`         | `1`                     |
    /// | `QUEUE_VISIBILITY_TIMEOUT_SECS` | `60`                    |
    /// | `IDEMPOTENCY_TTL_HOURS`         | `24`                    |
    /// | `MAX_PAYLOAD_BYTES`             | `1048576`               |
    /// | `BACKEND_URL`                   | unset                   |
    /// | `ARTIFACT_BUCKET`               | unset (in-memory)       |
    /// | `ARTIFACT_URL_TTL_SECS`         | `3600`                  |
    /// | `METRICS_HOST`                  | `0.0.0.0`               |
    /// | `METRICS_PORT`                  | `9090`                  |
    /// | `DRAIN_TIMEOUT_SECS`            | `30`                    |
    /// | `PROGRESS_LINGER_MS`            | `5000`                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`WorkerConfig::from_env`] but reading from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let poll_interval = env.millis("POLL_INTERVAL_MS", 1000)?;
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "POLL_INTERVAL_MS",
                value: "0".into(),
            });
        }
        let backend_call_timeout = env.secs("BACKEND_CALL_TIMEOUT_SECS", 30)?;
        let heartbeat_stale_after = match env.opt::<u64>("HEARTBEAT_STALE_SECS")? {
            Some(secs) => Duration::from_secs(secs),
            None => default_stale_after(poll_interval, backend_call_timeout),
        };
        // A worker blocked in one backend call must not look dead.
        let minimum = backend_call_timeout + poll_interval;
        if heartbeat_stale_after <= minimum {
            return Err(ConfigError::StaleThresholdTooShort {
                stale_after: heartbeat_stale_after,
                minimum,
            });
        }

        let policy_name = env.string("RECOVERY_POLICY", "requeue");
        let max_requeues = env.parse("MAX_RECOVERY_REQUEUES", DEFAULT_MAX_REQUEUES)?;
        let recovery_policy =
            RecoveryPolicy::parse(&policy_name, max_requeues).map_err(|_| ConfigError::Invalid {
                var: "RECOVERY_POLICY",
                value: policy_name.clone(),
            })?;

        let concurrency: usize = env.parse("WORKER_CONCURRENCY", 4)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "WORKER_CONCURRENCY",
                value: "0".into(),
            });
        }

        Ok(Self {
            database_url: env.opt_string("DATABASE_URL"),
            concurrency,
            worker_id_prefix: env.string("WORKER_ID_PREFIX", "worker"),
            queue_pop_timeout: env.millis("QUEUE_POP_TIMEOUT_MS", 1000)?,
            poll_interval,
            job_timeout: env.secs("JOB_TIMEOUT_SECS", 900)?,
            backend_call_timeout,
            max_backend_retries: env.parse("MAX_BACKEND_RETRIES", 1)?,
            retry_base_delay: env.millis("RETRY_BASE_DELAY_MS", 500)?,
            heartbeat_stale_after,
            sweep_interval: env.secs("SWEEP_INTERVAL_SECS", 30)?,
            recovery_policy,
            queue_visibility_timeout: env
                .secs("QUEUE_VISIBILITY_TIMEOUT_SECS", DEFAULT_VISIBILITY_TIMEOUT.as_secs())?,
            idempotency_ttl: env
                .opt::<u64>("IDEMPOTENCY_TTL_HOURS")?
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or(DEFAULT_IDEMPOTENCY_TTL),
            max_payload_bytes: env.parse("MAX_PAYLOAD_BYTES", DEFAULT_MAX_PAYLOAD_BYTES)?,
            backend_url: env.opt_string("BACKEND_URL"),
            artifact_bucket: env.opt_string("ARTIFACT_BUCKET"),
            artifact_url_ttl: env.secs("ARTIFACT_URL_TTL_SECS", DEFAULT_URL_TTL.as_secs())?,
            metrics_host: env.string("METRICS_HOST", "0.0.0.0"),
            metrics_port: env.parse("METRICS_PORT", 9090)?,
            drain_timeout: env.secs("DRAIN_TIMEOUT_SECS", 30)?,
            progress_linger: env.millis("PROGRESS_LINGER_MS", 5000)?,
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: self.poll_interval,
            job_timeout: self.job_timeout,
            backend_call_timeout: self.backend_call_timeout,
            max_backend_retries: self.max_backend_retries,
            backoff: Backoff::new(self.retry_base_delay),
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            policy: self.recovery_policy,
            stale_after: self.heartbeat_stale_after,
            lost_message_after: self.queue_visibility_timeout,
            interval: self.sweep_interval,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            concurrency: self.concurrency,
            worker_id_prefix: self.worker_id_prefix.clone(),
            queue_pop_timeout: self.queue_pop_timeout,
            registry_interval: self.poll_interval,
            drain_timeout: self.drain_timeout,
            executor: self.executor_config(),
            recovery: self.recovery_config(),
        }
    }

    pub fn submission_config(&self) -> SubmissionConfig {
        SubmissionConfig {
            max_payload_bytes: self.max_payload_bytes,
            idempotency_ttl: self.idempotency_ttl,
        }
    }
}

/// Typed accessors over a variable lookup.
struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn opt_string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, var: &str, default: &str) -> String {
        self.opt_string(var).unwrap_or_else(|| default.to_string())
    }

    fn opt<T: FromStr>(&self, var: &'static str) -> Result<Option<T>, ConfigError> {
        self.opt_string(var)
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| ConfigError::Invalid { var, value: value.clone() })
            })
            .transpose()
    }

    fn parse<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        Ok(self.opt(var)?.unwrap_or(default))
    }

    fn secs(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(var, default).map(Duration::from_secs)
    }

    fn millis(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(var, default).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = load(&[]).unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.job_timeout, Duration::from_secs(900));
        assert_eq!(config.max_backend_retries, 1);
        assert_eq!(config.heartbeat_stale_after, Duration::from_secs(32));
        assert_eq!(config.recovery_policy, RecoveryPolicy::Requeue { max_requeues: 1 });
        assert_eq!(config.idempotency_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(config.metrics_port, 9090);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn stale_threshold_follows_poll_interval_and_call_timeout() {
        let config = load(&[("POLL_INTERVAL_MS", "15000")]).unwrap();
        assert_eq!(config.heartbeat_stale_after, Duration::from_secs(60));

        let config = load(&[("BACKEND_CALL_TIMEOUT_SECS", "5"), ("HEARTBEAT_STALE_SECS", "10")]).unwrap();
        assert_eq!(config.heartbeat_stale_after, Duration::from_secs(10));
    }

    #[test]
    fn stale_threshold_must_outlast_one_backend_call() {
        assert_matches!(
            load(&[("HEARTBEAT_STALE_SECS", "31")]),
            Err(ConfigError::StaleThresholdTooShort { minimum, .. }) if minimum == Duration::from_secs(31)
        );
        assert_matches!(
            load(&[("BACKEND_CALL_TIMEOUT_SECS", "60")]).map(|c| c.heartbeat_stale_after),
            Ok(stale) if stale == Duration::from_secs(62)
        );
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        assert_matches!(
            load(&[("POLL_INTERVAL_MS", "0")]),
            Err(ConfigError::Invalid { var: "POLL_INTERVAL_MS", .. })
        );
    }

    #[test]
    fn fail_policy_is_parsed() {
        let config = load(&[("RECOVERY_POLICY", "FAIL")]).unwrap();
        assert_eq!(config.recovery_policy, RecoveryPolicy::Fail);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        assert_matches!(
            load(&[("WORKER_CONCURRENCY", "many")]),
            Err(ConfigError::Invalid { var: "WORKER_CONCURRENCY", .. })
        );
        assert_matches!(
            load(&[("WORKER_CONCURRENCY", "0")]),
            Err(ConfigError::Invalid { var: "WORKER_CONCURRENCY", .. })
        );
        assert_matches!(
            load(&[("RECOVERY_POLICY", "retry")]),
            Err(ConfigError::Invalid { var: "RECOVERY_POLICY", .. })
        );
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("DATABASE_URL", "  "), ("METRICS_PORT", "")]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.metrics_port, 9090);
    }
}
