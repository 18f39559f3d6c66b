//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to the embedded database file.
    pub db_path: PathBuf,
    /// Root directory for per-job artifact trees.
    pub artifact_root: PathBuf,
    /// Maximum number of non-terminal jobs before admission rejects.
    pub backlog_capacity: u64,
    /// Retry-after hint returned on backlog rejection.
    pub retry_after: Duration,
    /// Maximum concurrent file units across all jobs.
    pub worker_concurrency: usize,
    /// Dispatcher poll interval when no wakeup arrives.
    pub poll_interval: Duration,
    /// HTTP listen port.
    pub port: u16,
    /// Repair streak length that triggers an instability warning.
    pub repair_streak_warn: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/docmill.db"),
            artifact_root: PathBuf::from("./data/artifacts"),
            backlog_capacity: 32,
            retry_after: Duration::from_secs(30),
            worker_concurrency: 4,
            poll_interval: Duration::from_secs(2),
            port: 8080,
            repair_streak_warn: 3,
        }
    }
}

impl RuntimeConfig {
    /// Build a config from environment variables, falling back to defaults.
    /// A set-but-unparseable variable is an error, not a silent default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            db_path: env_var("DOCMILL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            artifact_root: env_var("DOCMILL_ARTIFACT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_root),
            backlog_capacity: env_parse("DOCMILL_BACKLOG_CAPACITY", defaults.backlog_capacity)?,
            retry_after: Duration::from_secs(env_parse(
                "DOCMILL_RETRY_AFTER_SECS",
                defaults.retry_after.as_secs(),
            )?),
            worker_concurrency: env_parse(
                "DOCMILL_WORKER_CONCURRENCY",
                defaults.worker_concurrency,
            )?,
            poll_interval: Duration::from_secs(env_parse(
                "DOCMILL_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            port: env_parse("DOCMILL_PORT", defaults.port)?,
            repair_streak_warn: env_parse(
                "DOCMILL_REPAIR_STREAK_WARN",
                defaults.repair_streak_warn,
            )?,
        })
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env_var(key) {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {value:?}"),
        }),
        None => Ok(default),
    }
}

/// Bounded exponential backoff policy for busy/locked database retries.
#[derive(Debug, Clone)]
pub struct BusyRetryPolicy {
    /// Maximum attempts before surfacing a fatal persistence error.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for BusyRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl BusyRetryPolicy {
    /// Delay before retry number `attempt` (1-based), with jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        // Up to 25% jitter so concurrent writers don't retry in lockstep
        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        capped.mul_f64(1.0 + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert!(config.backlog_capacity > 0);
        assert!(config.worker_concurrency > 0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BusyRetryPolicy::default();
        let first = policy.delay_for(1);
        let third = policy.delay_for(3);
        assert!(third >= first);
        // 1.25 * max_delay is the ceiling with full jitter
        assert!(policy.delay_for(10) <= policy.max_delay.mul_f64(1.25));
    }
}
