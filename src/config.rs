//! Typed configuration for jobs, caches, engines and the worker pool.
//!
//! Every struct deserializes with defaults for missing fields and exposes a
//! `validate()` that rejects out-of-range values instead of clamping them.
//! Durations are configured in (fractional) seconds.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, ensure_positive};

/// Scheduling parameters of one [`AsyncJob`](crate::job::AsyncJob).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Name used in logs and in the `job:<name>` diagnostic tag.
    pub job_name: String,
    /// Namespace of diagnostic metrics, e.g. `dd.postgres` gives
    /// `dd.postgres.async_job.cancel`.
    pub metric_prefix: String,
    pub enabled: bool,
    /// Run the routine inline in `run_job_loop` instead of on the pool.
    pub run_sync: bool,
    /// Maximum runs per second.
    pub rate_limit: f64,
    /// Minimum time between the starts of two runs.
    pub min_collection_interval_secs: f64,
    /// Stop the loop when `run_job_loop` was not called for this long.
    /// Defaults to twice the effective collection interval.
    pub inactivity_timeout_secs: Option<f64>,
    /// Minimum time between two missed-collection diagnostics.
    pub missed_collection_cooldown_secs: f64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name: "job".to_string(),
            metric_prefix: "dbm".to_string(),
            enabled: true,
            run_sync: false,
            rate_limit: 1.0,
            min_collection_interval_secs: 15.0,
            inactivity_timeout_secs: None,
            missed_collection_cooldown_secs: 300.0,
        }
    }
}

impl JobConfig {
    pub fn new(job_name: impl Into<String>, metric_prefix: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            metric_prefix: metric_prefix.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_name.trim().is_empty() {
            return Err(ConfigError::invalid("job_name", "must be non-empty"));
        }
        ensure_positive("rate_limit", self.rate_limit)?;
        ensure_non_negative(
            "min_collection_interval_secs",
            self.min_collection_interval_secs,
        )?;
        if let Some(timeout) = self.inactivity_timeout_secs {
            ensure_positive("inactivity_timeout_secs", timeout)?;
        }
        ensure_positive(
            "missed_collection_cooldown_secs",
            self.missed_collection_cooldown_secs,
        )?;
        Ok(())
    }

    pub fn min_collection_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_collection_interval_secs.max(0.0))
    }

    /// Time between run starts once both the rate limit and the floor apply.
    pub fn effective_interval(&self) -> Duration {
        let period = Duration::from_secs_f64(1.0 / self.rate_limit);
        period.max(self.min_collection_interval())
    }

    pub fn inactivity_timeout(&self) -> Duration {
        match self.inactivity_timeout_secs {
            Some(secs) => Duration::from_secs_f64(secs),
            None => self.effective_interval() * 2,
        }
    }

    pub fn missed_collection_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.missed_collection_cooldown_secs)
    }

    /// Makes the default inactivity timeout span two invocations of a check
    /// that runs every `check_interval`. An explicit timeout is kept as is.
    pub fn fit_check_interval(&mut self, check_interval: Duration) {
        if self.inactivity_timeout_secs.is_none() {
            let timeout = self.inactivity_timeout().max(check_interval * 2);
            self.inactivity_timeout_secs = Some(timeout.as_secs_f64());
        }
    }
}

/// Parameters of a [`RateLimitingTtlCache`](crate::cache::RateLimitingTtlCache).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_secs: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            ttl_secs: 60.0,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::invalid("max_size", "must be > 0"));
        }
        ensure_positive("ttl_secs", self.ttl_secs)?;
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs_f64(self.ttl_secs)
    }
}

/// Parameters of a [`StatementMetrics`](crate::statement_metrics::StatementMetrics) engine.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Calls a key may be absent before it is evicted (0 = evict at once).
    pub stale_after_cycles: u32,
}

/// Size of the shared [`WorkerPool`](crate::pool::WorkerPool).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of job loops running at once.
    pub max_jobs: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_jobs: 32 }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_jobs == 0 {
            return Err(ConfigError::invalid("max_jobs", "must be > 0"));
        }
        Ok(())
    }
}

/// Configuration of the PostgreSQL integration as loaded by `dbm-collectord`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub pool: PoolConfig,
    pub statement_metrics: JobConfig,
    pub statement_engine: EngineConfig,
    pub activity: JobConfig,
    /// Suppresses re-emission of identical activity samples.
    pub activity_samples: CacheConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            statement_metrics: JobConfig {
                rate_limit: 0.1,
                min_collection_interval_secs: 10.0,
                ..JobConfig::new("query-metrics", "dbm.postgres")
            },
            statement_engine: EngineConfig::default(),
            activity: JobConfig {
                rate_limit: 1.0,
                min_collection_interval_secs: 1.0,
                ..JobConfig::new("query-activity", "dbm.postgres")
            },
            activity_samples: CacheConfig {
                max_size: 10_000,
                ttl_secs: 60.0,
            },
        }
    }
}

impl CollectorConfig {
    /// Reads a JSON config file; missing sections fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies [`JobConfig::fit_check_interval`] to every job.
    pub fn fit_check_interval(&mut self, check_interval: Duration) {
        self.statement_metrics.fit_check_interval(check_interval);
        self.activity.fit_check_interval(check_interval);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.statement_metrics.validate()?;
        self.activity.validate()?;
        self.activity_samples.validate()?;
        Ok(())
    }
}

fn ensure_non_negative(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(name, format!("{value} must be >= 0")));
    }
    Ok(value)
}
