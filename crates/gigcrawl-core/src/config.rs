use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dedup::DedupConfig;
use crate::error::CrawlError;
use crate::health::HealthConfig;
use crate::job::WorkerConfig;
use crate::manager::ScalingConfig;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;

/// Top-level configuration for an [`Orchestrator`](crate::orchestrator::Orchestrator).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    /// Limits for sources without an override.
    pub rate_limit: RateLimitConfig,
    pub source_limits: HashMap<String, RateLimitConfig>,
    pub health: HealthConfig,
    pub dedup: DedupConfig,
    pub scaling: ScalingConfig,
    /// Template for autoscaled workers.
    pub worker: WorkerConfig,
}

impl OrchestratorConfig {
    /// Load configuration from `GIGCRAWL_*` environment variables.
    ///
    /// Unset variables keep their defaults:
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `GIGCRAWL_MIN_WORKERS` / `GIGCRAWL_MAX_WORKERS` | pool bounds |
    /// | `GIGCRAWL_TARGET_JOBS_PER_WORKER` | autoscaler target |
    /// | `GIGCRAWL_SCALE_COOLDOWN_SECS` | time between scaling actions |
    /// | `GIGCRAWL_MAX_CONCURRENT_JOBS` | per-worker concurrency |
    /// | `GIGCRAWL_POLL_INTERVAL_MS` | idle wait between claims |
    /// | `GIGCRAWL_REQUESTS_PER_MINUTE` / `GIGCRAWL_BURST_LIMIT` | default rate limit |
    /// | `GIGCRAWL_RETRY_BASE_DELAY_MS` / `GIGCRAWL_RETRY_MAX_DELAY_SECS` | backoff bounds |
    /// | `GIGCRAWL_FALLBACK_ON_EXHAUSTION` | `true` to ask executors for fallback records |
    /// | `GIGCRAWL_COOLING_PERIOD_SECS` | how long an unhealthy source is blocked |
    /// | `GIGCRAWL_RETENTION_HOURS` | age at which finished jobs are removed |
    pub fn from_env() -> Result<Self, CrawlError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CrawlError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = EnvVars { lookup };
        let mut config = Self::default();

        if let Some(v) = vars.parse("GIGCRAWL_MIN_WORKERS")? {
            config.scaling.min_workers = v;
        }
        if let Some(v) = vars.parse("GIGCRAWL_MAX_WORKERS")? {
            config.scaling.max_workers = v;
        }
        if let Some(v) = vars.parse("GIGCRAWL_TARGET_JOBS_PER_WORKER")? {
            config.scaling.target_jobs_per_worker = v;
        }
        if let Some(v) = vars.parse("GIGCRAWL_SCALE_COOLDOWN_SECS")? {
            config.scaling.cooldown = Duration::from_secs(v);
        }
        if let Some(v) = vars.parse("GIGCRAWL_RETENTION_HOURS")? {
            config.scaling.retention_hours = v;
        }
        if let Some(v) = vars.parse("GIGCRAWL_MAX_CONCURRENT_JOBS")? {
            config.worker.max_concurrent_jobs = v;
        }
        if let Some(v) = vars.parse("GIGCRAWL_POLL_INTERVAL_MS")? {
            config.worker.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = vars.parse("GIGCRAWL_REQUESTS_PER_MINUTE")? {
            config.rate_limit.requests_per_minute = v;
        }
        if let Some(v) = vars.parse("GIGCRAWL_BURST_LIMIT")? {
            config.rate_limit.burst_limit = v;
        }
        if let Some(v) = vars.parse("GIGCRAWL_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = vars.parse("GIGCRAWL_RETRY_MAX_DELAY_SECS")? {
            config.retry.max_delay = Duration::from_secs(v);
        }
        if let Some(v) = vars.parse("GIGCRAWL_FALLBACK_ON_EXHAUSTION")? {
            config.retry.fallback_on_exhaustion = v;
        }
        if let Some(v) = vars.parse("GIGCRAWL_COOLING_PERIOD_SECS")? {
            config.health.cooling_period = Duration::from_secs(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document. Missing sections and fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, CrawlError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_source_limit(mut self, source: impl Into<String>, limit: RateLimitConfig) -> Self {
        self.source_limits.insert(source.into(), limit);
        self
    }

    /// Check every section; the first problem found is reported.
    pub fn validate(&self) -> Result<(), CrawlError> {
        self.retry.validate().map_err(CrawlError::InvalidConfig)?;
        self.rate_limit.validate().map_err(CrawlError::InvalidConfig)?;
        for (source, limit) in &self.source_limits {
            limit
                .validate()
                .map_err(|e| CrawlError::InvalidConfig(format!("source {source}: {e}")))?;
        }
        self.health.validate().map_err(CrawlError::InvalidConfig)?;
        self.dedup.validate().map_err(CrawlError::InvalidConfig)?;
        self.scaling.validate()?;
        self.worker.validate()
    }
}

struct EnvVars<F> {
    lookup: F,
}

impl<F> EnvVars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, CrawlError> {
        let Some(raw) = (self.lookup)(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse()
            .map(Some)
            .map_err(|_| CrawlError::InvalidConfig(format!("Invalid {key} '{raw}'")))
    }
}
