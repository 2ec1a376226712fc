use crate::config::OrchestratorConfig;
use crate::dedup::{DedupConfig, Deduplicator};
use crate::health::{HealthConfig, HealthMonitor};
use crate::job_queue::JobQueue;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::retry::RetryPolicy;
use crate::traits::{EventSink, PlatformExecutor};

/// Everything a worker needs, shared by the whole pool.
///
/// Built once by the caller and handed to workers behind an `Arc`; there is
/// no process-wide state.
pub struct CrawlContext<Q, E, S> {
    pub queue: Q,
    pub executor: E,
    pub sink: S,
    pub rate_limiter: RateLimiter,
    pub health: HealthMonitor,
    pub deduplicator: Deduplicator,
    pub retry_policy: RetryPolicy,
}

impl<Q, E, S> CrawlContext<Q, E, S>
where
    Q: JobQueue,
    E: PlatformExecutor,
    S: EventSink,
{
    /// Context with default limits, health thresholds and retry policy.
    pub fn new(queue: Q, executor: E, sink: S) -> Self {
        Self {
            queue,
            executor,
            sink,
            rate_limiter: RateLimiter::new(RateLimitConfig::default()),
            health: HealthMonitor::new(HealthConfig::default()),
            deduplicator: Deduplicator::new(DedupConfig::default()),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Context wired from an already validated configuration.
    pub fn from_config(config: &OrchestratorConfig, queue: Q, executor: E, sink: S) -> Self {
        let rate_limiter = config.source_limits.iter().fold(
            RateLimiter::new(config.rate_limit),
            |limiter, (source, limit)| limiter.with_source_limit(source.clone(), *limit),
        );

        Self {
            queue,
            executor,
            sink,
            rate_limiter,
            health: HealthMonitor::new(config.health.clone()),
            deduplicator: Deduplicator::new(config.dedup.clone()),
            retry_policy: config.retry.clone(),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_health(mut self, health: HealthMonitor) -> Self {
        self.health = health;
        self
    }

    pub fn with_deduplicator(mut self, deduplicator: Deduplicator) -> Self {
        self.deduplicator = deduplicator;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}
