//! Per-source request throttling.
//!
//! Every worker shares one [`RateLimiter`], so the aggregate request rate to
//! a source stays bounded no matter how large the pool grows. Each source
//! gets its own token bucket: `burst_limit` tokens of capacity, refilled
//! continuously at `requests_per_minute`.
//!
//! # Example
//!
//! ```rust,no_run
//! use gigcrawl_core::rate_limit::{RateLimitConfig, RateLimiter};
//!
//! # async fn run() {
//! let limiter = RateLimiter::new(RateLimitConfig::new(30, 5))
//!     .with_source_limit("slow-board", RateLimitConfig::new(6, 1));
//! limiter.acquire("slow-board").await;
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Limits for one source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained refill rate.
    pub requests_per_minute: u32,

    /// Bucket capacity: how many requests may go out back to back.
    pub burst_limit: u32,
}

impl RateLimitConfig {
    pub fn new(requests_per_minute: u32, burst_limit: u32) -> Self {
        Self {
            requests_per_minute,
            burst_limit,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.requests_per_minute == 0 {
            return Err("requests_per_minute must be at least 1".into());
        }
        if self.burst_limit == 0 {
            return Err("burst_limit must be at least 1".into());
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    /// 30 requests per minute with bursts of 5.
    fn default() -> Self {
        Self::new(30, 5)
    }
}

/// Token bucket with continuous refill based on elapsed time.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    tokens_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            capacity: f64::from(config.burst_limit),
            tokens: f64::from(config.burst_limit),
            tokens_per_sec: f64::from(config.requests_per_minute) / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one whole token is available.
    fn time_until_token(&self) -> Duration {
        let deficit = (1.0 - self.tokens).max(0.0);
        let wait = Duration::from_secs_f64(deficit / self.tokens_per_sec);
        // Float rounding can leave us a hair short; never spin on zero.
        wait.max(Duration::from_millis(1))
    }

    fn fill(&mut self) {
        self.tokens = self.capacity;
        self.last_refill = Instant::now();
    }
}

type SharedBucket = Arc<tokio::sync::Mutex<TokenBucket>>;

/// Shared per-source rate limiter.
///
/// The outer map lock is only held long enough to find (or create) a
/// source's bucket. Waiting happens on the bucket's own async mutex, so
/// callers queue up in order per source while other sources proceed.
#[derive(Clone)]
pub struct RateLimiter {
    default: RateLimitConfig,
    overrides: Arc<HashMap<String, RateLimitConfig>>,
    buckets: Arc<Mutex<HashMap<String, SharedBucket>>>,
}

impl RateLimiter {
    pub fn new(default: RateLimitConfig) -> Self {
        Self {
            default,
            overrides: Arc::new(HashMap::new()),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Use different limits for one source.
    ///
    /// Meant for construction time; buckets already created keep their limits.
    pub fn with_source_limit(mut self, source: impl Into<String>, config: RateLimitConfig) -> Self {
        Arc::make_mut(&mut self.overrides).insert(source.into(), config);
        self
    }

    pub fn config_for(&self, source: &str) -> RateLimitConfig {
        self.overrides.get(source).copied().unwrap_or(self.default)
    }

    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<String, SharedBucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limiter mutex");
            poisoned.into_inner()
        })
    }

    fn bucket(&self, source: &str) -> SharedBucket {
        let mut buckets = self.lock_buckets();
        Arc::clone(buckets.entry(source.to_string()).or_insert_with(|| {
            Arc::new(tokio::sync::Mutex::new(TokenBucket::new(
                self.config_for(source),
            )))
        }))
    }

    /// Wait until a token is available for `source`, then consume it.
    pub async fn acquire(&self, source: &str) {
        let bucket = self.bucket(source);
        let mut bucket = bucket.lock().await;

        while !bucket.try_take() {
            let wait = bucket.time_until_token();
            tracing::debug!(
                source = %source,
                wait_ms = %wait.as_millis(),
                "Rate limiting request"
            );
            // Holding the bucket lock while sleeping keeps later callers
            // behind us in line.
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token only if one is free right now.
    pub fn try_acquire(&self, source: &str) -> bool {
        let bucket = self.bucket(source);
        let taken = match bucket.try_lock() {
            Ok(mut bucket) => bucket.try_take(),
            // Someone is already waiting on this source.
            Err(_) => false,
        };
        taken
    }

    /// Whole tokens currently available for `source`.
    pub async fn available(&self, source: &str) -> u32 {
        let bucket = self.bucket(source);
        let mut bucket = bucket.lock().await;
        bucket.refill();
        bucket.tokens.floor() as u32
    }

    /// Refill a source's bucket to capacity.
    pub async fn reset(&self, source: &str) {
        let bucket = self.bucket(source);
        bucket.lock().await.fill();
        tracing::info!(source = %source, "Rate limit reset");
    }
}
