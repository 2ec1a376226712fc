//! Rolling health status per data source.
//!
//! # Source States
//!
//! ```text
//! HEALTHY --[3 consecutive failures or error rate > 50%]--> DEGRADED
//! DEGRADED --[5 consecutive failures / abort]--> UNHEALTHY (blocked until cooling period ends)
//! UNHEALTHY --[cooling period elapsed]--> DEGRADED (on trial)
//! any --[success, recovery job]--> re-evaluated toward HEALTHY
//! ```
//!
//! A blocked source is left out of scrape claims until the block lifts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::ErrorKind;

/// Current health classification of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Thresholds for health transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before a source is degraded.
    pub degraded_after: u32,

    /// Consecutive failures before a source is unhealthy and blocked.
    pub unhealthy_after: u32,

    /// Error rate over the window above which a source is degraded.
    pub error_rate_threshold: f64,

    /// Number of recent outcomes the error rate is computed over.
    pub window_size: usize,

    /// How long an unhealthy source stays blocked.
    pub cooling_period: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_after: 3,
            unhealthy_after: 5,
            error_rate_threshold: 0.5,
            window_size: 20,
            cooling_period: Duration::from_secs(15 * 60),
        }
    }
}

impl HealthConfig {
    pub fn with_cooling_period(mut self, period: Duration) -> Self {
        self.cooling_period = period;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.degraded_after == 0 || self.unhealthy_after < self.degraded_after {
            return Err("health thresholds must satisfy 0 < degraded_after <= unhealthy_after".into());
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err("error_rate_threshold must be within [0, 1]".into());
        }
        if self.window_size == 0 {
            return Err("health window_size must be at least 1".into());
        }
        Ok(())
    }
}

/// Snapshot of one source's health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformHealth {
    pub source: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    /// Failure share over the last `window_size` outcomes.
    pub error_rate: f64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub blocked_until: Option<DateTime<Utc>>,
}

impl PlatformHealth {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            error_rate: 0.0,
            total_successes: 0,
            total_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            blocked_until: None,
        }
    }

    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug)]
struct SourceState {
    health: PlatformHealth,
    /// true = failure
    window: VecDeque<bool>,
}

impl SourceState {
    fn new(source: &str) -> Self {
        Self {
            health: PlatformHealth::new(source),
            window: VecDeque::new(),
        }
    }

    fn push_outcome(&mut self, failed: bool, window_size: usize) {
        self.window.push_back(failed);
        while self.window.len() > window_size {
            self.window.pop_front();
        }
        let failures = self.window.iter().filter(|f| **f).count();
        self.health.error_rate = failures as f64 / self.window.len() as f64;
    }
}

type SharedState = Arc<Mutex<SourceState>>;

/// Thread-safe health tracker shared by workers and the autoscaler.
#[derive(Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    sources: Arc<Mutex<HashMap<String, SharedState>>>,
}

fn recover<'a, T>(name: &str, result: std::sync::LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(|poisoned| {
        tracing::warn!(source = %name, "Recovered from poisoned health mutex");
        poisoned.into_inner()
    })
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            sources: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn state(&self, source: &str) -> SharedState {
        let mut sources = recover("*", self.sources.lock());
        Arc::clone(
            sources
                .entry(source.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SourceState::new(source)))),
        )
    }

    fn existing(&self) -> Vec<SharedState> {
        recover("*", self.sources.lock()).values().cloned().collect()
    }

    fn cooling_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.cooling_period).unwrap_or(TimeDelta::MAX)
    }

    /// Lift an expired block; the source then runs on trial as degraded.
    fn maybe_end_block(&self, state: &mut SourceState, now: DateTime<Utc>) {
        if let Some(until) = state.health.blocked_until
            && until <= now
        {
            tracing::info!(
                source = %state.health.source,
                "Cooling period over, retrying source"
            );
            state.health.blocked_until = None;
            state.health.status = HealthStatus::Degraded;
        }
    }

    fn block(&self, state: &mut SourceState, now: DateTime<Utc>) {
        let until = now
            .checked_add_signed(self.cooling_delta())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.health.blocked_until = Some(until);
        state.health.status = HealthStatus::Unhealthy;
    }

    fn evaluate(&self, state: &mut SourceState, now: DateTime<Utc>) {
        let health = &state.health;
        let status = if health.is_blocked(now) {
            HealthStatus::Unhealthy
        } else if health.consecutive_failures >= self.config.degraded_after
            || health.error_rate > self.config.error_rate_threshold
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        if status != state.health.status {
            tracing::info!(
                source = %state.health.source,
                from = %state.health.status,
                to = %status,
                "Source health changed"
            );
        }
        state.health.status = status;
    }

    pub fn record_success(&self, source: &str) {
        let shared = self.state(source);
        let mut state = recover(source, shared.lock());
        let now = Utc::now();
        self.maybe_end_block(&mut state, now);

        // Successes count, but only the cooling period or a reset lifts a block.
        state.health.consecutive_failures = 0;
        state.health.total_successes += 1;
        state.health.last_success_at = Some(now);
        state.push_outcome(false, self.config.window_size);
        self.evaluate(&mut state, now);
    }

    pub fn record_failure(&self, source: &str, kind: ErrorKind, message: &str) {
        let shared = self.state(source);
        let mut state = recover(source, shared.lock());
        let now = Utc::now();
        self.maybe_end_block(&mut state, now);

        state.health.consecutive_failures += 1;
        state.health.total_failures += 1;
        state.health.last_failure_at = Some(now);
        state.health.last_error = Some(format!("{kind}: {message}"));
        state.push_outcome(true, self.config.window_size);

        if state.health.consecutive_failures >= self.config.unhealthy_after
            && !state.health.is_blocked(now)
        {
            tracing::warn!(
                source = %source,
                failures = state.health.consecutive_failures,
                cooling_secs = self.config.cooling_period.as_secs(),
                "Source unhealthy, blocking"
            );
            self.block(&mut state, now);
        }
        self.evaluate(&mut state, now);
    }

    /// Block a source immediately (captcha, explicit ban).
    pub fn mark_blocked(&self, source: &str, reason: &str) {
        let shared = self.state(source);
        let mut state = recover(source, shared.lock());
        let now = Utc::now();

        tracing::warn!(source = %source, reason = %reason, "Source blocked");
        state.health.last_error = Some(reason.to_string());
        self.block(&mut state, now);
    }

    /// Forget failure history and lift any block.
    pub fn reset(&self, source: &str) {
        let shared = self.state(source);
        let mut state = recover(source, shared.lock());

        tracing::info!(source = %source, "Source health manually reset");
        state.health.consecutive_failures = 0;
        state.health.error_rate = 0.0;
        state.health.blocked_until = None;
        state.health.last_error = None;
        state.health.status = HealthStatus::Healthy;
        state.window.clear();
    }

    /// False while the source is blocked.
    pub fn is_available(&self, source: &str) -> bool {
        self.platform_health(source)
            .is_none_or(|health| !health.is_blocked(Utc::now()))
    }

    /// Sources that must not receive scrape claims right now.
    pub fn blocked_sources(&self) -> HashSet<String> {
        let now = Utc::now();
        self.existing()
            .into_iter()
            .filter_map(|shared| {
                let mut state = recover("*", shared.lock());
                self.maybe_end_block(&mut state, now);
                state
                    .health
                    .is_blocked(now)
                    .then(|| state.health.source.clone())
            })
            .collect()
    }

    /// Current health of one source, if it has been observed.
    pub fn platform_health(&self, source: &str) -> Option<PlatformHealth> {
        let shared = recover(source, self.sources.lock()).get(source).cloned()?;
        let mut state = recover(source, shared.lock());
        self.maybe_end_block(&mut state, Utc::now());
        Some(state.health.clone())
    }

    /// Health of every observed source, sorted by source name.
    pub fn snapshot(&self) -> Vec<PlatformHealth> {
        let now = Utc::now();
        let mut all: Vec<PlatformHealth> = self
            .existing()
            .into_iter()
            .map(|shared| {
                let mut state = recover("*", shared.lock());
                self.maybe_end_block(&mut state, now);
                state.health.clone()
            })
            .collect();
        all.sort_by(|a, b| a.source.cmp(&b.source));
        all
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail(monitor: &HealthMonitor, source: &str, times: usize) {
        for _ in 0..times {
            monitor.record_failure(source, ErrorKind::Network, "connection reset");
        }
    }

    #[test]
    fn test_unknown_source_is_available() {
        let monitor = HealthMonitor::default();
        assert!(monitor.is_available("alpha"));
        assert!(monitor.platform_health("alpha").is_none());
    }

    #[test]
    fn test_first_observation_creates_record() {
        let monitor = HealthMonitor::default();
        monitor.record_success("alpha");
        let health = monitor.platform_health("alpha").unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.total_successes, 1);
        assert!(health.last_success_at.is_some());
    }

    #[test]
    fn test_degraded_after_three_failures() {
        let config = HealthConfig {
            // Keep error rate out of the picture.
            error_rate_threshold: 1.0,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(config);
        fail(&monitor, "alpha", 2);
        assert_eq!(
            monitor.platform_health("alpha").unwrap().status,
            HealthStatus::Healthy
        );
        fail(&monitor, "alpha", 1);
        assert_eq!(
            monitor.platform_health("alpha").unwrap().status,
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_error_rate_degrades() {
        let monitor = HealthMonitor::default();
        monitor.record_success("alpha");
        fail(&monitor, "alpha", 1);
        monitor.record_success("alpha");
        fail(&monitor, "alpha", 2);

        let health = monitor.platform_health("alpha").unwrap();
        assert_eq!(health.consecutive_failures, 2);
        assert!((health.error_rate - 0.6).abs() < 1e-9);
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_unhealthy_after_five_failures_blocks() {
        let monitor = HealthMonitor::default();
        fail(&monitor, "alpha", 5);

        let health = monitor.platform_health("alpha").unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.blocked_until.is_some());
        assert!(!monitor.is_available("alpha"));
        assert!(monitor.blocked_sources().contains("alpha"));
    }

    #[test]
    fn test_block_expires_into_degraded_trial() {
        let config = HealthConfig::default().with_cooling_period(Duration::from_millis(10));
        let monitor = HealthMonitor::new(config);
        fail(&monitor, "alpha", 5);
        assert!(!monitor.is_available("alpha"));

        std::thread::sleep(Duration::from_millis(20));

        assert!(monitor.is_available("alpha"));
        let health = monitor.platform_health("alpha").unwrap();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.blocked_until.is_none());

        // A failed trial request blocks again.
        fail(&monitor, "alpha", 1);
        assert!(!monitor.is_available("alpha"));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let monitor = HealthMonitor::default();
        fail(&monitor, "alpha", 4);
        monitor.record_success("alpha");

        let health = monitor.platform_health("alpha").unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.total_failures, 4);
        // 4 of 5 outcomes failed, so still degraded by rate.
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_mark_blocked_and_reset() {
        let monitor = HealthMonitor::default();
        monitor.mark_blocked("alpha", "captcha detected");
        let health = monitor.platform_health("alpha").unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.last_error.as_deref(), Some("captcha detected"));
        assert!(!monitor.is_available("alpha"));

        monitor.reset("alpha");
        let health = monitor.platform_health("alpha").unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(monitor.is_available("alpha"));
    }

    #[test]
    fn test_success_does_not_lift_block() {
        let monitor = HealthMonitor::default();
        monitor.mark_blocked("alpha", "captcha detected");
        monitor.record_success("alpha");

        let health = monitor.platform_health("alpha").unwrap();
        assert!(!monitor.is_available("alpha"));
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.blocked_until.is_some());
        assert_eq!(health.total_successes, 1);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn test_success_after_cooling_period_restores_health() {
        let config = HealthConfig::default().with_cooling_period(Duration::from_millis(10));
        let monitor = HealthMonitor::new(config);
        monitor.mark_blocked("alpha", "captcha detected");

        std::thread::sleep(Duration::from_millis(20));
        monitor.record_success("alpha");

        let health = monitor.platform_health("alpha").unwrap();
        assert!(monitor.is_available("alpha"));
        assert!(health.blocked_until.is_none());
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_sources_are_independent() {
        let monitor = HealthMonitor::default();
        fail(&monitor, "alpha", 5);
        monitor.record_success("beta");

        assert!(!monitor.is_available("alpha"));
        assert!(monitor.is_available("beta"));

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].source, "alpha");
        assert_eq!(snapshot[1].status, HealthStatus::Healthy);
    }

    #[test]
    fn test_window_is_bounded() {
        let config = HealthConfig {
            window_size: 4,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(config);
        fail(&monitor, "alpha", 2);
        for _ in 0..4 {
            monitor.record_success("alpha");
        }
        let health = monitor.platform_health("alpha").unwrap();
        assert_eq!(health.error_rate, 0.0);
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_config_validation() {
        assert!(HealthConfig::default().validate().is_ok());
        let bad = HealthConfig {
            degraded_after: 5,
            unhealthy_after: 3,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
