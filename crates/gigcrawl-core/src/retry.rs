//! Failure classification and retry policy.
//!
//! Every failed job goes through two steps: [`ErrorClassifier`] turns the
//! raw [`ExecutionError`] into an [`ErrorKind`], then [`RetryPolicy::decide`]
//! picks a [`RecoveryAction`] and, for retries, a backoff delay.
//!
//! ```text
//! network / timeout / rate_limited      -> retry while attempts remain
//! selector_not_found                    -> retry twice, then skip
//! unknown                               -> retry once, then skip
//! data_validation                       -> skip
//! captcha_detected / source_blocked     -> abort (source marked blocked)
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

/// Upper bound for any retry delay, including `max_delay` and the
/// rate-limit floor.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Classified failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    CaptchaDetected,
    RateLimited,
    SelectorNotFound,
    DataValidation,
    SourceBlocked,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CaptchaDetected => "captcha_detected",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::SelectorNotFound => "selector_not_found",
            ErrorKind::DataValidation => "data_validation",
            ErrorKind::SourceBlocked => "source_blocked",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::SelectorNotFound => {
                Severity::Medium
            }
            ErrorKind::CaptchaDetected | ErrorKind::SourceBlocked => Severity::Critical,
            ErrorKind::RateLimited => Severity::High,
            ErrorKind::DataValidation => Severity::Warning,
            ErrorKind::Unknown => Severity::Low,
        }
    }

    /// Per-kind rule, independent of the job's attempt budget.
    fn rule(&self) -> KindRule {
        match self {
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimited => {
                KindRule::Retry { max_retries: None }
            }
            ErrorKind::SelectorNotFound => KindRule::Retry {
                max_retries: Some(2),
            },
            ErrorKind::Unknown => KindRule::Retry {
                max_retries: Some(1),
            },
            ErrorKind::DataValidation => KindRule::Skip,
            ErrorKind::CaptchaDetected | ErrorKind::SourceBlocked => KindRule::Abort,
        }
    }

    /// True for kinds that are worth another attempt at all.
    pub fn is_transient(&self) -> bool {
        matches!(self.rule(), KindRule::Retry { .. })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "network" => Ok(ErrorKind::Network),
            "timeout" => Ok(ErrorKind::Timeout),
            "captcha_detected" => Ok(ErrorKind::CaptchaDetected),
            "rate_limited" => Ok(ErrorKind::RateLimited),
            "selector_not_found" => Ok(ErrorKind::SelectorNotFound),
            "data_validation" => Ok(ErrorKind::DataValidation),
            "source_blocked" => Ok(ErrorKind::SourceBlocked),
            "unknown" => Ok(ErrorKind::Unknown),
            _ => Err(format!("Unknown error kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KindRule {
    /// Retry; `max_retries` caps retries for this kind below the job budget.
    Retry { max_retries: Option<u32> },
    Skip,
    Abort,
}

/// How bad a failure is, for logs and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Warning,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Warning => "warning",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    /// Reschedule after a backoff delay.
    Retry,
    /// Give up and mark the source blocked.
    Abort,
    /// Give up on this job only.
    Skip,
    /// Give up on scraping and ask the executor for fallback records.
    Fallback,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Abort => "abort",
            RecoveryAction::Skip => "skip",
            RecoveryAction::Fallback => "fallback",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Maps raw executor failures to [`ErrorKind`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(error: &ExecutionError) -> ErrorKind {
        match error {
            ExecutionError::Network(_) => ErrorKind::Network,
            ExecutionError::Timeout(_) => ErrorKind::Timeout,
            ExecutionError::Captcha(_) => ErrorKind::CaptchaDetected,
            ExecutionError::RateLimited { .. } => ErrorKind::RateLimited,
            ExecutionError::SelectorNotFound(_) => ErrorKind::SelectorNotFound,
            ExecutionError::InvalidData(_) => ErrorKind::DataValidation,
            ExecutionError::Blocked(_) => ErrorKind::SourceBlocked,
            ExecutionError::Http { status, message } => Self::classify_status(*status)
                .unwrap_or_else(|| Self::classify_message(message)),
            ExecutionError::FallbackUnsupported | ExecutionError::Internal(_) => {
                ErrorKind::Unknown
            }
            ExecutionError::Other(message) => Self::classify_message(message),
        }
    }

    fn classify_status(status: u16) -> Option<ErrorKind> {
        match status {
            429 => Some(ErrorKind::RateLimited),
            401 | 403 | 451 => Some(ErrorKind::SourceBlocked),
            408 | 504 => Some(ErrorKind::Timeout),
            500..=599 => Some(ErrorKind::Network),
            _ => None,
        }
    }

    /// Classify a free-form failure message.
    ///
    /// Order matters: a captcha page often also contains "blocked", and a
    /// "network timeout" is a timeout.
    pub fn classify_message(message: &str) -> ErrorKind {
        let msg = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

        if has(&["captcha", "recaptcha", "hcaptcha", "are you a robot", "verify you are human"]) {
            ErrorKind::CaptchaDetected
        } else if has(&["rate limit", "ratelimit", "too many requests", "429", "throttl"]) {
            ErrorKind::RateLimited
        } else if has(&["blocked", "forbidden", "403", "access denied", "banned"]) {
            ErrorKind::SourceBlocked
        } else if has(&["timeout", "timed out", "deadline exceeded"]) {
            ErrorKind::Timeout
        } else if has(&[
            "network",
            "connection",
            "econnrefused",
            "econnreset",
            "enotfound",
            "dns",
            "socket",
            "unreachable",
        ]) {
            ErrorKind::Network
        } else if has(&["selector", "element not found", "no such element", "waiting for"]) {
            ErrorKind::SelectorNotFound
        } else if has(&["validation", "invalid", "parse", "malformed", "missing field"]) {
            ErrorKind::DataValidation
        } else {
            ErrorKind::Unknown
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub kind: ErrorKind,
    pub action: RecoveryAction,
    pub severity: Severity,
    /// Set only when `action` is [`RecoveryAction::Retry`].
    pub delay: Option<Duration>,
}

impl RetryDecision {
    pub fn will_retry(&self) -> bool {
        self.action == RecoveryAction::Retry
    }
}

/// Retry configuration with exponential backoff.
///
/// `backoff_delay(n) = min(base_delay * multiplier^n, max_delay)`, then
/// jittered uniformly within `±jitter` of that value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,

    /// Jitter band as a fraction of the delay (0.25 = ±25%). Zero disables.
    pub jitter: f64,

    /// Minimum delay before retrying a rate-limited job.
    pub rate_limit_floor: Duration,

    /// Timeouts wait this many times longer than other transient failures.
    pub timeout_factor: f64,

    /// Exhausted transient failures become [`RecoveryAction::Fallback`]
    /// instead of [`RecoveryAction::Skip`].
    pub fallback_on_exhaustion: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: 0.25,
            rate_limit_floor: Duration::from_secs(60),
            timeout_factor: 2.0,
            fallback_on_exhaustion: false,
        }
    }
}

impl RetryPolicy {
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_rate_limit_floor(mut self, floor: Duration) -> Self {
        self.rate_limit_floor = floor;
        self
    }

    pub fn with_fallback_on_exhaustion(mut self, enabled: bool) -> Self {
        self.fallback_on_exhaustion = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(format!("retry multiplier must be >= 1, got {}", self.multiplier));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(format!("retry jitter must be in [0, 1), got {}", self.jitter));
        }
        if !(self.timeout_factor.is_finite() && self.timeout_factor >= 1.0) {
            return Err(format!(
                "timeout factor must be >= 1, got {}",
                self.timeout_factor
            ));
        }
        if self.base_delay > self.max_delay {
            return Err("retry base delay exceeds max delay".into());
        }
        if self.max_delay > MAX_RETRY_DELAY || self.rate_limit_floor > MAX_RETRY_DELAY {
            return Err(format!(
                "retry delays must not exceed {} seconds",
                MAX_RETRY_DELAY.as_secs()
            ));
        }
        Ok(())
    }

    /// Un-jittered exponential delay for the given attempt number.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Apply the configured jitter band to a delay.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        scaled(delay, factor)
    }

    /// Kind-adjusted, jittered delay before retrying, capped at
    /// [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, kind: ErrorKind, attempt: u32) -> Duration {
        let base = self.jittered(self.backoff_delay(attempt));
        let delay = match kind {
            ErrorKind::Timeout => scaled(base, self.timeout_factor),
            ErrorKind::RateLimited => base.max(self.rate_limit_floor),
            _ => base,
        };
        delay.min(MAX_RETRY_DELAY)
    }

    /// Decide what to do after `attempt` (1-based) of `max_attempts` failed.
    pub fn decide(&self, kind: ErrorKind, attempt: u32, max_attempts: u32) -> RetryDecision {
        let action = match kind.rule() {
            KindRule::Abort => RecoveryAction::Abort,
            KindRule::Skip => RecoveryAction::Skip,
            KindRule::Retry { max_retries } => {
                if max_retries.is_some_and(|limit| attempt > limit) {
                    RecoveryAction::Skip
                } else if attempt >= max_attempts {
                    if self.fallback_on_exhaustion {
                        RecoveryAction::Fallback
                    } else {
                        RecoveryAction::Skip
                    }
                } else {
                    RecoveryAction::Retry
                }
            }
        };

        let delay = (action == RecoveryAction::Retry).then(|| self.delay_for(kind, attempt));

        RetryDecision {
            kind,
            action,
            severity: kind.severity(),
            delay,
        }
    }
}

/// `delay * factor`, saturating instead of panicking on overflow.
fn scaled(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::default().with_jitter(0.0)
    }

    #[test]
    fn test_classify_typed_errors() {
        assert_eq!(
            ErrorClassifier::classify(&ExecutionError::Network("reset".into())),
            ErrorKind::Network
        );
        assert_eq!(
            ErrorClassifier::classify(&ExecutionError::Timeout(30)),
            ErrorKind::Timeout
        );
        assert_eq!(
            ErrorClassifier::classify(&ExecutionError::RateLimited { retry_after: None }),
            ErrorKind::RateLimited
        );
        assert_eq!(
            ErrorClassifier::classify(&ExecutionError::Blocked("ip".into())),
            ErrorKind::SourceBlocked
        );
        assert_eq!(
            ErrorClassifier::classify(&ExecutionError::Internal("oops".into())),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_classify_http_status() {
        let http = |status| ExecutionError::Http {
            status,
            message: String::new(),
        };
        assert_eq!(ErrorClassifier::classify(&http(429)), ErrorKind::RateLimited);
        assert_eq!(ErrorClassifier::classify(&http(403)), ErrorKind::SourceBlocked);
        assert_eq!(ErrorClassifier::classify(&http(504)), ErrorKind::Timeout);
        assert_eq!(ErrorClassifier::classify(&http(502)), ErrorKind::Network);
        assert_eq!(ErrorClassifier::classify(&http(404)), ErrorKind::Unknown);
    }

    #[test]
    fn test_classify_messages() {
        let cases = [
            ("network timeout", ErrorKind::Timeout),
            ("Navigation timed out after 30000 ms", ErrorKind::Timeout),
            ("connect ECONNREFUSED 127.0.0.1:443", ErrorKind::Network),
            ("Please complete the reCAPTCHA", ErrorKind::CaptchaDetected),
            ("HTTP 429 Too Many Requests", ErrorKind::RateLimited),
            ("Access denied for this region", ErrorKind::SourceBlocked),
            ("Selector .job-card not found", ErrorKind::SelectorNotFound),
            ("validation failed: budget is negative", ErrorKind::DataValidation),
            ("something odd happened", ErrorKind::Unknown),
        ];
        for (msg, expected) in cases {
            assert_eq!(ErrorClassifier::classify_message(msg), expected, "{msg}");
        }
    }

    #[test]
    fn test_captcha_wins_over_blocked() {
        assert_eq!(
            ErrorClassifier::classify_message("blocked: captcha required"),
            ErrorKind::CaptchaDetected
        );
    }

    #[test]
    fn test_error_kind_roundtrip() {
        for kind in [
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::CaptchaDetected,
            ErrorKind::RateLimited,
            ErrorKind::SelectorNotFound,
            ErrorKind::DataValidation,
            ErrorKind::SourceBlocked,
            ErrorKind::Unknown,
        ] {
            let parsed: ErrorKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_severity_table() {
        assert_eq!(ErrorKind::Network.severity(), Severity::Medium);
        assert_eq!(ErrorKind::CaptchaDetected.severity(), Severity::Critical);
        assert_eq!(ErrorKind::RateLimited.severity(), Severity::High);
        assert_eq!(ErrorKind::DataValidation.severity(), Severity::Warning);
        assert_eq!(ErrorKind::Unknown.severity(), Severity::Low);
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Warning > Severity::Low);
    }

    #[test]
    fn test_transient_kinds_retry_until_budget() {
        let policy = no_jitter();
        let d1 = policy.decide(ErrorKind::Network, 1, 3);
        assert_eq!(d1.action, RecoveryAction::Retry);
        assert!(d1.delay.is_some());

        let d2 = policy.decide(ErrorKind::Network, 2, 3);
        assert_eq!(d2.action, RecoveryAction::Retry);

        let d3 = policy.decide(ErrorKind::Network, 3, 3);
        assert_eq!(d3.action, RecoveryAction::Skip);
        assert_eq!(d3.delay, None);
    }

    #[test]
    fn test_exhaustion_falls_back_when_enabled() {
        let policy = no_jitter().with_fallback_on_exhaustion(true);
        assert_eq!(
            policy.decide(ErrorKind::Timeout, 3, 3).action,
            RecoveryAction::Fallback
        );
        // Terminal kinds never fall back.
        assert_eq!(
            policy.decide(ErrorKind::CaptchaDetected, 3, 3).action,
            RecoveryAction::Abort
        );
    }

    #[test]
    fn test_terminal_kinds_never_retry() {
        let policy = no_jitter();
        assert_eq!(
            policy.decide(ErrorKind::CaptchaDetected, 1, 5).action,
            RecoveryAction::Abort
        );
        assert_eq!(
            policy.decide(ErrorKind::SourceBlocked, 1, 5).action,
            RecoveryAction::Abort
        );
        assert_eq!(
            policy.decide(ErrorKind::DataValidation, 1, 5).action,
            RecoveryAction::Skip
        );
    }

    #[test]
    fn test_selector_retries_twice_then_skips() {
        let policy = no_jitter();
        assert!(policy.decide(ErrorKind::SelectorNotFound, 1, 10).will_retry());
        assert!(policy.decide(ErrorKind::SelectorNotFound, 2, 10).will_retry());
        assert_eq!(
            policy.decide(ErrorKind::SelectorNotFound, 3, 10).action,
            RecoveryAction::Skip
        );
    }

    #[test]
    fn test_unknown_retries_once_then_skips() {
        let policy = no_jitter();
        assert!(policy.decide(ErrorKind::Unknown, 1, 10).will_retry());
        assert_eq!(
            policy.decide(ErrorKind::Unknown, 2, 10).action,
            RecoveryAction::Skip
        );
    }

    #[test]
    fn test_rate_limit_delay_respects_floor() {
        let policy = no_jitter();
        let decision = policy.decide(ErrorKind::RateLimited, 1, 5);
        assert!(decision.delay.unwrap() >= Duration::from_secs(60));
    }

    #[test]
    fn test_timeout_waits_longer_than_network() {
        let policy = no_jitter();
        let network = policy.delay_for(ErrorKind::Network, 2);
        let timeout = policy.delay_for(ErrorKind::Timeout, 2);
        assert_eq!(timeout, network * 2);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = no_jitter();
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(20), Duration::from_secs(300));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::default().with_jitter(1.5).validate().is_err());
        let mut policy = RetryPolicy::default();
        policy.multiplier = 0.5;
        assert!(policy.validate().is_err());

        let policy = RetryPolicy::default().with_max_delay(Duration::from_secs(u64::MAX));
        assert!(policy.validate().is_err());
        let policy = RetryPolicy::default().with_rate_limit_floor(MAX_RETRY_DELAY * 2);
        assert!(policy.validate().is_err());
        let policy = RetryPolicy::default().with_max_delay(MAX_RETRY_DELAY);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_delay_saturates_at_ceiling() {
        let mut policy = RetryPolicy::default()
            .with_max_delay(MAX_RETRY_DELAY)
            .with_jitter(0.9);
        policy.timeout_factor = 1e300;

        let decision = policy.decide(ErrorKind::Timeout, 70, 100);
        assert_eq!(decision.action, RecoveryAction::Retry);
        assert_eq!(decision.delay, Some(MAX_RETRY_DELAY));

        for attempt in [0, 10, 70, u32::MAX - 1] {
            for kind in [ErrorKind::Network, ErrorKind::RateLimited, ErrorKind::Timeout] {
                assert!(policy.delay_for(kind, attempt) <= MAX_RETRY_DELAY);
            }
        }
    }

    proptest! {
        /// Property: backoff never decreases and never exceeds max_delay.
        #[test]
        fn prop_backoff_monotonic(
            attempt in 0u32..64,
            base_ms in 1u64..5_000,
            multiplier in 1.0f64..4.0,
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                multiplier,
                max_delay: Duration::from_secs(600),
                jitter: 0.0,
                ..Default::default()
            };
            let current = policy.backoff_delay(attempt);
            let next = policy.backoff_delay(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(next <= policy.max_delay);
        }

        /// Property: jittered delays stay within the configured band.
        #[test]
        fn prop_jitter_within_band(
            attempt in 0u32..12,
            jitter in 0.01f64..0.5,
        ) {
            let policy = RetryPolicy::default().with_jitter(jitter);
            let raw = policy.backoff_delay(attempt).as_secs_f64();
            let jittered = policy.jittered(policy.backoff_delay(attempt)).as_secs_f64();
            let tolerance = 1e-6;
            prop_assert!(jittered >= raw * (1.0 - jitter) - tolerance);
            prop_assert!(jittered <= raw * (1.0 + jitter) + tolerance);
        }
    }
}
