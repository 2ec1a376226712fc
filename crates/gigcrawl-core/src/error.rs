use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Structural and configuration errors raised by the orchestration core.
///
/// These are never retried: they indicate a caller mistake (unknown job,
/// unregistered worker, bad config) or a lost race on job ownership.
#[derive(Error, Debug)]
pub enum CrawlError {
    /// No job with this id exists (or it was removed by cleanup).
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// No worker with this id is registered with the manager.
    #[error("Worker not registered: {0}")]
    WorkerNotRegistered(String),

    /// A configuration value is missing or out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A job submission failed validation at the API boundary.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// The job is not in the state the operation requires.
    #[error("Job {job_id} is {actual}, expected {expected}")]
    InvalidTransition {
        job_id: Uuid,
        actual: JobStatus,
        expected: JobStatus,
    },

    /// The job is processing but owned by a different worker.
    #[error("Job {job_id} is not owned by worker {worker_id}")]
    NotOwner { job_id: Uuid, worker_id: String },

    /// The event sink rejected a record.
    #[error("Event sink error: {0}")]
    SinkError(String),

    /// A JSON configuration document could not be parsed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Failure reported by a [`PlatformExecutor`](crate::traits::PlatformExecutor).
///
/// Typed variants let executors say exactly what went wrong; anything else
/// goes through [`ExecutionError::Other`] and is classified by inspecting
/// the message.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    /// Connection-level failure (DNS, refused, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Source answered with an unexpected HTTP status.
    #[error("HTTP error (status {status}): {message}")]
    Http { status: u16, message: String },

    /// Source served a captcha challenge instead of content.
    #[error("Captcha challenge detected: {0}")]
    Captcha(String),

    /// Source asked us to slow down.
    #[error("Rate limited by source")]
    RateLimited { retry_after: Option<Duration> },

    /// Page structure changed; an expected element was missing.
    #[error("Selector not found: {0}")]
    SelectorNotFound(String),

    /// Scraped content failed validation.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Source refused access outright.
    #[error("Source blocked: {0}")]
    Blocked(String),

    /// The executor has no fallback path for this source.
    #[error("Fallback not supported by this executor")]
    FallbackUnsupported,

    /// Failure inside the orchestration core while running a handler.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Anything else; classified by message content.
    #[error("{0}")]
    Other(String),
}

impl ExecutionError {
    /// Minimum wait the source asked for, if it said so.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExecutionError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        crate::retry::ErrorClassifier::classify(self).is_transient()
    }
}

impl From<CrawlError> for ExecutionError {
    fn from(err: CrawlError) -> Self {
        ExecutionError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_only_for_rate_limit() {
        let err = ExecutionError::RateLimited {
            retry_after: Some(Duration::from_secs(90)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(90)));
        assert_eq!(ExecutionError::Timeout(30).retry_after(), None);
    }

    #[test]
    fn test_crawl_error_becomes_internal() {
        let err: ExecutionError = CrawlError::SinkError("disk full".into()).into();
        assert!(matches!(err, ExecutionError::Internal(ref m) if m.contains("disk full")));
    }

    #[test]
    fn test_is_retryable() {
        assert!(ExecutionError::Network("reset".into()).is_retryable());
        assert!(ExecutionError::Other("network timeout".into()).is_retryable());
        assert!(!ExecutionError::Captcha("challenge".into()).is_retryable());
        assert!(!ExecutionError::InvalidData("no title".into()).is_retryable());
    }

    #[test]
    fn test_transition_error_message() {
        let id = Uuid::nil();
        let err = CrawlError::InvalidTransition {
            job_id: id,
            actual: JobStatus::Completed,
            expected: JobStatus::Processing,
        };
        assert_eq!(
            err.to_string(),
            format!("Job {id} is completed, expected processing")
        );
    }
}
