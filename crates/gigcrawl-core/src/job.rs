use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dedup::DedupReport;
use crate::error::CrawlError;
use crate::health::PlatformHealth;
use crate::models::ScrapedRecord;
use crate::retry::{ErrorKind, RecoveryAction, Severity};

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Dispatch priority. Declaration order is significance order, so the
/// derived `Ord` ranks `Critical` highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Medium => "medium",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(JobPriority::Low),
            "medium" => Ok(JobPriority::Medium),
            "high" => Ok(JobPriority::High),
            "critical" => Ok(JobPriority::Critical),
            _ => Err(format!("Unknown job priority: {}", s)),
        }
    }
}

/// Kind of work a job performs; workers advertise the types they serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Scrape,
    HealthCheck,
    Recovery,
    Cleanup,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::Scrape,
        JobType::HealthCheck,
        JobType::Recovery,
        JobType::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Scrape => "scrape",
            JobType::HealthCheck => "health_check",
            JobType::Recovery => "recovery",
            JobType::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scrape" => Ok(JobType::Scrape),
            "health_check" => Ok(JobType::HealthCheck),
            "recovery" => Ok(JobType::Recovery),
            "cleanup" => Ok(JobType::Cleanup),
            _ => Err(format!("Unknown job type: {}", s)),
        }
    }
}

/// Named operation a recovery job applies to a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryCommand {
    /// Refill the source's token bucket.
    ResetRateLimit,
    /// Forget the source's failure history and lift any block.
    ClearErrors,
    /// Both of the above.
    RestartSource,
}

/// What a cleanup job purges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTarget {
    /// Terminal jobs in the queue.
    Jobs,
    /// Error and session records held by the event sink.
    Logs,
}

/// Typed job payload; the variant determines the [`JobType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Scrape {
        search_term: String,
        max_results: u32,
    },
    HealthCheck {
        /// `None` reports every known source.
        source: Option<String>,
    },
    Recovery {
        source: String,
        command: RecoveryCommand,
    },
    Cleanup {
        target: CleanupTarget,
        older_than_hours: u32,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Scrape { .. } => JobType::Scrape,
            JobPayload::HealthCheck { .. } => JobType::HealthCheck,
            JobPayload::Recovery { .. } => JobType::Recovery,
            JobPayload::Cleanup { .. } => JobType::Cleanup,
        }
    }
}

/// Result of a scrape job: deduplicated records plus the dedup report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeOutput {
    pub records: Vec<ScrapedRecord>,
    pub report: DedupReport,
    /// Records came from the executor's fallback path, not a live scrape.
    pub fallback: bool,
}

/// Typed result stored on a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutput {
    Scrape(ScrapeOutput),
    HealthCheck {
        sources: Vec<PlatformHealth>,
    },
    Recovery {
        source: String,
        command: RecoveryCommand,
    },
    Cleanup {
        target: CleanupTarget,
        removed: u64,
    },
}

/// Classified failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub action: RecoveryAction,
    pub message: String,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

/// A job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub priority: JobPriority,
    /// Data source a scrape job targets; workers filter on it.
    pub source: Option<String>,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest dispatch time; `None` means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last sign of life from the owning worker while processing.
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_error: Option<JobError>,
    pub result: Option<JobOutput>,
}

impl Job {
    /// A fresh pending job for `request`.
    pub fn new(request: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            priority: request.priority,
            source: request.source,
            payload: request.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: request.max_attempts,
            created_at: now,
            updated_at: now,
            scheduled_at: request.scheduled_at,
            claimed_by: None,
            started_at: None,
            completed_at: None,
            last_activity_at: None,
            last_error: None,
            result: None,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// True when the job's schedule allows dispatch at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Wall time between claim and completion, for finished jobs.
    pub fn processing_time(&self) -> Option<Duration> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        (completed - started).to_std().ok()
    }
}

/// Request to create a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub payload: JobPayload,
    pub priority: JobPriority,
    pub source: Option<String>,
    pub max_attempts: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    fn with_payload(payload: JobPayload, source: Option<String>) -> Self {
        Self {
            payload,
            priority: JobPriority::default(),
            source,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            scheduled_at: None,
        }
    }

    pub fn scrape(source: impl Into<String>, search_term: impl Into<String>, max_results: u32) -> Self {
        Self::with_payload(
            JobPayload::Scrape {
                search_term: search_term.into(),
                max_results,
            },
            Some(source.into()),
        )
    }

    pub fn health_check(source: Option<String>) -> Self {
        Self::with_payload(JobPayload::HealthCheck { source }, None)
    }

    pub fn recovery(source: impl Into<String>, command: RecoveryCommand) -> Self {
        Self::with_payload(
            JobPayload::Recovery {
                source: source.into(),
                command,
            },
            None,
        )
        .with_priority(JobPriority::High)
    }

    pub fn cleanup(target: CleanupTarget, older_than_hours: u32) -> Self {
        Self::with_payload(
            JobPayload::Cleanup {
                target,
                older_than_hours,
            },
            None,
        )
        .with_priority(JobPriority::Low)
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    /// Checks the request at the submission boundary.
    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.max_attempts == 0 {
            return Err(CrawlError::InvalidJob("max_attempts must be at least 1".into()));
        }
        if let Some(source) = &self.source
            && source.trim().is_empty()
        {
            return Err(CrawlError::InvalidJob("source must not be empty".into()));
        }

        match &self.payload {
            JobPayload::Scrape {
                search_term,
                max_results,
            } => {
                if self.source.is_none() {
                    return Err(CrawlError::InvalidJob("scrape jobs require a source".into()));
                }
                if search_term.trim().is_empty() {
                    return Err(CrawlError::InvalidJob(
                        "scrape jobs require a search term".into(),
                    ));
                }
                if *max_results == 0 {
                    return Err(CrawlError::InvalidJob("max_results must be at least 1".into()));
                }
            }
            JobPayload::Recovery { source, .. } => {
                if source.trim().is_empty() {
                    return Err(CrawlError::InvalidJob(
                        "recovery jobs require a source".into(),
                    ));
                }
            }
            JobPayload::HealthCheck { .. } | JobPayload::Cleanup { .. } => {}
        }
        Ok(())
    }
}

/// Configuration for a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub max_concurrent_jobs: usize,
    /// Sources this worker may scrape; empty means any source.
    pub sources: HashSet<String>,
    pub capabilities: HashSet<JobType>,
    /// Idle wait between empty claims.
    pub poll_interval: Duration,
    /// How often in-flight jobs report liveness to the queue.
    pub health_check_interval: Duration,
    /// Idle longer than this and the worker is first in line for scale-down.
    pub max_idle_time: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: generate_worker_id(),
            max_concurrent_jobs: 2,
            sources: HashSet::new(),
            capabilities: JobType::ALL.into_iter().collect(),
            poll_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = JobType>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Same settings under a fresh id, for autoscaled workers.
    pub fn fork(&self) -> Self {
        Self {
            worker_id: generate_worker_id(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.worker_id.trim().is_empty() {
            return Err(CrawlError::InvalidConfig("worker_id must not be empty".into()));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(CrawlError::InvalidConfig(format!(
                "worker {}: max_concurrent_jobs must be at least 1",
                self.worker_id
            )));
        }
        if self.capabilities.is_empty() {
            return Err(CrawlError::InvalidConfig(format!(
                "worker {}: at least one capability is required",
                self.worker_id
            )));
        }
        if self.poll_interval.is_zero() || self.health_check_interval.is_zero() {
            return Err(CrawlError::InvalidConfig(format!(
                "worker {}: intervals must be non-zero",
                self.worker_id
            )));
        }
        Ok(())
    }
}

fn generate_worker_id() -> String {
    format!("worker-{}", &Uuid::new_v4().to_string()[..8])
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    /// Mean claim-to-completion time over completed jobs.
    pub average_processing_time: Duration,
    /// completed / (completed + failed); zero before anything finished.
    pub success_rate: f64,
    /// Pending scrape jobs per source, for load accounting.
    pub pending_scrapes_by_source: HashMap<String, usize>,
}
