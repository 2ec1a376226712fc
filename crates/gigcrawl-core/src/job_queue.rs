use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CrawlError;
use crate::job::{Job, JobError, JobOutput, JobStatus, JobType, NewJob, QueueStats, WorkerConfig};

/// What a worker can take, passed to [`JobQueue::claim_next`].
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub worker_id: &'a str,
    pub capabilities: &'a HashSet<JobType>,
    /// Sources the worker serves; empty means any.
    pub sources: &'a HashSet<String>,
    /// Sources currently blocked by health tracking; scrape jobs for these
    /// are skipped.
    pub blocked_sources: &'a HashSet<String>,
}

impl<'a> ClaimRequest<'a> {
    pub fn for_worker(config: &'a WorkerConfig, blocked_sources: &'a HashSet<String>) -> Self {
        Self {
            worker_id: &config.worker_id,
            capabilities: &config.capabilities,
            sources: &config.sources,
            blocked_sources,
        }
    }

    /// Whether a pending job fits this request (ignoring schedule).
    pub fn accepts(&self, job: &Job) -> bool {
        if !self.capabilities.contains(&job.job_type()) {
            return false;
        }
        let Some(source) = job.source.as_deref() else {
            return true;
        };
        if !self.sources.is_empty() && !self.sources.contains(source) {
            return false;
        }
        !(job.job_type() == JobType::Scrape && self.blocked_sources.contains(source))
    }
}

/// A failed attempt, as reported by the owning worker.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub error: JobError,
    /// When to try again. `None` finalizes the job as failed.
    pub retry_at: Option<DateTime<Utc>>,
}

impl JobFailure {
    pub fn terminal(error: JobError) -> Self {
        Self {
            error,
            retry_at: None,
        }
    }

    pub fn retry_at(error: JobError, at: DateTime<Utc>) -> Self {
        Self {
            error,
            retry_at: Some(at),
        }
    }
}

/// Job storage shared by every worker.
///
/// Implementations must make `claim_next` atomic: two workers racing on
/// the same job must never both get it. An in-process implementation is
/// [`MemoryJobQueue`](crate::memory_queue::MemoryJobQueue); a database
/// implementation would use `SELECT ... FOR UPDATE SKIP LOCKED` or
/// equivalent.
pub trait JobQueue: Send + Sync + 'static {
    fn enqueue(&self, job: NewJob) -> impl Future<Output = Result<Job, CrawlError>> + Send;

    /// Atomically claim the best matching job.
    ///
    /// Returns `None` if nothing is claimable right now.
    fn claim_next(
        &self,
        request: ClaimRequest<'_>,
    ) -> impl Future<Output = Result<Option<Job>, CrawlError>> + Send;

    fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        output: JobOutput,
    ) -> impl Future<Output = Result<Job, CrawlError>> + Send;

    /// Record a failed attempt. The job is rescheduled when the failure
    /// carries a `retry_at` and attempts remain, otherwise it is failed.
    fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        failure: JobFailure,
    ) -> impl Future<Output = Result<Job, CrawlError>> + Send;

    /// Refresh the liveness timestamp of a processing job.
    fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> impl Future<Output = Result<(), CrawlError>> + Send;

    /// Return every job held by a worker to pending (graceful shutdown).
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, CrawlError>> + Send;

    /// Recover processing jobs with no activity for `timeout`.
    fn reap_stale(&self, timeout: Duration) -> impl Future<Output = Result<u64, CrawlError>> + Send;

    /// Remove terminal jobs finished more than `older_than_hours` ago.
    fn cleanup(&self, older_than_hours: u32)
    -> impl Future<Output = Result<u64, CrawlError>> + Send;

    fn get_job(&self, job_id: Uuid) -> impl Future<Output = Result<Option<Job>, CrawlError>> + Send;

    /// Newest first.
    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job>, CrawlError>> + Send;

    fn stats(&self) -> impl Future<Output = Result<QueueStats, CrawlError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_request_filters() {
        let caps: HashSet<JobType> = [JobType::Scrape].into_iter().collect();
        let sources: HashSet<String> = ["alpha".to_string()].into_iter().collect();
        let blocked = HashSet::new();
        let request = ClaimRequest {
            worker_id: "w",
            capabilities: &caps,
            sources: &sources,
            blocked_sources: &blocked,
        };

        assert!(request.accepts(&Job::new(NewJob::scrape("alpha", "rust", 5))));
        assert!(!request.accepts(&Job::new(NewJob::scrape("beta", "rust", 5))));
        assert!(!request.accepts(&Job::new(NewJob::health_check(None))));
    }

    #[test]
    fn test_blocked_source_only_skips_scrapes() {
        let caps: HashSet<JobType> = JobType::ALL.into_iter().collect();
        let any = HashSet::new();
        let blocked: HashSet<String> = ["alpha".to_string()].into_iter().collect();
        let request = ClaimRequest {
            worker_id: "w",
            capabilities: &caps,
            sources: &any,
            blocked_sources: &blocked,
        };

        assert!(!request.accepts(&Job::new(NewJob::scrape("alpha", "rust", 5))));
        let recovery = NewJob::recovery("alpha", crate::job::RecoveryCommand::ClearErrors)
            .with_source("alpha");
        assert!(request.accepts(&Job::new(recovery)));
    }
}
