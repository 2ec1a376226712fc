//! In-process [`JobQueue`] backed by a single mutex over the job table.
//!
//! Every operation takes the lock once and never awaits while holding it,
//! so claims are linearizable: concurrent workers never observe the same
//! pending job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::CrawlError;
use crate::job::{Job, JobError, JobOutput, JobStatus, JobType, NewJob, QueueStats};
use crate::job_queue::{ClaimRequest, JobFailure, JobQueue};
use crate::retry::{ErrorKind, RecoveryAction};

#[derive(Debug)]
struct Entry {
    /// Insertion order, for FIFO within a priority.
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<Uuid, Entry>,
    next_seq: u64,
}

impl QueueState {
    /// Retrying jobs whose backoff elapsed become pending again.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        for entry in self.jobs.values_mut() {
            let job = &mut entry.job;
            if job.status == JobStatus::Retrying && job.is_due(now) {
                job.status = JobStatus::Pending;
                job.updated_at = now;
            }
        }
    }

    /// The job, if it is processing and owned by `worker_id`.
    fn owned(&mut self, job_id: Uuid, worker_id: &str) -> Result<&mut Job, CrawlError> {
        let job = &mut self
            .jobs
            .get_mut(&job_id)
            .ok_or(CrawlError::JobNotFound(job_id))?
            .job;

        if job.status != JobStatus::Processing {
            return Err(CrawlError::InvalidTransition {
                job_id,
                actual: job.status,
                expected: JobStatus::Processing,
            });
        }
        if job.claimed_by.as_deref() != Some(worker_id) {
            return Err(CrawlError::NotOwner {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(job)
    }
}

/// Shared in-memory job queue. Clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job queue mutex");
            poisoned.into_inner()
        })
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn hours_ago(now: DateTime<Utc>, hours: u32) -> DateTime<Utc> {
    now - TimeDelta::hours(i64::from(hours))
}

impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, request: NewJob) -> Result<Job, CrawlError> {
        request.validate()?;
        let job = Job::new(request);

        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            job.id,
            Entry {
                seq,
                job: job.clone(),
            },
        );

        tracing::debug!(
            job_id = %job.id,
            job_type = %job.job_type(),
            priority = %job.priority,
            source = ?job.source,
            "Job enqueued"
        );
        Ok(job)
    }

    async fn claim_next(&self, request: ClaimRequest<'_>) -> Result<Option<Job>, CrawlError> {
        let now = Utc::now();
        let mut state = self.lock();
        state.promote_due(now);

        let best = state
            .jobs
            .values()
            .filter(|e| {
                e.job.status == JobStatus::Pending && e.job.is_due(now) && request.accepts(&e.job)
            })
            // Highest priority, then lowest sequence number.
            .max_by(|a, b| {
                a.job
                    .priority
                    .cmp(&b.job.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|e| e.job.id);

        let Some(job_id) = best else {
            return Ok(None);
        };
        let Some(entry) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        let job = &mut entry.job;
        job.status = JobStatus::Processing;
        job.claimed_by = Some(request.worker_id.to_string());
        job.started_at = Some(now);
        job.last_activity_at = Some(now);
        job.updated_at = now;
        job.attempts += 1;

        tracing::debug!(
            job_id = %job.id,
            worker_id = %request.worker_id,
            attempt = job.attempts,
            "Job claimed"
        );
        Ok(Some(job.clone()))
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        output: JobOutput,
    ) -> Result<Job, CrawlError> {
        let now = Utc::now();
        let mut state = self.lock();
        let job = state.owned(job_id, worker_id)?;

        job.status = JobStatus::Completed;
        job.claimed_by = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        job.last_error = None;
        job.result = Some(output);
        Ok(job.clone())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        failure: JobFailure,
    ) -> Result<Job, CrawlError> {
        let now = Utc::now();
        let mut state = self.lock();
        let job = state.owned(job_id, worker_id)?;

        job.claimed_by = None;
        job.updated_at = now;
        job.last_error = Some(failure.error);

        match failure.retry_at {
            Some(at) if job.can_retry() => {
                job.status = JobStatus::Retrying;
                job.scheduled_at = Some(at);
            }
            _ => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
            }
        }
        Ok(job.clone())
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<(), CrawlError> {
        let now = Utc::now();
        let mut state = self.lock();
        let job = state.owned(job_id, worker_id)?;
        job.last_activity_at = Some(now);
        Ok(())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, CrawlError> {
        let now = Utc::now();
        let mut state = self.lock();
        let mut released = 0;

        for entry in state.jobs.values_mut() {
            let job = &mut entry.job;
            if job.status == JobStatus::Processing && job.claimed_by.as_deref() == Some(worker_id)
            {
                job.status = JobStatus::Pending;
                job.claimed_by = None;
                job.started_at = None;
                job.last_activity_at = None;
                job.updated_at = now;
                // The attempt never ran to an outcome.
                job.attempts = job.attempts.saturating_sub(1);
                released += 1;
            }
        }

        if released > 0 {
            tracing::info!(%worker_id, released, "Released worker jobs");
        }
        Ok(released)
    }

    async fn reap_stale(&self, timeout: Duration) -> Result<u64, CrawlError> {
        let now = Utc::now();
        let Ok(timeout) = TimeDelta::from_std(timeout) else {
            return Ok(0);
        };
        let cutoff = now - timeout;

        let mut state = self.lock();
        let mut reaped = 0;

        for entry in state.jobs.values_mut() {
            let job = &mut entry.job;
            if job.status != JobStatus::Processing {
                continue;
            }
            let last_seen = job.last_activity_at.or(job.started_at).unwrap_or(job.updated_at);
            if last_seen >= cutoff {
                continue;
            }

            let worker = job.claimed_by.take();
            job.updated_at = now;
            reaped += 1;

            if !job.can_retry() {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.last_error = Some(JobError {
                    kind: ErrorKind::Timeout,
                    severity: ErrorKind::Timeout.severity(),
                    action: RecoveryAction::Skip,
                    message: format!(
                        "No activity from worker {} for {}s",
                        worker.as_deref().unwrap_or("?"),
                        timeout.num_seconds()
                    ),
                    attempt: job.attempts,
                    occurred_at: now,
                });
                tracing::warn!(job_id = %job.id, worker_id = ?worker, "Stale job failed, no attempts left");
            } else {
                job.status = JobStatus::Pending;
                job.last_activity_at = None;
                tracing::warn!(job_id = %job.id, worker_id = ?worker, "Stale job returned to queue");
            }
        }
        Ok(reaped)
    }

    async fn cleanup(&self, older_than_hours: u32) -> Result<u64, CrawlError> {
        let cutoff = hours_ago(Utc::now(), older_than_hours);
        let mut state = self.lock();
        let before = state.jobs.len();

        state.jobs.retain(|_, entry| {
            let job = &entry.job;
            !(job.status.is_terminal() && job.completed_at.is_some_and(|at| at <= cutoff))
        });

        let removed = (before - state.jobs.len()) as u64;
        if removed > 0 {
            tracing::info!(removed, older_than_hours, "Cleaned up finished jobs");
        }
        Ok(removed)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, CrawlError> {
        let mut state = self.lock();
        state.promote_due(Utc::now());
        Ok(state.jobs.get(&job_id).map(|e| e.job.clone()))
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, CrawlError> {
        let mut state = self.lock();
        state.promote_due(Utc::now());

        let mut entries: Vec<&Entry> = state
            .jobs
            .values()
            .filter(|e| status.is_none_or(|s| e.job.status == s))
            .collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(entries.into_iter().take(limit).map(|e| e.job.clone()).collect())
    }

    async fn stats(&self) -> Result<QueueStats, CrawlError> {
        let mut state = self.lock();
        state.promote_due(Utc::now());

        let mut stats = QueueStats {
            total: state.jobs.len(),
            ..Default::default()
        };
        let mut processing_total = Duration::ZERO;
        let mut timed = 0u32;

        for Entry { job, .. } in state.jobs.values() {
            match job.status {
                JobStatus::Pending => {
                    stats.pending += 1;
                    if job.job_type() == JobType::Scrape
                        && let Some(source) = &job.source
                    {
                        *stats
                            .pending_scrapes_by_source
                            .entry(source.clone())
                            .or_default() += 1;
                    }
                }
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Retrying => stats.retrying += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    if let Some(elapsed) = job.processing_time() {
                        processing_total += elapsed;
                        timed += 1;
                    }
                }
                JobStatus::Failed => stats.failed += 1,
            }
        }

        if timed > 0 {
            stats.average_processing_time = processing_total / timed;
        }
        let finished = stats.completed + stats.failed;
        if finished > 0 {
            stats.success_rate = stats.completed as f64 / finished as f64;
        }
        Ok(stats)
    }
}
