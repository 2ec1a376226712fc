use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::context::CrawlContext;
use crate::error::{CrawlError, ExecutionError};
use crate::job::{
    CleanupTarget, Job, JobError, JobOutput, JobPayload, JobType, RecoveryCommand, ScrapeOutput,
    WorkerConfig,
};
use crate::job_queue::{ClaimRequest, JobFailure, JobQueue};
use crate::models::{ErrorRecord, ScrapedRecord, SessionRecord};
use crate::retry::{ErrorClassifier, ErrorKind, MAX_RETRY_DELAY, RecoveryAction, RetryDecision};
use crate::traits::{EventSink, PlatformExecutor};

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling {
        worker_id: &'a str,
    },
    JobClaimed {
        worker_id: &'a str,
        job: &'a Job,
    },
    JobCompleted {
        worker_id: &'a str,
        job_id: Uuid,
        attempt: u32,
        fallback: bool,
    },
    JobFailed {
        worker_id: &'a str,
        job_id: Uuid,
        kind: ErrorKind,
        action: RecoveryAction,
        error: &'a str,
        will_retry: bool,
    },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling { worker_id } => {
                tracing::trace!(%worker_id, "Polling for jobs");
            }
            WorkerEvent::JobClaimed { worker_id, job } => {
                tracing::info!(
                    %worker_id,
                    job_id = %job.id,
                    job_type = %job.job_type(),
                    source = ?job.source,
                    attempt = job.attempts,
                    "Job claimed"
                );
            }
            WorkerEvent::JobCompleted {
                worker_id,
                job_id,
                attempt,
                fallback,
            } => {
                tracing::info!(%worker_id, %job_id, attempt, fallback, "Job completed");
            }
            WorkerEvent::JobFailed {
                worker_id,
                job_id,
                kind,
                action,
                error,
                will_retry,
            } => {
                tracing::warn!(
                    %worker_id,
                    %job_id,
                    %kind,
                    %action,
                    %error,
                    will_retry,
                    "Job failed"
                );
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub in_flight: usize,
    pub max_concurrent_jobs: usize,
    /// Jobs this worker completed.
    pub completed: u64,
    /// Attempts that ended in failure, retried or not.
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Time since the last job finished; zero while busy.
    pub idle_for: Duration,
}

#[derive(Debug)]
struct Activity {
    at: Option<DateTime<Utc>>,
    since: Instant,
}

/// Claims jobs it is capable of and runs up to `max_concurrent_jobs` of
/// them at once.
pub struct Worker<Q, E, S> {
    config: WorkerConfig,
    ctx: Arc<CrawlContext<Q, E, S>>,
    reporter: Arc<dyn WorkerReporter>,
    slots: Arc<Semaphore>,
    tasks: TaskTracker,
    /// Stops claiming.
    cancel: CancellationToken,
    /// Abandons in-flight jobs once the shutdown grace period is over.
    abort: CancellationToken,
    started_at: DateTime<Utc>,
    activity: Mutex<Activity>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl<Q, E, S> Worker<Q, E, S>
where
    Q: JobQueue,
    E: PlatformExecutor,
    S: EventSink,
{
    pub fn new(
        config: WorkerConfig,
        ctx: Arc<CrawlContext<Q, E, S>>,
        reporter: Arc<dyn WorkerReporter>,
    ) -> Result<Self, CrawlError> {
        config.validate()?;
        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            ctx,
            reporter,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            abort: CancellationToken::new(),
            started_at: Utc::now(),
            activity: Mutex::new(Activity {
                at: None,
                since: Instant::now(),
            }),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start the claim loop on the tokio runtime.
    pub fn spawn(self) -> WorkerHandle<Q, E, S> {
        let worker = Arc::new(self);
        let join = tokio::spawn(Arc::clone(&worker).run());
        WorkerHandle { worker, join }
    }

    pub fn stats(&self) -> WorkerStats {
        let in_flight = self
            .config
            .max_concurrent_jobs
            .saturating_sub(self.slots.available_permits());
        let activity = self.lock_activity();
        WorkerStats {
            worker_id: self.config.worker_id.clone(),
            in_flight,
            max_concurrent_jobs: self.config.max_concurrent_jobs,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            started_at: self.started_at,
            last_activity_at: activity.at,
            idle_for: if in_flight > 0 {
                Duration::ZERO
            } else {
                activity.since.elapsed()
            },
        }
    }

    fn lock_activity(&self) -> std::sync::MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(worker_id = %self.config.worker_id, "Recovered from poisoned activity mutex");
            poisoned.into_inner()
        })
    }

    fn touch(&self) {
        let mut activity = self.lock_activity();
        activity.at = Some(Utc::now());
        activity.since = Instant::now();
    }

    /// Claim loop; runs until the cancellation token fires.
    async fn run(self: Arc<Self>) {
        let worker_id = self.config.worker_id.as_str();
        self.reporter.report(WorkerEvent::Started { worker_id });

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                () = self.cancel.cancelled() => break,
            };

            self.reporter.report(WorkerEvent::Polling { worker_id });

            let blocked = self.ctx.health.blocked_sources();
            let claimed = self
                .ctx
                .queue
                .claim_next(ClaimRequest::for_worker(&self.config, &blocked))
                .await;

            match claimed {
                Ok(Some(job)) => {
                    self.touch();
                    self.reporter.report(WorkerEvent::JobClaimed {
                        worker_id,
                        job: &job,
                    });
                    let worker = Arc::clone(&self);
                    self.tasks.spawn(async move {
                        worker.process_job(job).await;
                        worker.touch();
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = self.cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(%worker_id, error = %e, "Failed to claim job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = self.cancel.cancelled() => break,
                    }
                }
            }
        }
    }

    async fn process_job(&self, job: Job) {
        let started_at = Utc::now();
        let clock = Instant::now();

        let handler = self.handle(&job);
        tokio::pin!(handler);
        let mut heartbeat = tokio::time::interval(self.config.health_check_interval);
        heartbeat.reset();

        let result = loop {
            tokio::select! {
                result = &mut handler => break result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.ctx.queue.heartbeat(job.id, self.id()).await {
                        tracing::warn!(job_id = %job.id, error = %e, "Heartbeat rejected");
                    }
                }
                () = self.abort.cancelled() => {
                    tracing::warn!(job_id = %job.id, worker_id = %self.id(), "Job abandoned at shutdown");
                    return;
                }
            }
        };

        self.log_session(&job, started_at, clock.elapsed(), &result).await;

        match result {
            Ok(output) => self.finish(&job, output, false).await,
            Err(error) => self.handle_failure(&job, error).await,
        }
    }

    /// Run the job's payload.
    async fn handle(&self, job: &Job) -> Result<JobOutput, ExecutionError> {
        match &job.payload {
            JobPayload::Scrape {
                search_term,
                max_results,
            } => {
                let source = job.source.as_deref().ok_or_else(|| {
                    ExecutionError::InvalidData("scrape job has no source".into())
                })?;

                self.ctx.rate_limiter.acquire(source).await;
                let records = self
                    .ctx
                    .executor
                    .execute(source, search_term, *max_results)
                    .await?;
                self.ctx.health.record_success(source);

                Ok(JobOutput::Scrape(self.deduplicate(records, false)))
            }
            JobPayload::HealthCheck { source } => {
                let sources = match source {
                    Some(source) => self.ctx.health.platform_health(source).into_iter().collect(),
                    None => self.ctx.health.snapshot(),
                };
                Ok(JobOutput::HealthCheck { sources })
            }
            JobPayload::Recovery { source, command } => {
                match command {
                    RecoveryCommand::ResetRateLimit => self.ctx.rate_limiter.reset(source).await,
                    RecoveryCommand::ClearErrors => self.ctx.health.reset(source),
                    RecoveryCommand::RestartSource => {
                        self.ctx.rate_limiter.reset(source).await;
                        self.ctx.health.reset(source);
                    }
                }
                Ok(JobOutput::Recovery {
                    source: source.clone(),
                    command: *command,
                })
            }
            JobPayload::Cleanup {
                target,
                older_than_hours,
            } => {
                let removed = match target {
                    CleanupTarget::Jobs => self.ctx.queue.cleanup(*older_than_hours).await?,
                    CleanupTarget::Logs => {
                        let cutoff = Utc::now() - TimeDelta::hours(i64::from(*older_than_hours));
                        self.ctx.sink.purge(cutoff).await?
                    }
                };
                Ok(JobOutput::Cleanup {
                    target: *target,
                    removed,
                })
            }
        }
    }

    fn deduplicate(&self, records: Vec<ScrapedRecord>, fallback: bool) -> ScrapeOutput {
        let (records, report) = self.ctx.deduplicator.deduplicate(records);
        ScrapeOutput {
            records,
            report,
            fallback,
        }
    }

    async fn finish(&self, job: &Job, output: JobOutput, fallback: bool) {
        match self.ctx.queue.complete(job.id, self.id(), output).await {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.reporter.report(WorkerEvent::JobCompleted {
                    worker_id: self.id(),
                    job_id: job.id,
                    attempt: job.attempts,
                    fallback,
                });
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to mark job completed");
            }
        }
    }

    fn decide(&self, job: &Job, error: &ExecutionError) -> RetryDecision {
        let kind = ErrorClassifier::classify(error);
        let mut decision = self
            .ctx
            .retry_policy
            .decide(kind, job.attempts, job.max_attempts);

        // A server-provided wait wins over our own backoff.
        if let (Some(delay), Some(floor)) = (decision.delay, error.retry_after()) {
            decision.delay = Some(delay.max(floor).min(MAX_RETRY_DELAY));
        }
        decision
    }

    async fn handle_failure(&self, job: &Job, error: ExecutionError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let decision = self.decide(job, &error);
        let message = error.to_string();

        let scrape_source = match job.job_type() {
            JobType::Scrape => job.source.as_deref(),
            _ => None,
        };
        if let Some(source) = scrape_source
            && !matches!(error, ExecutionError::Internal(_))
        {
            self.ctx.health.record_failure(source, decision.kind, &message);
            if decision.action == RecoveryAction::Abort {
                self.ctx.health.mark_blocked(source, &message);
            }
        }

        let fallback = match decision.action {
            RecoveryAction::Fallback => self.try_fallback(job).await,
            _ => None,
        };
        let action = match (decision.action, &fallback) {
            (RecoveryAction::Fallback, None) => RecoveryAction::Skip,
            (action, _) => action,
        };

        let now = Utc::now();
        let job_error = JobError {
            kind: decision.kind,
            severity: decision.severity,
            action,
            message: message.clone(),
            attempt: job.attempts,
            occurred_at: now,
        };
        self.log_error(job, &job_error).await;

        self.reporter.report(WorkerEvent::JobFailed {
            worker_id: self.id(),
            job_id: job.id,
            kind: decision.kind,
            action,
            error: &message,
            will_retry: decision.will_retry(),
        });

        if let Some(output) = fallback {
            self.finish(job, output, true).await;
            return;
        }

        let retry_at = decision.delay.map(|delay| {
            TimeDelta::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        let failure = JobFailure {
            error: job_error,
            retry_at,
        };

        if let Err(e) = self.ctx.queue.fail(job.id, self.id(), failure).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
        }
    }

    /// Ask the executor for fallback records after retries ran out.
    async fn try_fallback(&self, job: &Job) -> Option<JobOutput> {
        let JobPayload::Scrape {
            search_term,
            max_results,
        } = &job.payload
        else {
            return None;
        };
        let source = job.source.as_deref()?;

        match self
            .ctx
            .executor
            .fallback(source, search_term, *max_results)
            .await
        {
            Ok(records) => {
                tracing::info!(job_id = %job.id, %source, count = records.len(), "Using fallback records");
                Some(JobOutput::Scrape(self.deduplicate(records, true)))
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, %source, error = %e, "Fallback unavailable");
                None
            }
        }
    }

    async fn log_session(
        &self,
        job: &Job,
        started_at: DateTime<Utc>,
        duration: Duration,
        result: &Result<JobOutput, ExecutionError>,
    ) {
        let (records_found, records_kept) = match result {
            Ok(JobOutput::Scrape(output)) => (output.report.input_count, output.records.len()),
            _ => (0, 0),
        };
        let record = SessionRecord {
            job_id: job.id,
            worker_id: self.config.worker_id.clone(),
            job_type: job.job_type(),
            source: job.source.clone(),
            attempt: job.attempts,
            success: result.is_ok(),
            records_found,
            records_kept,
            error: result.as_ref().err().map(ToString::to_string),
            started_at,
            duration,
        };
        if let Err(e) = self.ctx.sink.log_session(&record).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to log session");
        }
    }

    async fn log_error(&self, job: &Job, error: &JobError) {
        let record = ErrorRecord {
            job_id: job.id,
            worker_id: self.config.worker_id.clone(),
            job_type: job.job_type(),
            source: job.source.clone(),
            kind: error.kind,
            severity: error.severity,
            action: error.action,
            message: error.message.clone(),
            attempt: error.attempt,
            occurred_at: error.occurred_at,
        };
        if let Err(e) = self.ctx.sink.log_error(&record).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to log error");
        }
    }
}

/// A running worker.
pub struct WorkerHandle<Q, E, S> {
    worker: Arc<Worker<Q, E, S>>,
    join: JoinHandle<()>,
}

impl<Q, E, S> WorkerHandle<Q, E, S>
where
    Q: JobQueue,
    E: PlatformExecutor,
    S: EventSink,
{
    pub fn id(&self) -> &str {
        self.worker.id()
    }

    pub fn config(&self) -> &WorkerConfig {
        self.worker.config()
    }

    pub fn stats(&self) -> WorkerStats {
        self.worker.stats()
    }

    /// Stop claiming, give in-flight jobs `timeout` to finish, then hand
    /// whatever is left back to the queue. Returns the number released.
    pub async fn stop(self, timeout: Duration) -> u64 {
        let worker = self.worker;
        let worker_id = worker.id();

        worker.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::error!(%worker_id, error = %e, "Worker loop panicked");
        }

        worker.tasks.close();
        let drained = tokio::time::timeout(timeout, worker.tasks.wait())
            .await
            .is_ok();

        let mut released = 0;
        if !drained {
            worker.abort.cancel();
            worker.tasks.wait().await;
            released = match worker.ctx.queue.release_worker_jobs(worker_id).await {
                Ok(count) => count,
                Err(e) => {
                    tracing::error!(%worker_id, error = %e, "Failed to release jobs");
                    0
                }
            };
        }

        worker.reporter.report(WorkerEvent::ShuttingDown {
            worker_id,
            jobs_released: released,
        });
        worker.reporter.report(WorkerEvent::Stopped { worker_id });
        released
    }
}
