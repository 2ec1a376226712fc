use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::context::CrawlContext;
use crate::error::CrawlError;
use crate::health::PlatformHealth;
use crate::job::{Job, JobPriority, JobStatus, NewJob, QueueStats, WorkerConfig};
use crate::job_queue::JobQueue;
use crate::manager::WorkerManager;
use crate::traits::{EventSink, PlatformExecutor};
use crate::worker::{TracingWorkerReporter, WorkerReporter, WorkerStats};

/// Entry point: job submission, worker lifecycle and observability.
pub struct Orchestrator<Q, E, S> {
    ctx: Arc<CrawlContext<Q, E, S>>,
    manager: Arc<WorkerManager<Q, E, S>>,
}

impl<Q, E, S> Orchestrator<Q, E, S>
where
    Q: JobQueue,
    E: PlatformExecutor,
    S: EventSink,
{
    pub fn new(config: OrchestratorConfig, queue: Q, executor: E, sink: S) -> Result<Self, CrawlError> {
        Self::with_reporter(config, queue, executor, sink, Arc::new(TracingWorkerReporter))
    }

    pub fn with_reporter(
        config: OrchestratorConfig,
        queue: Q,
        executor: E,
        sink: S,
        reporter: Arc<dyn WorkerReporter>,
    ) -> Result<Self, CrawlError> {
        config.validate()?;
        let ctx = Arc::new(CrawlContext::from_config(&config, queue, executor, sink));
        let manager = WorkerManager::new(
            Arc::clone(&ctx),
            config.scaling.clone(),
            config.worker.clone(),
            reporter,
        )?;
        Ok(Self {
            ctx,
            manager: Arc::new(manager),
        })
    }

    pub fn context(&self) -> &Arc<CrawlContext<Q, E, S>> {
        &self.ctx
    }

    pub fn manager(&self) -> &Arc<WorkerManager<Q, E, S>> {
        &self.manager
    }

    pub async fn add_job(&self, job: NewJob) -> Result<Job, CrawlError> {
        self.ctx.queue.enqueue(job).await
    }

    /// Enqueue several jobs. Nothing is enqueued if any job is invalid.
    pub async fn add_job_batch(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>, CrawlError> {
        for (index, job) in jobs.iter().enumerate() {
            job.validate().map_err(|e| match e {
                CrawlError::InvalidJob(msg) => CrawlError::InvalidJob(format!("job {index}: {msg}")),
                other => other,
            })?;
        }

        let mut created = Vec::with_capacity(jobs.len());
        for job in jobs {
            created.push(self.ctx.queue.enqueue(job).await?);
        }
        tracing::info!(count = created.len(), "Job batch enqueued");
        Ok(created)
    }

    /// Enqueue at critical priority, dispatchable immediately.
    pub async fn schedule_high_priority_job(&self, job: NewJob) -> Result<Job, CrawlError> {
        self.add_job(job.with_priority(JobPriority::Critical).scheduled_at(Utc::now()))
            .await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, CrawlError> {
        self.ctx
            .queue
            .get_job(job_id)
            .await?
            .ok_or(CrawlError::JobNotFound(job_id))
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobStatus, CrawlError> {
        Ok(self.get_job(job_id).await?.status)
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, CrawlError> {
        self.ctx.queue.list_jobs(status, limit).await
    }

    pub async fn get_stats(&self) -> Result<QueueStats, CrawlError> {
        self.ctx.queue.stats().await
    }

    pub async fn get_worker_stats(&self) -> Vec<WorkerStats> {
        self.manager.worker_stats().await
    }

    pub fn get_health_status(&self) -> Vec<PlatformHealth> {
        self.ctx.health.snapshot()
    }

    pub fn get_platform_health(&self, source: &str) -> Option<PlatformHealth> {
        self.ctx.health.platform_health(source)
    }

    pub async fn register_worker(&self, config: WorkerConfig) -> Result<String, CrawlError> {
        self.manager.register_worker(config).await
    }

    pub async fn unregister_worker(&self, worker_id: &str) -> Result<u64, CrawlError> {
        self.manager.unregister_worker(worker_id).await
    }

    pub async fn start(&self) -> Result<(), CrawlError> {
        self.manager.start().await
    }

    /// Stop every worker; unfinished jobs go back to pending.
    pub async fn stop(&self) -> u64 {
        self.manager.stop().await
    }
}
