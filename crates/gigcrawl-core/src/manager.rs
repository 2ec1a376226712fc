//! Worker registry and autoscaler.
//!
//! Every `check_interval` the manager looks at queue load and resizes the
//! pool between `min_workers` and `max_workers`:
//!
//! ```text
//! load = (claimable pending + processing) / max(active, 1)
//! wanted = ceil((claimable pending + processing) / target_jobs_per_worker)
//!
//! load > scale_up_threshold   && active < max  -> min(max, wanted)
//! load < scale_down_threshold && active > min  -> max(min, wanted)
//! ```
//!
//! Pending scrape jobs for blocked sources are not claimable and do not
//! count as load. No action is taken within `cooldown` of the last one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::context::CrawlContext;
use crate::error::CrawlError;
use crate::job::{QueueStats, WorkerConfig};
use crate::job_queue::JobQueue;
use crate::traits::{EventSink, PlatformExecutor};
use crate::worker::{Worker, WorkerHandle, WorkerReporter, WorkerStats};

/// Autoscaling and maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub target_jobs_per_worker: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    /// Minimum time between two scaling actions.
    pub cooldown: Duration,
    pub check_interval: Duration,
    /// Processing jobs silent for this long are reaped.
    pub stale_job_timeout: Duration,
    pub maintenance_interval: Duration,
    /// Finished jobs older than this are removed.
    pub retention_hours: u32,
    /// Grace period for in-flight jobs when a worker stops.
    pub shutdown_timeout: Duration,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 5,
            target_jobs_per_worker: 5,
            scale_up_threshold: 1.0,
            scale_down_threshold: 0.3,
            cooldown: Duration::from_secs(60),
            check_interval: Duration::from_secs(30),
            stale_job_timeout: Duration::from_secs(10 * 60),
            maintenance_interval: Duration::from_secs(60),
            retention_hours: 24,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ScalingConfig {
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_stale_job_timeout(mut self, timeout: Duration) -> Self {
        self.stale_job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.max_workers == 0 || self.min_workers > self.max_workers {
            return Err(CrawlError::InvalidConfig(format!(
                "worker bounds must satisfy 0 <= min <= max, max >= 1 (got {}..{})",
                self.min_workers, self.max_workers
            )));
        }
        if self.target_jobs_per_worker == 0 {
            return Err(CrawlError::InvalidConfig(
                "target_jobs_per_worker must be at least 1".into(),
            ));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(CrawlError::InvalidConfig(
                "scale_down_threshold must be below scale_up_threshold".into(),
            ));
        }
        if self.check_interval.is_zero() || self.maintenance_interval.is_zero() {
            return Err(CrawlError::InvalidConfig(
                "check and maintenance intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Inputs to a scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSnapshot {
    pub claimable_pending: usize,
    pub processing: usize,
    pub active_workers: usize,
}

impl LoadSnapshot {
    /// Derive load from queue stats, leaving out scrapes for blocked sources.
    pub fn from_stats(stats: &QueueStats, blocked: &HashSet<String>, active_workers: usize) -> Self {
        let unclaimable: usize = stats
            .pending_scrapes_by_source
            .iter()
            .filter(|(source, _)| blocked.contains(*source))
            .map(|(_, count)| count)
            .sum();
        Self {
            claimable_pending: stats.pending.saturating_sub(unclaimable),
            processing: stats.processing,
            active_workers,
        }
    }

    pub fn total(&self) -> usize {
        self.claimable_pending + self.processing
    }

    pub fn load(&self) -> f64 {
        self.total() as f64 / self.active_workers.max(1) as f64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingDecision {
    ScaleUp { from: usize, to: usize },
    ScaleDown { from: usize, to: usize },
    Hold(&'static str),
}

/// Pure scaling rule; `since_last_action` is `None` before the first action.
pub fn decide_scaling(
    config: &ScalingConfig,
    snapshot: LoadSnapshot,
    since_last_action: Option<Duration>,
) -> ScalingDecision {
    let active = snapshot.active_workers;
    if active < config.min_workers {
        return ScalingDecision::ScaleUp {
            from: active,
            to: config.min_workers,
        };
    }
    if since_last_action.is_some_and(|elapsed| elapsed < config.cooldown) {
        return ScalingDecision::Hold("cooldown");
    }

    let load = snapshot.load();
    let wanted = snapshot.total().div_ceil(config.target_jobs_per_worker);

    if load > config.scale_up_threshold && active < config.max_workers {
        let to = wanted.min(config.max_workers);
        if to > active {
            return ScalingDecision::ScaleUp { from: active, to };
        }
        return ScalingDecision::Hold("load below one target batch");
    }
    if load < config.scale_down_threshold && active > config.min_workers {
        let to = wanted.max(config.min_workers);
        if to < active {
            return ScalingDecision::ScaleDown { from: active, to };
        }
    }
    ScalingDecision::Hold("load within thresholds")
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub reaped: u64,
    pub cleaned: u64,
}

struct ManagedWorker<Q, E, S> {
    handle: WorkerHandle<Q, E, S>,
    spawned_at: Instant,
}

/// Owns the worker pool and its background loops.
pub struct WorkerManager<Q, E, S> {
    ctx: Arc<CrawlContext<Q, E, S>>,
    config: ScalingConfig,
    template: WorkerConfig,
    reporter: Arc<dyn WorkerReporter>,
    workers: tokio::sync::Mutex<Vec<ManagedWorker<Q, E, S>>>,
    last_scaled: Mutex<Option<Instant>>,
    /// Replaced on every `start` so the manager can be restarted.
    cancel: Mutex<CancellationToken>,
    loops: TaskTracker,
}

impl<Q, E, S> WorkerManager<Q, E, S>
where
    Q: JobQueue,
    E: PlatformExecutor,
    S: EventSink,
{
    /// `template` is forked for every autoscaled worker.
    pub fn new(
        ctx: Arc<CrawlContext<Q, E, S>>,
        config: ScalingConfig,
        template: WorkerConfig,
        reporter: Arc<dyn WorkerReporter>,
    ) -> Result<Self, CrawlError> {
        config.validate()?;
        template.validate()?;
        Ok(Self {
            ctx,
            config,
            template,
            reporter,
            workers: tokio::sync::Mutex::new(Vec::new()),
            last_scaled: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            loops: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    fn spawn_worker(&self, config: WorkerConfig) -> Result<ManagedWorker<Q, E, S>, CrawlError> {
        let worker = Worker::new(config, Arc::clone(&self.ctx), Arc::clone(&self.reporter))?;
        Ok(ManagedWorker {
            handle: worker.spawn(),
            spawned_at: Instant::now(),
        })
    }

    /// Start a worker with an explicit configuration. Returns its id.
    pub async fn register_worker(&self, config: WorkerConfig) -> Result<String, CrawlError> {
        let mut workers = self.workers.lock().await;
        if workers.iter().any(|w| w.handle.id() == config.worker_id) {
            return Err(CrawlError::InvalidConfig(format!(
                "worker {} is already registered",
                config.worker_id
            )));
        }
        let id = config.worker_id.clone();
        workers.push(self.spawn_worker(config)?);
        tracing::info!(worker_id = %id, total = workers.len(), "Worker registered");
        Ok(id)
    }

    /// Stop a worker and drop it from the pool. Returns jobs released.
    pub async fn unregister_worker(&self, worker_id: &str) -> Result<u64, CrawlError> {
        let managed = {
            let mut workers = self.workers.lock().await;
            let index = workers
                .iter()
                .position(|w| w.handle.id() == worker_id)
                .ok_or_else(|| CrawlError::WorkerNotRegistered(worker_id.to_string()))?;
            workers.remove(index)
        };
        let released = managed.handle.stop(self.config.shutdown_timeout).await;
        tracing::info!(%worker_id, released, "Worker unregistered");
        Ok(released)
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers
            .lock()
            .await
            .iter()
            .map(|w| w.handle.stats())
            .collect()
    }

    pub async fn load_snapshot(&self) -> Result<LoadSnapshot, CrawlError> {
        let stats = self.ctx.queue.stats().await?;
        let blocked = self.ctx.health.blocked_sources();
        let active = self.worker_count().await;
        Ok(LoadSnapshot::from_stats(&stats, &blocked, active))
    }

    fn since_last_action(&self) -> Option<Duration> {
        let last = self.last_scaled.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned scaling mutex");
            poisoned.into_inner()
        });
        last.map(|at| at.elapsed())
    }

    fn mark_scaled(&self) {
        let mut last = self.last_scaled.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned scaling mutex");
            poisoned.into_inner()
        });
        *last = Some(Instant::now());
    }

    /// One autoscaling pass.
    pub async fn scale_once(&self) -> Result<ScalingDecision, CrawlError> {
        let snapshot = self.load_snapshot().await?;
        let decision = decide_scaling(&self.config, snapshot, self.since_last_action());

        match decision {
            ScalingDecision::ScaleUp { from, to } => {
                tracing::info!(from, to, load = snapshot.load(), "Scaling up");
                let mut workers = self.workers.lock().await;
                for _ in workers.len()..to {
                    workers.push(self.spawn_worker(self.template.fork())?);
                }
                drop(workers);
                self.mark_scaled();
            }
            ScalingDecision::ScaleDown { from, to } => {
                tracing::info!(from, to, load = snapshot.load(), "Scaling down");
                let victims = self.take_victims(from.saturating_sub(to)).await;
                self.stop_all(victims).await;
                self.mark_scaled();
            }
            ScalingDecision::Hold(reason) => {
                tracing::debug!(reason, load = snapshot.load(), "No scaling action");
            }
        }
        Ok(decision)
    }

    /// Remove `count` workers: long-idle ones first, then the newest.
    async fn take_victims(&self, count: usize) -> Vec<ManagedWorker<Q, E, S>> {
        let mut workers = self.workers.lock().await;
        let mut ranked: Vec<(usize, bool, Instant)> = workers
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let idle = w.handle.stats().idle_for >= w.handle.config().max_idle_time;
                (i, idle, w.spawned_at)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.2.cmp(&a.2)));

        let mut chosen: Vec<usize> = ranked.into_iter().take(count).map(|(i, ..)| i).collect();
        // Remove from the back so earlier indices stay valid.
        chosen.sort_unstable_by(|a, b| b.cmp(a));
        chosen.into_iter().map(|i| workers.remove(i)).collect()
    }

    async fn stop_all(&self, workers: Vec<ManagedWorker<Q, E, S>>) -> u64 {
        let timeout = self.config.shutdown_timeout;
        join_all(workers.into_iter().map(|w| w.handle.stop(timeout)))
            .await
            .into_iter()
            .sum()
    }

    /// Reap stale jobs and purge old finished ones.
    pub async fn maintain_once(&self) -> Result<MaintenanceReport, CrawlError> {
        let reaped = self.ctx.queue.reap_stale(self.config.stale_job_timeout).await?;
        let cleaned = self.ctx.queue.cleanup(self.config.retention_hours).await?;
        if reaped > 0 || cleaned > 0 {
            tracing::info!(reaped, cleaned, "Maintenance pass");
        }
        Ok(MaintenanceReport { reaped, cleaned })
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned cancellation mutex");
            poisoned.into_inner()
        })
    }

    /// Bring the pool up to `min_workers` and start the control and
    /// maintenance loops. Starting a running manager is a no-op; starting a
    /// stopped one runs it again.
    pub async fn start(self: &Arc<Self>) -> Result<(), CrawlError> {
        let cancel = {
            let mut cancel = self.lock_cancel();
            if !cancel.is_cancelled() && !self.loops.is_empty() {
                tracing::debug!("Worker manager already running");
                return Ok(());
            }
            *cancel = CancellationToken::new();
            cancel.clone()
        };
        self.loops.reopen();

        {
            let mut workers = self.workers.lock().await;
            for _ in workers.len()..self.config.min_workers {
                workers.push(self.spawn_worker(self.template.fork())?);
            }
        }

        self.loops.spawn(Arc::clone(self).control_loop(cancel.clone()));
        self.loops.spawn(Arc::clone(self).maintenance_loop(cancel));
        tracing::info!(
            min = self.config.min_workers,
            max = self.config.max_workers,
            "Worker manager started"
        );
        Ok(())
    }

    async fn control_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.reset();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scale_once().await {
                        tracing::error!(error = %e, "Scaling pass failed");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.reset();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.maintain_once().await {
                        tracing::error!(error = %e, "Maintenance pass failed");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }

    /// Stop the loops and every worker. Returns jobs released.
    pub async fn stop(&self) -> u64 {
        self.lock_cancel().cancel();
        self.loops.close();
        self.loops.wait().await;

        let workers = std::mem::take(&mut *self.workers.lock().await);
        let count = workers.len();
        let released = self.stop_all(workers).await;
        tracing::info!(workers = count, released, "Worker manager stopped");
        released
    }
}
