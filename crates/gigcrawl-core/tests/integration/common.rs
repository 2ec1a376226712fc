use std::sync::Arc;
use std::time::Duration;

use gigcrawl_core::manager::ScalingConfig;
use gigcrawl_core::testutil::{MockExecutor, MockReporter, MockSink, eventually};
use gigcrawl_core::{
    JobStatus, MemoryJobQueue, Orchestrator, OrchestratorConfig, RateLimitConfig, RetryPolicy,
    WorkerConfig,
};
use uuid::Uuid;

pub type TestOrchestrator = Orchestrator<MemoryJobQueue, MockExecutor, MockSink>;

/// Configuration with every interval shortened to milliseconds.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryPolicy::default()
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(0.0),
        rate_limit: RateLimitConfig::new(6000, 100),
        scaling: ScalingConfig {
            min_workers: 1,
            max_workers: 3,
            target_jobs_per_worker: 2,
            cooldown: Duration::from_millis(50),
            check_interval: Duration::from_millis(25),
            maintenance_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_millis(200),
            ..ScalingConfig::default()
        },
        worker: WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_max_concurrent_jobs(1),
        ..OrchestratorConfig::default()
    }
}

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An orchestrator over mocks, plus the reporter its workers use.
pub fn setup(
    config: OrchestratorConfig,
    executor: MockExecutor,
    sink: MockSink,
) -> (TestOrchestrator, Arc<MockReporter>) {
    init_tracing();
    let reporter = Arc::new(MockReporter::new());
    let orchestrator = Orchestrator::with_reporter(
        config,
        MemoryJobQueue::new(),
        executor,
        sink,
        reporter.clone(),
    )
    .expect("Failed to build orchestrator");
    (orchestrator, reporter)
}

/// Wait until the job reaches `status`, panicking with its last state if not.
pub async fn wait_for_status(orchestrator: &TestOrchestrator, job_id: Uuid, status: JobStatus) {
    let reached = eventually(Duration::from_secs(5), || async move {
        orchestrator.get_job_status(job_id).await.unwrap() == status
    })
    .await;
    let current = orchestrator.get_job_status(job_id).await.unwrap();
    assert!(reached, "job {job_id} stuck in {current} waiting for {status}");
}
