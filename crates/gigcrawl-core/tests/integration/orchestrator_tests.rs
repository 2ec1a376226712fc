use std::time::Duration;

use gigcrawl_core::dedup::DropReason;
use gigcrawl_core::job::{CleanupTarget, JobOutput, RecoveryCommand};
use gigcrawl_core::testutil::{MockExecutor, MockSink, eventually, make_records};
use gigcrawl_core::{
    DedupConfig, ErrorKind, ExecutionError, HealthStatus, JobStatus, NewJob, OrchestratorConfig,
    RecoveryAction, ScrapedRecord,
};

use crate::integration::common::{fast_config, setup, wait_for_status};

fn react_listing(source: &str, budget: f64) -> ScrapedRecord {
    ScrapedRecord::new("Senior React Developer", "Software", source)
        .with_budget(budget)
        .with_source_url(format!("https://{source}.example.com/gigs/react"))
}

#[tokio::test]
async fn batch_of_scrapes_completes() {
    let executor = MockExecutor::with_responses(vec![
        Ok(make_records("alpha", 2)),
        Ok(make_records("beta", 3)),
        Ok(make_records("gamma", 1)),
    ]);
    let (orch, reporter) = setup(fast_config(), executor.clone(), MockSink::new());

    let jobs = orch
        .add_job_batch(vec![
            NewJob::scrape("alpha", "rust", 10),
            NewJob::scrape("beta", "rust", 10),
            NewJob::scrape("gamma", "rust", 10),
        ])
        .await
        .unwrap();
    orch.start().await.unwrap();

    for job in &jobs {
        wait_for_status(&orch, job.id, JobStatus::Completed).await;
    }

    let mut total_records = 0;
    for job in &jobs {
        match orch.get_job(job.id).await.unwrap().result {
            Some(JobOutput::Scrape(output)) => {
                assert!(!output.fallback);
                total_records += output.records.len();
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert_eq!(total_records, 6);

    let stats = orch.get_stats().await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.success_rate, 1.0);
    assert_eq!(executor.call_count(), 3);

    orch.stop().await;
    assert!(reporter.count("JobCompleted") >= 3);
    assert_eq!(reporter.count("Started"), reporter.count("Stopped"));
}

#[tokio::test]
async fn transient_failure_is_retried_with_backoff() {
    let executor = MockExecutor::with_responses(vec![
        Err(ExecutionError::Timeout(30)),
        Ok(make_records("alpha", 1)),
    ]);
    let sink = MockSink::new();
    let (orch, _) = setup(fast_config(), executor, sink.clone());

    let job = orch
        .add_job(NewJob::scrape("alpha", "rust", 10))
        .await
        .unwrap();
    orch.start().await.unwrap();
    wait_for_status(&orch, job.id, JobStatus::Completed).await;
    orch.stop().await;

    let job = orch.get_job(job.id).await.unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.last_error.unwrap().kind, ErrorKind::Timeout);
    assert_eq!(sink.error_count(), 1);
    assert_eq!(sink.session_count(), 2);

    let health = orch.get_platform_health("alpha").unwrap();
    assert_eq!(health.total_failures, 1);
    assert_eq!(health.total_successes, 1);
    assert_eq!(health.consecutive_failures, 0);
}

#[tokio::test]
async fn captcha_blocks_source_until_recovery() {
    let executor = MockExecutor::with_responses(vec![Err(ExecutionError::Captcha(
        "hcaptcha".into(),
    ))]);
    let (orch, _) = setup(fast_config(), executor, MockSink::new());
    orch.start().await.unwrap();

    let first = orch
        .add_job(NewJob::scrape("alpha", "rust", 10))
        .await
        .unwrap();
    wait_for_status(&orch, first.id, JobStatus::Failed).await;
    let error = orch.get_job(first.id).await.unwrap().last_error.unwrap();
    assert_eq!(error.action, RecoveryAction::Abort);

    let health = orch.get_platform_health("alpha").unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(health.blocked_until.is_some());

    let held = orch
        .add_job(NewJob::scrape("alpha", "rust", 10))
        .await
        .unwrap();
    let other = orch
        .add_job(NewJob::scrape("beta", "rust", 10))
        .await
        .unwrap();
    wait_for_status(&orch, other.id, JobStatus::Completed).await;
    assert_eq!(orch.get_job_status(held.id).await.unwrap(), JobStatus::Pending);

    orch.schedule_high_priority_job(NewJob::recovery("alpha", RecoveryCommand::ClearErrors))
        .await
        .unwrap();
    wait_for_status(&orch, held.id, JobStatus::Completed).await;
    assert_eq!(
        orch.get_platform_health("alpha").unwrap().status,
        HealthStatus::Healthy
    );

    orch.stop().await;
}

#[tokio::test]
async fn cross_source_duplicates_are_dropped() {
    let mut config = fast_config();
    config.dedup = DedupConfig::default()
        .with_source_rank("alpha", 10)
        .with_source_rank("beta", 1)
        .with_memory(Duration::from_secs(60));

    let executor = MockExecutor::with_responses(vec![
        Ok(vec![react_listing("alpha", 1200.0), react_listing("alpha", 1250.0)]),
        Ok(vec![
            react_listing("beta", 1300.0),
            ScrapedRecord::new("Data Pipeline Engineer", "Data", "beta").with_budget(4000.0),
        ]),
    ]);
    let (orch, _) = setup(config, executor, MockSink::new());
    orch.start().await.unwrap();

    let first = orch
        .add_job(NewJob::scrape("alpha", "react", 10))
        .await
        .unwrap();
    wait_for_status(&orch, first.id, JobStatus::Completed).await;
    let second = orch
        .add_job(NewJob::scrape("beta", "react", 10))
        .await
        .unwrap();
    wait_for_status(&orch, second.id, JobStatus::Completed).await;
    orch.stop().await;

    let Some(JobOutput::Scrape(first)) = orch.get_job(first.id).await.unwrap().result else {
        panic!("first job has no scrape output");
    };
    assert_eq!(first.records.len(), 1);
    assert_eq!(first.report.dropped[0].reason, DropReason::SameSignature);

    let Some(JobOutput::Scrape(second)) = orch.get_job(second.id).await.unwrap().result else {
        panic!("second job has no scrape output");
    };
    assert_eq!(second.records.len(), 1);
    assert_eq!(second.records[0].title, "Data Pipeline Engineer");
    assert_eq!(second.report.dropped_count(), 1);
    assert_eq!(second.report.dropped[0].reason, DropReason::SeenRecently);
    assert_eq!(second.report.dropped[0].kept_source, "alpha");
}

#[tokio::test]
async fn pool_scales_with_backlog() {
    let executor = MockExecutor::new().with_delay(Duration::from_millis(150));
    let (orch, _) = setup(fast_config(), executor, MockSink::new());

    let jobs = orch
        .add_job_batch(
            (0..12)
                .map(|i| NewJob::scrape("alpha", format!("term {i}"), 10))
                .collect(),
        )
        .await
        .unwrap();
    orch.start().await.unwrap();

    let orch = &orch;
    let scaled = eventually(Duration::from_secs(5), || async move {
        orch.get_worker_stats().await.len() == 3
    })
    .await;
    assert!(scaled, "pool never reached max_workers");

    let expected = jobs.len();
    let drained = eventually(Duration::from_secs(10), || async move {
        orch.get_stats().await.unwrap().completed == expected
    })
    .await;
    assert!(drained, "backlog was not drained");

    orch.stop().await;
    assert!(orch.get_worker_stats().await.is_empty());
}

#[tokio::test]
async fn stop_returns_in_flight_jobs_to_queue() {
    let executor = MockExecutor::new().with_delay(Duration::from_secs(30));
    let (orch, reporter) = setup(fast_config(), executor, MockSink::new());

    let job = orch
        .add_job(NewJob::scrape("alpha", "slow", 10))
        .await
        .unwrap();
    orch.start().await.unwrap();
    wait_for_status(&orch, job.id, JobStatus::Processing).await;

    let released = orch.stop().await;
    assert_eq!(released, 1);

    let job = orch.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert!(reporter.count("ShuttingDown") >= 1);
}

#[tokio::test]
async fn orchestrator_restarts_after_stop() {
    let (orch, _) = setup(fast_config(), MockExecutor::new(), MockSink::new());
    orch.start().await.unwrap();
    let first = orch
        .add_job(NewJob::scrape("alpha", "rust", 10))
        .await
        .unwrap();
    wait_for_status(&orch, first.id, JobStatus::Completed).await;
    orch.stop().await;
    assert!(orch.get_worker_stats().await.is_empty());

    orch.start().await.unwrap();
    let second = orch
        .add_job(NewJob::scrape("beta", "rust", 10))
        .await
        .unwrap();
    wait_for_status(&orch, second.id, JobStatus::Completed).await;
    assert!(!orch.get_worker_stats().await.is_empty());
    orch.stop().await;
}

#[tokio::test]
async fn registered_workers_respect_source_filter() {
    let mut config = fast_config();
    config.scaling.min_workers = 0;
    let (orch, _) = setup(config, MockExecutor::new(), MockSink::new());

    let worker_id = orch
        .register_worker(
            gigcrawl_core::WorkerConfig::default()
                .with_worker_id("beta-only")
                .with_sources(["beta"])
                .with_poll_interval(Duration::from_millis(10)),
        )
        .await
        .unwrap();
    assert_eq!(worker_id, "beta-only");

    let alpha = orch
        .add_job(NewJob::scrape("alpha", "rust", 10))
        .await
        .unwrap();
    let beta = orch
        .add_job(NewJob::scrape("beta", "rust", 10))
        .await
        .unwrap();
    wait_for_status(&orch, beta.id, JobStatus::Completed).await;
    assert_eq!(orch.get_job_status(alpha.id).await.unwrap(), JobStatus::Pending);

    orch.unregister_worker("beta-only").await.unwrap();
    assert!(orch.unregister_worker("beta-only").await.is_err());
}

#[tokio::test]
async fn cleanup_job_purges_finished_work() {
    let sink = MockSink::new();
    let (orch, _) = setup(fast_config(), MockExecutor::new(), sink.clone());
    orch.start().await.unwrap();

    let scrape = orch
        .add_job(NewJob::scrape("alpha", "rust", 10))
        .await
        .unwrap();
    wait_for_status(&orch, scrape.id, JobStatus::Completed).await;
    assert_eq!(sink.session_count(), 1);

    let cleanup = orch
        .add_job(NewJob::cleanup(CleanupTarget::Jobs, 0))
        .await
        .unwrap();
    wait_for_status(&orch, cleanup.id, JobStatus::Completed).await;
    orch.stop().await;

    assert!(orch.get_job(scrape.id).await.is_err());
    match orch.get_job(cleanup.id).await.unwrap().result {
        Some(JobOutput::Cleanup { removed, .. }) => assert_eq!(removed, 1),
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn config_from_lookup_drives_orchestrator() {
    let config = OrchestratorConfig::from_lookup(|key| match key {
        "GIGCRAWL_MAX_WORKERS" => Some("2".into()),
        "GIGCRAWL_POLL_INTERVAL_MS" => Some("10".into()),
        _ => None,
    })
    .unwrap();
    assert_eq!(config.scaling.max_workers, 2);

    let (orch, _) = setup(config, MockExecutor::new(), MockSink::new());
    assert!(orch.get_health_status().is_empty());
    assert_eq!(orch.manager().config().max_workers, 2);
}
