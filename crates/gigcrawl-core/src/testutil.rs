//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit and integration
//! tests. All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::dedup::DedupReport;
use crate::error::{CrawlError, ExecutionError};
use crate::job::{JobError, JobOutput, ScrapeOutput};
use crate::models::{ErrorRecord, ScrapedRecord, SessionRecord};
use crate::retry::ErrorKind;
use crate::traits::{EventSink, PlatformExecutor};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MockExecutor
// ---------------------------------------------------------------------------

type ExecResult = Result<Vec<ScrapedRecord>, ExecutionError>;

/// Mock executor with scripted responses.
///
/// Each call pops the first scripted response; once the script runs out,
/// calls return an empty record list.
#[derive(Clone, Default)]
pub struct MockExecutor {
    responses: Arc<Mutex<VecDeque<ExecResult>>>,
    fallback: Arc<Mutex<Option<Vec<ScrapedRecord>>>>,
    delay: Arc<Mutex<Option<Duration>>>,
    /// `(source, search_term)` for every `execute` call, in order.
    pub calls: Arc<Mutex<Vec<(String, String)>>>,
    pub fallback_calls: Arc<Mutex<usize>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<ExecResult>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            ..Self::default()
        }
    }

    /// Every call fails with `error`.
    pub fn always_failing(error: ExecutionError) -> Self {
        let executor = Self::default();
        executor.push_repeated(Err(error), 64);
        executor
    }

    pub fn push(&self, response: ExecResult) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn push_repeated(&self, response: ExecResult, times: usize) {
        let mut responses = self.responses.lock().unwrap();
        for _ in 0..times {
            responses.push_back(response.clone());
        }
    }

    pub fn with_fallback(self, records: Vec<ScrapedRecord>) -> Self {
        *self.fallback.lock().unwrap() = Some(records);
        self
    }

    /// Make every call take this long.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl PlatformExecutor for MockExecutor {
    async fn execute(
        &self,
        source: &str,
        search_term: &str,
        _max_results: u32,
    ) -> Result<Vec<ScrapedRecord>, ExecutionError> {
        self.calls
            .lock()
            .unwrap()
            .push((source.to_string(), search_term.to_string()));

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fallback(
        &self,
        _source: &str,
        _search_term: &str,
        _max_results: u32,
    ) -> Result<Vec<ScrapedRecord>, ExecutionError> {
        *self.fallback_calls.lock().unwrap() += 1;
        let fallback = self.fallback.lock().unwrap().clone();
        fallback.ok_or(ExecutionError::FallbackUnsupported)
    }
}

// ---------------------------------------------------------------------------
// MockSink
// ---------------------------------------------------------------------------

/// Mock event sink that keeps every record.
#[derive(Clone, Default)]
pub struct MockSink {
    pub errors: Arc<Mutex<Vec<ErrorRecord>>>,
    pub sessions: Arc<Mutex<Vec<SessionRecord>>>,
    pub purges: Arc<Mutex<Vec<DateTime<Utc>>>>,
    fail: bool,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose writes all fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn check(&self) -> Result<(), CrawlError> {
        if self.fail {
            Err(CrawlError::SinkError("mock sink unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl EventSink for MockSink {
    async fn log_error(&self, record: &ErrorRecord) -> Result<(), CrawlError> {
        self.check()?;
        self.errors.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn log_session(&self, record: &SessionRecord) -> Result<(), CrawlError> {
        self.check()?;
        self.sessions.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<u64, CrawlError> {
        self.check()?;
        self.purges.lock().unwrap().push(cutoff);

        let mut removed = 0;
        let mut errors = self.errors.lock().unwrap();
        let before = errors.len();
        errors.retain(|e| e.occurred_at > cutoff);
        removed += (before - errors.len()) as u64;

        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|s| s.started_at > cutoff);
        removed += (before - sessions.len()) as u64;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock worker reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == label)
            .count()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::Polling { .. } => "Polling",
            WorkerEvent::JobClaimed { .. } => "JobClaimed",
            WorkerEvent::JobCompleted { .. } => "JobCompleted",
            WorkerEvent::JobFailed { .. } => "JobFailed",
            WorkerEvent::ShuttingDown { .. } => "ShuttingDown",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// `count` distinct records for `source`.
pub fn make_records(source: &str, count: usize) -> Vec<ScrapedRecord> {
    (0..count)
        .map(|i| {
            ScrapedRecord::new(format!("Listing {i} for {source}"), "Software", source)
                .with_budget(500.0 * (i as f64 + 1.0))
                .with_source_url(format!("https://{source}.example.com/gigs/{i}"))
        })
        .collect()
}

pub fn job_error(kind: ErrorKind, message: &str, attempt: u32) -> JobError {
    JobError {
        kind,
        severity: kind.severity(),
        action: crate::retry::RecoveryAction::Retry,
        message: message.to_string(),
        attempt,
        occurred_at: Utc::now(),
    }
}

/// Scrape output with an empty dedup report.
pub fn scrape_output(records: Vec<ScrapedRecord>) -> JobOutput {
    let report = DedupReport {
        input_count: records.len(),
        kept_count: records.len(),
        dropped: Vec::new(),
    };
    JobOutput::Scrape(ScrapeOutput {
        records,
        report,
        fallback: false,
    })
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
