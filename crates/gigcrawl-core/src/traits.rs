use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::{CrawlError, ExecutionError};
use crate::models::{ErrorRecord, ScrapedRecord, SessionRecord};

/// Runs a search against one data source and returns the listings found.
///
/// This is the only place that knows how a page is fetched and parsed.
/// Implementations must tolerate being called twice for the same job:
/// the queue redelivers jobs abandoned by a stuck worker.
pub trait PlatformExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        source: &str,
        search_term: &str,
        max_results: u32,
    ) -> impl Future<Output = Result<Vec<ScrapedRecord>, ExecutionError>> + Send;

    /// Records to use when live scraping keeps failing.
    ///
    /// Only called when the retry policy has `fallback_on_exhaustion` set.
    /// The default has no fallback.
    fn fallback(
        &self,
        source: &str,
        search_term: &str,
        max_results: u32,
    ) -> impl Future<Output = Result<Vec<ScrapedRecord>, ExecutionError>> + Send {
        let _ = (source, search_term, max_results);
        async { Err(ExecutionError::FallbackUnsupported) }
    }
}

/// Append-only destination for error and session records.
///
/// Failures here are logged and swallowed by the worker; they never fail
/// the job being reported.
pub trait EventSink: Send + Sync + 'static {
    fn log_error(&self, record: &ErrorRecord) -> impl Future<Output = Result<(), CrawlError>> + Send;

    fn log_session(
        &self,
        record: &SessionRecord,
    ) -> impl Future<Output = Result<(), CrawlError>> + Send;

    /// Drop records older than `cutoff`. Returns how many were removed.
    fn purge(&self, cutoff: DateTime<Utc>) -> impl Future<Output = Result<u64, CrawlError>> + Send;
}

/// A no-op EventSink for use when persistence is not needed.
#[derive(Debug, Clone, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    async fn log_error(&self, _record: &ErrorRecord) -> Result<(), CrawlError> {
        Ok(())
    }

    async fn log_session(&self, _record: &SessionRecord) -> Result<(), CrawlError> {
        Ok(())
    }

    async fn purge(&self, _cutoff: DateTime<Utc>) -> Result<u64, CrawlError> {
        Ok(0)
    }
}

/// EventSink that writes records to the `tracing` log and keeps nothing.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    async fn log_error(&self, record: &ErrorRecord) -> Result<(), CrawlError> {
        tracing::warn!(
            job_id = %record.job_id,
            worker_id = %record.worker_id,
            source = ?record.source,
            kind = %record.kind,
            severity = %record.severity,
            action = %record.action,
            attempt = record.attempt,
            "{}",
            record.message
        );
        Ok(())
    }

    async fn log_session(&self, record: &SessionRecord) -> Result<(), CrawlError> {
        tracing::info!(
            job_id = %record.job_id,
            job_type = %record.job_type,
            source = ?record.source,
            success = record.success,
            found = record.records_found,
            kept = record.records_kept,
            duration_ms = record.duration.as_millis() as u64,
            "Session finished"
        );
        Ok(())
    }

    async fn purge(&self, _cutoff: DateTime<Utc>) -> Result<u64, CrawlError> {
        Ok(0)
    }
}
