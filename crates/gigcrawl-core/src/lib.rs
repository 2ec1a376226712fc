//! Job orchestration for a gig-listing scraper.
//!
//! Jobs go into a [`JobQueue`], a pool of workers claims them, runs the
//! scrape through a [`PlatformExecutor`] and reports through an
//! [`EventSink`]. Failures are classified and retried with backoff, sources
//! that misbehave are blocked for a cooling period, and scraped records
//! are deduplicated before they are stored on the job.

pub mod config;
pub mod context;
pub mod dedup;
pub mod error;
pub mod health;
pub mod job;
pub mod job_queue;
pub mod manager;
pub mod memory_queue;
pub mod models;
pub mod orchestrator;
pub mod rate_limit;
pub mod retry;
pub mod testutil;
pub mod traits;
pub mod worker;

pub use config::OrchestratorConfig;
pub use context::CrawlContext;
pub use dedup::{DedupConfig, DedupReport, Deduplicator};
pub use error::{CrawlError, ExecutionError};
pub use health::{HealthConfig, HealthMonitor, HealthStatus, PlatformHealth};
pub use job::{Job, JobPayload, JobPriority, JobStatus, JobType, NewJob, QueueStats, WorkerConfig};
pub use job_queue::JobQueue;
pub use manager::{ScalingConfig, WorkerManager};
pub use memory_queue::MemoryJobQueue;
pub use models::{ErrorRecord, ScrapedRecord, SessionRecord, compute_hash};
pub use orchestrator::Orchestrator;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::{ErrorClassifier, ErrorKind, RecoveryAction, RetryPolicy, Severity};
pub use traits::{EventSink, NullSink, PlatformExecutor, TracingSink};
pub use worker::{TracingWorkerReporter, Worker, WorkerHandle, WorkerReporter};
