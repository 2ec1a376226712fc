use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::job::JobType;
use crate::retry::{ErrorKind, RecoveryAction, Severity};

/// A gig listing produced by a platform executor.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScrapedRecord {
    /// Listing id on the source platform, when it exposes one.
    pub external_id: Option<String>,
    pub title: String,
    pub description: String,
    pub budget: Option<f64>,
    pub category: String,
    #[serde(default)]
    pub skills: Vec<String>,
    pub source: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub source_url: Option<String>,
}

impl ScrapedRecord {
    pub fn new(
        title: impl Into<String>,
        category: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            external_id: None,
            title: title.into(),
            description: String::new(),
            budget: None,
            category: category.into(),
            skills: Vec::new(),
            source: source.into(),
            posted_at: None,
            source_url: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_posted_at(mut self, posted_at: DateTime<Utc>) -> Self {
        self.posted_at = Some(posted_at);
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    /// Stable key for idempotent upserts downstream.
    ///
    /// Jobs may run more than once (stale-job recovery), so persistence
    /// should key on this rather than insert blindly.
    pub fn upsert_key(&self) -> String {
        let identity = match (&self.external_id, &self.source_url) {
            (Some(id), _) => format!("{}:id:{}", self.source, id),
            (None, Some(url)) => format!("{}:url:{}", self.source, url),
            (None, None) => format!("{}:title:{}", self.source, self.title.to_lowercase()),
        };
        compute_hash(&identity)
    }
}

/// Error record handed to the event sink for every failed attempt.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorRecord {
    pub job_id: Uuid,
    pub worker_id: String,
    pub job_type: JobType,
    pub source: Option<String>,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub action: RecoveryAction,
    pub message: String,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

/// One attempt at running a job, handed to the event sink.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionRecord {
    pub job_id: Uuid,
    pub worker_id: String,
    pub job_type: JobType,
    pub source: Option<String>,
    pub attempt: u32,
    pub success: bool,
    /// Records returned by the executor before deduplication.
    pub records_found: usize,
    /// Records left after deduplication.
    pub records_kept: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_upsert_key_prefers_external_id() {
        let a = ScrapedRecord::new("Rust dev", "Software", "alpha")
            .with_external_id("123")
            .with_source_url("https://alpha.example/jobs/123");
        let b = ScrapedRecord::new("Rust developer (updated)", "Software", "alpha")
            .with_external_id("123");
        assert_eq!(a.upsert_key(), b.upsert_key());
    }

    #[test]
    fn test_upsert_key_is_scoped_by_source() {
        let a = ScrapedRecord::new("Rust dev", "Software", "alpha").with_external_id("1");
        let b = ScrapedRecord::new("Rust dev", "Software", "beta").with_external_id("1");
        assert_ne!(a.upsert_key(), b.upsert_key());
    }

    #[test]
    fn test_record_deserializes_without_skills() {
        let record: ScrapedRecord = serde_json::from_value(serde_json::json!({
            "external_id": null,
            "title": "Logo design",
            "description": "",
            "budget": 250.0,
            "category": "Design",
            "source": "beta",
            "posted_at": null,
            "source_url": null,
        }))
        .unwrap();
        assert!(record.skills.is_empty());
        assert_eq!(record.budget, Some(250.0));
    }
}
