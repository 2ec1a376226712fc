//! Near-duplicate collapsing for scraped listings.
//!
//! The same gig is often posted on several boards with small differences in
//! casing, punctuation or budget. Records are grouped by a derived
//! *signature* and one representative per group is kept:
//!
//! 1. higher source reliability rank,
//! 2. longer description,
//! 3. more recent `posted_at`.
//!
//! The first criterion that differs wins; full ties keep the earlier record.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::models::ScrapedRecord;

/// Deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Title tokens (after normalization) that go into the signature.
    pub title_tokens: usize,

    /// Budget bucket width; 1000 puts 1200 and 1300 in the same bucket.
    pub budget_bucket: f64,

    /// Reliability rank per source; higher wins. Unlisted sources rank 0.
    pub source_ranks: HashMap<String, u32>,

    /// Remember kept signatures across batches for this long, so a listing
    /// already delivered from one source is not delivered again from a
    /// lower-ranked one. `None` dedups within a batch only.
    pub memory_ttl: Option<Duration>,

    /// Upper bound on remembered signatures.
    pub memory_capacity: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            title_tokens: 6,
            budget_bucket: 1000.0,
            source_ranks: HashMap::new(),
            memory_ttl: None,
            memory_capacity: 50_000,
        }
    }
}

impl DedupConfig {
    pub fn with_source_rank(mut self, source: impl Into<String>, rank: u32) -> Self {
        self.source_ranks.insert(source.into(), rank);
        self
    }

    pub fn with_memory(mut self, ttl: Duration) -> Self {
        self.memory_ttl = Some(ttl);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.title_tokens == 0 {
            return Err("dedup title_tokens must be at least 1".into());
        }
        if !(self.budget_bucket.is_finite() && self.budget_bucket > 0.0) {
            return Err("dedup budget_bucket must be positive".into());
        }
        Ok(())
    }
}

/// Why a record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Same signature as a better record in this batch.
    SameSignature,
    /// Same listing URL as a better record in this batch.
    SameUrl,
    /// Same signature as a record kept in an earlier batch.
    SeenRecently,
}

/// A dropped record and the record kept in its place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedRecord {
    pub title: String,
    pub source: String,
    pub source_url: Option<String>,
    pub signature: String,
    pub reason: DropReason,
    pub kept_source: String,
    pub kept_title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupReport {
    pub input_count: usize,
    pub kept_count: usize,
    pub dropped: Vec<DroppedRecord>,
}

impl DedupReport {
    pub fn dropped_count(&self) -> usize {
        self.dropped.len()
    }
}

#[derive(Debug, Clone)]
struct SeenRecord {
    source: String,
    title: String,
    rank: u32,
}

/// Collapses near-duplicate records. Cheap to clone; clones share memory.
#[derive(Clone)]
pub struct Deduplicator {
    config: DedupConfig,
    recent: Option<Cache<String, SeenRecord>>,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        let recent = config.memory_ttl.map(|ttl| {
            Cache::builder()
                .max_capacity(config.memory_capacity)
                .time_to_live(ttl)
                .build()
        });
        Self { config, recent }
    }

    pub fn rank(&self, source: &str) -> u32 {
        self.config.source_ranks.get(source).copied().unwrap_or(0)
    }

    /// Grouping key: sorted leading title tokens, budget bucket, category.
    pub fn signature(&self, record: &ScrapedRecord) -> String {
        let mut tokens: Vec<String> = tokenize(&record.title)
            .take(self.config.title_tokens)
            .collect();
        tokens.sort();

        let bucket = record
            .budget
            .filter(|b| b.is_finite() && *b >= 0.0)
            .map(|b| ((b / self.config.budget_bucket).floor() as u64).to_string())
            .unwrap_or_else(|| "-".to_string());

        let category = tokenize(&record.category).collect::<Vec<_>>().join(" ");

        format!("{}|{}|{}", tokens.join(" "), bucket, category)
    }

    /// Ordering of two candidates for the same slot; `Greater` means `a` wins.
    fn compare(&self, a: &ScrapedRecord, b: &ScrapedRecord) -> Ordering {
        self.rank(&a.source)
            .cmp(&self.rank(&b.source))
            .then_with(|| {
                a.description
                    .trim()
                    .chars()
                    .count()
                    .cmp(&b.description.trim().chars().count())
            })
            .then_with(|| a.posted_at.cmp(&b.posted_at))
    }

    /// Collapse duplicates, keeping first-seen order of the survivors.
    pub fn deduplicate(&self, records: Vec<ScrapedRecord>) -> (Vec<ScrapedRecord>, DedupReport) {
        let input_count = records.len();
        let mut report = DedupReport {
            input_count,
            ..Default::default()
        };

        let signatures: Vec<String> = records.iter().map(|r| self.signature(r)).collect();

        // Pass 1: best record per signature.
        let mut by_signature: HashMap<&str, usize> = HashMap::new();
        let mut losers: Vec<(usize, usize, DropReason)> = Vec::new();
        for (idx, signature) in signatures.iter().enumerate() {
            match by_signature.get(signature.as_str()).copied() {
                None => {
                    by_signature.insert(signature, idx);
                }
                Some(current) => {
                    if self.compare(&records[idx], &records[current]) == Ordering::Greater {
                        by_signature.insert(signature, idx);
                        losers.push((current, idx, DropReason::SameSignature));
                    } else {
                        losers.push((idx, current, DropReason::SameSignature));
                    }
                }
            }
        }

        // Pass 2: among survivors, best record per listing URL.
        let mut survivors: Vec<usize> = by_signature.values().copied().collect();
        survivors.sort_unstable();
        let mut by_url: HashMap<String, usize> = HashMap::new();
        for idx in survivors {
            let Some(url) = records[idx].source_url.as_deref().and_then(normalize_url) else {
                continue;
            };
            match by_url.get(&url).copied() {
                None => {
                    by_url.insert(url, idx);
                }
                Some(current) => {
                    if self.compare(&records[idx], &records[current]) == Ordering::Greater {
                        by_url.insert(url, idx);
                        losers.push((current, idx, DropReason::SameUrl));
                    } else {
                        losers.push((idx, current, DropReason::SameUrl));
                    }
                }
            }
        }

        // A record replaced in pass 1 may have been the winner another loser
        // pointed at; resolve every loser to its final survivor.
        let mut beaten_by: HashMap<usize, (usize, DropReason)> = HashMap::new();
        for (loser, winner, reason) in &losers {
            beaten_by.insert(*loser, (*winner, *reason));
        }
        let resolve = |mut idx: usize| {
            let mut hops = 0;
            while let Some((next, _)) = beaten_by.get(&idx) {
                idx = *next;
                hops += 1;
                if hops > input_count {
                    break;
                }
            }
            idx
        };

        let dropped: HashSet<usize> = beaten_by.keys().copied().collect();
        for idx in 0..input_count {
            if let Some((_, reason)) = beaten_by.get(&idx) {
                let kept = &records[resolve(idx)];
                report.dropped.push(drop_entry(&records[idx], &signatures[idx], *reason, kept));
            }
        }

        // Pass 3: cross-batch memory.
        let mut kept = Vec::with_capacity(input_count - dropped.len());
        for (idx, record) in records.into_iter().enumerate() {
            if dropped.contains(&idx) {
                continue;
            }
            if let Some(seen) = self.seen_better(&signatures[idx], &record) {
                report.dropped.push(DroppedRecord {
                    title: record.title.clone(),
                    source: record.source.clone(),
                    source_url: record.source_url.clone(),
                    signature: signatures[idx].clone(),
                    reason: DropReason::SeenRecently,
                    kept_source: seen.source,
                    kept_title: seen.title,
                });
                continue;
            }
            kept.push(record);
        }

        report.kept_count = kept.len();
        if report.dropped_count() > 0 {
            tracing::debug!(
                input = input_count,
                kept = report.kept_count,
                dropped = report.dropped_count(),
                "Collapsed duplicate records"
            );
        }
        (kept, report)
    }

    /// Checks cross-batch memory; remembers `record` if it is not beaten.
    fn seen_better(&self, signature: &str, record: &ScrapedRecord) -> Option<SeenRecord> {
        let cache = self.recent.as_ref()?;
        let rank = self.rank(&record.source);
        if let Some(seen) = cache.get(signature)
            && seen.source != record.source
            && seen.rank >= rank
        {
            return Some(seen);
        }
        cache.insert(
            signature.to_string(),
            SeenRecord {
                source: record.source.clone(),
                title: record.title.clone(),
                rank,
            },
        );
        None
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

fn drop_entry(
    record: &ScrapedRecord,
    signature: &str,
    reason: DropReason,
    kept: &ScrapedRecord,
) -> DroppedRecord {
    DroppedRecord {
        title: record.title.clone(),
        source: record.source.clone(),
        source_url: record.source_url.clone(),
        signature: signature.to_string(),
        reason,
        kept_source: kept.source.clone(),
        kept_title: kept.title.clone(),
    }
}

/// Lowercased alphanumeric words.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Canonical form of a listing URL for equality checks.
///
/// Drops the fragment, tracking parameters and trailing slashes; host case
/// is already normalized by the parser.
fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && k != "ref" && k != "source")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(if path.is_empty() { "/" } else { &path });

    Some(url.to_string())
}
