//! In-process memory store
//!
//! Implements every store contract over a plain list. Backs the
//! `database.backend = "memory"` mode and the engine's tests, and can be
//! told to fail at individual read paths.

use crate::db::models::MemoryRecord;
use crate::db::store::{KeywordRetrievalClient, MemoryStore, ScoredRecord, VectorRetrievalClient};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex_lite::Regex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, RwLock};
use uuid::Uuid;

/// Read path that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    Window,
    Recent,
    Vector,
    Keyword,
}

#[derive(Debug, Default)]
struct Failures {
    window: AtomicBool,
    recent: AtomicBool,
    vector: AtomicBool,
    keyword: AtomicBool,
}

impl Failures {
    fn flag(&self, point: FailurePoint) -> &AtomicBool {
        match point {
            FailurePoint::Window => &self.window,
            FailurePoint::Recent => &self.recent,
            FailurePoint::Vector => &self.vector,
            FailurePoint::Keyword => &self.keyword,
        }
    }

    fn check(&self, point: FailurePoint) -> Result<()> {
        if self.flag(point).load(Ordering::SeqCst) {
            return Err(AppError::DatabaseConnection {
                message: format!("in-memory store: {:?} read unavailable", point),
            });
        }
        Ok(())
    }
}

/// Memory store held entirely in process
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<Vec<MemoryRecord>>,
    failures: Failures,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with records
    pub fn with_records(records: impl IntoIterator<Item = MemoryRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Add a record
    pub fn insert(&self, record: MemoryRecord) {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }

    /// Number of records across all users
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make one read path fail (or recover)
    pub fn set_failing(&self, point: FailurePoint, failing: bool) {
        self.failures.flag(point).store(failing, Ordering::SeqCst);
    }

    /// Make every read path fail (or recover)
    pub fn set_all_failing(&self, failing: bool) {
        for point in [
            FailurePoint::Window,
            FailurePoint::Recent,
            FailurePoint::Vector,
            FailurePoint::Keyword,
        ] {
            self.set_failing(point, failing);
        }
    }

    fn snapshot(&self) -> Vec<MemoryRecord> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn owned_by(&self, owner: Uuid) -> Vec<MemoryRecord> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.user_id == owner)
            .collect()
    }
}

fn newest_first(records: &mut [MemoryRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

fn best_first(scored: &mut [ScoredRecord]) {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.record.created_at.cmp(&a.record.created_at))
    });
}

/// Cosine similarity; zero when either vector has no magnitude
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[A-Za-z0-9']+").expect("token pattern is valid"))
}

/// Lower-cased terms of three or more characters
fn terms(text: &str) -> HashSet<String> {
    token_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| t.len() >= 3)
        .collect()
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn records_between(
        &self,
        owner: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        self.failures.check(FailurePoint::Window)?;

        let mut records: Vec<MemoryRecord> = self
            .owned_by(owner)
            .into_iter()
            .filter(|r| r.created_at >= start && r.created_at < end)
            .collect();
        newest_first(&mut records);
        records.truncate(limit);
        Ok(records)
    }

    async fn recent_records(&self, owner: Uuid, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.failures.check(FailurePoint::Recent)?;

        let mut records = self.owned_by(owner);
        newest_first(&mut records);
        records.truncate(limit);
        Ok(records)
    }
}

#[async_trait]
impl VectorRetrievalClient for InMemoryStore {
    async fn search(
        &self,
        vector: &[f32],
        min_similarity: f32,
        max_results: usize,
        owner: Uuid,
    ) -> Result<Vec<ScoredRecord>> {
        self.failures.check(FailurePoint::Vector)?;

        let mut scored: Vec<ScoredRecord> = self
            .owned_by(owner)
            .into_iter()
            .filter_map(|record| {
                let similarity = cosine_similarity(vector, record.vector.as_deref()?);
                (similarity >= min_similarity && similarity > 0.0)
                    .then(|| ScoredRecord::new(record, similarity.min(1.0)))
            })
            .collect();
        best_first(&mut scored);
        scored.truncate(max_results);
        Ok(scored)
    }
}

#[async_trait]
impl KeywordRetrievalClient for InMemoryStore {
    async fn search(
        &self,
        text: &str,
        max_results: usize,
        owner: Uuid,
    ) -> Result<Vec<ScoredRecord>> {
        self.failures.check(FailurePoint::Keyword)?;

        let query_terms = terms(text);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<ScoredRecord> = self
            .owned_by(owner)
            .into_iter()
            .filter_map(|record| {
                let overlap = terms(&record.body_text).intersection(&query_terms).count();
                (overlap > 0).then(|| {
                    let score = overlap as f32 / query_terms.len() as f32;
                    ScoredRecord::new(record, score)
                })
            })
            .collect();
        best_first(&mut scored);
        scored.truncate(max_results);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(hours_ago: i64) -> DateTime<Utc> {
        Utc::now() - Duration::hours(hours_ago)
    }

    #[tokio::test]
    async fn test_recent_records_are_newest_first_and_scoped() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let store = InMemoryStore::with_records([
            MemoryRecord::new(alice, "oldest", at(30)),
            MemoryRecord::new(alice, "newest", at(1)),
            MemoryRecord::new(bob, "not mine", at(0)),
            MemoryRecord::new(alice, "middle", at(10)),
        ]);

        let records = store.recent_records(alice, 2).await.unwrap();
        let bodies: Vec<_> = records.iter().map(|r| r.body_text.as_str()).collect();
        assert_eq!(bodies, vec!["newest", "middle"]);
    }

    #[tokio::test]
    async fn test_window_end_is_exclusive() {
        let owner = Uuid::new_v4();
        let end = Utc::now();
        let start = end - Duration::days(1);
        let store = InMemoryStore::with_records([
            MemoryRecord::new(owner, "at start", start),
            MemoryRecord::new(owner, "at end", end),
        ]);

        let records = store.records_between(owner, start, end, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body_text, "at start");
    }

    #[tokio::test]
    async fn test_vector_search_threshold_and_zero_vector() {
        let owner = Uuid::new_v4();
        let store = InMemoryStore::with_records([
            MemoryRecord::new(owner, "close", at(2)).with_vector(vec![1.0, 0.1]),
            MemoryRecord::new(owner, "far", at(1)).with_vector(vec![0.0, 1.0]),
            MemoryRecord::new(owner, "unembedded", at(0)),
        ]);

        let hits = VectorRetrievalClient::search(&store, &[1.0, 0.0], 0.5, 5, owner)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.body_text, "close");

        let none = VectorRetrievalClient::search(&store, &[0.0, 0.0], 0.0, 5, owner)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_keyword_search_ranks_by_overlap() {
        let owner = Uuid::new_v4();
        let store = InMemoryStore::with_records([
            MemoryRecord::new(owner, "Long meeting about the budget", at(3)),
            MemoryRecord::new(owner, "Budget review meeting went well", at(2)),
            MemoryRecord::new(owner, "Went hiking", at(1)),
        ]);

        let hits = KeywordRetrievalClient::search(&store, "budget review meeting", 5, owner)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.body_text, "Budget review meeting went well");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!(hits[1].score < hits[0].score);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let owner = Uuid::new_v4();
        let store = InMemoryStore::with_records([MemoryRecord::new(owner, "entry", at(1))]);

        store.set_failing(FailurePoint::Recent, true);
        assert!(store.recent_records(owner, 5).await.is_err());

        store.set_failing(FailurePoint::Recent, false);
        assert_eq!(store.recent_records(owner, 5).await.unwrap().len(), 1);
    }
}
