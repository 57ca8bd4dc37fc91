//! Store contracts consumed by the recall engine
//!
//! The engine never talks to a database directly. It sees three
//! collaborators, all implemented by [`super::PgMemoryStore`] in production
//! and by [`super::InMemoryStore`] in tests and local mode.

use crate::db::models::MemoryRecord;
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A record paired with a similarity or overlap score in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub score: f32,
}

impl ScoredRecord {
    pub fn new(record: MemoryRecord, score: f32) -> Self {
        Self { record, score }
    }
}

/// Date-scoped and recency reads over a user's records
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Records owned by `owner` with `start <= created_at < end`, newest first
    async fn records_between(
        &self,
        owner: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>>;

    /// The user's most recent records, newest first
    async fn recent_records(&self, owner: Uuid, limit: usize) -> Result<Vec<MemoryRecord>>;
}

/// Nearest-neighbour search delegated to the store
#[async_trait]
pub trait VectorRetrievalClient: Send + Sync {
    /// Records whose similarity to `vector` is at least `min_similarity`,
    /// best first. Failure and zero matches are equivalent for callers.
    async fn search(
        &self,
        vector: &[f32],
        min_similarity: f32,
        max_results: usize,
        owner: Uuid,
    ) -> Result<Vec<ScoredRecord>>;
}

/// Lexical-overlap search delegated to the store
#[async_trait]
pub trait KeywordRetrievalClient: Send + Sync {
    /// Records ranked by overlap with `text`, best first
    async fn search(&self, text: &str, max_results: usize, owner: Uuid)
        -> Result<Vec<ScoredRecord>>;
}
