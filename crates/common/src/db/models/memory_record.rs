//! Memory record: one user-owned note as the recall engine sees it

use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::FromQueryResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored note. Owned and mutated only by the store; the engine reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Plain-text body
    pub body_text: String,

    pub created_at: DateTime<Utc>,

    /// Embedding, present only if previously computed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

impl MemoryRecord {
    /// Create a record without an embedding
    pub fn new(user_id: Uuid, body_text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            body_text: body_text.into(),
            created_at,
            vector: None,
        }
    }

    /// Attach an embedding
    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }
}

/// Row shape for record queries (`embedding` selected as `::text`)
#[derive(Debug, FromQueryResult)]
pub struct MemoryRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub body_text: String,
    pub created_at: DateTimeWithTimeZone,
    pub embedding: Option<String>,
}

/// Row shape for ranked queries
#[derive(Debug, FromQueryResult)]
pub struct ScoredMemoryRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub body_text: String,
    pub created_at: DateTimeWithTimeZone,
    pub embedding: Option<String>,
    pub score: f64,
}

impl From<MemoryRow> for MemoryRecord {
    fn from(row: MemoryRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            body_text: row.body_text,
            created_at: row.created_at.with_timezone(&Utc),
            vector: row.embedding.as_deref().and_then(parse_vector_literal),
        }
    }
}

impl ScoredMemoryRow {
    /// Split into the record and its raw score
    pub fn into_parts(self) -> (MemoryRecord, f64) {
        let record = MemoryRecord {
            id: self.id,
            user_id: self.user_id,
            body_text: self.body_text,
            created_at: self.created_at.with_timezone(&Utc),
            vector: self.embedding.as_deref().and_then(parse_vector_literal),
        };
        (record, self.score)
    }
}

/// Convert a vector to pgvector's text format "[1,2,3]"
pub fn format_vector_literal(vector: &[f32]) -> String {
    format!(
        "[{}]",
        vector
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

/// Parse pgvector's text format; `None` if any component is malformed
pub fn parse_vector_literal(text: &str) -> Option<Vec<f32>> {
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner
        .split(',')
        .map(|part| part.trim().parse::<f32>().ok())
        .collect()
}
