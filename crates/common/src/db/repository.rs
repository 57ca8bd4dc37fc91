//! Postgres-backed memory store
//!
//! Reads `memory_records` through raw statements: the `embedding` column
//! is a pgvector `vector`, which SeaORM cannot decode natively, so every
//! query selects it as text and parses it back.

use crate::db::models::{format_vector_literal, MemoryRecord, MemoryRow, ScoredMemoryRow};
use crate::db::store::{KeywordRetrievalClient, MemoryStore, ScoredRecord, VectorRetrievalClient};
use crate::db::DbPool;
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, DbBackend, FromQueryResult, Statement, Value};
use tracing::instrument;
use uuid::Uuid;

const RECORD_COLUMNS: &str =
    "id, user_id, body_text, created_at, embedding::text AS embedding";

/// Memory store over Postgres with the pgvector extension
#[derive(Clone)]
pub struct PgMemoryStore {
    pool: DbPool,
}

impl PgMemoryStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    async fn fetch_records(&self, sql: &str, values: Vec<Value>) -> Result<Vec<MemoryRecord>> {
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, values);
        let rows = MemoryRow::find_by_statement(stmt)
            .all(self.read_conn())
            .await?;

        Ok(rows.into_iter().map(MemoryRecord::from).collect())
    }

    async fn fetch_scored(
        &self,
        sql: &str,
        values: Vec<Value>,
        normalize: fn(f64) -> f32,
    ) -> Result<Vec<ScoredRecord>> {
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, values);
        let rows = ScoredMemoryRow::find_by_statement(stmt)
            .all(self.read_conn())
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let (record, raw) = row.into_parts();
                ScoredRecord::new(record, normalize(raw))
            })
            .collect())
    }
}

/// Cosine similarity from pgvector lies in [-1, 1]; relevance is [0, 1]
fn clamp_similarity(raw: f64) -> f32 {
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 1.0) as f32
    }
}

/// `ts_rank_cd` is unbounded above; map it monotonically into [0, 1)
fn squash_rank(raw: f64) -> f32 {
    if raw.is_nan() || raw <= 0.0 {
        0.0
    } else {
        (raw / (1.0 + raw)) as f32
    }
}

#[async_trait]
impl MemoryStore for PgMemoryStore {
    #[instrument(skip(self), level = "debug")]
    async fn records_between(
        &self,
        owner: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM memory_records
            WHERE user_id = $1
              AND created_at >= $2
              AND created_at < $3
            ORDER BY created_at DESC
            LIMIT $4
            "#
        );

        self.fetch_records(
            &sql,
            vec![owner.into(), start.into(), end.into(), (limit as i64).into()],
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn recent_records(&self, owner: Uuid, limit: usize) -> Result<Vec<MemoryRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM memory_records
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        );

        self.fetch_records(&sql, vec![owner.into(), (limit as i64).into()])
            .await
    }
}

#[async_trait]
impl VectorRetrievalClient for PgMemoryStore {
    #[instrument(skip(self, vector), fields(dimension = vector.len()), level = "debug")]
    async fn search(
        &self,
        vector: &[f32],
        min_similarity: f32,
        max_results: usize,
        owner: Uuid,
    ) -> Result<Vec<ScoredRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS},
                   1 - (embedding <=> $1::vector) AS score
            FROM memory_records
            WHERE user_id = $2
              AND embedding IS NOT NULL
              AND 1 - (embedding <=> $1::vector) >= $3
            ORDER BY embedding <=> $1::vector
            LIMIT $4
            "#
        );

        self.fetch_scored(
            &sql,
            vec![
                format_vector_literal(vector).into(),
                owner.into(),
                (min_similarity as f64).into(),
                (max_results as i64).into(),
            ],
            clamp_similarity,
        )
        .await
    }
}

#[async_trait]
impl KeywordRetrievalClient for PgMemoryStore {
    #[instrument(skip(self), level = "debug")]
    async fn search(
        &self,
        text: &str,
        max_results: usize,
        owner: Uuid,
    ) -> Result<Vec<ScoredRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS},
                   ts_rank_cd(to_tsvector('english', body_text),
                              plainto_tsquery('english', $1))::float8 AS score
            FROM memory_records
            WHERE user_id = $2
              AND to_tsvector('english', body_text) @@ plainto_tsquery('english', $1)
            ORDER BY score DESC, created_at DESC
            LIMIT $3
            "#
        );

        self.fetch_scored(
            &sql,
            vec![text.into(), owner.into(), (max_results as i64).into()],
            squash_rank,
        )
        .await
    }
}
