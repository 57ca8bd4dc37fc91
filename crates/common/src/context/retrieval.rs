//! Retrieval Orchestrator - the fallback chain behind every question
//!
//! States run `Start -> Classified -> Retrieved -> Degraded? -> Done`.
//! The primary path is picked by the classifier: a temporal question reads
//! the resolved date window, a semantic one goes through the embedding and
//! vector search. An empty or failed primary path degrades to the user's
//! most recent records. Only a failure of that last read is an error.

use crate::config::RetrievalConfig;
use crate::context::classifier::{Classifier, KeywordClassifier, QueryKind};
use crate::context::temporal::TemporalResolver;
use crate::db::{
    KeywordRetrievalClient, MemoryRecord, MemoryStore, ScoredRecord, VectorRetrievalClient,
};
use crate::embeddings::EmbeddingClient;
use crate::errors::{AppError, Result};
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// An incoming question, scoped to its asker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub text: String,
    pub user_id: Uuid,
}

impl Query {
    pub fn new(text: impl Into<String>, user_id: Uuid) -> Self {
        Self {
            text: text.into(),
            user_id,
        }
    }
}

/// Why a record was retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    Temporal,
    Semantic,
    Keyword,
    RecencyFallback,
}

impl MatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchReason::Temporal => "temporal",
            MatchReason::Semantic => "semantic",
            MatchReason::Keyword => "keyword",
            MatchReason::RecencyFallback => "recency_fallback",
        }
    }
}

/// A record with its relevance in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedRecord {
    pub record: MemoryRecord,
    pub relevance: f32,
    pub reason: MatchReason,
}

impl RetrievedRecord {
    pub fn new(record: MemoryRecord, relevance: f32, reason: MatchReason) -> Self {
        Self {
            record,
            relevance,
            reason,
        }
    }

    fn scored(scored: ScoredRecord, reason: MatchReason) -> Self {
        Self::new(scored.record, scored.score, reason)
    }
}

/// Ranked, de-duplicated, capped retrieval output.
///
/// Relevance never increases along the sequence and ids are unique;
/// [`RetrievalResult::ranked`] enforces both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalResult {
    entries: Vec<RetrievedRecord>,
}

impl RetrievalResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rank candidates by relevance (ties newest first), keep the first
    /// occurrence of each id and truncate to `cap`
    pub fn ranked(candidates: impl IntoIterator<Item = RetrievedRecord>, cap: usize) -> Self {
        let mut candidates: Vec<RetrievedRecord> = candidates
            .into_iter()
            .map(|mut c| {
                c.relevance = if c.relevance.is_nan() {
                    0.0
                } else {
                    c.relevance.clamp(0.0, 1.0)
                };
                c
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.relevance
                .total_cmp(&a.relevance)
                .then_with(|| b.record.created_at.cmp(&a.record.created_at))
        });

        let mut seen = HashSet::new();
        let entries = candidates
            .into_iter()
            .filter(|c| seen.insert(c.record.id))
            .take(cap)
            .collect();

        Self { entries }
    }

    pub fn entries(&self) -> &[RetrievedRecord] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetrievedRecord> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|e| e.record.id).collect()
    }
}

/// How the primary path ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryOutcome {
    Hits,
    Empty,
    Failed,
}

impl PrimaryOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            PrimaryOutcome::Hits => "hits",
            PrimaryOutcome::Empty => "empty",
            PrimaryOutcome::Failed => "error",
        }
    }
}

/// Orchestrator states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalState {
    Start,
    Classified(QueryKind),
    Retrieved(PrimaryOutcome),
    Degraded(PrimaryOutcome),
    Done,
}

impl RetrievalState {
    /// Transition out of `Retrieved`: hits finish, anything else degrades
    pub fn after_primary(outcome: PrimaryOutcome) -> Self {
        match outcome {
            PrimaryOutcome::Hits => RetrievalState::Done,
            other => RetrievalState::Degraded(other),
        }
    }
}

struct Primary {
    path: &'static str,
    outcome: PrimaryOutcome,
    result: RetrievalResult,
}

impl Primary {
    fn from_candidates(
        path: &'static str,
        candidates: Vec<RetrievedRecord>,
        cap: usize,
    ) -> Self {
        let result = RetrievalResult::ranked(candidates, cap);
        let outcome = if result.is_empty() {
            PrimaryOutcome::Empty
        } else {
            PrimaryOutcome::Hits
        };
        Self {
            path,
            outcome,
            result,
        }
    }

    fn failed(path: &'static str) -> Self {
        Self {
            path,
            outcome: PrimaryOutcome::Failed,
            result: RetrievalResult::empty(),
        }
    }
}

/// Sequences classifier, resolver and clients into one ranked result
pub struct RetrievalOrchestrator {
    classifier: Arc<dyn Classifier>,
    resolver: TemporalResolver,
    embeddings: EmbeddingClient,
    store: Arc<dyn MemoryStore>,
    vectors: Arc<dyn VectorRetrievalClient>,
    keywords: Option<Arc<dyn KeywordRetrievalClient>>,
    config: RetrievalConfig,
}

impl RetrievalOrchestrator {
    /// Orchestrator with the keyword classifier and no keyword client
    pub fn new(
        config: RetrievalConfig,
        store: Arc<dyn MemoryStore>,
        vectors: Arc<dyn VectorRetrievalClient>,
        embeddings: EmbeddingClient,
    ) -> Self {
        Self {
            classifier: Arc::new(KeywordClassifier::new()),
            resolver: TemporalResolver::new(config.utc_offset_minutes),
            embeddings,
            store,
            vectors,
            keywords: None,
            config,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Keyword search used when the embedding came back as the sentinel
    pub fn with_keyword_client(mut self, keywords: Arc<dyn KeywordRetrievalClient>) -> Self {
        self.keywords = Some(keywords);
        self
    }

    /// Retrieve context for `query` as of now
    pub async fn retrieve(&self, query: &Query) -> Result<RetrievalResult> {
        self.retrieve_at(query, Utc::now()).await
    }

    /// Retrieve context for `query`, resolving dates against `now`
    #[instrument(skip(self, query), fields(user_id = %query.user_id))]
    pub async fn retrieve_at(&self, query: &Query, now: DateTime<Utc>) -> Result<RetrievalResult> {
        let started = Instant::now();
        let mut state = RetrievalState::Start;
        debug!(?state, "Retrieval started");

        let kind = self.classifier.classify(&query.text);
        metrics::record_query(kind.as_str());
        state = RetrievalState::Classified(kind);
        debug!(?state, "Query classified");

        let primary = match kind {
            QueryKind::Temporal => self.temporal(query, now).await,
            QueryKind::Semantic => self.semantic(query).await,
        };
        metrics::record_retrieval(started.elapsed().as_secs_f64(), primary.path);
        state = RetrievalState::Retrieved(primary.outcome);
        debug!(?state, path = primary.path, hits = primary.result.len(), "Primary path finished");

        state = RetrievalState::after_primary(primary.outcome);
        let result = match state {
            RetrievalState::Degraded(outcome) => {
                debug!(?state, "Falling back to recent records");
                metrics::record_fallback(outcome.as_str());
                let fallback_started = Instant::now();
                let result = self.recency_fallback(query).await?;
                metrics::record_retrieval(fallback_started.elapsed().as_secs_f64(), "fallback");
                result
            }
            _ => primary.result,
        };

        debug!(state = ?RetrievalState::Done, results = result.len(), "Retrieval finished");
        Ok(result)
    }

    async fn temporal(&self, query: &Query, now: DateTime<Utc>) -> Primary {
        let window = self.resolver.resolve(&query.text, now);
        debug!(start = %window.start, end = %window.end, "Resolved temporal window");

        match self
            .store
            .records_between(
                query.user_id,
                window.start,
                window.end,
                self.config.temporal_limit,
            )
            .await
        {
            Ok(records) => {
                let relevance = self.config.temporal_relevance;
                let candidates = records
                    .into_iter()
                    .map(|r| RetrievedRecord::new(r, relevance, MatchReason::Temporal))
                    .collect();
                Primary::from_candidates("temporal", candidates, self.config.result_cap)
            }
            Err(e) => {
                warn!(error = %e, "Temporal window query failed");
                Primary::failed("temporal")
            }
        }
    }

    async fn semantic(&self, query: &Query) -> Primary {
        let vector = self.embeddings.generate(&query.text).await;

        if EmbeddingClient::is_sentinel(&vector) {
            return self.degraded_semantic(query).await;
        }

        match self
            .vectors
            .search(
                &vector,
                self.config.min_similarity,
                self.config.semantic_limit,
                query.user_id,
            )
            .await
        {
            Ok(hits) => {
                let candidates = hits
                    .into_iter()
                    .map(|h| RetrievedRecord::scored(h, MatchReason::Semantic))
                    .collect();
                Primary::from_candidates("semantic", candidates, self.config.result_cap)
            }
            Err(e) => {
                warn!(error = %e, "Vector search failed");
                Primary::failed("semantic")
            }
        }
    }

    /// The sentinel vector ranks nothing; try lexical overlap instead
    async fn degraded_semantic(&self, query: &Query) -> Primary {
        let keywords = match &self.keywords {
            Some(k) if self.config.keyword_on_degraded_embedding => k,
            _ => {
                debug!("Embedding unavailable, skipping vector search");
                return Primary::from_candidates("semantic", Vec::new(), self.config.result_cap);
            }
        };

        match keywords
            .search(&query.text, self.config.semantic_limit, query.user_id)
            .await
        {
            Ok(hits) => {
                let candidates = hits
                    .into_iter()
                    .map(|h| RetrievedRecord::scored(h, MatchReason::Keyword))
                    .collect();
                Primary::from_candidates("keyword", candidates, self.config.result_cap)
            }
            Err(e) => {
                warn!(error = %e, "Keyword search failed");
                Primary::failed("keyword")
            }
        }
    }

    async fn recency_fallback(&self, query: &Query) -> Result<RetrievalResult> {
        let records = self
            .store
            .recent_records(query.user_id, self.config.fallback_limit)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Store unavailable during recency fallback");
                AppError::StoreUnavailable {
                    message: format!("Recent records unavailable: {}", e),
                }
            })?;

        let relevance = self.config.fallback_relevance;
        Ok(RetrievalResult::ranked(
            records
                .into_iter()
                .map(|r| RetrievedRecord::new(r, relevance, MatchReason::RecencyFallback)),
            self.config.result_cap,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FailurePoint, InMemoryStore};
    use crate::embeddings::{Embedder, MockEmbedder};
    use chrono::Duration;
    use tokio_test::{assert_err, assert_ok};

    const DIM: usize = 64;

    fn instant(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn orchestrator(store: &Arc<InMemoryStore>, embedder: MockEmbedder) -> RetrievalOrchestrator {
        RetrievalOrchestrator::new(
            RetrievalConfig::default(),
            store.clone(),
            store.clone(),
            EmbeddingClient::new(Arc::new(embedder)),
        )
    }

    fn record(owner: Uuid, body: &str, at: DateTime<Utc>) -> MemoryRecord {
        MemoryRecord::new(owner, body, at)
    }

    fn assert_ranked(result: &RetrievalResult) {
        for pair in result.entries().windows(2) {
            assert!(pair[0].relevance >= pair[1].relevance);
        }
        let unique: HashSet<Uuid> = result.ids().into_iter().collect();
        assert_eq!(unique.len(), result.len());
    }

    #[tokio::test]
    async fn test_yesterday_returns_window_records_newest_first() {
        let owner = Uuid::new_v4();
        let now = instant("2024-03-14T15:00:00Z");
        let morning = record(owner, "Coffee with Dana", instant("2024-03-13T08:00:00Z"));
        let evening = record(owner, "Finished the report", instant("2024-03-13T21:00:00Z"));
        let store = Arc::new(InMemoryStore::with_records([
            morning.clone(),
            evening.clone(),
            record(owner, "Today's entry", instant("2024-03-14T09:00:00Z")),
            record(owner, "Two days back", instant("2024-03-12T23:59:59Z")),
        ]));

        let result = assert_ok!(
            orchestrator(&store, MockEmbedder::new(DIM))
                .retrieve_at(&Query::new("what did I write yesterday", owner), now)
                .await
        );

        assert_eq!(result.ids(), vec![evening.id, morning.id]);
        for entry in result.iter() {
            assert_eq!(entry.reason, MatchReason::Temporal);
            assert!((entry.relevance - 0.9).abs() < f32::EPSILON);
        }
    }

    #[tokio::test]
    async fn test_semantic_miss_falls_back_to_five_most_recent() {
        let owner = Uuid::new_v4();
        let now = Utc::now();
        let records: Vec<MemoryRecord> = (0..7)
            .map(|i| record(owner, &format!("entry {i}"), now - Duration::hours(i)))
            .collect();
        let store = Arc::new(InMemoryStore::with_records(records.clone()));

        let result = assert_ok!(
            orchestrator(&store, MockEmbedder::new(DIM))
                .retrieve(&Query::new("what have I been feeling about work", owner))
                .await
        );

        let expected: Vec<Uuid> = records.iter().take(5).map(|r| r.id).collect();
        assert_eq!(result.ids(), expected);
        for entry in result.iter() {
            assert_eq!(entry.reason, MatchReason::RecencyFallback);
            assert!((entry.relevance - 0.5).abs() < f32::EPSILON);
        }
    }

    #[tokio::test]
    async fn test_semantic_hits_ranked_by_similarity() {
        let owner = Uuid::new_v4();
        let embedder = MockEmbedder::new(DIM);
        let now = Utc::now();
        let text = "feeling stressed about work deadlines";
        let store = Arc::new(InMemoryStore::with_records([
            record(owner, text, now - Duration::days(3))
                .with_vector(embedder.embed(text).await.unwrap()),
            record(owner, "unrelated", now),
        ]));

        let result = assert_ok!(
            orchestrator(&store, embedder)
                .retrieve(&Query::new(text, owner))
                .await
        );

        assert_eq!(result.len(), 1);
        assert_eq!(result.entries()[0].reason, MatchReason::Semantic);
        assert!(result.entries()[0].relevance > 0.99);
    }

    #[tokio::test]
    async fn test_user_without_records_gets_empty_result() {
        let store = Arc::new(InMemoryStore::with_records([record(
            Uuid::new_v4(),
            "someone else's note",
            Utc::now(),
        )]));

        let result = assert_ok!(
            orchestrator(&store, MockEmbedder::new(DIM))
                .retrieve(&Query::new("anything", Uuid::new_v4()))
                .await
        );
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_window_failure_is_absorbed_by_fallback() {
        let owner = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::with_records([record(
            owner,
            "only entry",
            Utc::now() - Duration::days(30),
        )]));
        store.set_failing(FailurePoint::Window, true);

        let result = assert_ok!(
            orchestrator(&store, MockEmbedder::new(DIM))
                .retrieve(&Query::new("entries from today", owner))
                .await
        );
        assert_eq!(result.len(), 1);
        assert_eq!(result.entries()[0].reason, MatchReason::RecencyFallback);
    }

    #[tokio::test]
    async fn test_empty_window_falls_back_to_recent_records() {
        let owner = Uuid::new_v4();
        let now = instant("2024-03-14T15:00:00Z");
        let records: Vec<MemoryRecord> = (0..7)
            .map(|i| record(owner, &format!("older entry {i}"), now - Duration::days(3 + i)))
            .collect();
        let store = Arc::new(InMemoryStore::with_records(records.clone()));

        let result = assert_ok!(
            orchestrator(&store, MockEmbedder::new(DIM))
                .retrieve_at(&Query::new("what did I do yesterday", owner), now)
                .await
        );

        let expected: Vec<Uuid> = records.iter().take(5).map(|r| r.id).collect();
        assert_eq!(result.ids(), expected);
        for entry in result.iter() {
            assert_eq!(entry.reason, MatchReason::RecencyFallback);
            assert!((entry.relevance - 0.5).abs() < f32::EPSILON);
        }
    }

    #[tokio::test]
    async fn test_fallback_failure_is_store_unavailable() {
        let owner = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::with_records([record(
            owner,
            "entry",
            Utc::now(),
        )]));
        store.set_all_failing(true);

        let err = assert_err!(
            orchestrator(&store, MockEmbedder::new(DIM))
                .retrieve(&Query::new("how was my mood", owner))
                .await
        );
        assert!(matches!(err, AppError::StoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_sentinel_embedding_uses_keyword_search() {
        let owner = Uuid::new_v4();
        let now = Utc::now();
        let budget = record(owner, "Budget meeting ran long", now - Duration::days(10));
        let store = Arc::new(InMemoryStore::with_records([
            budget.clone(),
            record(owner, "Walked our dog", now),
        ]));

        let orchestrator = orchestrator(&store, MockEmbedder::failing(DIM))
            .with_keyword_client(store.clone());
        let result = assert_ok!(
            orchestrator
                .retrieve(&Query::new("notes about the budget meeting", owner))
                .await
        );

        assert_eq!(result.ids(), vec![budget.id]);
        assert_eq!(result.entries()[0].reason, MatchReason::Keyword);
    }

    #[tokio::test]
    async fn test_sentinel_embedding_without_keywords_falls_back() {
        let owner = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::with_records([record(
            owner,
            "Budget meeting ran long",
            Utc::now(),
        )]));

        let result = assert_ok!(
            orchestrator(&store, MockEmbedder::failing(DIM))
                .retrieve(&Query::new("budget meeting", owner))
                .await
        );
        assert_eq!(result.entries()[0].reason, MatchReason::RecencyFallback);
    }

    #[test]
    fn test_ranked_orders_dedups_and_caps() {
        let owner = Uuid::new_v4();
        let now = Utc::now();
        let a = record(owner, "a", now - Duration::hours(2));
        let b = record(owner, "b", now - Duration::hours(1));
        let c = record(owner, "c", now);

        let result = RetrievalResult::ranked(
            [
                RetrievedRecord::new(a.clone(), 0.4, MatchReason::Semantic),
                RetrievedRecord::new(b.clone(), 0.9, MatchReason::Temporal),
                RetrievedRecord::new(a.clone(), 0.8, MatchReason::Keyword),
                RetrievedRecord::new(c.clone(), 0.9, MatchReason::Temporal),
                RetrievedRecord::new(record(owner, "nan", now), f32::NAN, MatchReason::Keyword),
            ],
            3,
        );

        assert_eq!(result.ids(), vec![c.id, b.id, a.id]);
        assert!((result.entries()[2].relevance - 0.8).abs() < f32::EPSILON);
        assert_ranked(&result);
    }

    #[test]
    fn test_ranked_clamps_relevance() {
        let owner = Uuid::new_v4();
        let result = RetrievalResult::ranked(
            [
                RetrievedRecord::new(record(owner, "hi", Utc::now()), 1.7, MatchReason::Keyword),
                RetrievedRecord::new(record(owner, "lo", Utc::now()), -0.2, MatchReason::Keyword),
            ],
            10,
        );
        assert_eq!(result.entries()[0].relevance, 1.0);
        assert_eq!(result.entries()[1].relevance, 0.0);
    }

    #[test]
    fn test_after_primary_transitions() {
        assert_eq!(
            RetrievalState::after_primary(PrimaryOutcome::Hits),
            RetrievalState::Done
        );
        assert_eq!(
            RetrievalState::after_primary(PrimaryOutcome::Empty),
            RetrievalState::Degraded(PrimaryOutcome::Empty)
        );
        assert_eq!(
            RetrievalState::after_primary(PrimaryOutcome::Failed),
            RetrievalState::Degraded(PrimaryOutcome::Failed)
        );
    }

    #[tokio::test]
    async fn test_results_always_ranked_and_unique() {
        let owner = Uuid::new_v4();
        let now = Utc::now();
        let store = Arc::new(InMemoryStore::with_records(
            (0..20).map(|i| record(owner, &format!("day {i} notes"), now - Duration::hours(i * 5))),
        ));
        let orchestrator = orchestrator(&store, MockEmbedder::new(DIM))
            .with_keyword_client(store.clone());

        for question in ["today", "this week", "notes", "recent notes", "past days"] {
            let result = assert_ok!(orchestrator.retrieve(&Query::new(question, owner)).await);
            assert!(!result.is_empty(), "{question}");
            assert!(result.len() <= RetrievalConfig::default().result_cap);
            assert_ranked(&result);
        }
    }
}
