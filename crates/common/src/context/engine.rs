//! Recall engine facade
//!
//! question -> retrieval -> context -> prompt -> completion, either as one
//! answer or as a framed stream. Everything that can fail terminally
//! (the recency fallback, opening the completion) happens before the first
//! frame exists, so a stream is never started only to report an error.

use crate::config::ContextConfig;
use crate::context::assembler::ContextAssembler;
use crate::context::completion::{build_prompt, CompletionService, Prompt};
use crate::context::frames::SourceSummary;
use crate::context::multiplexer::SourceMultiplexer;
use crate::context::retrieval::{Query, RetrievalOrchestrator, RetrievalResult};
use crate::errors::{AppError, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Non-streamed answer with the records it drew on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub response: String,
    pub sources: Vec<SourceSummary>,
}

pub struct RecallEngine {
    orchestrator: RetrievalOrchestrator,
    assembler: ContextAssembler,
    completion: Arc<dyn CompletionService>,
    preview_chars: usize,
    retrieval_timeout: Duration,
    completion_timeout: Duration,
}

async fn bounded<T>(
    limit: Duration,
    work: impl Future<Output = Result<T>>,
    on_timeout: impl FnOnce() -> AppError,
) -> Result<T> {
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => {
            let err = on_timeout();
            warn!(timeout_ms = limit.as_millis() as u64, error = %err, "Deadline exceeded");
            Err(err)
        }
    }
}

impl RecallEngine {
    pub fn new(
        orchestrator: RetrievalOrchestrator,
        completion: Arc<dyn CompletionService>,
        context: &ContextConfig,
    ) -> Self {
        Self {
            orchestrator,
            assembler: ContextAssembler::from_config(context),
            completion,
            preview_chars: context.source_preview_chars,
            retrieval_timeout: DEFAULT_TIMEOUT,
            completion_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Deadlines for retrieval and for the completion call (for a stream,
    /// until the backend starts answering)
    pub fn with_timeouts(mut self, retrieval: Duration, completion: Duration) -> Self {
        self.retrieval_timeout = retrieval;
        self.completion_timeout = completion;
        self
    }

    /// Name of the configured completion backend
    pub fn completion_name(&self) -> &str {
        self.completion.name()
    }

    async fn prepare(&self, query: &Query) -> Result<(RetrievalResult, Prompt)> {
        let result = bounded(self.retrieval_timeout, self.orchestrator.retrieve(query), || {
            AppError::StoreUnavailable {
                message: "retrieval timed out".to_string(),
            }
        })
        .await?;
        let context = self.assembler.assemble(&result);
        Ok((result, build_prompt(&query.text, &context)))
    }

    #[instrument(skip_all, fields(user_id = %query.user_id))]
    pub async fn answer(&self, query: &Query) -> Result<Answer> {
        let (result, prompt) = self.prepare(query).await?;
        let response = bounded(self.completion_timeout, self.completion.complete(&prompt), || {
            completion_timed_out(self.completion.name())
        })
        .await?;

        info!(sources = result.len(), "Answer generated");
        Ok(Answer {
            response,
            sources: SourceSummary::from_result(&result, self.preview_chars),
        })
    }

    #[instrument(skip_all, fields(user_id = %query.user_id))]
    pub async fn answer_stream(&self, query: &Query) -> Result<SourceMultiplexer> {
        let (result, prompt) = self.prepare(query).await?;
        let tokens = bounded(self.completion_timeout, self.completion.stream(&prompt), || {
            completion_timed_out(self.completion.name())
        })
        .await?;

        info!(sources = result.len(), "Answer stream started");
        Ok(SourceMultiplexer::new(
            SourceSummary::from_result(&result, self.preview_chars),
            tokens,
        ))
    }
}

fn completion_timed_out(backend: &str) -> AppError {
    AppError::CompletionUnavailable {
        message: format!("{} completion did not answer in time", backend),
    }
}
