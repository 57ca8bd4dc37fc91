//! Recall engine
//!
//! Retrieval-augmented answering over a user's own notes:
//! - Query classification (temporal vs. semantic)
//! - Temporal window resolution
//! - Fallback-chain retrieval
//! - Context assembly
//! - Completion streaming with source multiplexing

mod assembler;
mod classifier;
mod completion;
mod decoder;
mod engine;
mod frames;
mod multiplexer;
mod retrieval;
mod temporal;

pub use assembler::{ContextAssembler, ContextWindow, Snippet, NO_RECORDS_MARKER};
pub use classifier::{Classifier, KeywordClassifier, QueryKind};
pub use completion::{
    build_prompt, create_completion_service, Backend, CompletionService, HttpCompletionService,
    MockCompletion, MockScript, Prompt, TokenStream, SYSTEM_PROMPT,
};
pub use decoder::{decode_increments, Decoded, IncrementDecoder, NdjsonDecoder, SseDecoder};
pub use engine::{Answer, RecallEngine};
pub use frames::{FrameCodec, SourceSummary, StreamFrame};
pub use multiplexer::{MuxState, SourceMultiplexer};
pub use retrieval::{
    MatchReason, PrimaryOutcome, Query, RetrievalOrchestrator, RetrievalResult, RetrievalState,
    RetrievedRecord,
};
pub use temporal::{TemporalResolver, TimePhrase, TimeWindow};
