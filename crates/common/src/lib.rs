//! Quill Common Library
//!
//! Shared code for the Quill services including:
//! - The recall engine (retrieval, context assembly, answer streaming)
//! - Store contracts with Postgres and in-memory implementations
//! - Embedding client abstraction
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod config;
pub mod context;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod metrics;

// Re-export commonly used types
pub use config::AppConfig;
pub use context::{Answer, Query, RecallEngine, RetrievalOrchestrator};
pub use embeddings::{Embedder, EmbeddingClient};
pub use errors::{AppError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
