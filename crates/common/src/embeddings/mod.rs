//! Embedding service abstraction
//!
//! Provides a unified interface for multiple embedding providers:
//! - OpenAI-compatible endpoints (text-embedding-3-small, ...)
//! - Ollama (nomic-embed-text, ...)
//! - A deterministic mock for tests and local runs
//!
//! Callers in the recall engine go through [`EmbeddingClient`], which never
//! fails: provider errors become the all-zero sentinel vector.

use crate::config::EmbeddingConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;
}

type Attempt<T> = std::result::Result<T, backoff::Error<AppError>>;

/// Run `op` with exponential backoff, giving up after `max_retries` retries.
/// `op` marks each failure transient or permanent itself.
async fn with_retry<T, F, Fut>(max_retries: u32, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_multiplier(2.0)
        .with_max_elapsed_time(Some(Duration::from_secs(10)))
        .build();
    let attempts = AtomicU32::new(0);

    retry(policy, || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        let fut = op();
        async move {
            fut.await.map_err(|err| match err {
                backoff::Error::Transient { err, .. } if attempt < max_retries => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        error = %err,
                        "Embedding request failed, retrying"
                    );
                    backoff::Error::transient(err)
                }
                backoff::Error::Transient { err, .. } => backoff::Error::permanent(err),
                permanent => permanent,
            })
        }
    })
    .await
}

/// Classify a non-success HTTP status: throttling and server faults retry
fn status_error(status: reqwest::StatusCode, body: String) -> backoff::Error<AppError> {
    let err = AppError::EmbeddingError {
        message: format!("API error {}: {}", status, body),
    };
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

fn build_http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| AppError::Configuration {
            message: format!("Failed to create HTTP client: {}", e),
        })
}

/// OpenAI-compatible embedding client
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimension: usize,
    base_url: String,
    max_retries: u32,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
}

impl OpenAIEmbedder {
    /// Create a new OpenAI embedder
    pub fn new(api_key: String, config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            api_key,
            model: config.model.clone(),
            dimension: config.dimension,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            max_retries: config.max_retries,
        })
    }

    async fn make_request(&self, text: &str) -> Attempt<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&OpenAIRequest {
                input: text,
                model: &self.model,
            })
            .send()
            .await
            .map_err(|e| {
                backoff::Error::transient(AppError::EmbeddingError {
                    message: format!("Request failed: {}", e),
                })
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let result: OpenAIResponse = response.json().await.map_err(|e| {
            backoff::Error::permanent(AppError::EmbeddingError {
                message: format!("Failed to parse response: {}", e),
            })
        })?;

        result
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| {
                backoff::Error::permanent(AppError::EmbeddingError {
                    message: "Empty response".to_string(),
                })
            })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        with_retry(self.max_retries, || self.make_request(text)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Ollama embedding client (`POST /api/embeddings`)
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dimension: usize,
    base_url: String,
    max_retries: u32,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            model: config.model.clone(),
            dimension: config.dimension,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_retries: config.max_retries,
        })
    }

    async fn make_request(&self, text: &str) -> Attempt<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&OllamaRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| {
                backoff::Error::transient(AppError::EmbeddingError {
                    message: format!("Request failed: {}", e),
                })
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        response
            .json::<OllamaResponse>()
            .await
            .map(|r| r.embedding)
            .map_err(|e| {
                backoff::Error::permanent(AppError::EmbeddingError {
                    message: format!("Failed to parse response: {}", e),
                })
            })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        with_retry(self.max_retries, || self.make_request(text)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Mock embedder for testing and local runs.
///
/// Feature-hashes lower-cased terms into a fixed number of buckets, so texts
/// sharing words land close together and results are reproducible.
pub struct MockEmbedder {
    dimension: usize,
    failing: bool,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            failing: false,
        }
    }

    /// An embedder whose every call fails
    pub fn failing(dimension: usize) -> Self {
        Self {
            dimension,
            failing: true,
        }
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.failing {
            return Err(AppError::EmbeddingError {
                message: "mock embedder configured to fail".to_string(),
            });
        }

        let mut vector = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return Ok(vector);
        }

        for term in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 3)
        {
            let digest = Sha256::digest(term.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vector)
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Never-failing front for an [`Embedder`].
///
/// Any provider failure, wrong dimensionality or non-finite component yields
/// the sentinel vector: all zeros, of the configured dimension.
#[derive(Clone)]
pub struct EmbeddingClient {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingClient {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    /// The vector returned in place of a failed embedding
    pub fn sentinel(&self) -> Vec<f32> {
        vec![0.0; self.dimension()]
    }

    /// Whether `vector` is the sentinel (carries no direction)
    pub fn is_sentinel(vector: &[f32]) -> bool {
        vector.iter().all(|x| *x == 0.0)
    }

    /// Embed `text`; falls back to the sentinel vector instead of failing
    #[instrument(skip_all, fields(model = %self.embedder.model_name()))]
    pub async fn generate(&self, text: &str) -> Vec<f32> {
        let start = Instant::now();
        let model = self.embedder.model_name();

        match self.embedder.embed(text).await {
            Ok(vector)
                if vector.len() == self.dimension() && vector.iter().all(|x| x.is_finite()) =>
            {
                metrics::record_embedding(start.elapsed().as_secs_f64(), model, true);
                vector
            }
            Ok(vector) => {
                tracing::warn!(
                    expected = self.dimension(),
                    actual = vector.len(),
                    "Unusable embedding returned, using sentinel vector"
                );
                metrics::record_embedding(start.elapsed().as_secs_f64(), model, false);
                self.sentinel()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Embedding generation failed, using sentinel vector");
                metrics::record_embedding(start.elapsed().as_secs_f64(), model, false);
                self.sentinel()
            }
        }
    }
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "embedding.api_key is required for the openai provider".to_string(),
            })?;
            Ok(Arc::new(OpenAIEmbedder::new(key, config)?))
        }
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "mock" => Ok(Arc::new(MockEmbedder::new(config.dimension))),
        other => {
            tracing::warn!(provider = other, "Unknown embedding provider, using mock");
            Ok(Arc::new(MockEmbedder::new(config.dimension)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::cosine_similarity;

    #[tokio::test]
    async fn test_mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new(64);
        let a = embedder.embed("Worried about the work deadline").await.unwrap();
        let b = embedder.embed("Worried about the work deadline").await.unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_mock_embedder_related_texts_are_closer() {
        let embedder = MockEmbedder::new(256);
        let query = embedder.embed("feeling stressed about work").await.unwrap();
        let related = embedder.embed("work has me stressed again").await.unwrap();
        let unrelated = embedder.embed("baked sourdough bread").await.unwrap();

        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[tokio::test]
    async fn test_client_returns_sentinel_on_failure() {
        let client = EmbeddingClient::new(Arc::new(MockEmbedder::failing(32)));
        let vector = client.generate("anything").await;
        assert_eq!(vector.len(), 32);
        assert!(EmbeddingClient::is_sentinel(&vector));
    }

    #[tokio::test]
    async fn test_client_passes_through_success() {
        let client = EmbeddingClient::new(Arc::new(MockEmbedder::new(32)));
        let vector = client.generate("morning run by the river").await;
        assert!(!EmbeddingClient::is_sentinel(&vector));
    }

    #[test]
    fn test_create_embedder_requires_openai_key() {
        let config = EmbeddingConfig::default();
        assert!(matches!(
            create_embedder(&config),
            Err(AppError::Configuration { .. })
        ));

        let mock = EmbeddingConfig {
            provider: "mock".to_string(),
            dimension: 16,
            ..EmbeddingConfig::default()
        };
        assert_eq!(create_embedder(&mock).unwrap().dimension(), 16);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(backoff::Error::transient(AppError::EmbeddingError {
                    message: "503".to_string(),
                }))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(backoff::Error::permanent(AppError::EmbeddingError {
                    message: "401".to_string(),
                }))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
