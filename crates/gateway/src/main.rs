//! Quill API Gateway
//!
//! HTTP entry point for journal questions.
//! Handles:
//! - Caller identity from the upstream auth layer
//! - Rate limiting
//! - Plain and streamed chat answers
//! - Observability (logging, metrics, request ids)

mod auth;
mod handlers;
mod middleware;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use quill_common::{
    config::{AppConfig, ObservabilityConfig, StoreBackend},
    context::{create_completion_service, CompletionService, RecallEngine, RetrievalOrchestrator},
    db::{DbPool, InMemoryStore, KeywordRetrievalClient, MemoryStore, PgMemoryStore, VectorRetrievalClient},
    embeddings::{create_embedder, Embedder, EmbeddingClient},
    metrics,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{signal, sync::Notify};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::middleware::rate_limit::{rate_limit, GlobalRateLimit};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<RecallEngine>,
    /// Present only for the Postgres backend
    pub db: Option<DbPool>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Arc::new(AppConfig::load()?);

    init_tracing(&config.observability);
    info!(
        service = %config.observability.service_name,
        "Starting Quill API Gateway v{}",
        quill_common::VERSION
    );

    init_metrics(&config.observability)?;

    let state = build_state(config.clone()).await?;
    info!(
        backend = ?config.database.backend,
        completion = state.engine.completion_name(),
        "Recall engine ready"
    );

    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    let stop = Arc::new(Notify::new());
    let mut server = tokio::spawn({
        let stop = stop.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.notified().await })
                .await
        }
    });

    tokio::select! {
        result = &mut server => {
            result??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    // open streams hold the drain; cut them off after the timeout
    stop.notify_one();
    match tokio::time::timeout(config.shutdown_timeout(), server).await {
        Ok(result) => result??,
        Err(_) => warn!(
            timeout_secs = config.server.shutdown_timeout_secs,
            "Shutdown timed out with open connections"
        ),
    }

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn init_metrics(config: &ObservabilityConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.metrics_port == 0 {
        info!("Metrics exporter disabled");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], config.metrics_port)))
        .set_buckets_for_metric(
            Matcher::Suffix("retrieval_duration_seconds".to_string()),
            metrics::RETRIEVAL_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Suffix("embedding_duration_seconds".to_string()),
            metrics::EMBEDDING_BUCKETS,
        )?
        .install()?;

    metrics::register_metrics();
    info!(port = config.metrics_port, "Prometheus exporter listening");
    Ok(())
}

/// Wire the engine over the configured store backend
async fn build_state(config: Arc<AppConfig>) -> quill_common::Result<AppState> {
    let embedder = create_embedder(&config.embedding)?;
    let completion = create_completion_service(&config.completion)?;

    let (engine, db) = match config.database.backend {
        StoreBackend::Postgres => {
            info!("Connecting to database...");
            let pool = DbPool::new(&config.database).await?;
            let store = Arc::new(PgMemoryStore::new(pool.clone()));
            (build_engine(&config, store, embedder, completion), Some(pool))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; records do not survive a restart");
            let store = Arc::new(InMemoryStore::new());
            (build_engine(&config, store, embedder, completion), None)
        }
    };

    Ok(AppState {
        config,
        engine: Arc::new(engine),
        db,
    })
}

/// One store value serves every retrieval contract
pub(crate) fn build_engine<S>(
    config: &AppConfig,
    store: Arc<S>,
    embedder: Arc<dyn Embedder>,
    completion: Arc<dyn CompletionService>,
) -> RecallEngine
where
    S: MemoryStore + VectorRetrievalClient + KeywordRetrievalClient + 'static,
{
    let mut orchestrator = RetrievalOrchestrator::new(
        config.retrieval.clone(),
        store.clone(),
        store.clone(),
        EmbeddingClient::new(embedder),
    );
    if config.retrieval.keyword_on_degraded_embedding {
        orchestrator = orchestrator.with_keyword_client(store);
    }

    RecallEngine::new(orchestrator, completion, &config.context).with_timeouts(
        config.request_timeout(),
        Duration::from_secs(config.completion.timeout_secs),
    )
}

/// Create the main application router
pub(crate) fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Chat endpoints (identity required, rate limited)
    let mut chat_routes = Router::new()
        .route("/chat", post(handlers::chat::chat))
        .route("/chat/stream", post(handlers::chat::chat_stream));

    if state.config.rate_limit.enabled {
        chat_routes = chat_routes.route_layer(axum::middleware::from_fn_with_state(
            GlobalRateLimit::new(&state.config.rate_limit),
            rate_limit,
        ));
    }

    // API routes
    let api_routes = Router::new()
        // Health endpoints (no auth)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .merge(chat_routes);

    // Compose the app
    Router::new()
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
