//! Health check handlers

use axum::{extract::State, Json};
use serde::Serialize;
use std::time::Instant;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: quill_common::VERSION.to_string(),
    })
}

/// Readiness probe - checks the memory store
pub async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let store = match &state.db {
        Some(db) => {
            let start = Instant::now();
            match db.ping().await {
                Ok(_) => CheckResult {
                    status: "up".to_string(),
                    backend: "postgres".to_string(),
                    latency_ms: Some(start.elapsed().as_millis() as u64),
                    error: None,
                },
                Err(e) => CheckResult {
                    status: "down".to_string(),
                    backend: "postgres".to_string(),
                    latency_ms: None,
                    error: Some(e.to_string()),
                },
            }
        }
        None => CheckResult {
            status: "up".to_string(),
            backend: "memory".to_string(),
            latency_ms: None,
            error: None,
        },
    };

    let ready = store.status == "up";

    Json(ReadyResponse {
        status: if ready { "ready" } else { "not_ready" }.to_string(),
        checks: HealthChecks { store },
    })
}
