//! Caller identity supplied by the upstream auth layer

use axum::{extract::FromRequestParts, http::request::Parts};
use quill_common::errors::{AppError, Result};
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated caller, as asserted by the fronting proxy
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Owner of the records a question may read
    pub user_id: Uuid,

    /// Request ID for tracing
    pub request_id: String,
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .ok_or_else(|| AppError::Unauthorized {
                message: "Missing or invalid X-User-ID header".to_string(),
            })?;

        Ok(Self {
            user_id,
            request_id,
        })
    }
}
