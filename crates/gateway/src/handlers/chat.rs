//! Chat handlers

use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::auth::AuthContext;
use crate::AppState;
use quill_common::{
    context::FrameCodec,
    errors::{AppError, Result},
    Query,
};

/// Chat request, shared by both answer modes
#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(length(min = 1, max = 4000), custom(function = "not_blank"))]
    pub message: String,
}

/// Non-streamed chat response
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
}

fn not_blank(message: &str) -> std::result::Result<(), ValidationError> {
    if message.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

impl ChatRequest {
    fn into_query(self, auth: &AuthContext) -> Result<Query> {
        self.validate().map_err(|e| AppError::Validation {
            message: e.to_string(),
            field: Some("message".to_string()),
        })?;
        Ok(Query::new(self.message, auth.user_id))
    }
}

/// Answer a question in one response
#[tracing::instrument(skip_all, fields(request_id = %auth.request_id))]
pub async fn chat(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>> {
    let query = request.into_query(&auth)?;
    let answer = state.engine.answer(&query).await?;

    Ok(Json(ChatResponse {
        response: answer.response,
    }))
}

/// Answer a question as a `data:` framed stream.
///
/// Retrieval and the completion request finish before the response starts,
/// so their failures and deadlines come back as ordinary error responses.
/// Once streaming, the only timeout is the client's.
#[tracing::instrument(skip_all, fields(request_id = %auth.request_id))]
pub async fn chat_stream(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<ChatRequest>,
) -> Result<Response> {
    let query = request.into_query(&auth)?;
    let frames = state.engine.answer_stream(&query).await?;

    let body = Body::from_stream(frames.map(|frame| FrameCodec::encode(&frame)));

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::USER_ID_HEADER;
    use crate::{build_engine, create_router};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use chrono::{Duration, Utc};
    use quill_common::config::AppConfig;
    use async_trait::async_trait;
    use quill_common::context::{
        CompletionService, MockCompletion, MockScript, Prompt, StreamFrame, TokenStream,
    };
    use quill_common::db::{InMemoryStore, MemoryRecord};
    use quill_common::embeddings::MockEmbedder;
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    pub(crate) fn test_app(store: Arc<InMemoryStore>, completion: Arc<MockCompletion>) -> Router {
        let mut config = AppConfig::default();
        config.rate_limit.enabled = false;
        app_with(config, store, completion)
    }

    fn app_with(
        config: AppConfig,
        store: Arc<InMemoryStore>,
        completion: Arc<dyn CompletionService>,
    ) -> Router {
        let engine = build_engine(&config, store, Arc::new(MockEmbedder::new(32)), completion);
        create_router(AppState {
            config: Arc::new(config),
            engine: Arc::new(engine),
            db: None,
        })
    }

    fn seeded(owner: Uuid, n: i64) -> Arc<InMemoryStore> {
        let now = Utc::now();
        Arc::new(InMemoryStore::with_records((0..n).map(|i| {
            MemoryRecord::new(owner, format!("journal line {i}"), now - Duration::hours(i))
        })))
    }

    fn post(path: &str, user: Option<Uuid>, message: &str) -> Request<Body> {
        let mut builder = Request::post(path).header(header::CONTENT_TYPE, "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user.to_string());
        }
        builder
            .body(Body::from(serde_json::json!({ "message": message }).to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn error_code(response: Response) -> String {
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        body["error"]["code"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_missing_user_is_unauthorized() {
        let app = test_app(Arc::new(InMemoryStore::new()), Arc::new(MockCompletion::echo()));

        let response = app.oneshot(post("/v1/chat", None, "hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_blank_message_is_rejected() {
        let app = test_app(Arc::new(InMemoryStore::new()), Arc::new(MockCompletion::echo()));
        let user = Some(Uuid::new_v4());

        let response = app
            .clone()
            .oneshot(post("/v1/chat", user, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "VALIDATION_ERROR");

        let response = app
            .oneshot(post("/v1/chat/stream", user, "   "))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_returns_complete_answer() {
        let owner = Uuid::new_v4();
        let completion = Arc::new(MockCompletion::tokens(["You ", "wrote ", "twice."]));
        let app = test_app(seeded(owner, 2), completion.clone());

        let response = app
            .oneshot(post("/v1/chat", Some(owner), "my recent notes"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["response"], "You wrote twice.");
        assert!(completion
            .last_prompt()
            .unwrap()
            .user
            .contains("journal line 1"));
    }

    #[tokio::test]
    async fn test_stream_sends_sources_then_tokens() {
        let owner = Uuid::new_v4();
        let app = test_app(
            seeded(owner, 3),
            Arc::new(MockCompletion::tokens(["Mostly ", "quiet."])),
        );

        let response = app
            .oneshot(post("/v1/chat/stream", Some(owner), "my recent notes"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let frames = FrameCodec::decode_all(&body_text(response).await).unwrap();
        assert_eq!(frames.len(), 3);
        match &frames[0] {
            StreamFrame::Sources { sources } => assert_eq!(sources.len(), 3),
            other => panic!("expected sources first, got {other:?}"),
        }
        assert_eq!(
            frames[1],
            StreamFrame::Token {
                response: "Mostly ".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_stream_without_records_has_no_sources_frame() {
        let app = test_app(
            Arc::new(InMemoryStore::new()),
            Arc::new(MockCompletion::tokens(["Nothing ", "found."])),
        );

        let response = app
            .oneshot(post("/v1/chat/stream", Some(Uuid::new_v4()), "what happened today"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let frames = FrameCodec::decode_all(&body_text(response).await).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.kind() == "token"));
    }

    #[tokio::test]
    async fn test_dropped_completion_ends_stream_after_delivered_frames() {
        let owner = Uuid::new_v4();
        let completion = MockCompletion::new(MockScript::DropAfter(vec![
            "one ".to_string(),
            "two".to_string(),
        ]));
        let app = test_app(seeded(owner, 1), Arc::new(completion));

        let response = app
            .oneshot(post("/v1/chat/stream", Some(owner), "my recent notes"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let frames = FrameCodec::decode_all(&body_text(response).await).unwrap();
        let kinds: Vec<&str> = frames.iter().map(|f| f.kind()).collect();
        assert_eq!(kinds, vec!["sources", "token", "token"]);
    }

    #[tokio::test]
    async fn test_store_unavailable_is_503_without_stream() {
        let owner = Uuid::new_v4();
        let store = seeded(owner, 2);
        store.set_all_failing(true);
        let app = test_app(store, Arc::new(MockCompletion::echo()));

        let response = app
            .oneshot(post("/v1/chat/stream", Some(owner), "what did I do today"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_ne!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
    }

    #[tokio::test]
    async fn test_completion_unavailable_is_502() {
        let owner = Uuid::new_v4();
        let app = test_app(
            seeded(owner, 2),
            Arc::new(MockCompletion::new(MockScript::Unavailable)),
        );

        for path in ["/v1/chat", "/v1/chat/stream"] {
            let response = app
                .clone()
                .oneshot(post(path, Some(owner), "my recent notes"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
    }

    #[tokio::test]
    async fn test_rate_limited_after_burst() {
        let mut config = AppConfig::default();
        config.rate_limit.requests_per_second = 1;
        config.rate_limit.burst = 1;
        let app = app_with(config, Arc::new(InMemoryStore::new()), Arc::new(MockCompletion::echo()));
        let user = Some(Uuid::new_v4());

        let first = app.clone().oneshot(post("/v1/chat", user, "hi")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.clone().oneshot(post("/v1/chat", user, "hi")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let health = app
            .oneshot(Request::get("/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }

    struct HungCompletion;

    #[async_trait]
    impl CompletionService for HungCompletion {
        async fn complete(&self, _prompt: &Prompt) -> Result<String> {
            std::future::pending().await
        }

        async fn stream(&self, _prompt: &Prompt) -> Result<TokenStream> {
            std::future::pending().await
        }

        fn name(&self) -> &str {
            "hung"
        }
    }

    #[tokio::test]
    async fn test_hung_completion_is_502() {
        let owner = Uuid::new_v4();
        let mut config = AppConfig::default();
        config.rate_limit.enabled = false;
        config.server.request_timeout_secs = 1;
        config.completion.timeout_secs = 1;
        let app = app_with(config, seeded(owner, 2), Arc::new(HungCompletion));

        for path in ["/v1/chat", "/v1/chat/stream"] {
            let response = app
                .clone()
                .oneshot(post(path, Some(owner), "my recent notes"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
            assert_eq!(error_code(response).await, "COMPLETION_UNAVAILABLE");
        }
    }
}
