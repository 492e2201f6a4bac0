use crate::upstream::{Upstream, UpstreamError};
use crate::users::{NewUser, UserDirectory, UserError};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{Extensions, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use turnstile_core::{
    CacheKey, GuardDecision, GuardError, IdempotencyGuard, KeyError, KeyValueStore,
    ReadThroughCache, RejectReason, RequestDescriptor,
};

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Shared application state passed to all handlers.
pub struct AppState {
    pub cache: ReadThroughCache,
    pub guard: IdempotencyGuard,
    pub store: Arc<dyn KeyValueStore>,
    pub upstream: Arc<dyn Upstream>,
    pub users: UserDirectory,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/comments", get(list_comments))
        .route("/users", post(create_user))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("an identical request was already processed")]
    Duplicate,
    #[error("idempotency key was already used with a different request")]
    TokenReused,
    #[error("email already registered")]
    EmailTaken,
    #[error("request deduplication is unavailable, retry later")]
    StoreUnavailable,
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Duplicate | ApiError::EmailTaken => StatusCode::CONFLICT,
            ApiError::TokenReused => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "validation_error",
            ApiError::Duplicate => "duplicate_request",
            ApiError::TokenReused => "token_reused",
            ApiError::EmailTaken => "email_taken",
            ApiError::StoreUnavailable => "store_unavailable",
            ApiError::Upstream(_) => "upstream_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({ "error": self.code(), "message": self.to_string() })),
        )
            .into_response()
    }
}

impl From<KeyError> for ApiError {
    fn from(e: KeyError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<GuardError> for ApiError {
    fn from(e: GuardError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

/// GET /health: liveness plus a store ping.
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store = match state.store.ping().await {
        Ok(()) => "up",
        Err(e) => {
            tracing::warn!(store = state.store.name(), error = %e, "store health check failed");
            "down"
        }
    };
    Json(json!({ "status": "OK", "store": store }))
}

/// GET /comments?postId=N
async fn list_comments(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let mut params: Vec<(&str, &str)> = Vec::new();
    if let Some(post_id) = query.get("postId") {
        if post_id.is_empty() || !post_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ApiError::BadRequest(
                "postId must be a non-empty alphanumeric value".into(),
            ));
        }
        params.push(("postId", post_id));
    }

    let key = CacheKey::for_query("comments", &params)?;

    let upstream = &state.upstream;
    let params = &params;
    let lookup = state
        .cache
        .fetch_or_compute::<Vec<Value>, _, _, _>(&key, move || async move {
            upstream.fetch("comments", params).await
        })
        .await
        .map_err(|e| {
            metrics::counter!("turnstile_upstream_errors_total").increment(1);
            tracing::error!(key = %key, error = %e, "upstream fetch failed");
            ApiError::Upstream(e)
        })?;

    metrics::counter!("turnstile_cache_lookups_total", "outcome" => lookup.outcome.as_str())
        .increment(1);

    Ok(([("x-cache", lookup.outcome.as_str())], Json(lookup.value)).into_response())
}

/// POST /users: create a user at most once per idempotency key and window.
async fn create_user(
    State(state): State<Arc<AppState>>,
    extensions: Extensions,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut descriptor = RequestDescriptor::from_body_bytes("POST", "/users", &body)?;
    let new_user =
        NewUser::from_body(descriptor.body()).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if let Some(value) = headers.get(IDEMPOTENCY_HEADER) {
        let token = value.to_str().map_err(|_| {
            ApiError::BadRequest(format!("{IDEMPOTENCY_HEADER} must be visible ASCII"))
        })?;
        descriptor = descriptor.with_token(token);
    }
    if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
        descriptor = descriptor.with_source(addr.ip().to_string());
    }

    let decision = state.guard.guard(&descriptor).await?;
    metrics::counter!("turnstile_guard_decisions_total", "decision" => decision.label())
        .increment(1);

    match decision {
        GuardDecision::Admitted { key, marker } => match state.users.create(new_user) {
            Ok(user) => {
                tracing::info!(key = %key, user_id = user.id, "user created");
                Ok((StatusCode::CREATED, Json(user)).into_response())
            }
            Err(e) => {
                // The mutation did not happen, so the key must not block a retry.
                if let Err(release_err) = state.guard.release(&key, &marker).await {
                    tracing::warn!(key = %key, op = "delete", error = %release_err, "failed to release idempotency key");
                }
                match e {
                    UserError::EmailTaken => Err(ApiError::EmailTaken),
                    UserError::InvalidPayload(msg) => Err(ApiError::BadRequest(msg)),
                }
            }
        },
        GuardDecision::Rejected { reason, .. } => match reason {
            RejectReason::Duplicate => Err(ApiError::Duplicate),
            RejectReason::TokenReused => Err(ApiError::TokenReused),
        },
        GuardDecision::StoreUnavailable { .. } => Err(ApiError::StoreUnavailable),
    }
}
