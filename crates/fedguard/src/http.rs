//! Axum HTTP handlers for the fedguard decision service.
//!
//! Provides the decision endpoint, policy CRUD, bulk reload, audit event
//! retrieval and a liveness check.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use audit_log::{AuditKind, AuditLog};
use policy_engine::{
    Context, Decision, DecisionEngine, Policy, PolicyFilter, PolicyStore, StoreError,
    ValidationError, Violation,
};

/// Default and maximum page sizes for `GET /events`.
pub const DEFAULT_EVENTS_LIMIT: usize = 50;
pub const MAX_EVENTS_LIMIT: usize = 500;

/// Shared application state for Axum handlers.
pub struct AppState {
    pub engine: Arc<DecisionEngine>,
    pub audit: Arc<AuditLog>,
}

impl AppState {
    pub fn new(engine: Arc<DecisionEngine>, audit: Arc<AuditLog>) -> Self {
        Self { engine, audit }
    }

    fn store(&self) -> &Arc<PolicyStore> {
        self.engine.store()
    }
}

/// Build the Axum router with all endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/check", post(handle_check))
        .route("/policies", get(handle_list_policies).post(handle_create_policy))
        .route(
            "/policies/{id}",
            get(handle_get_policy)
                .put(handle_put_policy)
                .delete(handle_delete_policy),
        )
        .route("/reload", post(handle_reload))
        .route("/events", get(handle_events))
        .route("/health", get(handle_health))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub violations: Vec<Violation>,
}

#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::Validation(v) => ApiError::Validation(v),
            StoreError::NotFound(_) => ApiError::NotFound(message),
            StoreError::Unavailable(_) => ApiError::Unavailable(message),
        }
    }
}

impl ApiError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        ApiError::Validation(ValidationError {
            violations: vec![Violation::new(field, message)],
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Validation(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorResponse {
                    error: err.to_string(),
                    violations: err.violations,
                },
            ),
            ApiError::NotFound(error) => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    error,
                    violations: Vec::new(),
                },
            ),
            ApiError::Unavailable(error) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse {
                    error,
                    violations: Vec::new(),
                },
            ),
            ApiError::Internal(error) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse {
                    error,
                    violations: Vec::new(),
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Run a synchronous store operation off the async worker threads.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("worker task failed: {e}")))?
}

/// Decode a policy body, reconciling its id with `path_id` when given.
fn policy_from_body(mut body: serde_json::Value, path_id: Option<&str>) -> Result<Policy, ApiError> {
    let serde_json::Value::Object(map) = &mut body else {
        return Err(ApiError::invalid("body", "policy must be a JSON object"));
    };
    if let Some(path_id) = path_id {
        match map.get("id") {
            None => {
                map.insert("id".into(), serde_json::Value::String(path_id.to_string()));
            }
            Some(serde_json::Value::String(id)) if id == path_id => {}
            Some(other) => {
                return Err(ApiError::invalid(
                    "id",
                    format!("body id {other} does not match path id '{path_id}'"),
                ));
            }
        }
    }
    serde_json::from_value(body).map_err(|e| ApiError::invalid("body", e.to_string()))
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    #[serde(default)]
    pub policy_type: Option<String>,
    #[serde(default)]
    pub context: Context,
}

/// `/check` response: a [`Decision`] without its timestamp, so repeated
/// checks of the same context produce identical bodies.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckResponse {
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub matched_policy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub matched_rule_index: Option<usize>,
    pub signature: String,
}

impl From<Decision> for CheckResponse {
    fn from(d: Decision) -> Self {
        Self {
            allowed: d.allowed,
            reason: d.reason,
            matched_policy_id: d.matched_policy_id,
            matched_rule_index: d.matched_rule_index,
            signature: d.signature,
        }
    }
}

/// POST /check -- evaluate a context
async fn handle_check(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckRequest>,
) -> Json<CheckResponse> {
    let context_hash = req.context.canonical_hash(req.policy_type.as_deref());
    let engine = Arc::clone(&state.engine);
    let CheckRequest {
        policy_type,
        context,
    } = req;

    let decision =
        tokio::task::spawn_blocking(move || engine.check(policy_type.as_deref(), &context)).await;

    let decision = match decision {
        Ok(decision) => decision,
        Err(e) => {
            let generation = state.store().generation();
            error!(error = %e, %context_hash, "decision task failed; denying");
            let decision = Decision::internal_error(&context_hash, generation);
            state.audit.append(
                AuditKind::PolicyViolation,
                serde_json::json!({
                    "context_hash": context_hash,
                    "generation": generation,
                    "allowed": false,
                    "reason": decision.reason,
                    "signature": decision.signature,
                    "cached": false,
                }),
            );
            decision
        }
    };

    Json(decision.into())
}

// ---------------------------------------------------------------------------
// Policy CRUD
// ---------------------------------------------------------------------------

/// GET /policies?type=&enabled=
async fn handle_list_policies(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<PolicyFilter>,
) -> Json<Vec<Policy>> {
    Json(state.store().list(&filter))
}

/// GET /policies/{id}
async fn handle_get_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Policy>, ApiError> {
    state
        .store()
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::from(StoreError::NotFound(id)))
}

/// POST /policies -- create; an existing id is rejected
async fn handle_create_policy(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<Policy>), ApiError> {
    let policy = policy_from_body(body, None)?;
    let store = Arc::clone(state.store());
    let created = blocking(move || store.create(policy).map_err(ApiError::from)).await?;
    info!(policy_id = %created.id, version = created.version, "policy created");
    Ok((StatusCode::CREATED, Json(created)))
}

/// PUT /policies/{id} -- create or replace
async fn handle_put_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<Policy>, ApiError> {
    let policy = policy_from_body(body, Some(&id))?;
    let store = Arc::clone(state.store());
    let stored = blocking(move || store.put(policy).map_err(ApiError::from)).await?;
    Ok(Json(stored))
}

/// DELETE /policies/{id}
async fn handle_delete_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Policy>, ApiError> {
    let store = Arc::clone(state.store());
    let removed = blocking(move || store.delete(&id).map_err(ApiError::from)).await?;
    Ok(Json(removed))
}

/// POST /reload -- all-or-nothing reload from the durable source
async fn handle_reload(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let store = Arc::clone(state.store());
    let summary = blocking(move || store.reload_from_source().map_err(ApiError::from)).await?;
    Ok(Json(summary))
}

// ---------------------------------------------------------------------------
// Audit & health
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub before: Option<u64>,
    pub limit: Option<usize>,
}

/// GET /events?before=&limit= -- newest-first audit history
async fn handle_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENTS_LIMIT)
        .clamp(1, MAX_EVENTS_LIMIT);
    Json(state.audit.page(query.before, limit))
}

/// GET /health -- liveness only
async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let store = state.store();
    let mut health = serde_json::json!({
        "status": "ok",
        "generation": store.generation(),
        "policies": store.len(),
    });
    if let Some(stats) = state.engine.cache_stats() {
        health["cache"] = serde_json::json!(stats);
    }
    Json(health)
}
