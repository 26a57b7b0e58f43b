//! REST surface for the presentation layer.
//!
//! Thin handlers over the orchestrator, gate, dispatcher, and query surface.
//! Stage failures inside a pipeline run are recorded on the call and never
//! surface here as raw errors; gate and dispatch misuse map to structured
//! 4xx envelopes because the caller has to handle them.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::context::ContextStore;
use crate::dispatch::{ActionDispatcher, EffectSenders};
use crate::engine::EngineSet;
use crate::engine::retry::RetryConfig;
use crate::errors::{ApprovalError, DispatchError, PipelineError};
use crate::locks::CallLocks;
use crate::models::{ApprovalOutcome, CallFilters, Effect, Stage};
use crate::orchestrator::Orchestrator;
use crate::query::QuerySurface;
use crate::store::StoreHandle;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub gate: Arc<ApprovalGate>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub query: QuerySurface,
    pub context: ContextStore,
    pub events: broadcast::Sender<String>,
}

impl AppState {
    /// Wire the full component graph over one store. The engines and effect
    /// senders are injected so tests (and alternate deployments) can swap
    /// backends without touching the wiring.
    pub fn new(
        store: StoreHandle,
        engines: EngineSet,
        senders: EffectSenders,
        retry: RetryConfig,
        persist_debug_artifacts: bool,
    ) -> Self {
        let locks = CallLocks::new();
        let (events, _) = broadcast::channel::<String>(256);

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            engines,
            retry,
            locks.clone(),
            events.clone(),
            persist_debug_artifacts,
        ));
        let gate = Arc::new(ApprovalGate::new(
            store.clone(),
            locks.clone(),
            events.clone(),
        ));
        let dispatcher = Arc::new(ActionDispatcher::new(
            store.clone(),
            senders,
            locks,
            events.clone(),
        ));

        Self {
            orchestrator,
            gate,
            dispatcher,
            query: QuerySurface::new(store.clone()),
            context: ContextStore::new(store),
            events,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateCallRequest {
    pub audio_ref: String,
}

#[derive(Deserialize, Default)]
pub struct RunStageRequest {
    pub input: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct ResolveRequest {
    pub outcome: ApprovalOutcome,
    pub notes: Option<String>,
    pub resolved_by: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct DispatchRequest {
    pub effects: Option<Vec<Effect>>,
}

#[derive(Deserialize)]
pub struct CreateContextDocRequest {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    UnprocessableEntity(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::UnprocessableEntity(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match &err {
            PipelineError::CallNotFound { .. } => ApiError::NotFound(err.to_string()),
            PipelineError::CallCancelled { .. }
            | PipelineError::AlreadyTerminal { .. }
            | PipelineError::StageNotRunnable { .. } => ApiError::Conflict(err.to_string()),
            PipelineError::Engine { .. } => ApiError::UnprocessableEntity(err.to_string()),
            PipelineError::Storage(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        match &err {
            ApprovalError::CallNotFound { .. } => ApiError::NotFound(err.to_string()),
            ApprovalError::AlreadyResolved { .. }
            | ApprovalError::NotAwaitingApproval { .. } => ApiError::Conflict(err.to_string()),
            ApprovalError::Storage(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match &err {
            DispatchError::CallNotFound { .. } => ApiError::NotFound(err.to_string()),
            DispatchError::NotApproved { .. } | DispatchError::NoDecision { .. } => {
                ApiError::Conflict(err.to_string())
            }
            DispatchError::Storage(_) => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/calls", post(create_call).get(list_calls))
        .route("/api/calls/{id}", get(get_call))
        .route("/api/calls/{id}/process", post(process_call))
        .route("/api/calls/{id}/stages/{stage}", post(run_stage))
        .route("/api/calls/{id}/resolve", post(resolve_call))
        .route("/api/calls/{id}/dispatch", post(dispatch_effects))
        .route("/api/calls/{id}/cancel", post(cancel_call))
        .route("/api/metrics", get(get_metrics))
        .route("/api/context", post(add_context_doc).get(list_context_docs))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Full pipeline kickoff: register the call, continue the walk in the
/// background, answer immediately with the call in Uploaded state.
async fn create_call(
    State(state): State<SharedState>,
    Json(req): Json<CreateCallRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.audio_ref.trim().is_empty() {
        return Err(ApiError::BadRequest("audio_ref must not be empty".into()));
    }

    let call = state.orchestrator.create_call(&req.audio_ref).await?;

    let orchestrator = state.orchestrator.clone();
    let call_id = call.id;
    tokio::spawn(async move {
        // Stage failures are recorded on the call; nothing to surface here.
        if let Err(err) = orchestrator.process_call(call_id).await {
            tracing::debug!(%call_id, error = %err, "background pipeline run stopped");
        }
    });

    Ok((StatusCode::CREATED, Json(call)))
}

/// Idempotent resume from the first incomplete stage.
async fn process_call(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .query
        .get_call(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("call {} not found", id)))?;

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(err) = orchestrator.process_call(id).await {
            tracing::debug!(call_id = %id, error = %err, "background pipeline run stopped");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(detail.call)))
}

/// Debug single-stage execution; awaited so the caller gets the artifact.
async fn run_stage(
    State(state): State<SharedState>,
    Path((id, stage)): Path<(Uuid, String)>,
    body: Option<Json<RunStageRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let stage = Stage::from_str(&stage).map_err(ApiError::BadRequest)?;
    let input = body.and_then(|Json(req)| req.input);
    let artifact = state.orchestrator.run_stage(id, stage, input).await?;
    Ok(Json(artifact))
}

async fn resolve_call(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResolveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .gate
        .resolve(id, req.outcome, req.notes, req.resolved_by)
        .await?;

    // An approved resolution triggers dispatch of the sanctioned effects;
    // their outcomes land in the audit log without holding up this response.
    if record.outcome == ApprovalOutcome::Approved {
        let dispatcher = state.dispatcher.clone();
        tokio::spawn(async move {
            if let Err(err) = dispatcher.dispatch(id, None).await {
                tracing::warn!(call_id = %id, error = %err, "auto-dispatch failed");
            }
        });
    }

    Ok(Json(record))
}

/// Manual effect dispatch/retry for an approved call.
async fn dispatch_effects(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    body: Option<Json<DispatchRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let effects = body.and_then(|Json(req)| req.effects);
    let results = state.dispatcher.dispatch(id, effects).await?;
    Ok(Json(results))
}

async fn cancel_call(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let call = state.orchestrator.cancel(id).await?;
    Ok(Json(call))
}

async fn list_calls(
    State(state): State<SharedState>,
    Query(filters): Query<CallFilters>,
) -> Result<impl IntoResponse, ApiError> {
    let calls = state
        .query
        .list_calls(filters)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(calls))
}

async fn get_call(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .query
        .get_call(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::NotFound(format!("call {} not found", id))),
    }
}

async fn get_metrics(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let metrics = state
        .query
        .metrics()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(metrics))
}

async fn add_context_doc(
    State(state): State<SharedState>,
    Json(req): Json<CreateContextDocRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let doc = state
        .context
        .add_doc(&req.title, &req.body, req.tags)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn list_context_docs(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let docs = state
        .context
        .list_docs()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(docs))
}
