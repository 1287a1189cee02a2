//! HTTP surface over the orchestrator: run, control verbs, queries, and a
//! server-sent-events stream of the bus.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{ErrorKind, QuorumError};
use crate::events::EventPayload;
use crate::workflow::orchestrator::{CreateOptions, Orchestrator};
use crate::workflow::types::{WorkflowId, WorkflowStatus};

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/run", post(run_workflow))
        .route("/workflows", get(list_workflows))
        .route("/workflows/:id", get(get_workflow))
        .route("/workflows/:id/resume", post(resume_workflow))
        .route("/workflows/:id/pause", post(pause_workflow))
        .route("/workflows/:id/cancel", post(cancel_workflow))
        .route("/workflows/:id/events", get(workflow_events))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { orchestrator })
}

/// Bind and serve until `shutdown` fires.
pub async fn serve(
    orchestrator: Arc<Orchestrator>,
    bind: &str,
    shutdown: CancellationToken,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "http api listening");
    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

struct ApiError(QuorumError);

impl From<QuorumError> for ApiError {
    fn from(e: QuorumError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QuorumError::MaxConcurrent { .. } => StatusCode::TOO_MANY_REQUESTS,
            QuorumError::AlreadyRunning(_) | QuorumError::LockBusy(_) => StatusCode::CONFLICT,
            e => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::LockBusy => StatusCode::CONFLICT,
                ErrorKind::AgentFailure | ErrorKind::MergeConflict => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        let body = Json(ErrorBody {
            kind: format!("{:?}", self.0.kind()),
            message: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

/// Control verbs answer 200 or 409: a workflow in the wrong state for the
/// verb is a conflict, not a malformed request.
struct ControlError(QuorumError);

impl From<QuorumError> for ControlError {
    fn from(e: QuorumError) -> Self {
        ControlError(e)
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        match &self.0 {
            QuorumError::Validation(_) => {
                let body = Json(ErrorBody {
                    kind: "Conflict".to_string(),
                    message: self.0.to_string(),
                });
                (StatusCode::CONFLICT, body).into_response()
            }
            _ => ApiError(self.0).into_response(),
        }
    }
}

#[derive(Deserialize)]
struct RunRequest {
    prompt: String,
    title: Option<String>,
    base_branch: Option<String>,
}

#[derive(Serialize)]
struct RunResponse {
    workflow_id: String,
}

async fn run_workflow(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    let id = state
        .orchestrator
        .create(CreateOptions {
            prompt: request.prompt,
            title: request.title,
            base_branch: request.base_branch,
            ..CreateOptions::default()
        })
        .await?;
    state.orchestrator.start(&id, false).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RunResponse {
            workflow_id: id.to_string(),
        }),
    ))
}

#[derive(Serialize)]
struct ControlResponse {
    workflow_id: String,
    action: &'static str,
}

async fn resume_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ControlResponse>, ControlError> {
    let id = WorkflowId::parse(&id)?;
    state.orchestrator.resume(&id, false).await?;
    Ok(Json(ControlResponse {
        workflow_id: id.to_string(),
        action: "resume",
    }))
}

async fn pause_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ControlResponse>, ControlError> {
    let id = WorkflowId::parse(&id)?;
    state.orchestrator.pause(&id).await?;
    Ok(Json(ControlResponse {
        workflow_id: id.to_string(),
        action: "pause",
    }))
}

async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ControlResponse>, ControlError> {
    let id = WorkflowId::parse(&id)?;
    state.orchestrator.cancel(&id).await?;
    Ok(Json(ControlResponse {
        workflow_id: id.to_string(),
        action: "cancel",
    }))
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(WorkflowStatus::parse)
        .transpose()?;
    let workflows = state.orchestrator.list_all(status).await?;
    let summaries: Vec<serde_json::Value> = workflows.iter().map(summarize).collect();
    Ok(Json(serde_json::json!({ "workflows": summaries })))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::workflow::types::Workflow>, ApiError> {
    let id = WorkflowId::parse(&id)?;
    Ok(Json(state.orchestrator.get(&id).await?))
}

fn summarize(wf: &crate::workflow::types::Workflow) -> serde_json::Value {
    serde_json::json!({
        "id": wf.id,
        "title": wf.title,
        "status": wf.status,
        "current_phase": wf.current_phase,
        "created_at": wf.created_at,
        "updated_at": wf.updated_at,
        "tasks": wf.tasks.len(),
    })
}

async fn workflow_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let id = WorkflowId::parse(&id)?;
    // 404 rather than an empty stream for unknown ids.
    state.orchestrator.get(&id).await?;

    let subscriber = state.orchestrator.subscribe();
    let stream = futures::stream::unfold(subscriber, move |mut subscriber| {
        let id = id.clone();
        async move {
            loop {
                match subscriber.recv().await {
                    Some(envelope) => {
                        let relevant = envelope.workflow_id == id
                            || matches!(envelope.payload, EventPayload::DroppedEvents { .. });
                        if !relevant {
                            continue;
                        }
                        match SseEvent::default().json_data(&envelope) {
                            Ok(event) => return Some((Ok(event), subscriber)),
                            Err(_) => continue,
                        }
                    }
                    None => return None,
                }
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
