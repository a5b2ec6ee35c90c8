use std::{convert::Infallible, sync::Arc, time::Duration};

use autoboard_core::{
    gateway::{GatewayAck, PlanDecision},
    session::ProjectSession,
    worktree, Feature, Project, WorktreeDescriptor,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream, StreamExt};

use crate::AppState;

// ── Error helpers ─────────────────────────────────────────────────────────

pub(crate) type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

pub(crate) fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!("internal error: {e}");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
}

/// The backend refused or was unreachable.
fn upstream(e: anyhow::Error) -> ApiError {
    tracing::warn!("backend call failed: {e:#}");
    api_error(StatusCode::BAD_GATEWAY, format!("{e:#}"))
}

fn session(state: &AppState, project_id: &str) -> Result<Arc<ProjectSession>, ApiError> {
    state
        .service
        .session(project_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown project {project_id}")))
}

fn ack_json(ack: GatewayAck) -> ApiResult {
    if ack.success {
        Ok(Json(json!({ "success": true })))
    } else {
        Err(api_error(
            StatusCode::BAD_GATEWAY,
            ack.error.unwrap_or_else(|| "request declined".into()),
        ))
    }
}

// ── Request bodies ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct OpenProjectBody {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub features: Vec<Feature>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StartBody {
    pub max_concurrency: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WorktreesBody {
    /// Omit to run `git worktree list` against the project.
    pub worktrees: Option<Vec<WorktreeDescriptor>>,
    /// Worktree path to show; omit for the primary worktree.
    pub selected: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct FollowUpBody {
    pub prompt: String,
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.start_time.elapsed().as_secs(),
        "projects": state.service.project_ids(),
        "activeProject": state.service.active_project(),
    }))
}

// Projects

pub(crate) async fn open_project(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OpenProjectBody>,
) -> ApiResult {
    let session = state
        .service
        .open_project(Project::new(body.id.clone(), body.path), Vec::new());
    session.replace_features(body.features).await;
    Ok(Json(json!({ "id": body.id, "features": session.features().await.len() })))
}

pub(crate) async fn close_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.service.close_project(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(StatusCode::NOT_FOUND, format!("unknown project {id}")))
    }
}

pub(crate) async fn set_active(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    session(&state, &id)?;
    state.service.set_active_project(Some(id.clone()));
    Ok(Json(json!({ "activeProject": id })))
}

// Auto mode

pub(crate) async fn get_auto_mode(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let session = session(&state, &id)?;
    let auto = session.auto_mode().await;
    let pending = session.pending().await;
    Ok(Json(json!({
        "isRunning": auto.is_running,
        "runningTaskIds": auto.running_task_ids,
        "pendingTaskIds": pending,
        "maxConcurrency": auto.max_concurrency,
        "branchName": auto.branch_name,
        "loopActive": state.service.is_loop_active(&id),
        "scope": state.service.registry().active_scope(&id),
    })))
}

pub(crate) async fn start_auto_mode(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<StartBody>>,
) -> ApiResult {
    session(&state, &id)?;
    let max = body.and_then(|Json(b)| b.max_concurrency);
    state
        .service
        .start_auto_mode(&id, max)
        .await
        .map_err(upstream)?;
    Ok(Json(json!({ "isRunning": true })))
}

pub(crate) async fn stop_auto_mode(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    session(&state, &id)?;
    state.service.stop_auto_mode(&id).await.map_err(upstream)?;
    Ok(Json(json!({ "isRunning": false })))
}

pub(crate) async fn tick(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    session(&state, &id)?;
    let report = state.service.tick_now(&id).await.map_err(internal)?;
    Ok(Json(json!({
        "skipped": report.skipped,
        "aborted": report.aborted,
        "started": report.started,
        "failed": report.failed,
    })))
}

// Features

pub(crate) async fn list_features(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let session = session(&state, &id)?;
    Ok(Json(json!(session.features().await)))
}

pub(crate) async fn put_features(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(features): Json<Vec<Feature>>,
) -> ApiResult {
    let session = session(&state, &id)?;
    let count = features.len();
    session.replace_features(features).await;
    Ok(Json(json!({ "features": count })))
}

pub(crate) async fn stop_feature(
    State(state): State<Arc<AppState>>,
    Path((id, feature_id)): Path<(String, String)>,
) -> ApiResult {
    let ack = state
        .service
        .stop_feature(&id, &feature_id)
        .await
        .map_err(upstream)?;
    ack_json(ack)
}

pub(crate) async fn resume_feature(
    State(state): State<Arc<AppState>>,
    Path((id, feature_id)): Path<(String, String)>,
) -> ApiResult {
    let ack = state
        .service
        .resume_feature(&id, &feature_id)
        .await
        .map_err(upstream)?;
    ack_json(ack)
}

pub(crate) async fn follow_up_feature(
    State(state): State<Arc<AppState>>,
    Path((id, feature_id)): Path<(String, String)>,
    Json(body): Json<FollowUpBody>,
) -> ApiResult {
    let ack = state
        .service
        .follow_up_feature(&id, &feature_id, &body.prompt)
        .await
        .map_err(upstream)?;
    ack_json(ack)
}

pub(crate) async fn approve_plan(
    State(state): State<Arc<AppState>>,
    Path((id, feature_id)): Path<(String, String)>,
    Json(decision): Json<PlanDecision>,
) -> ApiResult {
    let ack = state
        .service
        .approve_plan(&id, &feature_id, decision)
        .await
        .map_err(upstream)?;
    ack_json(ack)
}

// Worktrees

pub(crate) async fn put_worktrees(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<WorktreesBody>,
) -> ApiResult {
    let session = session(&state, &id)?;
    let descriptors = match body.worktrees {
        Some(list) => list,
        None => {
            let repo = session.path().to_string();
            tokio::task::spawn_blocking(move || worktree::list_worktrees(&repo))
                .await
                .map_err(internal)?
                .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, format!("{e:#}")))?
        }
    };
    let registry = state.service.registry();
    registry.refresh(&id, descriptors);
    registry.select(&id, body.selected);
    Ok(Json(json!({
        "worktrees": registry.descriptors(&id),
        "scope": registry.active_scope(&id),
    })))
}

// ── SSE ───────────────────────────────────────────────────────────────────

fn sse_from<T: Send + 'static>(
    history: Vec<T>,
    mut live: broadcast::Receiver<T>,
    encode: fn(&T) -> String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    T: Clone,
{
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        for item in &history {
            if tx.send(encode(item)).is_err() {
                return;
            }
        }
        loop {
            match live.recv().await {
                Ok(item) => {
                    if tx.send(encode(&item)).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx).map(|data| Ok(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

pub(crate) async fn sse_board_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    sse_from(Vec::new(), state.service.subscribe_board(), |ev| {
        serde_json::to_string(ev).unwrap_or_default()
    })
}

pub(crate) async fn sse_activity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = session(&state, &id)?;
    let (history, live) = session.lock().await.activity.subscribe();
    Ok(sse_from(history, live, |entry| {
        serde_json::to_string(entry).unwrap_or_default()
    }))
}

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before snapshotting the ring so nothing falls in between.
    let live = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    sse_from(history, live, String::clone)
}
