use crate::core::error::OrchestratorError;
use crate::core::model::{DownloadRequest, DownloadStatus, EngineOptions, StatusView};
use crate::core::orchestrator::SubmitOutcome;
use crate::core::tracker::ClearFilter;
use crate::server::error::ApiResult;
use crate::server::AppState;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

const DEFAULT_HISTORY_LIMIT: u32 = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBody {
    pub url: Option<String>,
    #[serde(alias = "id")]
    pub download_id: Option<String>,
    pub title: Option<String>,
    pub is_playlist: Option<bool>,
    #[serde(default)]
    pub engine_options: EngineOptions,
}

impl SubmitBody {
    fn into_request(self) -> ApiResult<DownloadRequest> {
        let url = self
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| OrchestratorError::validation("url is required"))?;
        let id = self.download_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut req = DownloadRequest::new(id, url.trim());
        req.title = self.title;
        req.is_playlist = self.is_playlist;
        req.engine_options = self.engine_options;
        Ok(req)
    }
}

#[derive(Debug, Deserialize)]
pub struct PriorityBody {
    pub priority: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderBody {
    pub order: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct BulkClearQuery {
    pub status: Option<String>,
    pub age: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let orch = &state.orchestrator;
    Json(json!({
        "status": "ok",
        "app_name": state.app_name,
        "version": state.version,
        "max_concurrent": orch.max_concurrent(),
        "downloading": orch.count_with(DownloadStatus::Downloading),
        "queued": orch.count_with(DownloadStatus::Queued),
    }))
}

pub async fn submit(
    State(state): State<AppState>,
    body: Result<Json<SubmitBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let request = body.into_request()?;
    match state.orchestrator.submit(request)? {
        SubmitOutcome::Started { id, title, url } => Ok(Json(json!({
            "status": "success",
            "downloadId": id,
            "title": title,
            "url": url,
        }))),
        SubmitOutcome::Queued { id, position } => Ok(Json(json!({
            "status": "queued",
            "message": format!("Download queued at position {}", position),
            "downloadId": id,
            "position": position,
        }))),
    }
}

fn success_for(id: &str) -> Json<Value> {
    Json(json!({ "status": "success", "downloadId": id }))
}

pub async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state.orchestrator.cancel(&id).await?;
    Ok(success_for(&id))
}

pub async fn pause(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state.orchestrator.pause(&id)?;
    Ok(success_for(&id))
}

pub async fn resume(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state.orchestrator.resume(&id)?;
    Ok(success_for(&id))
}

pub async fn priority(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<PriorityBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let raw = body
        .priority
        .ok_or_else(|| OrchestratorError::validation("priority is required"))?;
    let nice = i32::try_from(raw)
        .map_err(|_| OrchestratorError::validation(format!("priority out of range: {}", raw)))?;
    state.orchestrator.set_priority(&id, nice)?;
    Ok(Json(json!({ "status": "success", "downloadId": id, "priority": nice })))
}

pub async fn status_all(State(state): State<AppState>) -> Json<BTreeMap<String, StatusView>> {
    Json(state.orchestrator.list_all())
}

pub async fn status_one(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<StatusView>> {
    Ok(Json(state.orchestrator.status(&id)?))
}

pub async fn clear_one(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state.orchestrator.clear_one(&id)?;
    Ok(Json(json!({ "status": "success", "message": format!("Cleared download {}", id) })))
}

pub async fn clear_bulk(
    State(state): State<AppState>,
    query: Result<Query<BulkClearQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(q) = query?;
    let filter = ClearFilter::parse(q.status.as_deref(), q.age)?;
    let ids = state.orchestrator.clear_bulk(&filter);
    info!(cleared = ids.len(), status = ?q.status, age = ?q.age, "bulk clear");
    Ok(Json(json!({
        "status": "success",
        "cleared_count": ids.len(),
        "cleared_ids": ids,
    })))
}

pub async fn queue_list(State(state): State<AppState>) -> Json<Value> {
    let queue: Vec<Value> = state
        .orchestrator
        .queue()
        .into_iter()
        .map(|e| json!({ "downloadId": e.request.id, "url": e.request.url }))
        .collect();
    Json(json!({ "queue": queue }))
}

pub async fn queue_reorder(
    State(state): State<AppState>,
    body: Result<Json<ReorderBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let order = body.order.ok_or_else(|| OrchestratorError::validation("order is required"))?;
    state.orchestrator.reorder_queue(&order)?;
    Ok(Json(json!({ "status": "success" })))
}

pub async fn queue_remove(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state.orchestrator.remove_queued(&id)?;
    Ok(success_for(&id))
}

pub async fn history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(q) = query?;
    let rows = state.orchestrator.history(q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)).await?;
    Ok(Json(json!({ "history": rows })))
}
