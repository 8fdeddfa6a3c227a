//! Thin HTTP surface over the export engine. Authentication, TLS and the
//! browser UI live outside this process; these handlers only translate
//! requests into engine calls and engine errors into status codes.

use crate::domain::{EngineError, ExportFilter, ItemKey, OutputFormat};
use crate::usecases::engine::ExportEngine;
use crate::usecases::queue::QueueProjections;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub fn router(engine: Arc<ExportEngine>) -> Router {
    Router::new()
        .route("/api/export/create", post(create_job))
        .route("/api/export/tasks", get(list_jobs))
        .route("/api/export/{id}", get(get_job).delete(delete_job))
        .route("/api/export/{id}/start", post(start_job))
        .route("/api/export/{id}/pause", post(pause_job))
        .route("/api/export/{id}/resume", post(resume_job))
        .route("/api/export/{id}/cancel", post(cancel_job))
        .route("/api/export/{id}/retry", post(retry_failed))
        .route("/api/export/{id}/retry_file/{item}", post(retry_file))
        .route(
            "/api/export/{id}/download/{item}/{action}",
            post(item_control),
        )
        .route("/api/export/{id}/verify", post(verify_job))
        .route("/api/export/{id}/scan", post(scan_job))
        .route("/api/export/{id}/concurrency", post(set_concurrency))
        .route("/api/export/{id}/tdl-mode", post(set_delegated))
        .route("/api/export/{id}/downloads", get(get_downloads))
        .with_state(engine)
}

fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Busy => StatusCode::CONFLICT,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidState(_) => StatusCode::CONFLICT,
        EngineError::Config(_) | EngineError::Delegated(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct OpResponse {
    success: bool,
    message: String,
}

fn ok(message: impl Into<String>) -> Json<OpResponse> {
    Json(OpResponse {
        success: true,
        message: message.into(),
    })
}

fn err_response(e: EngineError) -> (StatusCode, Json<OpResponse>) {
    let code = status_for(&e);
    if code == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %e, "api call failed");
    }
    (
        code,
        Json(OpResponse {
            success: false,
            message: e.to_string(),
        }),
    )
}

type OpResult = Result<Json<OpResponse>, (StatusCode, Json<OpResponse>)>;

fn parse_id(id: &str) -> Result<Uuid, (StatusCode, Json<OpResponse>)> {
    id.parse()
        .map_err(|_| err_response(EngineError::NotFound(id.to_string())))
}

fn parse_item(item: &str) -> Result<ItemKey, (StatusCode, Json<OpResponse>)> {
    ItemKey::parse(item)
        .ok_or_else(|| err_response(EngineError::NotFound(format!("item {}", item))))
}

#[derive(Deserialize)]
struct CreateQuery {
    name: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CreateBody {
    #[serde(flatten)]
    filter: ExportFilter,
    format: Option<OutputFormat>,
}

#[derive(Serialize)]
struct CreateResponse {
    id: Uuid,
}

async fn create_job(
    State(engine): State<Arc<ExportEngine>>,
    Query(q): Query<CreateQuery>,
    Json(body): Json<CreateBody>,
) -> Result<Json<CreateResponse>, (StatusCode, Json<OpResponse>)> {
    let job = engine
        .create_job(&q.name, body.filter, body.format.unwrap_or_default())
        .await
        .map_err(err_response)?;
    Ok(Json(CreateResponse { id: job.id }))
}

async fn list_jobs(State(engine): State<Arc<ExportEngine>>) -> Json<serde_json::Value> {
    let jobs = engine.list_jobs().await;
    Json(serde_json::json!({ "tasks": jobs }))
}

async fn get_job(
    State(engine): State<Arc<ExportEngine>>,
    Path(id): Path<String>,
) -> Result<Json<crate::domain::ExportJob>, (StatusCode, Json<OpResponse>)> {
    let id = parse_id(&id)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    Ok(Json(controller.snapshot().await))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DeleteQuery {
    /// Also remove the exported media tree; off by default.
    purge: bool,
}

async fn delete_job(
    State(engine): State<Arc<ExportEngine>>,
    Path(id): Path<String>,
    Query(q): Query<DeleteQuery>,
) -> OpResult {
    let id = parse_id(&id)?;
    engine.delete_job(id, q.purge).await.map_err(err_response)?;
    Ok(ok(if q.purge {
        "deleted, media purged"
    } else {
        "deleted, media retained"
    }))
}

async fn start_job(State(engine): State<Arc<ExportEngine>>, Path(id): Path<String>) -> OpResult {
    let id = parse_id(&id)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    controller.start().await.map_err(err_response)?;
    Ok(ok("started"))
}

async fn pause_job(State(engine): State<Arc<ExportEngine>>, Path(id): Path<String>) -> OpResult {
    let id = parse_id(&id)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    controller.pause().await.map_err(err_response)?;
    Ok(ok("paused"))
}

async fn resume_job(State(engine): State<Arc<ExportEngine>>, Path(id): Path<String>) -> OpResult {
    let id = parse_id(&id)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    controller.resume().await.map_err(err_response)?;
    Ok(ok("resumed"))
}

async fn cancel_job(State(engine): State<Arc<ExportEngine>>, Path(id): Path<String>) -> OpResult {
    let id = parse_id(&id)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    controller.cancel().await.map_err(err_response)?;
    Ok(ok("cancelled"))
}

async fn retry_failed(State(engine): State<Arc<ExportEngine>>, Path(id): Path<String>) -> OpResult {
    let id = parse_id(&id)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    let moved = controller.retry_failed().await.map_err(err_response)?;
    Ok(ok(format!("{} items requeued", moved)))
}

async fn retry_file(
    State(engine): State<Arc<ExportEngine>>,
    Path((id, item)): Path<(String, String)>,
) -> OpResult {
    let id = parse_id(&id)?;
    let key = parse_item(&item)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    controller.retry_item(key).await.map_err(err_response)?;
    Ok(ok("item requeued"))
}

async fn item_control(
    State(engine): State<Arc<ExportEngine>>,
    Path((id, item, action)): Path<(String, String, String)>,
) -> OpResult {
    let id = parse_id(&id)?;
    let key = parse_item(&item)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    match action.as_str() {
        "pause" => controller.pause_item(key).await.map_err(err_response)?,
        "resume" => controller.resume_item(key).await.map_err(err_response)?,
        "cancel" => controller.cancel_item(key).await.map_err(err_response)?,
        _ => {
            return Err(err_response(EngineError::NotFound(format!(
                "action {}",
                action
            ))))
        }
    }
    Ok(ok(action))
}

async fn verify_job(State(engine): State<Arc<ExportEngine>>, Path(id): Path<String>) -> OpResult {
    let id = parse_id(&id)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    let summary = controller.verify().await.map_err(err_response)?;
    Ok(ok(summary))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ScanQuery {
    full: bool,
}

async fn scan_job(
    State(engine): State<Arc<ExportEngine>>,
    Path(id): Path<String>,
    Query(q): Query<ScanQuery>,
) -> OpResult {
    let id = parse_id(&id)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    controller.scan(q.full).await.map_err(err_response)?;
    Ok(ok(if q.full { "full rescan" } else { "rescan" }))
}

#[derive(Deserialize)]
struct ConcurrencyQuery {
    max_concurrent_downloads: u32,
    /// 1 disables parallel chunking; anything above enables it.
    parallel_chunk_connections: Option<u32>,
}

async fn set_concurrency(
    State(engine): State<Arc<ExportEngine>>,
    Path(id): Path<String>,
    Query(q): Query<ConcurrencyQuery>,
) -> OpResult {
    let id = parse_id(&id)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    controller
        .set_concurrency(
            q.max_concurrent_downloads,
            q.parallel_chunk_connections.map(|n| n > 1),
        )
        .await
        .map_err(err_response)?;
    Ok(ok("concurrency updated"))
}

#[derive(Deserialize)]
struct DelegatedQuery {
    enabled: bool,
}

async fn set_delegated(
    State(engine): State<Arc<ExportEngine>>,
    Path(id): Path<String>,
    Query(q): Query<DelegatedQuery>,
) -> OpResult {
    let id = parse_id(&id)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    controller
        .set_delegated(q.enabled)
        .await
        .map_err(err_response)?;
    Ok(ok(if q.enabled {
        "delegated downloader enabled"
    } else {
        "delegated downloader disabled"
    }))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DownloadsQuery {
    limit: usize,
    reversed_order: bool,
}

async fn get_downloads(
    State(engine): State<Arc<ExportEngine>>,
    Path(id): Path<String>,
    Query(q): Query<DownloadsQuery>,
) -> Result<Json<QueueProjectionsResponse>, (StatusCode, Json<OpResponse>)> {
    let id = parse_id(&id)?;
    let controller = engine.controller(id).await.map_err(err_response)?;
    let p = controller.downloads(q.limit, q.reversed_order).await;
    Ok(Json(QueueProjectionsResponse::from(p)))
}

#[derive(Serialize)]
struct QueueProjectionsResponse {
    active: Vec<crate::domain::MediaItem>,
    waiting: Vec<crate::domain::MediaItem>,
    failed: Vec<crate::domain::MediaItem>,
    completed: Vec<crate::domain::MediaItem>,
}

impl From<QueueProjections> for QueueProjectionsResponse {
    fn from(p: QueueProjections) -> Self {
        Self {
            active: p.active,
            waiting: p.waiting,
            failed: p.failed,
            completed: p.completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(status_for(&EngineError::Busy), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&EngineError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&EngineError::InvalidState("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&EngineError::Store("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn item_path_parses() {
        assert!(parse_item("-100_5_0").is_ok());
        assert!(parse_item("garbage").is_err());
    }
}
