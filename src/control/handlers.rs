//! Control plane request handlers

use super::error::{ApiError, ApiResult};
use super::ControlContext;
use crate::store::entities::{activity_event, exclude, file, root, server};
use crate::store::{ActivityKind, Created, FileFilter, NewServer};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn default_true() -> bool {
	true
}

#[derive(Debug, Deserialize)]
pub struct CreateRootRequest {
	pub path: String,
	#[serde(default = "default_true")]
	pub recursive: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateExcludeRequest {
	pub pattern: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
	pub name: String,
	pub base_url: String,
	pub username: String,
	pub password: String,
	#[serde(default)]
	pub is_default: bool,
}

/// Server rows never leave the daemon with credentials attached.
#[derive(Debug, Serialize)]
pub struct ServerResponse {
	pub id: i32,
	pub name: String,
	pub base_url: String,
	pub username: String,
	pub is_default: bool,
	pub has_token: bool,
	pub created_at: DateTime<Utc>,
}

impl From<server::Model> for ServerResponse {
	fn from(model: server::Model) -> Self {
		Self {
			id: model.id,
			name: model.name,
			base_url: model.base_url,
			username: model.username,
			is_default: model.is_default,
			has_token: model.token.is_some(),
			created_at: model.created_at,
		}
	}
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
	pub id: i64,
	pub created_at: DateTime<Utc>,
	pub kind: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub file_path: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub root_id: Option<i32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<serde_json::Value>,
}

impl From<activity_event::Model> for EventResponse {
	fn from(model: activity_event::Model) -> Self {
		Self {
			id: model.id,
			created_at: model.created_at,
			kind: model.kind,
			file_path: model.file_path,
			root_id: model.root_id,
			message: model.message,
			details: model.details,
		}
	}
}

pub async fn health(State(ctx): State<Arc<ControlContext>>) -> Response {
	if ctx.store.healthy().await {
		Json(json!({ "status": "ok", "store": "ok" })).into_response()
	} else {
		(
			StatusCode::SERVICE_UNAVAILABLE,
			Json(json!({ "status": "degraded", "store": "unhealthy" })),
		)
			.into_response()
	}
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
	pub version: &'static str,
	pub uptime_secs: u64,
	pub scanner_active: bool,
	pub fingerprinter_active: bool,
	pub watcher_active: bool,
	pub uploader_active: bool,
	pub upload_content: bool,
	pub files_tracked: u64,
	pub files_completed: u64,
	pub files_failed: u64,
	pub pending_sha256: u64,
	pub pending_uploads: u64,
	pub pending_deletions: u64,
}

pub async fn status(State(ctx): State<Arc<ControlContext>>) -> ApiResult<Json<StatusResponse>> {
	let stats = ctx.store.stats().await?;
	let status = &ctx.status;
	Ok(Json(StatusResponse {
		version: status.version,
		uptime_secs: status.started_at.elapsed().as_secs(),
		scanner_active: status.scanner_active(),
		fingerprinter_active: status.fingerprinter_active.load(Ordering::Relaxed),
		watcher_active: ctx.watchers.active_count() > 0,
		uploader_active: status.uploads_in_flight.load(Ordering::Relaxed) > 0,
		upload_content: status.upload_content.load(Ordering::Relaxed),
		files_tracked: stats.files_tracked,
		files_completed: stats.files_completed,
		files_failed: stats.files_failed,
		pending_sha256: stats.pending_sha256,
		pending_uploads: stats.pending_uploads,
		pending_deletions: stats.pending_deletions,
	}))
}

pub async fn list_roots(
	State(ctx): State<Arc<ControlContext>>,
) -> ApiResult<Json<Vec<root::Model>>> {
	Ok(Json(ctx.store.list_roots().await?))
}

pub async fn create_root(
	State(ctx): State<Arc<ControlContext>>,
	Json(req): Json<CreateRootRequest>,
) -> ApiResult<Response> {
	match ctx.store.create_root(&req.path, req.recursive).await? {
		Created::New(model) => {
			ctx.watchers.start(model.clone());
			Ok((StatusCode::CREATED, Json(model)).into_response())
		}
		Created::Existing(model) => Ok((
			StatusCode::CONFLICT,
			Json(json!({ "error": "root already registered", "id": model.id })),
		)
			.into_response()),
	}
}

pub async fn delete_root(
	State(ctx): State<Arc<ControlContext>>,
	Path(id): Path<i32>,
) -> ApiResult<StatusCode> {
	ctx.watchers.stop(id);
	ctx.store.delete_root(id).await?;
	Ok(StatusCode::NO_CONTENT)
}

pub async fn scan_root(
	State(ctx): State<Arc<ControlContext>>,
	Path(id): Path<i32>,
) -> ApiResult<Response> {
	let root = ctx.store.get_root(id).await?;
	let scanner = ctx.scanner.clone();
	let scans = ctx.status.scans_in_flight.clone();
	tokio::spawn(async move {
		scans.fetch_add(1, Ordering::Relaxed);
		let _ = scanner.scan(&root).await;
		scans.fetch_sub(1, Ordering::Relaxed);
	});
	Ok((
		StatusCode::ACCEPTED,
		Json(json!({ "root_id": id, "state": "scheduled" })),
	)
		.into_response())
}

pub async fn scan_all(State(ctx): State<Arc<ControlContext>>) -> Response {
	let scanner = ctx.scanner.clone();
	let scans = ctx.status.scans_in_flight.clone();
	tokio::spawn(async move {
		scans.fetch_add(1, Ordering::Relaxed);
		let _ = scanner.scan_all().await;
		scans.fetch_sub(1, Ordering::Relaxed);
	});
	(StatusCode::ACCEPTED, Json(json!({ "state": "scheduled" }))).into_response()
}

pub async fn list_excludes(
	State(ctx): State<Arc<ControlContext>>,
) -> ApiResult<Json<Vec<exclude::Model>>> {
	Ok(Json(ctx.store.list_excludes().await?))
}

pub async fn create_exclude(
	State(ctx): State<Arc<ControlContext>>,
	Json(req): Json<CreateExcludeRequest>,
) -> ApiResult<Response> {
	match ctx.store.create_exclude(&req.pattern).await? {
		Created::New(model) => Ok((StatusCode::CREATED, Json(model)).into_response()),
		Created::Existing(model) => Ok((
			StatusCode::CONFLICT,
			Json(json!({ "error": "pattern already exists", "id": model.id })),
		)
			.into_response()),
	}
}

pub async fn delete_exclude(
	State(ctx): State<Arc<ControlContext>>,
	Path(id): Path<i32>,
) -> ApiResult<StatusCode> {
	ctx.store.delete_exclude(id).await?;
	Ok(StatusCode::NO_CONTENT)
}

pub async fn list_servers(
	State(ctx): State<Arc<ControlContext>>,
) -> ApiResult<Json<Vec<ServerResponse>>> {
	let servers = ctx.store.list_servers().await?;
	Ok(Json(servers.into_iter().map(Into::into).collect()))
}

pub async fn create_server(
	State(ctx): State<Arc<ControlContext>>,
	Json(req): Json<CreateServerRequest>,
) -> ApiResult<Response> {
	let created = ctx
		.store
		.create_server(NewServer {
			name: req.name,
			base_url: req.base_url,
			username: req.username,
			secret: req.password,
			is_default: req.is_default,
		})
		.await?;
	match created {
		Created::New(model) => Ok((
			StatusCode::CREATED,
			Json(ServerResponse::from(model)),
		)
			.into_response()),
		Created::Existing(model) => Ok((
			StatusCode::CONFLICT,
			Json(json!({ "error": "server name already exists", "id": model.id })),
		)
			.into_response()),
	}
}

pub async fn delete_server(
	State(ctx): State<Arc<ControlContext>>,
	Path(id): Path<i32>,
) -> ApiResult<StatusCode> {
	ctx.store.delete_server(id).await?;
	Ok(StatusCode::NO_CONTENT)
}

pub async fn set_default_server(
	State(ctx): State<Arc<ControlContext>>,
	Path(id): Path<i32>,
) -> ApiResult<Json<ServerResponse>> {
	Ok(Json(ctx.store.set_default_server(id).await?.into()))
}

#[derive(Debug, Default, Deserialize)]
pub struct FilesQuery {
	pub path_prefix: Option<String>,
	pub sha256: Option<String>,
	pub limit: Option<u64>,
	pub offset: Option<u64>,
}

pub async fn list_files(
	State(ctx): State<Arc<ControlContext>>,
	Query(query): Query<FilesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
	let files = ctx
		.store
		.list_files(FileFilter {
			path_prefix: query.path_prefix,
			sha256: query.sha256,
			limit: query.limit.unwrap_or(100),
			offset: query.offset.unwrap_or(0),
		})
		.await?;
	Ok(Json(json!({ "count": files.len(), "files": files })))
}

pub async fn get_file(
	State(ctx): State<Arc<ControlContext>>,
	Path(id): Path<i32>,
) -> ApiResult<Json<file::Model>> {
	Ok(Json(ctx.store.get_file(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerUploadsRequest {
	pub upload_content: Option<bool>,
	pub path_prefix: Option<String>,
	pub limit: Option<u64>,
}

pub async fn trigger_uploads(
	State(ctx): State<Arc<ControlContext>>,
	Json(req): Json<TriggerUploadsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
	if let Some(upload_content) = req.upload_content {
		ctx.status
			.upload_content
			.store(upload_content, Ordering::Relaxed);
	}
	let queued = ctx
		.store
		.trigger_uploads(req.path_prefix.as_deref(), req.limit)
		.await?;
	Ok(Json(json!({ "files_queued": queued })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityQuery {
	pub limit: Option<u64>,
	pub since_id: Option<i64>,
	pub kind: Option<String>,
}

pub async fn list_activity(
	State(ctx): State<Arc<ControlContext>>,
	Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<serde_json::Value>> {
	let kind = query
		.kind
		.as_deref()
		.map(|k| {
			k.parse::<ActivityKind>()
				.map_err(|_| ApiError::bad_request(format!("unknown activity kind: {k}")))
		})
		.transpose()?;
	let events = ctx
		.store
		.read_activity(query.since_id.unwrap_or(0), query.limit.unwrap_or(100), kind)
		.await?;
	let events: Vec<EventResponse> = events.into_iter().map(Into::into).collect();
	Ok(Json(json!({ "events": events })))
}
