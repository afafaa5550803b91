//! REST API routes

use crate::config;
use crate::db::{Download, DownloadStatus};
use crate::download::{DownloadStats, NewDownload};
use crate::error::ManagerError;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Create API routes
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Downloads
        .route("/downloads", get(list_downloads).post(add_download))
        .route("/downloads/stats", get(download_stats))
        .route("/downloads/{id}", get(get_download).delete(remove_download))
        .route("/downloads/{id}/pause", post(pause_download))
        .route("/downloads/{id}/resume", post(resume_download))
        // Settings
        .route("/settings", get(get_settings).put(update_settings))
}

/// Envelope around every API payload
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: &'static str,
    pub data: Option<T>,
    pub err: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            status: "ok",
            data: Some(data),
            err: String::new(),
        })
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;

// ============ Download Endpoints ============

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Substring of the file name
    pub q: Option<String>,
    pub status: Option<String>,
}

/// List downloads, newest first
async fn list_downloads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Download>> {
    let manager = &state.download_manager;

    let downloads = match (query.q.as_deref(), query.status.as_deref()) {
        (Some(text), _) if !text.trim().is_empty() => manager.search_downloads(text.trim())?,
        (_, Some(status)) => {
            let status = DownloadStatus::parse(status)
                .ok_or_else(|| AppError::BadRequest(format!("unknown status `{status}`")))?;
            manager.list_by_status(status)?
        }
        _ => manager.list_downloads()?,
    };

    Ok(ApiResponse::ok(downloads))
}

/// Response after adding a download
#[derive(Debug, Serialize)]
pub struct AddDownloadResponse {
    pub id: String,
    pub queued: bool,
}

/// Add a new download
async fn add_download(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewDownload>,
) -> ApiResult<AddDownloadResponse> {
    let id = state.download_manager.start_download(req).await?;
    let queued = state.download_manager.is_queued(&id);
    Ok(ApiResponse::ok(AddDownloadResponse { id, queued }))
}

async fn get_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Download> {
    Ok(ApiResponse::ok(state.download_manager.get_download(&id)?))
}

/// Pause an active download; responds once the offsets are persisted
async fn pause_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Download> {
    Ok(ApiResponse::ok(state.download_manager.pause_download(&id).await?))
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub queued: bool,
}

async fn resume_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ResumeResponse> {
    let queued = state.download_manager.resume_download(&id).await?;
    Ok(ApiResponse::ok(ResumeResponse { queued }))
}

/// Remove a download
async fn remove_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    state.download_manager.delete_download(&id).await?;
    Ok(ApiResponse::ok(()))
}

/// Get download statistics
async fn download_stats(State(state): State<Arc<AppState>>) -> ApiResult<DownloadStats> {
    Ok(ApiResponse::ok(state.download_manager.stats()))
}

// ============ Settings Endpoints ============

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub server_port: u16,
    pub max_concurrent_downloads: usize,
    pub save_path: PathBuf,
    pub merge_strategy: config::MergeStrategyKind,
}

impl SettingsResponse {
    fn from_settings(settings: &config::Settings) -> Self {
        Self {
            server_port: settings.server.port,
            max_concurrent_downloads: settings.max_concurrent_downloads,
            save_path: settings.downloads.save_path.clone(),
            merge_strategy: settings.merge.strategy,
        }
    }
}

/// Get current settings
async fn get_settings(State(state): State<Arc<AppState>>) -> ApiResult<SettingsResponse> {
    let settings = state.settings.read();
    Ok(ApiResponse::ok(SettingsResponse::from_settings(&settings)))
}

/// Update settings request
#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    pub max_concurrent_downloads: Option<usize>,
    pub save_path: Option<PathBuf>,
}

/// Update settings
async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateSettingsRequest>,
) -> ApiResult<SettingsResponse> {
    let mut settings = state.settings.write();

    if let Some(max) = req.max_concurrent_downloads {
        if max == 0 {
            return Err(AppError::BadRequest(
                "max_concurrent_downloads must be at least 1".into(),
            ));
        }
        settings.max_concurrent_downloads = max;
        state.download_manager.set_max_concurrent(max);
    }

    if let Some(save_path) = req.save_path {
        info!("Default save path: {}", save_path.display());
        settings.downloads.save_path = save_path.clone();
        state.download_manager.set_save_path(save_path);
    }

    // Save to file
    config::save_at(&state.config_path, &settings)?;

    Ok(ApiResponse::ok(SettingsResponse::from_settings(&settings)))
}

// ============ Error Handling ============

/// Application error type
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Internal(msg) => {
                error!("Request failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(ApiResponse::<()> {
            status: "err",
            data: None,
            err: message,
        });
        (status, body).into_response()
    }
}

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        let message = err.to_string();
        match err {
            ManagerError::NotFound(_) => AppError::NotFound(message),
            ManagerError::InvalidState { .. } => AppError::Conflict(message),
            ManagerError::InvalidRequest(_) => AppError::BadRequest(message),
            ManagerError::Probe { .. } => AppError::BadGateway(message),
            ManagerError::Registry(_) => AppError::Internal(message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
