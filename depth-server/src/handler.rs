//! HTTP handlers for session lifecycle: upload, status, delete. The
//! WebSocket streaming endpoint lives in `websocket.rs`.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use depth_core::error::DepthError;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use crate::AppState;

/// Wraps any error as a 500 unless constructed directly with a specific
/// status, generalizing the teacher's `handler::AppError(anyhow::Error)`
/// (which always maps to 500) so session-not-found can surface as 404.
pub struct AppError {
    status: StatusCode,
    message: String,
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    fn not_found(message: impl Into<String>) -> Self {
        AppError {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        AppError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(e: E) -> Self {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.into().to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn session_error(err: DepthError) -> AppError {
    match err {
        DepthError::SessionNotFound => AppError::not_found("session not found"),
        other => AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: other.to_string(),
        },
    }
}

/// `POST /api/sessions` — streams a multipart upload to disk and opens a
/// decoder pool over it, in 1 MiB-ish chunks as they arrive off the wire
/// (matching the original's `await upload.read(1024 * 1024)` loop; the
/// exact chunk boundaries are whatever `multer` hands back, not a hard
/// 1 MiB cut).
pub async fn create_session(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<Value>> {
    let (session_id, target) = state.manager.reserve_upload_path();
    let dir = target
        .parent()
        .expect("reserve_upload_path always returns a path with a parent");
    tokio::fs::create_dir_all(dir).await?;

    let mut file = tokio::fs::File::create(&target).await?;
    let mut wrote_any = false;
    while let Some(mut field) = multipart.next_field().await? {
        while let Some(chunk) = field.chunk().await? {
            file.write_all(&chunk).await?;
            wrote_any = true;
        }
    }
    file.flush().await?;

    if !wrote_any {
        let _ = tokio::fs::remove_dir_all(dir).await;
        return Err(AppError::bad_request("upload contained no file data"));
    }

    let session = state
        .manager
        .register_session(session_id, target)
        .await
        .map_err(session_error)?;

    Ok(Json(json!({
        "session_id": session.session_id,
        "width": session.metadata.width,
        "height": session.metadata.height,
        "fps": session.metadata.fps,
        "duration_ms": session.metadata.duration_ms,
    })))
}

/// `DELETE /api/sessions/{id}`
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Value>> {
    state
        .manager
        .delete_session(&session_id)
        .await
        .map_err(session_error)?;
    Ok(Json(json!({ "status": "deleted" })))
}

/// `GET /api/sessions/{id}/status`
pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Value>> {
    let session = state
        .manager
        .get(&session_id)
        .await
        .ok_or_else(|| AppError::not_found("session not found"))?;

    let snapshot = session.buffer_snapshot().await;
    Ok(Json(json!({
        "session_id": session.session_id,
        "metadata": session.metadata,
        "config": {
            "inference_workers": state.settings.inference_worker_count,
            "process_res": session.current_process_res().await,
            "downsample_factor": state.settings.depth_downsample_factor,
        },
        "buffer_snapshot": snapshot,
    })))
}
