use std::convert::Infallible;
use std::path::Path as FsPath;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};
use uuid::Uuid;
use vidfetch_core::core::events::ProgressEvent;
use vidfetch_core::models::Platform;
use vidfetch_core::{DownloadError, ErrorKind};

use crate::AppState;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(status_for(kind), message)
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        Self::from_kind(err.kind(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.message,
        }));
        (self.status, body).into_response()
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::FileTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::ServerBusy => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ExtractionFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::UpdateCheckFailed | ErrorKind::Cancelled | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    url: String,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    success: bool,
    download_id: Uuid,
    platform: Platform,
    filename: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    url: String,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

/// Runs a job to completion and answers with its artifact id.
pub async fn download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        debug!("Rejected download body: {}", rejection);
        ApiError::new(StatusCode::BAD_REQUEST, "Request body must be {\"url\": \"...\"}")
    })?;

    let mut handle = state.orchestrator.submit(&request.url).await?;

    while let Some(event) = handle.events.recv().await {
        match event {
            ProgressEvent::Status { .. } => continue,
            ProgressEvent::Complete {
                download_id,
                platform,
                filename,
                ..
            } => {
                return Ok(Json(DownloadResponse {
                    success: true,
                    download_id,
                    platform,
                    filename,
                }));
            }
            ProgressEvent::Error { kind, error, .. } => {
                return Err(ApiError::from_kind(kind, error));
            }
        }
    }

    error!("Job {} ended without a terminal event", handle.job_id);
    Err(DownloadError::Internal.into())
}

fn sse_event(event: &ProgressEvent) -> Event {
    let data = match event {
        ProgressEvent::Status {
            phase,
            message,
            percent,
            ..
        } => json!({
            "status": message,
            "phase": phase,
            "percent": percent,
        }),
        ProgressEvent::Complete {
            download_id,
            platform,
            filename,
            size_bytes,
            ..
        } => json!({
            "download_id": download_id,
            "platform": platform,
            "filename": filename,
            "size_bytes": size_bytes,
        }),
        ProgressEvent::Error { kind, error, .. } => json!({
            "error": error,
            "kind": kind,
        }),
    };

    Event::default().event(event.name()).data(data.to_string())
}

/// Pushes a job's progress as server-sent events. The stream ends after the
/// terminal event; a client that disconnects drops the receiver, which
/// cancels the job.
pub async fn download_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Sse<KeepAliveStream<BoxStream<'static, Result<Event, Infallible>>>> {
    let stream: BoxStream<'static, Result<Event, Infallible>> =
        match state.orchestrator.submit(&params.url).await {
            Ok(handle) => stream::unfold(handle.events, |mut events| async move {
                let event = events.recv().await?;
                Some((Ok(sse_event(&event)), events))
            })
            .boxed(),
            Err(err) => {
                let data = json!({ "error": err.to_string(), "kind": err.kind() });
                let event = Event::default().event("error").data(data.to_string());
                stream::once(async move { Ok(event) }).boxed()
            }
        };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn content_type_for(filename: &str) -> &'static str {
    let ext = FsPath::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "opus" | "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

fn content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        filename,
        urlencoding::encode(filename)
    )
}

pub async fn fetch_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid download id"))?;

    let reader = state.store.open_for_read(id).await?;
    let artifact = reader.artifact;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&artifact.filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(artifact.size_bytes));
    let disposition = HeaderValue::from_str(&content_disposition(&artifact.filename))
        .map_err(|_| ApiError::from(DownloadError::Internal))?;
    headers.insert(CONTENT_DISPOSITION, disposition);

    let body = Body::from_stream(ReaderStream::new(reader.file));
    Ok((headers, body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidfetch_core::ValidationError;

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (
                DownloadError::Validation(ValidationError::UnsupportedHost),
                StatusCode::BAD_REQUEST,
            ),
            (DownloadError::NotFound, StatusCode::NOT_FOUND),
            (DownloadError::file_too_large(500 * 1024 * 1024), StatusCode::PAYLOAD_TOO_LARGE),
            (DownloadError::ServerBusy, StatusCode::SERVICE_UNAVAILABLE),
            (DownloadError::Timeout { seconds: 300 }, StatusCode::GATEWAY_TIMEOUT),
            (
                DownloadError::ExtractionFailed("Download failed".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (DownloadError::Internal, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for("clip.mp4"), "video/mp4");
        assert_eq!(content_type_for("clip.WEBM"), "video/webm");
        assert_eq!(content_type_for("clip"), "application/octet-stream");
    }

    #[test]
    fn disposition_carries_both_filename_forms() {
        assert_eq!(
            content_disposition("My Clip.mp4"),
            "attachment; filename=\"My Clip.mp4\"; filename*=UTF-8''My%20Clip.mp4"
        );
    }
}
