use std::path::PathBuf;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::{Query, State},
    http::{
        HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName},
    },
    response::{IntoResponse, Response},
};
use futures::stream::StreamExt;
use once_cell::sync::Lazy;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use regex::Regex;
use serde::Deserialize;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::downloader::{self, Downloaded, FormatKind};
use crate::errors::DownloadError;
use crate::metadata::validate_youtube_url;
use crate::sessions::SessionStore;
use crate::state::AppState;

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s\-.]").unwrap());

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub url: Option<String>,
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default)]
    pub format: FormatKind,
    #[serde(rename = "downloadId")]
    pub download_id: Option<String>,
    pub title: Option<String>,
    /// Total media seconds, from previously fetched metadata; enables
    /// duration-relative merge progress.
    pub duration: Option<f64>,
}

/// Browser-navigation variant of the start request (`GET ?url=…&id=…`),
/// which downloads straight into the page without a fetch call.
#[derive(Debug, Deserialize)]
pub struct StartQuery {
    pub url: Option<String>,
    pub id: Option<String>,
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default)]
    pub format: FormatKind,
    pub title: Option<String>,
    pub duration: Option<f64>,
}

fn default_quality() -> String {
    "best".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    pub id: Option<String>,
}

pub async fn start_post(State(state): State<AppState>, Json(req): Json<StartRequest>) -> Response {
    perform_download(state, req).await
}

pub async fn start_get(State(state): State<AppState>, Query(q): Query<StartQuery>) -> Response {
    perform_download(
        state,
        StartRequest {
            url: q.url,
            quality: q.quality,
            format: q.format,
            download_id: q.id,
            title: q.title,
            duration: q.duration,
        },
    )
    .await
}

pub async fn cancel_download(
    State(state): State<AppState>,
    Query(q): Query<CancelQuery>,
) -> Response {
    let Some(id) = q.id.filter(|id| !id.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Download ID required");
    };

    if state.sessions.cancel(&id) {
        Json(serde_json::json!({ "success": true })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Download not found" })),
        )
            .into_response()
    }
}

async fn perform_download(state: AppState, req: StartRequest) -> Response {
    let Some(url) = req.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "URL is required");
    };
    if !validate_youtube_url(url) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid YouTube URL");
    }

    let id = req
        .download_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("dl_{}", Uuid::new_v4().simple()));

    info!("[{}] Starting download: {} quality, {:?}", id, req.quality, req.format);
    let token = state.sessions.insert(&id, req.duration);

    let result = downloader::run(
        &state.settings,
        &state.sessions,
        &id,
        url,
        &req.quality,
        req.format,
        token,
    )
    .await;

    match result {
        Ok(downloaded) => {
            state.sessions.mark_streaming(&id);
            // Give the progress stream one tick to observe the hand-off
            // before the response starts.
            tokio::time::sleep(Duration::from_millis(100)).await;
            info!("[{}] Download complete, streaming to client", id);
            deliver(&state, &id, downloaded, req.title.as_deref()).await
        }
        Err(DownloadError::Cancelled) => {
            info!("[{}] Download aborted", id);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Download cancelled")
        }
        Err(e) => {
            error!("[{}] Download failed: {}", id, e);
            state.sessions.mark_error(&id, &e.to_string());
            state.sessions.remove_after_grace(&id);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// Streams the produced file to the client and deletes it afterwards.
async fn deliver(state: &AppState, id: &str, downloaded: Downloaded, title: Option<&str>) -> Response {
    let file = match File::open(&downloaded.file_path).await {
        Ok(f) => f,
        Err(e) => {
            error!("[{}] Produced file unreadable: {} ({:?})", id, e, downloaded.file_path);
            state.sessions.remove(id);
            let _ = tokio::fs::remove_file(&downloaded.file_path).await;
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Downloaded file unreadable");
        }
    };

    let size = match file.metadata().await {
        Ok(m) => m.len(),
        Err(e) => {
            error!("[{}] Failed to stat produced file: {}", id, e);
            state.sessions.remove(id);
            let _ = tokio::fs::remove_file(&downloaded.file_path).await;
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Downloaded file unreadable");
        }
    };

    let ext = downloaded
        .file_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4")
        .to_lowercase();
    let content_type = mime_guess::from_path(&downloaded.file_path).first_or_octet_stream();
    let filename = attachment_filename(title, &downloaded.file_name, &ext);

    // The guard travels inside the stream closure; dropping the stream —
    // normal end or client cancel — triggers the delayed cleanup.
    let guard = DeliveryGuard {
        sessions: state.sessions.clone(),
        id: id.to_string(),
        path: downloaded.file_path.clone(),
    };
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _held = &guard;
        chunk
    });

    let mut headers = HeaderMap::new();
    if let Ok(val) = HeaderValue::from_str(content_type.as_ref()) {
        headers.insert(CONTENT_TYPE, val);
    }
    if let Ok(val) = HeaderValue::from_str(&content_disposition(&filename)) {
        headers.insert(CONTENT_DISPOSITION, val);
    }
    if let Ok(val) = HeaderValue::from_str(&size.to_string()) {
        headers.insert(CONTENT_LENGTH, val);
    }
    if let Ok(val) = HeaderValue::from_str(id) {
        headers.insert(HeaderName::from_static("x-download-id"), val);
    }

    (headers, Body::from_stream(stream)).into_response()
}

/// Title → safe attachment filename: strip everything outside word
/// characters, whitespace, hyphen and dot, then ensure the extension.
/// Falls back to the produced file's own name when no usable title.
fn attachment_filename(title: Option<&str>, fallback: &str, ext: &str) -> String {
    let safe = title
        .map(|t| UNSAFE_FILENAME_CHARS.replace_all(t, "").trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| fallback.to_string());
    let suffix = format!(".{}", ext);
    if safe.ends_with(&suffix) { safe } else { format!("{}{}", safe, suffix) }
}

/// Plain quoted filename for legacy clients, RFC 5987 `filename*` for
/// anything in the title that survived sanitization beyond ASCII.
fn content_disposition(filename: &str) -> String {
    if filename.is_ascii() {
        format!("attachment; filename=\"{}\"", filename)
    } else {
        let encoded = utf8_percent_encode(filename, NON_ALPHANUMERIC);
        let fallback: String = filename.chars().filter(char::is_ascii).collect();
        format!("attachment; filename=\"{}\"; filename*=UTF-8''{}", fallback, encoded)
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}

/// Deletes the temp file and drops the session entry shortly after the
/// transfer ends, leaving the terminal record briefly visible to the
/// progress stream.
struct DeliveryGuard {
    sessions: SessionStore,
    id: String,
    path: PathBuf,
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let id = std::mem::take(&mut self.id);
        let path = std::mem::take(&mut self.path);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                sessions.remove(&id);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => info!("[{}] Cleaned up temp file", id),
                    Err(e) => warn!("[{}] Failed to delete temp file: {}", id, e),
                }
            });
        } else {
            sessions.remove(&id);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("[{}] Failed to delete temp file: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(
            attachment_filename(Some("My Video: Part 1!"), "dl_1.mp4", "mp4"),
            "My Video Part 1.mp4"
        );
        assert_eq!(attachment_filename(Some("clip.mp4"), "dl_1.mp4", "mp4"), "clip.mp4");
        assert_eq!(attachment_filename(Some("???"), "dl_1.mp3", "mp3"), "dl_1.mp3");
        assert_eq!(attachment_filename(None, "dl_1.mp3", "mp3"), "dl_1.mp3");
    }

    #[test]
    fn disposition_header_escapes_non_ascii() {
        assert_eq!(
            content_disposition("clip.mp4"),
            "attachment; filename=\"clip.mp4\""
        );
        let value = content_disposition("café.mp4");
        assert!(value.contains("filename*=UTF-8''caf%C3%A9%2Emp4"));
        assert!(value.contains("filename=\"caf.mp4\""));
    }
}
