use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Deserialize;
use tracing::error;

use crate::errors::MetadataError;
use crate::media::available_qualities;
use crate::metadata;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MetadataRequest {
    pub url: Option<String>,
}

pub async fn fetch_metadata(
    State(state): State<AppState>,
    Json(req): Json<MetadataRequest>,
) -> impl IntoResponse {
    let Some(url) = req.url.filter(|u| !u.trim().is_empty()) else {
        return envelope_error(StatusCode::BAD_REQUEST, "URL is required");
    };

    match metadata::fetch(&state.settings, &url).await {
        Ok(meta) => {
            let qualities = available_qualities(&meta);
            let mut data = serde_json::to_value(&meta).unwrap_or_default();
            if let Some(obj) = data.as_object_mut() {
                obj.insert(
                    "availableQualities".to_string(),
                    serde_json::to_value(qualities).unwrap_or_default(),
                );
            }
            (
                StatusCode::OK,
                Json(serde_json::json!({ "success": true, "data": data })),
            )
        }
        Err(MetadataError::InvalidUrl) => {
            envelope_error(StatusCode::BAD_REQUEST, &MetadataError::InvalidUrl.to_string())
        }
        Err(e) => {
            error!("Metadata fetch failed: {}", e);
            envelope_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch video metadata. Make sure yt-dlp is installed.",
            )
        }
    }
}

fn envelope_error(status: StatusCode, message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "success": false, "error": message })))
}
