use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;

use super::AppState;
use crate::errors::FetchError;

/// Clients sometimes request `.../EP012345670000.jpg`; strip the suffix so
/// both spellings hit the same cache entry.
fn normalize_id(raw: &str) -> &str {
    raw.strip_suffix(".jpg").unwrap_or(raw)
}

pub async fn serve_poster(
    Path(program_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    respond(&state, normalize_id(&program_id), None).await
}

pub async fn serve_pinned_poster(
    Path((program_id, image_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    let image_id = normalize_id(&image_id).to_string();
    respond(&state, normalize_id(&program_id), Some(image_id.as_str())).await
}

async fn respond(state: &AppState, program_id: &str, pinned: Option<&str>) -> Response {
    if program_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing program id").into_response();
    }
    match state.resolver.resolve(program_id, pinned).await {
        Ok(file) => serve_cached_file(&file.path),
        Err(e) => error_response(program_id, e),
    }
}

/// Serve a cached poster with aggressive caching headers. The file is
/// immutable for the life of its image id.
fn serve_cached_file(path: &std::path::Path) -> Response {
    let modified = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    match std::fs::read(path) {
        Ok(bytes) => Response::builder()
            .header(header::CONTENT_TYPE, "image/jpeg")
            .header(header::CACHE_CONTROL, "public, max-age=31536000, immutable")
            .header(
                header::LAST_MODIFIED,
                modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            )
            .body(Body::from(bytes))
            .unwrap(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "resolved poster unreadable");
            (StatusCode::NOT_FOUND, "poster not found").into_response()
        }
    }
}

fn error_response(program_id: &str, error: FetchError) -> Response {
    match error {
        FetchError::NotFound => (StatusCode::NOT_FOUND, "no acceptable image").into_response(),
        FetchError::UpstreamThrottled {
            reason,
            retry_after_secs,
        } => Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header(header::RETRY_AFTER, retry_after_secs.to_string())
            .body(Body::from(reason))
            .unwrap(),
        e => {
            warn!(program_id, error = %e, "poster fetch failed");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let pause = match state.gate.active_pause() {
        Some((until, reason)) => json!({
            "active": true,
            "until": until.to_rfc3339(),
            "remaining_seconds": (until - Utc::now()).num_seconds().max(0),
            "reason": reason,
        }),
        None => json!({ "active": false }),
    };

    let cached_files = std::fs::read_dir(&state.cache_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("jpg"))
                .count()
        })
        .unwrap_or(0);

    Json(json!({
        "pause": pause,
        "index_entries": state.index.len().await,
        "cached_files": cached_files,
    }))
}

pub async fn clear_pause(State(state): State<AppState>) -> StatusCode {
    state.gate.clear();
    StatusCode::NO_CONTENT
}
