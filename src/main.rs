mod config;
mod downloader;
mod errors;
mod handlers;
mod lines;
mod media;
mod metadata;
mod parser;
mod sessions;
mod sidecar;
mod smoothing;
mod state;

use axum::{
    Router,
    routing::{get, post},
};
use local_ip_address::local_ip;
use std::net::SocketAddr;
use std::path::Path;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Level, info};
use walkdir::WalkDir;

use crate::config::Settings;
use crate::handlers::{api, download, metadata as metadata_h, progress};
use crate::sessions::SessionStore;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let settings = Settings::new().expect("Failed to load configuration");

    tracing_subscriber::fmt()
        .with_env_filter(&settings.log_level)
        .init();

    info!("Starting Grabtube...");

    if !settings.temp_dir.exists() {
        std::fs::create_dir_all(&settings.temp_dir).expect("Failed to create temp directory");
    }
    sweep_stale_artifacts(&settings.temp_dir);

    let local_ip = local_ip().unwrap_or("127.0.0.1".parse().unwrap());
    let state = AppState {
        settings: settings.clone(),
        sessions: SessionStore::new(),
    };

    let app = create_app(state);

    let port = settings.server_port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on http://{}", addr);
    info!("Network address: http://{}:{}", local_ip, port);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/metadata", post(metadata_h::fetch_metadata))
        .route(
            "/api/download",
            post(download::start_post)
                .get(download::start_get)
                .delete(download::cancel_download),
        )
        .route("/api/progress/{id}", get(progress::progress_stream))
        .route("/api/info", get(api::server_info))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The temp dir holds only this service's transient artifacts; anything
/// present at startup belongs to a previous run and is junk.
fn sweep_stale_artifacts(temp_dir: &Path) {
    let mut removed = 0u32;
    for entry in WalkDir::new(temp_dir).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        info!("Removed {} stale artifact(s) from {:?}", removed, temp_dir);
    }
}
