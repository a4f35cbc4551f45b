//! Web layer.
//!
//! Thin axum handlers over the resolver: the two proxy routes, liveness,
//! and a small admin surface for the backoff gate. HTTPS termination is a
//! reverse proxy's job.

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    backoff::BackoffGate, config::Config, index::ProgramImageIndex, resolver::PosterResolver,
};

pub mod handlers;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<PosterResolver>,
    pub gate: Arc<BackoffGate>,
    pub index: Arc<ProgramImageIndex>,
    pub cache_dir: PathBuf,
}

/// Build the full route table over the given state. Exposed separately so
/// tests can drive the router without binding a socket.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // On-demand poster proxy. First request downloads from upstream and
        // stores by image id; later requests serve from disk.
        .route("/proxy/sd/:program_id", get(handlers::serve_poster))
        .route(
            "/proxy/sd/:program_id/:image_id",
            get(handlers::serve_pinned_poster),
        )
        .route("/api/v1/status", get(handlers::status))
        .route("/api/v1/pause/clear", post(handlers::clear_pause))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(
        config: &Config,
        resolver: Arc<PosterResolver>,
        gate: Arc<BackoffGate>,
        index: Arc<ProgramImageIndex>,
    ) -> Result<Self> {
        let app = build_router(AppState {
            resolver,
            gate,
            index,
            cache_dir: config.storage.cache_dir.clone(),
        });
        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;
        Ok(Self { app, addr })
    }

    /// Start the web server
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app).await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
