// Kabeuchi Server — HTTP front end
//
// Routes:
//   POST /api/chat         → commands::chat
//   GET  /api/diagnostics  → commands::diagnostics
//   everything else        → static files from `static_dir`
//
// CORS is permissive: the UI may be opened from a different origin during
// development.

pub mod commands;
pub mod config;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use kabeuchi_core::AgentDispatcher;
use log::{info, warn};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::config::ServerConfig;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let static_dir = state.config.static_dir.clone();
    Router::new()
        .route("/api/chat", post(commands::chat::chat))
        .route("/api/diagnostics", get(commands::diagnostics::diagnostics))
        .fallback_service(ServeDir::new(static_dir).append_index_html_on_directories(true))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Build the dispatcher from `config`, bind, and serve until ctrl-c.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    if config.agent.endpoint().is_none() || config.agent.agent_name().is_none() {
        warn!("[server] Agent endpoint or name not configured; chat will report the missing setting");
    }
    let dispatcher = AgentDispatcher::from_config(&config.agent)?;
    let addr = format!("{}:{}", config.bind_address, config.effective_port());
    let state = AppState::new(dispatcher, config);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("[server] Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("[server] Shutting down");
        })
        .await?;
    Ok(())
}
