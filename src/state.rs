// Kabeuchi Server — Shared State
// Cloned into every handler by axum. The dispatcher is stateless, so one
// instance serves all requests concurrently.

use kabeuchi_core::AgentDispatcher;
use std::sync::Arc;

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<AgentDispatcher>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(dispatcher: AgentDispatcher, config: ServerConfig) -> Self {
        AppState { dispatcher: Arc::new(dispatcher), config: Arc::new(config) }
    }
}
