// Kabeuchi Commands — Diagnostics
// GET /api/diagnostics: what the server would call, for checking a
// deployment. Configuration only; never a token.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub endpoint: Option<String>,
    pub agent_name: Option<String>,
    pub api_version: String,
    pub primary_url: Option<String>,
    pub candidate_urls: Vec<String>,
    pub environment: kabeuchi_core::DeploymentEnvironment,
    pub credential: String,
    pub token_scope: String,
    pub timeout_secs: u64,
    pub max_message_chars: usize,
}

pub async fn diagnostics(State(state): State<AppState>) -> Json<Diagnostics> {
    let agent = &state.config.agent;
    let urls = state.dispatcher.candidate_urls();
    Json(Diagnostics {
        endpoint: agent.endpoint().map(str::to_string),
        agent_name: agent.agent_name().map(str::to_string),
        api_version: agent.preferred_api_version().to_string(),
        primary_url: urls.first().cloned(),
        candidate_urls: urls,
        environment: agent.environment,
        credential: state.dispatcher.credential_name().to_string(),
        token_scope: agent.token_scope.clone(),
        timeout_secs: state.dispatcher.timeout().as_secs(),
        max_message_chars: state.config.max_message_chars,
    })
}
