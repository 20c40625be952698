// Kabeuchi Commands — Chat
//
//   POST /api/chat  { "message": "…" }
//     → 200 { "response": "…", "meta": { "model": "…", "toolsUsed": [...] } }
//     → 400 { "error": "…" }  empty or over-long message
//
// Agent failures are still 200: the dispatcher has already turned them into
// text the chat window can show.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kabeuchi_core::DispatchResult;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub meta: ChatMeta,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMeta {
    pub model: Option<String>,
    pub tools_used: Vec<String>,
}

impl From<DispatchResult> for ChatResponse {
    fn from(r: DispatchResult) -> Self {
        ChatResponse {
            response: r.response_text,
            meta: ChatMeta { model: r.model_identifier, tools_used: r.tools_used },
        }
    }
}

/// Trimmed message, or the reason it cannot be sent.
pub fn validate_message(message: &str, max_chars: usize) -> Result<&str, String> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err("Message is empty".into());
    }
    let len = trimmed.chars().count();
    if len > max_chars {
        return Err(format!("Message is too long ({len} characters, max {max_chars})"));
    }
    Ok(trimmed)
}

pub async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Response {
    let message = match validate_message(&request.message, state.config.max_message_chars) {
        Ok(m) => m,
        Err(reason) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response(),
    };

    // axum drops this future when the client disconnects; the guard turns
    // that drop into a cancellation the dispatcher can see.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    info!("[server] Chat message ({} chars)", message.chars().count());
    let result = state.dispatcher.dispatch(message, &cancel).await;
    Json(ChatResponse::from(result)).into_response()
}
