// ── Kabeuchi Atoms: Data Types ─────────────────────────────────────────────
// Per-call values of the dispatch engine. All are created fresh for one
// dispatch and dropped when it completes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Protocol variants ──────────────────────────────────────────────────────

/// Path layout of the remote responses endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlShape {
    /// `{endpoint}/openai/responses?api-version=...`
    Responses,
    /// `{endpoint}/openai/v1/responses?api-version=...`
    V1Responses,
}

impl UrlShape {
    pub fn path(&self) -> &'static str {
        match self {
            UrlShape::Responses => "/openai/responses",
            UrlShape::V1Responses => "/openai/v1/responses",
        }
    }
}

/// One (URL shape, api-version) pairing the dispatcher is willing to try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVariant {
    pub shape: UrlShape,
    pub version: String,
}

impl ProtocolVariant {
    pub fn new(shape: UrlShape, version: impl Into<String>) -> Self {
        ProtocolVariant { shape, version: version.into() }
    }

    pub fn responses(version: impl Into<String>) -> Self {
        Self::new(UrlShape::Responses, version)
    }

    /// Full request URL for this variant against `endpoint`.
    pub fn url(&self, endpoint: &str) -> String {
        format!(
            "{}{}?api-version={}",
            endpoint.trim_end_matches('/'),
            self.shape.path(),
            urlencoding::encode(&self.version)
        )
    }

    /// Case-insensitive identity used for de-duplication.
    pub(crate) fn dedup_key(&self) -> (UrlShape, String) {
        (self.shape, self.version.to_lowercase())
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?api-version={}", self.shape.path(), self.version)
    }
}

// ── Request / result ───────────────────────────────────────────────────────

/// Everything one dispatch needs to talk to the agent. Immutable per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub message: String,
    pub agent_name: String,
    pub variants: Vec<ProtocolVariant>,
}

impl DispatchRequest {
    /// Outbound JSON body. Identical for every variant.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "input": self.message,
            "agent": {
                "name": self.agent_name,
                "type": crate::atoms::constants::AGENT_REFERENCE_TYPE,
            },
        })
    }
}

/// The reply handed back to the caller. On failure `response_text` holds a
/// user-presentable explanation and the metadata is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub response_text: String,
    pub model_identifier: Option<String>,
    /// Deduplicated and sorted case-insensitively.
    pub tools_used: Vec<String>,
}

impl DispatchResult {
    pub fn text(text: impl Into<String>) -> Self {
        DispatchResult { response_text: text.into(), ..Default::default() }
    }
}

// ── Credentials ────────────────────────────────────────────────────────────

/// A bearer token. The secret never appears in `Debug` output.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub scope: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// True when the token expires within `margin_secs` (or already has).
    /// Tokens without a known expiry never go stale.
    pub fn expires_within(&self, margin_secs: i64, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at - chrono::Duration::seconds(margin_secs) <= now,
            None => false,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ── Transport ──────────────────────────────────────────────────────────────

/// Status and body of one HTTP exchange, success or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Cut `s` to at most `max_bytes` without splitting a UTF-8 character.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
