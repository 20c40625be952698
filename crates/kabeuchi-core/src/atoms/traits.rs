// ── Kabeuchi Atoms: Seam Traits ────────────────────────────────────────────
// The two collaborators the dispatcher talks to. Production implementations
// live in engine/; tests plug in stubs.

use async_trait::async_trait;
use serde_json::Value;

use crate::atoms::error::EngineResult;
use crate::atoms::types::{AccessToken, TransportResponse};

/// Anything that can produce a bearer token for a scope.
///
/// Implementations may cache internally but must be safe to call from many
/// dispatches at once.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Short label for logs and diagnostics ("developer", "managed_identity", …).
    fn name(&self) -> &str;

    async fn get_token(&self, scope: &str) -> EngineResult<AccessToken>;
}

/// Sends one authenticated JSON POST.
///
/// Non-2xx statuses are *not* errors here; they come back as a
/// [`TransportResponse`] so the dispatcher can classify them. `Err` means the
/// exchange itself failed (connect, DNS, TLS, reading the body).
///
/// Dropping the returned future must abort the request.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn post_json(&self, url: &str, bearer: &str, body: &Value) -> Result<TransportResponse, String>;
}
