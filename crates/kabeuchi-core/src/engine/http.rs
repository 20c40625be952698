// ── Kabeuchi Engine: HTTP Client & Transport ───────────────────────────────
//
// One certificate-pinned reqwest::Client shared by the agent transport and
// the managed identity credential.
//
// Features:
//   • rustls ClientConfig built from the Mozilla root store only (the OS
//     trust store is ignored)
//   • 10s connect timeout; no overall request timeout, since the dispatcher
//     owns the deadline
//   • `ReqwestTransport`: the production `AgentTransport`

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use rustls::ClientConfig;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::atoms::constants::CONNECT_TIMEOUT_SECS;
use crate::atoms::traits::AgentTransport;
use crate::atoms::types::TransportResponse;

// ── Certificate-Pinned Client Factory ──────────────────────────────────────

/// Build a `rustls::ClientConfig` pinned to the Mozilla root certificates.
///
/// Uses an explicit `ring` CryptoProvider rather than the process-level
/// default so the config works in unit-test binaries where no global
/// provider has been installed.
fn pinned_tls_config() -> ClientConfig {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("Failed to set default TLS protocol versions")
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

static PINNED_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .use_preconfigured_tls(pinned_tls_config())
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()
        .expect("Failed to build certificate-pinned reqwest::Client")
});

/// Get the shared certificate-pinned HTTP client (one connection pool).
pub fn pinned_client() -> Client {
    PINNED_CLIENT.clone()
}

// ── Agent transport ────────────────────────────────────────────────────────

/// `AgentTransport` over reqwest. Cancellation is by dropping the future.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        ReqwestTransport { client: pinned_client() }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, bearer: &str, body: &Value) -> Result<TransportResponse, String> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("HTTP request failed: {}", e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| format!("Failed to read response body: {}", e))?;
        debug!("[http] POST {} -> {} ({} bytes)", url, status, body.len());
        Ok(TransportResponse { status, body })
    }
}
