// Kabeuchi Engine — Credential Providers
//
// Every strategy implements the TokenProvider capability ("give me a bearer
// token for this scope"); AnyCredential picks one from config.
//
//   developer         Azure CLI on a workstation (`az account get-access-token`)
//   managed_identity  App Service identity endpoint, else the VM/IMDS endpoint
//   static            a pre-issued token from config or the environment
//
// The CLI and managed identity strategies are wrapped in CachedCredential so
// one token serves many dispatches until it is close to expiry.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::atoms::constants::{CLI_TOKEN_TIMEOUT_SECS, TOKEN_REFRESH_MARGIN_SECS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::TokenProvider;
use crate::atoms::types::{truncate_utf8, AccessToken};
use crate::engine::config::{AgentConfig, CredentialMode};
use crate::engine::http::pinned_client;

const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const MSI_REQUEST_TIMEOUT_SECS: u64 = 10;

/// `https://ai.azure.com/.default` → `https://ai.azure.com`
pub fn scope_to_resource(scope: &str) -> &str {
    scope.trim_end_matches("/.default")
}

// ── Provider factory ───────────────────────────────────────────────────────

/// Type-erased credential strategy chosen from `AgentConfig`.
pub struct AnyCredential(Box<dyn TokenProvider>);

impl AnyCredential {
    pub fn from_config(config: &AgentConfig) -> EngineResult<Self> {
        let provider: Box<dyn TokenProvider> = match config.credential_mode() {
            CredentialMode::Developer => Box::new(CachedCredential::new(DeveloperCredential::new())),
            CredentialMode::ManagedIdentity => Box::new(CachedCredential::new(
                ManagedIdentityCredential::from_env(config.managed_identity_client_id.clone()),
            )),
            CredentialMode::Static => {
                let token = config
                    .static_token
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| {
                        EngineError::Config("static credential selected but no token configured".into())
                    })?;
                Box::new(StaticTokenCredential::new(token))
            }
        };
        info!("[credential] Using {} credential", provider.name());
        Ok(AnyCredential(provider))
    }
}

#[async_trait]
impl TokenProvider for AnyCredential {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn get_token(&self, scope: &str) -> EngineResult<AccessToken> {
        self.0.get_token(scope).await
    }
}

// ── Static ─────────────────────────────────────────────────────────────────

pub struct StaticTokenCredential {
    token: String,
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>) -> Self {
        StaticTokenCredential { token: token.into() }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenCredential {
    fn name(&self) -> &str {
        "static"
    }

    async fn get_token(&self, scope: &str) -> EngineResult<AccessToken> {
        Ok(AccessToken { token: self.token.clone(), scope: scope.to_string(), expires_at: None })
    }
}

// ── Developer (Azure CLI) ──────────────────────────────────────────────────

pub struct DeveloperCredential {
    program: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    /// Local wall-clock time, e.g. `2025-01-01 12:00:00.000000`.
    expires_on: Option<String>,
    /// Unix seconds; only newer CLI versions emit it.
    #[serde(rename = "expires_on")]
    expires_on_unix: Option<i64>,
}

impl DeveloperCredential {
    pub fn new() -> Self {
        DeveloperCredential { program: "az".into() }
    }

    /// Use a different executable (tests, non-standard installs).
    pub fn with_program(program: impl Into<String>) -> Self {
        DeveloperCredential { program: program.into() }
    }

    fn command(&self) -> tokio::process::Command {
        if cfg!(target_os = "windows") {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.arg("/C").arg(&self.program);
            cmd
        } else {
            tokio::process::Command::new(&self.program)
        }
    }
}

impl Default for DeveloperCredential {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `az account get-access-token --output json`.
pub(crate) fn parse_cli_token(stdout: &str, scope: &str) -> EngineResult<AccessToken> {
    let parsed: CliToken = serde_json::from_str(stdout)?;
    let expires_at = parsed
        .expires_on_unix
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .or_else(|| parsed.expires_on.as_deref().and_then(parse_cli_local_time));
    Ok(AccessToken { token: parsed.access_token, scope: scope.to_string(), expires_at })
}

fn parse_cli_local_time(s: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl TokenProvider for DeveloperCredential {
    fn name(&self) -> &str {
        "developer"
    }

    async fn get_token(&self, scope: &str) -> EngineResult<AccessToken> {
        let mut cmd = self.command();
        cmd.args(["account", "get-access-token", "--output", "json", "--scope", scope])
            .kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(CLI_TOKEN_TIMEOUT_SECS), cmd.output())
            .await
            .map_err(|_| EngineError::Auth(format!("{} timed out after {}s", self.program, CLI_TOKEN_TIMEOUT_SECS)))?
            .map_err(|e| EngineError::Auth(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Auth(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                truncate_utf8(stderr.trim(), 300)
            )));
        }

        parse_cli_token(&String::from_utf8_lossy(&output.stdout), scope)
    }
}

// ── Managed identity ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagedIdentityEndpoint {
    /// App Service / Functions / Container Apps: `IDENTITY_ENDPOINT` + `IDENTITY_HEADER`.
    AppService { endpoint: String, header: String },
    /// Azure Instance Metadata Service.
    Imds { endpoint: String },
}

pub struct ManagedIdentityCredential {
    client: Client,
    endpoint: ManagedIdentityEndpoint,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    pub fn new(endpoint: ManagedIdentityEndpoint, client_id: Option<String>) -> Self {
        ManagedIdentityCredential { client: pinned_client(), endpoint, client_id }
    }

    /// App Service endpoint when its variables are set, IMDS otherwise.
    pub fn from_env(client_id: Option<String>) -> Self {
        let endpoint = match (std::env::var("IDENTITY_ENDPOINT"), std::env::var("IDENTITY_HEADER")) {
            (Ok(endpoint), Ok(header)) if !endpoint.is_empty() => {
                ManagedIdentityEndpoint::AppService { endpoint, header }
            }
            _ => ManagedIdentityEndpoint::Imds { endpoint: IMDS_TOKEN_URL.into() },
        };
        Self::new(endpoint, client_id)
    }

    fn request(&self, resource: &str) -> reqwest::RequestBuilder {
        let (url, api_version) = match &self.endpoint {
            ManagedIdentityEndpoint::AppService { endpoint, .. } => (endpoint, APP_SERVICE_API_VERSION),
            ManagedIdentityEndpoint::Imds { endpoint } => (endpoint, IMDS_API_VERSION),
        };
        let mut query = vec![("api-version", api_version.to_string()), ("resource", resource.to_string())];
        if let Some(id) = &self.client_id {
            query.push(("client_id", id.clone()));
        }
        let req = self
            .client
            .get(url)
            .query(&query)
            .timeout(Duration::from_secs(MSI_REQUEST_TIMEOUT_SECS));
        match &self.endpoint {
            ManagedIdentityEndpoint::AppService { header, .. } => req.header("X-IDENTITY-HEADER", header),
            ManagedIdentityEndpoint::Imds { .. } => req.header("Metadata", "true"),
        }
    }
}

/// Parse an identity endpoint token response. `expires_on` arrives as a
/// string on some hosts and a number on others.
pub(crate) fn parse_msi_token(body: &str, scope: &str) -> EngineResult<AccessToken> {
    let v: Value = serde_json::from_str(body)?;
    let token = v["access_token"]
        .as_str()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| EngineError::Auth("identity endpoint response has no access_token".into()))?;
    let expires_at = match &v["expires_on"] {
        Value::String(s) => s.parse::<i64>().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
    .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    Ok(AccessToken { token: token.to_string(), scope: scope.to_string(), expires_at })
}

#[async_trait]
impl TokenProvider for ManagedIdentityCredential {
    fn name(&self) -> &str {
        "managed_identity"
    }

    async fn get_token(&self, scope: &str) -> EngineResult<AccessToken> {
        let response = self.request(scope_to_resource(scope)).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(EngineError::Auth(format!(
                "identity endpoint returned {}: {}",
                status.as_u16(),
                truncate_utf8(&body, 300)
            )));
        }
        parse_msi_token(&body, scope)
    }
}

// ── Token cache ────────────────────────────────────────────────────────────

/// Reuses tokens per scope until they are within the refresh margin of
/// expiry. The lock is never held across an await; two concurrent misses may
/// both fetch, and the later one wins.
pub struct CachedCredential<P> {
    inner: P,
    cache: Mutex<HashMap<String, AccessToken>>,
}

impl<P: TokenProvider> CachedCredential<P> {
    pub fn new(inner: P) -> Self {
        CachedCredential { inner, cache: Mutex::new(HashMap::new()) }
    }

    fn cached(&self, scope: &str) -> Option<AccessToken> {
        let cache = self.cache.lock();
        cache
            .get(scope)
            .filter(|t| !t.expires_within(TOKEN_REFRESH_MARGIN_SECS, Utc::now()))
            .cloned()
    }
}

#[async_trait]
impl<P: TokenProvider> TokenProvider for CachedCredential<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_token(&self, scope: &str) -> EngineResult<AccessToken> {
        if let Some(token) = self.cached(scope) {
            return Ok(token);
        }
        let token = self.inner.get_token(scope).await.inspect_err(|e| {
            warn!("[credential] {} token acquisition failed: {}", self.inner.name(), e);
        })?;
        self.cache.lock().insert(scope.to_string(), token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SCOPE: &str = "https://ai.azure.com/.default";

    struct Counting {
        calls: Arc<AtomicUsize>,
        ttl_secs: i64,
    }

    #[async_trait]
    impl TokenProvider for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn get_token(&self, scope: &str) -> EngineResult<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                token: format!("t{n}"),
                scope: scope.to_string(),
                expires_at: Some(Utc::now() + chrono::Duration::seconds(self.ttl_secs)),
            })
        }
    }

    #[test]
    fn resource_drops_default_suffix() {
        assert_eq!(scope_to_resource(SCOPE), "https://ai.azure.com");
        assert_eq!(scope_to_resource("https://x"), "https://x");
    }

    #[test]
    fn cli_output_prefers_unix_expiry() {
        let out = r#"{"accessToken":"abc","expiresOn":"2030-01-01 00:00:00.000000","expires_on":1893456000,"tokenType":"Bearer"}"#;
        let token = parse_cli_token(out, SCOPE).unwrap();
        assert_eq!(token.token, "abc");
        assert_eq!(token.expires_at.map(|t| t.timestamp()), Some(1_893_456_000));
    }

    #[test]
    fn cli_output_local_expiry() {
        let out = r#"{"accessToken":"abc","expiresOn":"2030-01-01 00:00:00.000000"}"#;
        let token = parse_cli_token(out, SCOPE).unwrap();
        assert!(token.expires_at.is_some());
    }

    #[test]
    fn msi_expiry_as_string_or_number() {
        let a = parse_msi_token(r#"{"access_token":"a","expires_on":"1893456000"}"#, SCOPE).unwrap();
        let b = parse_msi_token(r#"{"access_token":"b","expires_on":1893456000}"#, SCOPE).unwrap();
        assert_eq!(a.expires_at, b.expires_at);
        assert!(parse_msi_token(r#"{"error":"invalid_resource"}"#, SCOPE).is_err());
    }

    #[test]
    fn static_mode_requires_token() {
        let cfg = AgentConfig { credential: Some(CredentialMode::Static), ..Default::default() };
        assert!(AnyCredential::from_config(&cfg).is_err());

        let cfg = AgentConfig {
            credential: Some(CredentialMode::Static),
            static_token: Some("tok".into()),
            ..Default::default()
        };
        assert_eq!(AnyCredential::from_config(&cfg).unwrap().name(), "static");
    }

    #[tokio::test]
    async fn cache_reuses_fresh_token() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cred = CachedCredential::new(Counting { calls: calls.clone(), ttl_secs: 3600 });
        let a = cred.get_token(SCOPE).await.unwrap();
        let b = cred.get_token(SCOPE).await.unwrap();
        assert_eq!(a.token, b.token);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_refreshes_near_expiry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cred = CachedCredential::new(Counting { calls: calls.clone(), ttl_secs: 60 });
        cred.get_token(SCOPE).await.unwrap();
        cred.get_token(SCOPE).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_cli_is_auth_error() {
        let cred = DeveloperCredential::with_program("kabeuchi-no-such-az-binary");
        let err = cred.get_token(SCOPE).await.unwrap_err();
        assert!(matches!(err, EngineError::Auth(_)));
    }

    #[tokio::test]
    async fn app_service_identity_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/msi/token"))
            .and(header("X-IDENTITY-HEADER", "secret-header"))
            .and(query_param("resource", "https://ai.azure.com"))
            .and(query_param("api-version", APP_SERVICE_API_VERSION))
            .and(query_param("client_id", "uami"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "msi-token",
                "expires_on": "1893456000",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cred = ManagedIdentityCredential::new(
            ManagedIdentityEndpoint::AppService {
                endpoint: format!("{}/msi/token", server.uri()),
                header: "secret-header".into(),
            },
            Some("uami".into()),
        );
        let token = cred.get_token(SCOPE).await.unwrap();
        assert_eq!(token.token, "msi-token");
    }

    #[tokio::test]
    async fn imds_error_status_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/identity/oauth2/token"))
            .and(header("Metadata", "true"))
            .respond_with(ResponseTemplate::new(400).set_body_string("identity not found"))
            .mount(&server)
            .await;

        let cred = ManagedIdentityCredential::new(
            ManagedIdentityEndpoint::Imds {
                endpoint: format!("{}/metadata/identity/oauth2/token", server.uri()),
            },
            None,
        );
        let err = cred.get_token(SCOPE).await.unwrap_err();
        assert!(err.to_string().contains("identity not found"));
    }
}
