// Kabeuchi Engine — Agent Dispatcher
//
// Turns one user message into one agent reply:
//
//   config check → token → [variant 1, variant 2, …] → extract text + metadata
//
// Stopping rule for the variant loop:
//   • 2xx                    → done, extract
//   • version-negotiation    → next variant
//   • anything else          → stop, RemoteRejected / TransportError
//
// One deadline covers the whole loop. The attempt signal is a child of the
// caller's cancellation token that the deadline also cancels, so the
// caller's signal and the internal budget collapse into a single signal
// while staying distinguishable in the result.

use futures::FutureExt;
use log::{error, info, warn};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::atoms::constants::LOG_BODY_LIMIT;
use crate::atoms::error::{DispatchError, EngineResult, FailureKind};
use crate::atoms::traits::{AgentTransport, TokenProvider};
use crate::atoms::types::{truncate_utf8, DispatchRequest, DispatchResult, ProtocolVariant, TransportResponse};
use crate::engine::config::AgentConfig;
use crate::engine::credentials::AnyCredential;
use crate::engine::extract::{extract_metadata, extract_text};
use crate::engine::http::ReqwestTransport;
use crate::engine::negotiation::{build_variants, dedup_variants, fallback_variants, is_negotiation_failure};

/// Classification of one variant attempt.
enum Attempt {
    Succeeded(String),
    /// Version rejected; the next variant may work. Never surfaced.
    NegotiationFailed { status: u16 },
    Rejected { status: u16, body: String },
}

fn classify(response: TransportResponse) -> Attempt {
    if response.is_success() {
        Attempt::Succeeded(response.body)
    } else if is_negotiation_failure(&response.body) {
        Attempt::NegotiationFailed { status: response.status }
    } else {
        Attempt::Rejected { status: response.status, body: response.body }
    }
}

/// Stateless across calls; share it behind an `Arc`.
pub struct AgentDispatcher {
    endpoint: Option<String>,
    agent_name: Option<String>,
    scope: String,
    variants: Vec<ProtocolVariant>,
    timeout: Duration,
    credential: Arc<dyn TokenProvider>,
    transport: Arc<dyn AgentTransport>,
}

impl AgentDispatcher {
    pub fn new(
        config: &AgentConfig,
        credential: Arc<dyn TokenProvider>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        AgentDispatcher {
            endpoint: config.endpoint().map(str::to_string),
            agent_name: config.agent_name().map(str::to_string),
            scope: config.token_scope.clone(),
            variants: build_variants(config.preferred_api_version(), &fallback_variants()),
            timeout: Duration::from_secs(config.timeout_secs),
            credential,
            transport,
        }
    }

    /// Production wiring: credential strategy from config, reqwest transport.
    pub fn from_config(config: &AgentConfig) -> EngineResult<Self> {
        let credential = AnyCredential::from_config(config)?;
        Ok(Self::new(config, Arc::new(credential), Arc::new(ReqwestTransport::new())))
    }

    /// Replace the variant sequence. Duplicates are dropped.
    pub fn with_variants(mut self, variants: Vec<ProtocolVariant>) -> Self {
        self.variants = dedup_variants(variants);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn variants(&self) -> &[ProtocolVariant] {
        &self.variants
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Budget in whole seconds, rounded up so a sub-second budget never
    /// reads as zero.
    fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs_f64().ceil() as u64
    }

    pub fn credential_name(&self) -> &str {
        self.credential.name()
    }

    /// Request URLs in attempt order, or empty when no endpoint is set.
    pub fn candidate_urls(&self) -> Vec<String> {
        match &self.endpoint {
            Some(endpoint) => self.variants.iter().map(|v| v.url(endpoint)).collect(),
            None => Vec::new(),
        }
    }

    fn request_for(&self, message: &str) -> Result<(DispatchRequest, &str), DispatchError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| DispatchError::ConfigurationMissing("endpoint".into()))?;
        let agent_name = self
            .agent_name
            .as_deref()
            .ok_or_else(|| DispatchError::ConfigurationMissing("agent name".into()))?;
        let request = DispatchRequest {
            message: message.to_string(),
            agent_name: agent_name.to_string(),
            variants: self.variants.clone(),
        };
        Ok((request, endpoint))
    }

    // ── Public entry points ────────────────────────────────────────────────

    /// Never fails: errors come back as a user-presentable `response_text`.
    pub async fn dispatch(&self, message: &str, cancel: &CancellationToken) -> DispatchResult {
        let outcome = AssertUnwindSafe(self.try_dispatch(message, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "internal failure".into());
                Err(DispatchError::Unexpected(detail))
            });

        match outcome {
            Ok(result) => result,
            Err(e) => {
                match e.kind() {
                    FailureKind::CallerCancelled => info!("[dispatch] {}", e),
                    FailureKind::UnexpectedError => error!("[dispatch] {}", e),
                    _ => warn!("[dispatch] {}", e),
                }
                DispatchResult::text(e.user_message())
            }
        }
    }

    /// Typed variant of [`dispatch`](Self::dispatch).
    pub async fn try_dispatch(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult, DispatchError> {
        let (request, endpoint) = self.request_for(message)?;

        // 1. Token. Caller cancellation applies; the attempt budget does not.
        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::CallerCancelled),
            token = self.credential.get_token(&self.scope) => token.map_err(|e| {
                error!("[dispatch] {} credential failed: {}", self.credential.name(), e);
                DispatchError::AuthenticationFailed(e.to_string())
            })?,
        };

        // 2. Attempt loop under one shared deadline. The timer lives in the
        // same select, so dropping this future drops it too.
        let attempt_signal = cancel.child_token();
        let deadline = Instant::now() + self.timeout;
        let outcome = tokio::select! {
            biased;
            _ = attempt_signal.cancelled() => Err(DispatchError::CallerCancelled),
            _ = tokio::time::sleep_until(deadline) => {
                attempt_signal.cancel();
                Err(DispatchError::TimedOut { secs: self.timeout_secs() })
            }
            body = self.attempt_variants(&request, endpoint, &token.token) => body,
        };
        let body = outcome?;

        // 3. Extraction.
        let text = extract_text(&body);
        let meta = extract_metadata(&body);
        info!(
            "[dispatch] Reply {} chars, model={}, tools={:?}",
            text.chars().count(),
            meta.model.as_deref().unwrap_or("-"),
            meta.tools_used
        );
        Ok(DispatchResult {
            response_text: text,
            model_identifier: meta.model,
            tools_used: meta.tools_used,
        })
    }

    // ── Attempt loop ───────────────────────────────────────────────────────

    async fn attempt_variants(
        &self,
        request: &DispatchRequest,
        endpoint: &str,
        bearer: &str,
    ) -> Result<String, DispatchError> {
        let body = request.body();
        let total = request.variants.len();
        let mut tried = Vec::with_capacity(total);

        for (i, variant) in request.variants.iter().enumerate() {
            let url = variant.url(endpoint);
            info!("[dispatch] Attempt {}/{} {}", i + 1, total, variant);

            let response = self
                .transport
                .post_json(&url, bearer, &body)
                .await
                .map_err(DispatchError::Transport)?;

            match classify(response) {
                Attempt::Succeeded(body) => {
                    info!("[dispatch] {} accepted", variant);
                    return Ok(body);
                }
                Attempt::NegotiationFailed { status } => {
                    warn!("[dispatch] {} rejected as unsupported version ({}), trying next", variant, status);
                    tried.push(variant.to_string());
                }
                Attempt::Rejected { status, body } => {
                    error!(
                        "[dispatch] {} failed with {}: {}",
                        variant,
                        status,
                        truncate_utf8(&body, LOG_BODY_LIMIT)
                    );
                    return Err(DispatchError::RemoteRejected {
                        variant: variant.to_string(),
                        status,
                        body: truncate_utf8(&body, LOG_BODY_LIMIT).to_string(),
                    });
                }
            }
        }

        Err(DispatchError::NoSupportedProtocolVersion { tried })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::error::EngineError;
    use crate::atoms::types::AccessToken;
    use crate::engine::credentials::StaticTokenCredential;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NEGOTIATION_BODY: &str = r#"{"error":{"code":"BadRequest","message":"API version not supported"}}"#;
    const OK_BODY: &str = r#"{"model":"gpt-x","output":[{"type":"file_search_call"},{"type":"message","content":[{"type":"output_text","text":"Hello"}]}]}"#;

    enum Step {
        Respond(u16, &'static str),
        Fail(&'static str),
        Hang,
        Delay(u64, u16, &'static str),
    }

    #[derive(Default)]
    struct StubTransport {
        script: Mutex<VecDeque<Step>>,
        repeat_last: Option<(u16, &'static str)>,
        calls: Mutex<Vec<(String, String, Value)>>,
    }

    impl StubTransport {
        fn scripted(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(StubTransport { script: Mutex::new(steps.into()), ..Default::default() })
        }

        fn always(status: u16, body: &'static str) -> Arc<Self> {
            Arc::new(StubTransport { repeat_last: Some((status, body)), ..Default::default() })
        }

        fn urls(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(u, _, _)| u.clone()).collect()
        }
    }

    #[async_trait]
    impl AgentTransport for StubTransport {
        async fn post_json(&self, url: &str, bearer: &str, body: &Value) -> Result<TransportResponse, String> {
            self.calls.lock().push((url.to_string(), bearer.to_string(), body.clone()));
            let step = self.script.lock().pop_front();
            let step = match (step, self.repeat_last) {
                (Some(step), _) => step,
                (None, Some((status, body))) => Step::Respond(status, body),
                (None, None) => Step::Fail("script exhausted"),
            };
            match step {
                Step::Respond(status, body) => Ok(TransportResponse { status, body: body.into() }),
                Step::Fail(msg) => Err(msg.into()),
                Step::Hang => std::future::pending().await,
                Step::Delay(ms, status, body) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(TransportResponse { status, body: body.into() })
                }
            }
        }
    }

    struct FailingCredential;

    #[async_trait]
    impl TokenProvider for FailingCredential {
        fn name(&self) -> &str {
            "failing"
        }

        async fn get_token(&self, _scope: &str) -> EngineResult<AccessToken> {
            Err(EngineError::Auth("not logged in".into()))
        }
    }

    struct CountingCredential(AtomicUsize);

    #[async_trait]
    impl TokenProvider for CountingCredential {
        fn name(&self) -> &str {
            "counting"
        }

        async fn get_token(&self, scope: &str) -> EngineResult<AccessToken> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken { token: "tok".into(), scope: scope.into(), expires_at: None })
        }
    }

    fn config() -> AgentConfig {
        AgentConfig {
            endpoint: Some("https://agents.example/api/projects/p".into()),
            agent_name: Some("kabeuchi".into()),
            ..Default::default()
        }
    }

    fn four_variants() -> Vec<ProtocolVariant> {
        ["v-a", "v-b", "v-c", "v-d"].iter().map(|v| ProtocolVariant::responses(*v)).collect()
    }

    fn dispatcher(transport: Arc<StubTransport>) -> AgentDispatcher {
        AgentDispatcher::new(&config(), Arc::new(StaticTokenCredential::new("tok")), transport)
            .with_variants(four_variants())
    }

    #[tokio::test]
    async fn falls_back_after_negotiation_failure() {
        let transport = StubTransport::scripted(vec![
            Step::Respond(400, NEGOTIATION_BODY),
            Step::Respond(200, OK_BODY),
            Step::Respond(200, OK_BODY),
            Step::Respond(200, OK_BODY),
        ]);
        let d = dispatcher(transport.clone());

        let result = d.try_dispatch("hi", &CancellationToken::new()).await.unwrap();

        assert_eq!(result.response_text, "Hello");
        assert_eq!(result.model_identifier.as_deref(), Some("gpt-x"));
        assert_eq!(result.tools_used, vec!["file_search_call"]);
        assert_eq!(
            transport.urls(),
            vec![
                "https://agents.example/api/projects/p/openai/responses?api-version=v-a",
                "https://agents.example/api/projects/p/openai/responses?api-version=v-b",
            ]
        );
    }

    #[tokio::test]
    async fn stops_on_first_non_negotiation_failure() {
        let transport = StubTransport::always(403, r#"{"error":{"code":"PermissionDenied"}}"#);
        let d = dispatcher(transport.clone());

        let err = d.try_dispatch("hi", &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::RemoteRejected);
        assert!(matches!(err, DispatchError::RemoteRejected { status: 403, .. }));
        assert_eq!(transport.urls().len(), 1);
    }

    #[tokio::test]
    async fn exhausts_all_variants_on_negotiation_failures() {
        let transport = StubTransport::always(400, NEGOTIATION_BODY);
        let d = dispatcher(transport.clone());

        let err = d.try_dispatch("hi", &CancellationToken::new()).await.unwrap_err();

        assert_eq!(
            transport.urls(),
            ["v-a", "v-b", "v-c", "v-d"]
                .iter()
                .map(|v| format!("https://agents.example/api/projects/p/openai/responses?api-version={v}"))
                .collect::<Vec<_>>()
        );
        assert_eq!(
            err,
            DispatchError::NoSupportedProtocolVersion {
                tried: vec![
                    "/openai/responses?api-version=v-a".into(),
                    "/openai/responses?api-version=v-b".into(),
                    "/openai/responses?api-version=v-c".into(),
                    "/openai/responses?api-version=v-d".into(),
                ]
            }
        );
    }

    #[tokio::test]
    async fn sends_bearer_and_agent_reference() {
        let transport = StubTransport::always(200, OK_BODY);
        let d = dispatcher(transport.clone());

        d.try_dispatch("こんにちは", &CancellationToken::new()).await.unwrap();

        let calls = transport.calls.lock();
        let (_, bearer, body) = &calls[0];
        assert_eq!(bearer, "tok");
        assert_eq!(
            body,
            &serde_json::json!({"input": "こんにちは", "agent": {"name": "kabeuchi", "type": "agent_reference"}})
        );
    }

    #[tokio::test]
    async fn identical_inputs_give_identical_results() {
        let transport = StubTransport::always(200, OK_BODY);
        let d = dispatcher(transport);
        let cancel = CancellationToken::new();

        let a = d.dispatch("same", &cancel).await;
        let b = d.dispatch("same", &cancel).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn empty_success_is_accepted() {
        let transport = StubTransport::always(200, "");
        let d = dispatcher(transport.clone());

        let result = d.try_dispatch("hi", &CancellationToken::new()).await.unwrap();
        assert_eq!(result.response_text, "");
        assert_eq!(transport.urls().len(), 1);
    }

    #[tokio::test]
    async fn missing_config_fails_before_any_io() {
        let credential = Arc::new(CountingCredential(AtomicUsize::new(0)));
        let transport = StubTransport::always(200, OK_BODY);
        let cfg = AgentConfig { agent_name: None, ..config() };
        let d = AgentDispatcher::new(&cfg, credential.clone(), transport.clone());

        let err = d.try_dispatch("hi", &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::ConfigurationMissing);
        assert_eq!(credential.0.load(Ordering::SeqCst), 0);
        assert!(transport.urls().is_empty());
    }

    #[tokio::test]
    async fn credential_failure_is_fatal() {
        let transport = StubTransport::always(200, OK_BODY);
        let d = AgentDispatcher::new(&config(), Arc::new(FailingCredential), transport.clone());

        let err = d.try_dispatch("hi", &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::AuthenticationFailed);
        assert!(transport.urls().is_empty());
    }

    #[tokio::test]
    async fn transport_error_is_terminal() {
        let transport = StubTransport::scripted(vec![Step::Fail("connection refused")]);
        let d = dispatcher(transport.clone());

        let err = d.try_dispatch("hi", &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err, DispatchError::Transport("connection refused".into()));
        assert_eq!(transport.urls().len(), 1);
    }

    #[tokio::test]
    async fn caller_cancellation_mid_request() {
        let transport = StubTransport::scripted(vec![Step::Hang]);
        let d = dispatcher(transport).with_timeout(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = d.try_dispatch("hi", &cancel).await.unwrap_err();
        assert_eq!(err, DispatchError::CallerCancelled);
    }

    #[tokio::test]
    async fn unresponsive_remote_times_out() {
        let transport = StubTransport::scripted(vec![Step::Hang]);
        let d = dispatcher(transport).with_timeout(Duration::from_millis(100));
        let cancel = CancellationToken::new();

        let err = d.try_dispatch("hi", &cancel).await.unwrap_err();

        assert_eq!(err, DispatchError::TimedOut { secs: 1 });
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn abandoned_dispatch_leaves_no_tasks_behind() {
        let transport = StubTransport::always(200, OK_BODY);
        *transport.script.lock() = (0..20).map(|_| Step::Hang).collect();
        let d = dispatcher(transport);
        let metrics = tokio::runtime::Handle::current().metrics();
        let before = metrics.num_alive_tasks();

        for _ in 0..20 {
            let cancel = CancellationToken::new();
            let dropped = tokio::time::timeout(Duration::from_millis(1), d.try_dispatch("hi", &cancel)).await;
            assert!(dropped.is_err());
        }
        tokio::task::yield_now().await;

        assert_eq!(metrics.num_alive_tasks(), before);
    }

    #[tokio::test]
    async fn deadline_is_shared_across_attempts() {
        // Each attempt alone fits in the budget; together they do not.
        let transport = StubTransport::scripted(vec![
            Step::Delay(150, 400, NEGOTIATION_BODY),
            Step::Delay(150, 400, NEGOTIATION_BODY),
            Step::Delay(150, 200, OK_BODY),
        ]);
        let d = dispatcher(transport.clone()).with_timeout(Duration::from_millis(250));

        let err = d.try_dispatch("hi", &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::TimedOut);
        assert_eq!(transport.urls().len(), 2);
    }

    #[tokio::test]
    async fn already_cancelled_skips_network() {
        let transport = StubTransport::always(200, OK_BODY);
        let d = dispatcher(transport.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = d.try_dispatch("hi", &cancel).await.unwrap_err();
        assert_eq!(err, DispatchError::CallerCancelled);
        assert!(transport.urls().is_empty());
    }

    #[tokio::test]
    async fn dispatch_turns_failures_into_text() {
        let transport = StubTransport::always(500, "upstream exploded");
        let d = dispatcher(transport);

        let result = d.dispatch("hi", &CancellationToken::new()).await;

        assert!(result.response_text.contains("HTTP 500"));
        assert!(result.model_identifier.is_none());
        assert!(result.tools_used.is_empty());
    }

    #[test]
    fn configured_version_leads_default_sequence() {
        let cfg = AgentConfig { api_version: Some("2024-10-01-preview".into()), ..config() };
        let d = AgentDispatcher::new(&cfg, Arc::new(StaticTokenCredential::new("t")), StubTransport::always(200, ""));
        assert_eq!(d.variants()[0], ProtocolVariant::responses("2024-10-01-preview"));
        assert_eq!(d.candidate_urls().len(), d.variants().len());
    }
}
