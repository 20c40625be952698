// ── Kabeuchi Atoms: Error Types ────────────────────────────────────────────
// Two `thiserror` enums:
//   • `EngineError`: plumbing failures (I/O, config files, credential
//     providers). Coarse-grained by domain.
//   • `DispatchError`: the outcome taxonomy of one agent dispatch. Every
//     variant has a user-presentable message; none carries a token.

use serde::Serialize;
use thiserror::Error;

// ── Engine error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML config file could not be parsed.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential acquisition failure.
    #[error("Auth error: {0}")]
    Auth(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

// ── Dispatch error ─────────────────────────────────────────────────────────

/// Why a dispatch did not produce an agent reply.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Endpoint or agent name absent. No network access was attempted.
    #[error("agent configuration is missing: {0}")]
    ConfigurationMissing(String),

    /// The credential provider could not produce a token.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A variant was rejected for a non-version reason.
    #[error("agent rejected the request ({variant}): HTTP {status}: {body}")]
    RemoteRejected { variant: String, status: u16, body: String },

    /// Every variant was rejected as an unsupported protocol version.
    #[error("no supported protocol version (tried {})", .tried.join(", "))]
    NoSupportedProtocolVersion { tried: Vec<String> },

    #[error("cancelled by caller")]
    CallerCancelled,

    #[error("agent timed out after {secs} seconds")]
    TimedOut { secs: u64 },

    /// Connection refused, DNS, TLS and other network-level failures.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// Stable discriminant of a [`DispatchError`], for logs and the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConfigurationMissing,
    AuthenticationFailed,
    RemoteRejected,
    NoSupportedProtocolVersion,
    CallerCancelled,
    TimedOut,
    TransportError,
    UnexpectedError,
}

impl DispatchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DispatchError::ConfigurationMissing(_) => FailureKind::ConfigurationMissing,
            DispatchError::AuthenticationFailed(_) => FailureKind::AuthenticationFailed,
            DispatchError::RemoteRejected { .. } => FailureKind::RemoteRejected,
            DispatchError::NoSupportedProtocolVersion { .. } => {
                FailureKind::NoSupportedProtocolVersion
            }
            DispatchError::CallerCancelled => FailureKind::CallerCancelled,
            DispatchError::TimedOut { .. } => FailureKind::TimedOut,
            DispatchError::Transport(_) => FailureKind::TransportError,
            DispatchError::Unexpected(_) => FailureKind::UnexpectedError,
        }
    }

    /// Text shown in the chat window in place of an agent reply.
    pub fn user_message(&self) -> String {
        match self {
            DispatchError::ConfigurationMissing(what) => {
                format!("Sorry, the agent is not configured ({what} is missing).")
            }
            DispatchError::AuthenticationFailed(_) => {
                "Sorry, I could not sign in to the agent service. Please try again later.".into()
            }
            DispatchError::RemoteRejected { status, body, .. } => {
                format!("The agent service returned an error (HTTP {status}): {body}")
            }
            DispatchError::NoSupportedProtocolVersion { tried } => format!(
                "The agent service did not accept any known API version (tried {}).",
                tried.join(", ")
            ),
            DispatchError::CallerCancelled => "The request was cancelled.".into(),
            DispatchError::TimedOut { secs } => {
                format!("The agent did not answer within {secs} seconds. Please try again.")
            }
            DispatchError::Transport(detail) => {
                format!("Could not connect to the agent service: {detail}")
            }
            DispatchError::Unexpected(detail) => format!("An error occurred: {detail}"),
        }
    }
}
