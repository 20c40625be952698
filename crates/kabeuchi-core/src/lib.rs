// Kabeuchi Core — agent dispatch engine
//
// Layering:
//   atoms/   pure types, constants, errors and traits; no I/O
//   engine/  everything that touches the network, the filesystem or a clock

pub mod atoms;
pub mod engine;

pub use atoms::error::{DispatchError, EngineError, EngineResult, FailureKind};
pub use atoms::traits::{AgentTransport, TokenProvider};
pub use atoms::types::{AccessToken, DispatchRequest, DispatchResult, ProtocolVariant, UrlShape};
pub use engine::config::{AgentConfig, CredentialMode, DeploymentEnvironment};
pub use engine::credentials::AnyCredential;
pub use engine::dispatcher::AgentDispatcher;
pub use engine::http::ReqwestTransport;
