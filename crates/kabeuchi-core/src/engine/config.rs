// Kabeuchi Engine — Configuration
//
// AgentConfig is read from a TOML file (optional) and then overridden by
// environment variables, so a container can run without any file at all.
//
// File lookup order:
//   1. explicit path (CLI --config)
//   2. ./kabeuchi.toml
//   3. <config dir>/kabeuchi/kabeuchi.toml
//   4. built-in defaults

use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::atoms::constants::{DEFAULT_API_VERSION, DEFAULT_DISPATCH_TIMEOUT_SECS, DEFAULT_TOKEN_SCOPE};
use crate::atoms::error::{EngineError, EngineResult};

pub const CONFIG_FILE_NAME: &str = "kabeuchi.toml";

// ── Deployment environment & credential mode ───────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentEnvironment {
    /// Developer workstation: signed-in Azure CLI identity.
    #[default]
    Development,
    /// Hosted: managed identity of the compute resource.
    Production,
}

impl DeploymentEnvironment {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" | "local" => Some(Self::Development),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }
}

/// Which credential strategy produces the bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    Developer,
    ManagedIdentity,
    /// Pre-issued token from config or environment.
    Static,
}

impl CredentialMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "developer" | "cli" | "azure_cli" => Some(Self::Developer),
            "managed_identity" | "msi" => Some(Self::ManagedIdentity),
            "static" | "token" => Some(Self::Static),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialMode::Developer => "developer",
            CredentialMode::ManagedIdentity => "managed_identity",
            CredentialMode::Static => "static",
        }
    }
}

// ── Agent config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Project endpoint, e.g. `https://<resource>.services.ai.azure.com/api/projects/<project>`.
    pub endpoint: Option<String>,
    pub agent_name: Option<String>,
    /// Preferred api-version; the fallback list follows it.
    pub api_version: Option<String>,
    pub environment: DeploymentEnvironment,
    /// Overrides the strategy implied by `environment`.
    pub credential: Option<CredentialMode>,
    /// User-assigned managed identity; system-assigned when absent.
    pub managed_identity_client_id: Option<String>,
    #[serde(skip_serializing)]
    pub static_token: Option<String>,
    pub token_scope: String,
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            endpoint: None,
            agent_name: None,
            api_version: None,
            environment: DeploymentEnvironment::default(),
            credential: None,
            managed_identity_client_id: None,
            static_token: None,
            token_scope: DEFAULT_TOKEN_SCOPE.into(),
            timeout_secs: DEFAULT_DISPATCH_TIMEOUT_SECS,
        }
    }
}

impl AgentConfig {
    /// Credential strategy after applying the explicit override.
    pub fn credential_mode(&self) -> CredentialMode {
        self.credential.unwrap_or(match self.environment {
            DeploymentEnvironment::Development => CredentialMode::Developer,
            DeploymentEnvironment::Production => CredentialMode::ManagedIdentity,
        })
    }

    pub fn preferred_api_version(&self) -> &str {
        self.api_version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_API_VERSION)
    }

    /// Endpoint, if set and non-blank.
    pub fn endpoint(&self) -> Option<&str> {
        non_blank(self.endpoint.as_deref())
    }

    /// Agent name, if set and non-blank.
    pub fn agent_name(&self) -> Option<&str> {
        non_blank(self.agent_name.as_deref())
    }

    /// Overlay environment variables from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay environment variables using `lookup`. Blank values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("FOUNDRY_ENDPOINT") {
            self.endpoint = Some(v);
        }
        if let Some(v) = get("FOUNDRY_AGENT_NAME") {
            self.agent_name = Some(v);
        }
        if let Some(v) = get("FOUNDRY_API_VERSION") {
            self.api_version = Some(v);
        }
        if let Some(v) = get("FOUNDRY_TOKEN_SCOPE") {
            self.token_scope = v;
        }
        if let Some(v) = get("FOUNDRY_ACCESS_TOKEN") {
            self.static_token = Some(v);
        }
        if let Some(v) = get("AZURE_CLIENT_ID") {
            self.managed_identity_client_id = Some(v);
        }
        if let Some(env) = get("KABEUCHI_ENVIRONMENT").as_deref().and_then(DeploymentEnvironment::parse) {
            self.environment = env;
        }
        if let Some(mode) = get("KABEUCHI_CREDENTIAL").as_deref().and_then(CredentialMode::parse) {
            self.credential = Some(mode);
        }
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

// ── File loading ───────────────────────────────────────────────────────────

/// Candidate config file locations, most specific first.
pub fn config_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(p) = explicit {
        return vec![p.to_path_buf()];
    }
    let mut out = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        out.push(dir.join("kabeuchi").join(CONFIG_FILE_NAME));
    }
    out
}

/// Load `T` from the first existing candidate, or `T::default()`.
///
/// An explicit path that does not exist is an error; missing implicit
/// locations are not.
pub fn load_toml<T: DeserializeOwned + Default>(explicit: Option<&Path>) -> EngineResult<T> {
    if let Some(p) = explicit {
        if !p.exists() {
            return Err(EngineError::Config(format!("config file not found: {}", p.display())));
        }
    }
    for path in config_candidates(explicit) {
        if path.is_file() {
            let raw = std::fs::read_to_string(&path)?;
            let value = toml::from_str(&raw)?;
            info!("[config] Loaded {}", path.display());
            return Ok(value);
        }
    }
    info!("[config] No config file found, using defaults");
    Ok(T::default())
}
