// Kabeuchi Server — Configuration
// Server settings plus the nested agent section, loaded from the same
// kabeuchi.toml the core crate looks for.

use kabeuchi_core::atoms::constants::MAX_MESSAGE_CHARS;
use kabeuchi_core::engine::config::load_toml;
use kabeuchi_core::{AgentConfig, DeploymentEnvironment, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// `None` → 5000 in development, 8080 in production.
    pub port: Option<u16>,
    /// Directory of the browser UI (index.html, chat.js).
    pub static_dir: String,
    pub max_message_chars: usize,
    pub agent: AgentConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: "127.0.0.1".into(),
            port: None,
            static_dir: "wwwroot".into(),
            max_message_chars: MAX_MESSAGE_CHARS,
            agent: AgentConfig::default(),
        }
    }
}

impl ServerConfig {
    /// File (if any) then environment overrides.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut config: ServerConfig = load_toml(path)?;
        config.agent.apply_env();
        Ok(config)
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(match self.agent.environment {
            DeploymentEnvironment::Development => 5000,
            DeploymentEnvironment::Production => 8080,
        })
    }
}
