//! Agent configuration stored in `.fuzz-agent.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::envelope::SessionConfig;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".fuzz-agent.toml";
/// Environment fallback for `auth_token`.
pub const AUTH_TOKEN_ENV: &str = "FUZZ_AGENT_API_KEY";

/// Agent configuration (TOML).
///
/// Missing fields default to values suitable for a local service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Path of the API description document.
    pub spec: PathBuf,

    /// Websocket URL of the orchestration service.
    pub endpoint: String,

    /// Host of the system under test, literal or `{{ env "NAME" }}`.
    pub host: String,

    /// Port of the system under test, literal or `{{ env "NAME" }}`.
    pub port: String,

    pub auth_token: Option<String>,

    pub script: ScriptConfig,
}

/// Shell commands per lifecycle stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptConfig {
    pub start: Vec<String>,
    pub reset: Vec<String>,
    pub stop: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            spec: PathBuf::from("openapi.json"),
            endpoint: "ws://localhost:7077/1/fuzz".to_string(),
            host: "localhost".to_string(),
            port: "3000".to_string(),
            auth_token: None,
            script: ScriptConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(anyhow!(
                "endpoint must be a ws:// or wss:// URL, got '{}'",
                self.endpoint
            ));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host must be non-empty"));
        }
        if self.port.trim().is_empty() {
            return Err(anyhow!("port must be non-empty"));
        }
        if self.spec.as_os_str().is_empty() {
            return Err(anyhow!("spec must be a non-empty path"));
        }
        for (stage, commands) in [
            ("start", &self.script.start),
            ("reset", &self.script.reset),
            ("stop", &self.script.stop),
        ] {
            if commands.iter().any(|cmd| cmd.trim().is_empty()) {
                return Err(anyhow!("script.{stage} contains an empty command"));
            }
        }
        Ok(())
    }

    /// Token sent when dialing the service: config first, then `FUZZ_AGENT_API_KEY`.
    pub fn resolve_auth_token(&self) -> Result<String> {
        if let Some(token) = self.auth_token.as_deref().filter(|t| !t.trim().is_empty()) {
            return Ok(token.to_string());
        }
        match std::env::var(AUTH_TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => Ok(token),
            _ => Err(anyhow!(
                "missing auth token (set auth_token in config or ${AUTH_TOKEN_ENV})"
            )),
        }
    }

    /// The part of the configuration carried inside the session-open action.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.host.clone(),
            port: self.port.clone(),
            spec_path: self.spec.display().to_string(),
            start_commands: count(&self.script.start),
            reset_commands: count(&self.script.reset),
            stop_commands: count(&self.script.stop),
        }
    }
}

fn count(commands: &[String]) -> u32 {
    u32::try_from(commands.len()).unwrap_or(u32::MAX)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
