use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SkeinConfig {
    pub backend: BackendConfig,
    pub retry: RetrySettings,
    pub agent: AgentSettings,
    pub tool_servers: Vec<ToolServerConfig>,
}

impl SkeinConfig {
    /// Load config from a TOML file, falling back to defaults for missing
    /// fields. After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: SkeinConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Try to load from path; if the file doesn't exist, return defaults
    /// with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SKEIN_BASE_URL") {
            self.backend.base_url = v;
        }
        if let Ok(v) = std::env::var("SKEIN_API_KEY") {
            self.backend.api_key = v;
        }
        if let Ok(v) = std::env::var("SKEIN_MODEL") {
            self.backend.model = v;
        }
        if let Ok(v) = std::env::var("SKEIN_MAX_STEPS") {
            if let Ok(n) = v.parse() {
                self.agent.max_steps = n;
            }
        }
        if let Ok(v) = std::env::var("SKEIN_TOOL_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.agent.tool_timeout_secs = n;
            }
        }
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    /// Sent as the `X-API-Key` header. Usually supplied via `SKEIN_API_KEY`.
    pub api_key: String,
    pub model: String,
    /// Default prompt template (backend "pattern") applied when the request
    /// doesn't name one.
    pub template: Option<String>,
    /// Hard wall-clock timeout per HTTP attempt, independent of retries.
    pub attempt_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:13333".to_string(),
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            template: None,
            attempt_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_wait_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_wait_ms: 1_000,
            max_wait_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Hard bound on reasoning iterations per agent run.
    pub max_steps: u32,
    /// Per-tool-call timeout. Tool servers run out-of-process and may hang
    /// independently of network conditions.
    pub tool_timeout_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: 20,
            tool_timeout_secs: 30,
        }
    }
}

/// One configured tool server. Disabled by default: a server only ever
/// connects when explicitly enabled.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolServerConfig {
    pub id: String,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub enabled: bool,
    pub auto_reconnect: bool,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled: false,
            auto_reconnect: false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
