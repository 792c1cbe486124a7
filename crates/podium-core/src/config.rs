//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level Podium configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    /// Frames larger than this are dropped without being parsed.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_port() -> u16 {
    18790
}

fn default_max_payload_bytes() -> usize {
    65_536
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Max WebSocket connections per IP (default: 10).
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,
}

fn default_max_connections_per_ip() -> u32 {
    10
}

/// Client-side sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Realtime endpoint, e.g. `ws://127.0.0.1:18790/ws/lecture-1`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_env: Option<String>,

    /// Session (room) name appended to a relay base URL by the CLI.
    #[serde(default = "default_session")]
    pub session: String,

    /// Name of the same-device broadcast channel.
    #[serde(default = "default_channel_name")]
    pub channel_name: String,
}

fn default_session() -> String {
    "default".into()
}

fn default_channel_name() -> String {
    "podium-session-sync".into()
}

impl SyncConfig {
    /// Resolve the endpoint from the direct value or the named env var.
    pub fn resolve_endpoint(&self) -> Option<String> {
        resolve_secret_field(&self.endpoint, &self.endpoint_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "podium_backplane=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a value: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::PodiumError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw)?;

        json5::from_str(&substituted)
            .map_err(|e| crate::error::PodiumError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn relay_port(&self) -> u16 {
        self.relay.as_ref().map(|r| r.port).unwrap_or_else(default_port)
    }

    pub fn relay_bind(&self) -> String {
        self.relay
            .as_ref()
            .and_then(|r| r.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn max_connections_per_ip(&self) -> Option<u32> {
        self.relay
            .as_ref()
            .and_then(|r| r.rate_limit.as_ref())
            .map(|rl| rl.max_connections_per_ip)
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.relay
            .as_ref()
            .map(|r| r.max_payload_bytes)
            .unwrap_or_else(default_max_payload_bytes)
    }

    pub fn sync_endpoint(&self) -> Option<String> {
        self.sync.as_ref().and_then(SyncConfig::resolve_endpoint)
    }

    pub fn session_name(&self) -> String {
        self.sync
            .as_ref()
            .map(|s| s.session.clone())
            .unwrap_or_else(default_session)
    }

    pub fn channel_name(&self) -> String {
        self.sync
            .as_ref()
            .map(|s| s.channel_name.clone())
            .unwrap_or_else(default_channel_name)
    }

    /// Get a config value by dotted path (e.g. "relay.port", "sync.session").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(sync) = &self.sync {
            match sync.resolve_endpoint() {
                Some(endpoint) => {
                    if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
                        errors.push(format!(
                            "Sync endpoint must use ws:// or wss://: {endpoint}"
                        ));
                    }
                }
                None => {
                    if let Some(env) = &sync.endpoint_env {
                        warnings.push(format!(
                            "Sync endpoint env var '{env}' is unset; websocket transport disabled"
                        ));
                    }
                }
            }
            if sync.session.trim().is_empty() {
                errors.push("Sync session name cannot be empty".to_string());
            }
        }

        if let Some(relay) = &self.relay {
            if relay.port == 0 {
                errors.push("Relay port cannot be 0".to_string());
            }
            if relay.max_payload_bytes == 0 {
                errors.push("Relay max_payload_bytes cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Podium data: `~/.podium/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".podium")
}
