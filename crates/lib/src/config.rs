//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.askbridge/config.json`) and environment.
//! Secrets always prefer the environment; the file only supplies fallbacks.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP listener and webhook verification settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Outbound chat platform settings (Chatwork, Slack).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Model provider settings.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Extra or overriding tool-server declarations, keyed by server name.
    #[serde(default)]
    pub tool_servers: BTreeMap<String, ToolServerConfig>,

    /// Per-integration overrides (trigger token, tool servers, model).
    #[serde(default)]
    pub integrations: IntegrationsConfig,

    /// Timeouts, retries and admission limits.
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Gateway bind, port, and webhook verification secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the HTTP listener (default 4000).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Shared secret for subscription handshakes. Overridden by WEBHOOK_VERIFY_TOKEN env.
    pub verify_token: Option<String>,
}

fn default_gateway_port() -> u16 {
    4000
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            verify_token: None,
        }
    }
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub chatwork: ChatworkChannelConfig,
}

/// Chatwork channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatworkChannelConfig {
    /// API token. Overridden by CHATWORK_API_TOKEN env when set.
    pub api_token: Option<String>,
    /// Fallback room for replies when the event carries none. Overridden by CHATWORK_ROOM_ID env.
    pub room_id: Option<String>,
    /// API base URL (default https://api.chatwork.com/v2).
    pub api_base: Option<String>,
}

/// Model provider settings (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Default model id (e.g. "gpt-4o-mini").
    pub model: Option<String>,
    /// API base URL including the version segment (default https://api.openai.com/v1).
    pub base_url: Option<String>,
    /// API key. Overridden by OPENAI_API_KEY env when set.
    pub api_key: Option<String>,
}

/// One tool-protocol server declaration. `env` values may reference process env as `${VAR}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Integration overrides, one block per integration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationsConfig {
    #[serde(default)]
    pub chatwork: IntegrationConfig,
    #[serde(default)]
    pub slack: IntegrationConfig,
    #[serde(default)]
    pub crm: IntegrationConfig,
    #[serde(default)]
    pub news: IntegrationConfig,
}

/// Overrides for a single integration. Unset fields keep the built-in profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Command token that must appear in the message (e.g. "/ask").
    pub trigger: Option<String>,
    /// Tool servers bound to this integration's agent.
    pub servers: Option<Vec<String>>,
    /// Model id for this integration; falls back to agent.model.
    pub model: Option<String>,
    /// Output schema version for integrations with structured output (crm: 1 or 2).
    pub schema_version: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger: None,
            servers: None,
            model: None,
            schema_version: None,
        }
    }
}

/// Deadlines, retries and admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    /// Hard deadline for one agent invocation, including its tool calls.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Deadline for one tool-server request (handshake, list, call).
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Maximum number of tool sessions open at once across all requests.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Extra attempts for each outbound post after the first one fails.
    #[serde(default = "default_dispatch_retries")]
    pub dispatch_retries: u32,
    /// Base delay between outbound attempts; doubles after each failure.
    #[serde(default = "default_dispatch_backoff_ms")]
    pub dispatch_backoff_ms: u64,
}

fn default_agent_timeout_secs() -> u64 {
    300
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_sessions() -> usize {
    4
}

fn default_dispatch_retries() -> u32 {
    2
}

fn default_dispatch_backoff_ms() -> u64 {
    500
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            agent_timeout_secs: default_agent_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            dispatch_retries: default_dispatch_retries(),
            dispatch_backoff_ms: default_dispatch_backoff_ms(),
        }
    }
}

impl PolicyConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs.max(1))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs.max(1))
    }

    pub fn dispatch_backoff(&self) -> Duration {
        Duration::from_millis(self.dispatch_backoff_ms)
    }

    /// Session permits; zero would deadlock every request, so it is clamped to one.
    pub fn session_permits(&self) -> usize {
        self.max_concurrent_sessions.max(1)
    }
}

/// Non-empty trimmed env value, if set.
fn env_value(var: &str) -> Option<String> {
    std::env::var(var).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Pick the env value when present, otherwise the trimmed non-empty config value.
pub fn prefer_env(env: Option<String>, config_value: Option<&String>) -> Option<String> {
    env.or_else(|| {
        config_value
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the webhook verification secret: WEBHOOK_VERIFY_TOKEN, then FB_WEBHOOK_TOKEN, then config.
pub fn resolve_verify_token(config: &Config) -> Option<String> {
    prefer_env(
        env_value("WEBHOOK_VERIFY_TOKEN").or_else(|| env_value("FB_WEBHOOK_TOKEN")),
        config.gateway.verify_token.as_ref(),
    )
}

/// Resolve the model provider key: env OPENAI_API_KEY overrides config.
pub fn resolve_openai_api_key(config: &Config) -> Option<String> {
    prefer_env(env_value("OPENAI_API_KEY"), config.agent.api_key.as_ref())
}

/// Resolve the Chatwork API token: env CHATWORK_API_TOKEN overrides config.
pub fn resolve_chatwork_token(config: &Config) -> Option<String> {
    prefer_env(
        env_value("CHATWORK_API_TOKEN"),
        config.channels.chatwork.api_token.as_ref(),
    )
}

/// Resolve the fallback Chatwork room: env CHATWORK_ROOM_ID overrides config.
pub fn resolve_chatwork_room(config: &Config) -> Option<String> {
    prefer_env(
        env_value("CHATWORK_ROOM_ID"),
        config.channels.chatwork.room_id.as_ref(),
    )
}

/// Expand `${VAR}` references against `lookup`. Returns None when any referenced variable is unset,
/// so a declared credential that is missing stays visibly missing instead of becoming "".
pub fn expand_env_with<F>(value: &str, lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}')?;
        let name = &after[..end];
        out.push_str(&lookup(name)?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}

/// Expand `${VAR}` references against the process environment.
pub fn expand_env(value: &str) -> Option<String> {
    expand_env_with(value, env_value)
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("ASKBRIDGE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".askbridge").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 4000);
        assert_eq!(g.bind, "127.0.0.1");
        assert!(g.verify_token.is_none());
    }

    #[test]
    fn parses_camel_case_sections() {
        let json = r#"{
            "gateway": { "port": 8080, "verifyToken": "s3cret" },
            "agent": { "model": "gpt-4o" },
            "toolServers": {
                "search": { "command": "npx", "args": ["-y", "server-perplexity-ask"], "env": { "PERPLEXITY_API_KEY": "${PPLX}" } }
            },
            "integrations": { "crm": { "schemaVersion": 1, "enabled": false } },
            "policy": { "maxConcurrentSessions": 2 }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.gateway.verify_token.as_deref(), Some("s3cret"));
        assert_eq!(config.agent.model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.tool_servers["search"].args.len(), 2);
        assert!(!config.integrations.crm.enabled);
        assert_eq!(config.integrations.crm.schema_version, Some(1));
        assert!(config.integrations.slack.enabled);
        assert_eq!(config.policy.max_concurrent_sessions, 2);
        assert_eq!(config.policy.dispatch_retries, 2);
    }

    #[test]
    fn prefer_env_falls_back_to_trimmed_config() {
        let cfg = Some(" from-config ".to_string());
        assert_eq!(
            prefer_env(Some("from-env".into()), cfg.as_ref()).as_deref(),
            Some("from-env")
        );
        assert_eq!(prefer_env(None, cfg.as_ref()).as_deref(), Some("from-config"));
        let blank = Some("   ".to_string());
        assert_eq!(prefer_env(None, blank.as_ref()), None);
    }

    #[test]
    fn expand_env_substitutes_and_reports_missing() {
        let lookup = |name: &str| match name {
            "A" => Some("alpha".to_string()),
            _ => None,
        };
        assert_eq!(
            expand_env_with("key-${A}-x", lookup).as_deref(),
            Some("key-alpha-x")
        );
        assert_eq!(expand_env_with("plain", lookup).as_deref(), Some("plain"));
        assert_eq!(expand_env_with("${MISSING}", lookup), None);
        assert_eq!(expand_env_with("${unterminated", lookup), None);
    }

    #[test]
    fn policy_clamps_degenerate_values() {
        let policy = PolicyConfig {
            agent_timeout_secs: 0,
            max_concurrent_sessions: 0,
            ..PolicyConfig::default()
        };
        assert_eq!(policy.agent_timeout(), Duration::from_secs(1));
        assert_eq!(policy.session_permits(), 1);
        assert_eq!(PolicyConfig::default().tool_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind(" localhost "));
        assert!(!is_loopback_bind("0.0.0.0"));
    }
}
