use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub llm_compat: LlmCompatConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "d_agent_id")]
    pub agent_id: String,
    #[serde(default = "d_agent_name")]
    pub name: String,
    /// Persona header prepended to every LLM prompt.
    #[serde(default = "d_persona")]
    pub persona: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: d_agent_id(),
            name: d_agent_name(),
            persona: d_persona(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage root. Overridden by `P3394_STORAGE_PATH`.
    #[serde(default = "d_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: d_storage_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP servers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    /// HTTP-native channel port.
    #[serde(default = "d_api_port")]
    pub api_port: u16,
    /// Agent-to-agent (P3394 server) channel port.
    #[serde(default = "d_p3394_port")]
    pub p3394_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            api_port: d_api_port(),
            p3394_port: d_p3394_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Unix domain socket path for the interactive terminal channel.
    #[serde(default = "d_socket_path")]
    pub socket_path: PathBuf,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            socket_path: d_socket_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCompatConfig {
    /// Serve the provider-compatible `/v1/messages` endpoint.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "d_llm_compat_port")]
    pub port: u16,
    /// Accepted `x-api-key` values. Empty = open.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Token-usage estimation ratio (characters per token).
    #[serde(default = "d_chars_per_token")]
    pub chars_per_token: usize,
}

impl Default for LlmCompatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: d_llm_compat_port(),
            api_keys: Vec::new(),
            chars_per_token: d_chars_per_token(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions / skills
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Idle TTL measured from last activity.
    #[serde(default = "d_ttl_hours")]
    pub ttl_hours: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_hours: d_ttl_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "d_skills_path")]
    pub path: PathBuf,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            path: d_skills_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing / policy / LLM / MCP
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Leading token that marks a symbolic command.
    #[serde(default = "d_sigil")]
    pub command_sigil: String,
    /// Keywords that route a message to the delegation capability.
    #[serde(default = "d_delegation_keywords")]
    pub delegation_keywords: Vec<String>,
    /// Default deadline for outbound calls, seconds.
    #[serde(default = "d_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            command_sigil: d_sigil(),
            delegation_keywords: d_delegation_keywords(),
            deadline_secs: d_deadline_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyConfig {
    /// Global enforcement flag. Overridden by `ENFORCE_AUTHENTICATION`.
    #[serde(default)]
    pub enforce: bool,
    /// Channels where enforcement is on even when the global flag is off.
    #[serde(default)]
    pub enforce_channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// `mock` or `anthropic`.
    #[serde(default = "d_llm_provider")]
    pub provider: String,
    #[serde(default = "d_llm_model")]
    pub model: String,
    #[serde(default = "d_llm_base_url")]
    pub base_url: String,
    #[serde(default = "d_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "d_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: d_llm_provider(),
            model: d_llm_model(),
            base_url: d_llm_base_url(),
            max_tokens: d_llm_max_tokens(),
            timeout_secs: d_llm_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `stdio` or `sse`.
    #[serde(default = "d_mcp_transport")]
    pub transport: String,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            transport: d_mcp_transport(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Apply environment overrides, then report anything a human should see
    /// before the server starts.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("P3394_STORAGE_PATH") {
            if !path.is_empty() {
                self.storage.path = PathBuf::from(path);
            }
        }
        if let Ok(v) = std::env::var("ENFORCE_AUTHENTICATION") {
            self.policy.enforce = v.eq_ignore_ascii_case("true");
        }
    }

    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let error = |message: String| ConfigIssue {
            severity: ConfigSeverity::Error,
            message,
        };

        if self.agent.agent_id.is_empty() {
            issues.push(error("agent.agent_id must not be empty".into()));
        }
        if self.server.api_port == self.server.p3394_port {
            issues.push(error(format!(
                "server.api_port and server.p3394_port are both {}",
                self.server.api_port
            )));
        }
        if self.llm_compat.enabled
            && (self.llm_compat.port == self.server.api_port
                || self.llm_compat.port == self.server.p3394_port)
        {
            issues.push(error(format!(
                "llm_compat.port {} collides with another server port",
                self.llm_compat.port
            )));
        }
        if self.llm_compat.chars_per_token == 0 {
            issues.push(error("llm_compat.chars_per_token must be > 0".into()));
        }
        if self.routing.command_sigil.is_empty() {
            issues.push(error("routing.command_sigil must not be empty".into()));
        }
        if !self.skills.path.exists() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: format!(
                    "skills.path {} does not exist — no skills will be loaded",
                    self.skills.path.display()
                ),
            });
        }
        issues
    }
}

// ── Defaults ─────────────────────────────────────────────────────────

fn d_agent_id() -> String {
    "exemplar".into()
}
fn d_agent_name() -> String {
    "P3394 Exemplar Agent".into()
}
fn d_persona() -> String {
    "You are the P3394 Exemplar Agent, a helpful standards-compliant assistant.".into()
}
fn d_storage_path() -> PathBuf {
    PathBuf::from("./data")
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_api_port() -> u16 {
    3394
}
fn d_p3394_port() -> u16 {
    3395
}
fn d_llm_compat_port() -> u16 {
    3396
}
fn d_socket_path() -> PathBuf {
    PathBuf::from("./data/terminal.sock")
}
fn d_chars_per_token() -> usize {
    4
}
fn d_ttl_hours() -> u64 {
    24
}
fn d_skills_path() -> PathBuf {
    PathBuf::from("./skills")
}
fn d_sigil() -> String {
    "/".into()
}
fn d_delegation_keywords() -> Vec<String> {
    vec![
        "delegate to".into(),
        "ask the subagent".into(),
        "hand off to".into(),
    ]
}
fn d_deadline_secs() -> u64 {
    120
}
fn d_llm_provider() -> String {
    "mock".into()
}
fn d_llm_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn d_llm_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn d_llm_max_tokens() -> u32 {
    4096
}
fn d_llm_timeout() -> u64 {
    120
}
fn d_mcp_transport() -> String {
    "stdio".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.api_port, 3394);
        assert_eq!(config.sessions.ttl_hours, 24);
        assert_eq!(config.routing.command_sigil, "/");
        assert!(!config.policy.enforce);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            api_port = 8080

            [llm_compat]
            enabled = true
            api_keys = ["sk-agent-key1"]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.api_port, 8080);
        assert_eq!(config.server.p3394_port, 3395);
        assert!(config.llm_compat.enabled);
        assert_eq!(config.llm_compat.api_keys, vec!["sk-agent-key1"]);
    }

    #[test]
    fn port_collision_is_an_error() {
        let config: Config = toml::from_str(
            r#"
            [server]
            api_port = 3394
            p3394_port = 3394
            "#,
        )
        .unwrap();
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("p3394_port")));
    }
}
