//! The unified capability descriptor.
//!
//! One schema describes everything the agent can do — built-in commands,
//! skills, subagent proxies, transport realizations — and drives discovery,
//! routing, permissioning, and introspection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Directly invocable unit.
    Atomic,
    /// A sequence of hooks around an underlying substrate.
    Composite,
    /// Forwards to another capability, possibly on another agent.
    Proxy,
    /// Not directly invocable; instantiated by other capabilities.
    Template,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substrate {
    Symbolic,
    Llm,
    Shell,
    Agent,
    ExternalService,
    Transport,
}

impl Substrate {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Substrate::Symbolic => "symbolic",
            Substrate::Llm => "llm",
            Substrate::Shell => "shell",
            Substrate::Agent => "agent",
            Substrate::ExternalService => "external_service",
            Substrate::Transport => "transport",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    Direct,
    Command,
    Message,
    Event,
    UiAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureScope {
    Internal,
    Agent,
    Channel,
    Human,
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Input/output schema, inline or by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaRef {
    Reference(String),
    Inline(Value),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

/// Lifecycle hooks; each entry is a capability id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub pre_invoke: Vec<String>,
    #[serde(default)]
    pub post_invoke: Vec<String>,
    #[serde(default)]
    pub on_error: Vec<String>,
}

impl Hooks {
    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.pre_invoke
            .iter()
            .chain(&self.post_invoke)
            .chain(&self.on_error)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delegation {
    #[serde(default)]
    pub allowed: bool,
    #[serde(default)]
    pub creates_subagent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    #[serde(default = "d_true")]
    pub log_invocation: bool,
    #[serde(default)]
    pub log_inputs: bool,
    #[serde(default)]
    pub log_outputs: bool,
}

impl Default for Audit {
    fn default() -> Self {
        Self {
            log_invocation: true,
            log_inputs: false,
            log_outputs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_true")]
    pub mutable: bool,
    #[serde(default)]
    pub signed: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            enabled: true,
            mutable: true,
            signed: false,
        }
    }
}

fn d_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub capability_id: String,
    pub name: String,
    #[serde(default = "d_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub kind: CapabilityKind,
    pub substrate: Substrate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub invocation_modes: Vec<InvocationMode>,
    #[serde(default)]
    pub command_aliases: Vec<String>,
    /// Lowercased substrings that route free text to this capability.
    #[serde(default)]
    pub message_triggers: Vec<String>,
    #[serde(default = "d_exposure")]
    pub exposure: ExposureScope,
    /// Channels this capability may be exposed on. Empty = all.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    #[serde(default)]
    pub default_grant: bool,
    #[serde(default = "d_danger")]
    pub danger_level: DangerLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<SchemaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<SchemaRef>,
    #[serde(default)]
    pub dependencies: Dependencies,
    #[serde(default)]
    pub hooks: Hooks,
    #[serde(default)]
    pub delegation: Delegation,
    #[serde(default)]
    pub audit: Audit,
    #[serde(default)]
    pub status: Status,
    /// Usage line rendered in the manifest and `/help`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    /// Classification overrides (normally auto-derived from the id prefix).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_level: Option<crate::catalog::PowerLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cognitive_pattern: Option<crate::catalog::CognitivePattern>,
}

fn d_version() -> String {
    "1.0.0".into()
}
fn d_exposure() -> ExposureScope {
    ExposureScope::Internal
}
fn d_danger() -> DangerLevel {
    DangerLevel::Low
}

impl CapabilityDescriptor {
    /// Minimal atomic descriptor; callers fill in the rest.
    pub fn atomic(capability_id: impl Into<String>, name: impl Into<String>, substrate: Substrate) -> Self {
        Self {
            capability_id: capability_id.into(),
            name: name.into(),
            version: d_version(),
            description: String::new(),
            kind: CapabilityKind::Atomic,
            substrate,
            runtime: None,
            entrypoint: None,
            invocation_modes: vec![InvocationMode::Direct],
            command_aliases: Vec::new(),
            message_triggers: Vec::new(),
            exposure: ExposureScope::Internal,
            channels: Vec::new(),
            required_permissions: Vec::new(),
            default_grant: false,
            danger_level: DangerLevel::Low,
            input_schema: None,
            output_schema: None,
            dependencies: Dependencies::default(),
            hooks: Hooks::default(),
            delegation: Delegation::default(),
            audit: Audit::default(),
            status: Status::default(),
            usage: None,
            power_level: None,
            cognitive_pattern: None,
        }
    }

    pub fn with_command(mut self, alias: impl Into<String>) -> Self {
        self.command_aliases.push(alias.into());
        if !self.invocation_modes.contains(&InvocationMode::Command) {
            self.invocation_modes.push(InvocationMode::Command);
        }
        self
    }

    pub fn with_exposure(mut self, exposure: ExposureScope) -> Self {
        self.exposure = exposure;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.required_permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn enabled(&self) -> bool {
        self.status.enabled
    }

    /// May this capability be shown / invoked on `channel_id`?
    pub fn allows_channel(&self, channel_id: &str) -> bool {
        self.channels.is_empty() || self.channels.iter().any(|c| c == channel_id)
    }
}

/// Case-normalization applied to command aliases before uniqueness checks
/// and lookup.
pub fn normalize_alias(alias: &str) -> String {
    alias.trim().trim_start_matches('/').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_command_mode() {
        let d = CapabilityDescriptor::atomic("cmd.version", "Version", Substrate::Symbolic)
            .with_command("/version");
        assert!(d.invocation_modes.contains(&InvocationMode::Command));
        assert_eq!(d.command_aliases, vec!["/version"]);
    }

    #[test]
    fn alias_normalization() {
        assert_eq!(normalize_alias("/Help"), "help");
        assert_eq!(normalize_alias("  /LISTCOMMANDS "), "listcommands");
        assert_eq!(normalize_alias("status"), "status");
    }

    #[test]
    fn descriptor_serde_round_trip() {
        let d = CapabilityDescriptor::atomic("cmd.help", "Help", Substrate::Symbolic)
            .with_command("/help")
            .with_exposure(ExposureScope::Public)
            .with_description("List available commands");
        let json = serde_json::to_string(&d).unwrap();
        let back: CapabilityDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.capability_id, "cmd.help");
        assert_eq!(back.exposure, ExposureScope::Public);
        assert!(back.status.enabled);
        assert!(back.audit.log_invocation);
    }

    #[test]
    fn schema_ref_accepts_inline_and_reference() {
        let r: SchemaRef = serde_json::from_str(r#""p3394://schema/umf""#).unwrap();
        assert!(matches!(r, SchemaRef::Reference(_)));
        let i: SchemaRef =
            serde_json::from_str(r#"{"type":"object","required":["text"]}"#).unwrap();
        assert!(matches!(i, SchemaRef::Inline(_)));
    }

    #[test]
    fn channel_scoping() {
        let mut d = CapabilityDescriptor::atomic("cmd.x", "X", Substrate::Symbolic);
        assert!(d.allows_channel("terminal"));
        d.channels = vec!["http-api".into()];
        assert!(!d.allows_channel("terminal"));
        assert!(d.allows_channel("http-api"));
    }
}
