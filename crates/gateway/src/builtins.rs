//! Built-in capabilities: the symbolic command set, the core LLM chat
//! capability, and the delegation proxy. Discovery assembles these with
//! skill- and channel-derived descriptors for catalog reconciliation.

use std::sync::Arc;

use serde_json::json;

use p3394_capabilities::{
    CapabilityDescriptor, CapabilityFilter, CapabilityKind, DangerLevel, ExposureScope,
    InvocationMode, SourceTag, Substrate,
};
use p3394_domain::error::Result;
use p3394_domain::umf::{ContentBlock, Umf};
use p3394_sessions::Session;
use p3394_skills::SkillRegistry;

use crate::channels::ChannelCapabilities;
use crate::state::{AppState, SymbolicHandler};

pub const LLM_CAPABILITY: &str = "llm.chat";
pub const DELEGATE_CAPABILITY: &str = "task.delegate";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn command(id: &str, alias: &str, description: &str) -> CapabilityDescriptor {
    let mut d = CapabilityDescriptor::atomic(id, alias.trim_start_matches('/'), Substrate::Symbolic)
        .with_command(alias)
        .with_exposure(ExposureScope::Public)
        .with_description(description);
    d.entrypoint = Some(id.to_owned());
    d.usage = Some(alias.to_owned());
    d
}

/// The built-in capability set, before skills and channels are merged in.
pub fn builtin_descriptors() -> Vec<(CapabilityDescriptor, SourceTag)> {
    let mut list = vec![
        command("cmd.help", "/help", "List available commands"),
        command("cmd.about", "/about", "About this agent"),
        command("cmd.status", "/status", "Gateway status"),
        command("cmd.version", "/version", "Agent version"),
        command("cmd.listCommands", "/listCommands", "List command capabilities"),
        command("cmd.listSkills", "/listSkills", "List skill capabilities"),
        command("cmd.listSubAgents", "/listSubAgents", "List subagent capabilities"),
        command("cmd.listChannels", "/listChannels", "List channel transports"),
        command("cmd.whoami", "/whoami", "Show the authenticated principal"),
    ];

    // Admin-only configuration mutator.
    let mut configure = command("cap.configure", "/configure", "Change agent configuration");
    configure.exposure = ExposureScope::Human;
    configure.required_permissions = vec!["cap:admin".into()];
    configure.danger_level = DangerLevel::Critical;
    configure.audit.log_inputs = true;
    list.push(configure);

    // The core LLM capability free text routes to.
    let mut llm = CapabilityDescriptor::atomic(LLM_CAPABILITY, "chat", Substrate::Llm);
    llm.description = "Converse with the agent".into();
    llm.invocation_modes = vec![InvocationMode::Message];
    llm.exposure = ExposureScope::Public;
    llm.default_grant = true;
    list.push(llm);

    // Delegation to subagents.
    let mut delegate = CapabilityDescriptor::atomic(DELEGATE_CAPABILITY, "delegate", Substrate::Agent);
    delegate.kind = CapabilityKind::Proxy;
    delegate.description = "Delegate a task to a subagent".into();
    delegate.invocation_modes = vec![InvocationMode::Message, InvocationMode::Direct];
    delegate.exposure = ExposureScope::Agent;
    delegate.required_permissions = vec!["agent:invoke".into()];
    delegate.delegation.allowed = true;
    delegate.delegation.creates_subagent = true;
    list.push(delegate);

    list.into_iter().map(|d| (d, SourceTag::Builtin)).collect()
}

/// Composite descriptors for every loaded skill document.
pub fn skill_descriptors(skills: &SkillRegistry) -> Vec<(CapabilityDescriptor, SourceTag)> {
    skills
        .list()
        .iter()
        .map(|doc| {
            let mut d = CapabilityDescriptor::atomic(
                doc.capability_id(),
                doc.name(),
                Substrate::Llm,
            );
            d.kind = CapabilityKind::Composite;
            d.description = doc.frontmatter.description.clone();
            d.invocation_modes = vec![InvocationMode::Message];
            d.message_triggers = doc.frontmatter.triggers.clone();
            d.exposure = ExposureScope::Human;
            d.entrypoint = Some(doc.name().to_owned());
            (d, SourceTag::Skill)
        })
        .collect()
}

/// Transport realizations: one descriptor per active channel adapter.
pub fn channel_descriptors(
    channels: &[ChannelCapabilities],
) -> Vec<(CapabilityDescriptor, SourceTag)> {
    channels
        .iter()
        .map(|caps| {
            let mut d = CapabilityDescriptor::atomic(
                format!("transport.{}", caps.channel_id),
                caps.channel_id.clone(),
                Substrate::Transport,
            );
            d.description = format!("{} channel adapter", caps.channel_type);
            d.invocation_modes = Vec::new();
            d.exposure = ExposureScope::Agent;
            d.status.mutable = false;
            (d, SourceTag::Config)
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn reply_text(req: &Umf, text: String) -> Result<Umf> {
    Ok(Umf::reply_to(req, vec![ContentBlock::text(text)]))
}

fn reply_markdown(req: &Umf, text: String) -> Result<Umf> {
    Ok(Umf::reply_to(req, vec![ContentBlock::markdown(text)]))
}

pub fn version_line(state: &AppState) -> String {
    format!(
        "{} v{}",
        state.config.agent.name,
        env!("CARGO_PKG_VERSION")
    )
}

fn help_table(state: &AppState) -> String {
    let mut out = String::from("| Command | Description |\n|---|---|\n");
    let commands = state.registry.query(&CapabilityFilter {
        invocation_mode: Some(InvocationMode::Command),
        enabled: Some(true),
        ..Default::default()
    });
    for d in commands {
        if d.exposure < ExposureScope::Human {
            continue;
        }
        let alias = d
            .command_aliases
            .first()
            .cloned()
            .unwrap_or_else(|| d.capability_id.clone());
        out.push_str(&format!("| {alias} | {} |\n", d.description));
    }
    out
}

fn bullet_list(lines: Vec<String>, empty: &str) -> String {
    if lines.is_empty() {
        return empty.to_string();
    }
    lines
        .into_iter()
        .map(|l| format!("- {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn handler<F>(f: F) -> SymbolicHandler
where
    F: Fn(&Umf, &Session, &AppState) -> Result<Umf> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Install every built-in symbolic handler into the state's handler table.
pub fn register_handlers(state: &AppState) {
    let table: Vec<(&str, SymbolicHandler)> = vec![
        (
            "cmd.version",
            handler(|req, _session, state| reply_text(req, version_line(state))),
        ),
        (
            "cmd.about",
            handler(|req, _session, state| {
                reply_text(
                    req,
                    format!(
                        "{} ({}) — protocol P3394, address p3394://{}",
                        state.config.agent.name,
                        env!("CARGO_PKG_VERSION"),
                        state.agent_id()
                    ),
                )
            }),
        ),
        (
            "cmd.status",
            handler(|req, _session, state| {
                let status = json!({
                    "agent_id": state.agent_id(),
                    "uptime_secs": state.started_at.elapsed().as_secs(),
                    "live_sessions": state.sessions.live_count(),
                    "capabilities": state.registry.list().len(),
                    "subagents": state.router.agent_ids(),
                });
                reply_text(req, status.to_string())
            }),
        ),
        (
            "cmd.help",
            handler(|req, _session, state| reply_markdown(req, help_table(state))),
        ),
        (
            "cmd.listCommands",
            handler(|req, _session, state| {
                let lines = state
                    .catalog
                    .query(&CapabilityFilter {
                        kind: Some(CapabilityKind::Atomic),
                        invocation_mode: Some(InvocationMode::Command),
                        enabled: Some(true),
                        ..Default::default()
                    })
                    .into_iter()
                    .map(|e| {
                        format!(
                            "{} — {}",
                            e.descriptor
                                .command_aliases
                                .first()
                                .cloned()
                                .unwrap_or_else(|| e.descriptor.capability_id.clone()),
                            e.descriptor.description
                        )
                    })
                    .collect();
                reply_markdown(req, bullet_list(lines, "No commands registered."))
            }),
        ),
        (
            "cmd.listSkills",
            handler(|req, _session, state| {
                let lines = state
                    .catalog
                    .query(&CapabilityFilter {
                        kind: Some(CapabilityKind::Composite),
                        enabled: Some(true),
                        ..Default::default()
                    })
                    .into_iter()
                    .map(|e| format!("{} — {}", e.descriptor.name, e.descriptor.description))
                    .collect();
                reply_markdown(req, bullet_list(lines, "No skills loaded."))
            }),
        ),
        (
            "cmd.listSubAgents",
            handler(|req, _session, state| {
                let mut lines: Vec<String> = state
                    .catalog
                    .query(&CapabilityFilter {
                        kind: Some(CapabilityKind::Proxy),
                        substrate: Some(Substrate::Agent),
                        ..Default::default()
                    })
                    .into_iter()
                    .map(|e| format!("{} — {}", e.descriptor.name, e.descriptor.description))
                    .collect();
                for agent_id in state.router.agent_ids() {
                    lines.push(format!("{agent_id} — connected subagent"));
                }
                reply_markdown(req, bullet_list(lines, "No subagents connected."))
            }),
        ),
        (
            "cmd.listChannels",
            handler(|req, _session, state| {
                let lines = state
                    .catalog
                    .query(&CapabilityFilter {
                        substrate: Some(Substrate::Transport),
                        ..Default::default()
                    })
                    .into_iter()
                    .map(|e| format!("{} — {}", e.descriptor.name, e.descriptor.description))
                    .collect();
                reply_markdown(req, bullet_list(lines, "No channels active."))
            }),
        ),
        (
            "cmd.whoami",
            handler(|req, session, _state| {
                reply_text(
                    req,
                    format!(
                        "principal: {}\nassurance: {:?}\nchannel: {}\npermissions: {}",
                        session.client_principal,
                        session.assurance,
                        session.channel_id,
                        if session.permissions.is_empty() {
                            "(none)".to_string()
                        } else {
                            session.permissions.join(", ")
                        }
                    ),
                )
            }),
        ),
        (
            "cap.configure",
            handler(|req, _session, _state| {
                // Reaching this handler means policy allowed the change.
                reply_text(
                    req,
                    "configuration update accepted (restart required to apply)".into(),
                )
            }),
        ),
    ];

    for (entrypoint, handler) in table {
        state.register_symbolic(entrypoint, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_set_includes_required_commands() {
        let descriptors = builtin_descriptors();
        for alias in ["/help", "/about", "/status", "/version", "/listCommands"] {
            assert!(
                descriptors.iter().any(|(d, _)| d
                    .command_aliases
                    .iter()
                    .any(|a| a == alias)),
                "missing {alias}"
            );
        }
    }

    #[test]
    fn configure_requires_admin_permission() {
        let descriptors = builtin_descriptors();
        let (configure, _) = descriptors
            .iter()
            .find(|(d, _)| d.capability_id == "cap.configure")
            .unwrap();
        assert_eq!(configure.required_permissions, vec!["cap:admin"]);
        assert_eq!(configure.danger_level, DangerLevel::Critical);
    }

    #[test]
    fn llm_capability_is_default_grant() {
        let descriptors = builtin_descriptors();
        let (llm, _) = descriptors
            .iter()
            .find(|(d, _)| d.capability_id == LLM_CAPABILITY)
            .unwrap();
        assert!(llm.default_grant);
        assert!(llm.required_permissions.is_empty());
    }
}
