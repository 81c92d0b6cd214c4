//! The self-describing manifest served by the HTTP channels.

use serde_json::{json, Map, Value};

use p3394_capabilities::{CapabilityFilter, ExposureScope, InvocationMode};

use crate::channels::map_command_syntax;
use crate::state::AppState;

/// Build the manifest JSON. `detailed` adds the agent-to-agent discovery
/// extensions: per-channel command syntax maps and the skill trigger
/// evaluation order.
pub fn build(state: &AppState, detailed: bool) -> Value {
    let channels = state.channel_list();

    let commands: Vec<Value> = state
        .registry
        .query(&CapabilityFilter {
            invocation_mode: Some(InvocationMode::Command),
            enabled: Some(true),
            ..Default::default()
        })
        .into_iter()
        .filter(|d| d.exposure >= ExposureScope::Channel)
        .map(|d| {
            let name = d
                .command_aliases
                .first()
                .cloned()
                .unwrap_or_else(|| d.capability_id.clone());
            let mut command = json!({
                "name": name,
                "description": d.description,
                "usage": d.usage.clone().unwrap_or_else(|| name.clone()),
                "requires_auth": !d.required_permissions.is_empty(),
                "aliases": d.command_aliases,
            });
            if detailed {
                let mut by_channel = Map::new();
                for caps in &channels {
                    by_channel.insert(
                        caps.channel_id.clone(),
                        Value::String(map_command_syntax(&name, caps.command_syntax)),
                    );
                }
                command["syntax_by_channel"] = Value::Object(by_channel);
            }
            command
        })
        .collect();

    let channel_entries: Vec<Value> = channels
        .iter()
        .map(|caps| {
            let mut endpoints = Map::new();
            for command in &commands {
                if let Some(name) = command["name"].as_str() {
                    endpoints.insert(
                        name.trim_start_matches('/').to_owned(),
                        Value::String(map_command_syntax(name, caps.command_syntax)),
                    );
                }
            }
            json!({
                "id": caps.channel_id,
                "type": caps.channel_type,
                "active": true,
                "command_syntax": caps.command_syntax,
                "command_prefix": caps.command_prefix,
                "endpoints": Value::Object(endpoints),
            })
        })
        .collect();

    let mut manifest = json!({
        "agent_id": state.agent_id(),
        "name": state.config.agent.name,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "P3394",
        "address": format!("p3394://{}", state.agent_id()),
        "channels": channel_entries,
        "commands": commands,
    });

    if detailed {
        manifest["skill_trigger_ordering"] = Value::Array(
            state
                .skills
                .trigger_ordering()
                .into_iter()
                .map(|(trigger, skill)| json!({ "trigger": trigger, "skill": skill }))
                .collect(),
        );
    }
    manifest
}
