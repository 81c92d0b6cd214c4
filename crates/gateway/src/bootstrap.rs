//! Startup wiring: build the shared state, run capability discovery and
//! catalog reconciliation, and connect built-in subagents.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use p3394_capabilities::{CapabilityCatalog, CapabilityRegistry};
use p3394_domain::config::Config;
use p3394_domain::error::Result;
use p3394_kstar::{KstarStore, XapiWriter};
use p3394_principals::{PolicyEngine, PrincipalRegistry, SYSTEM_URN};
use p3394_providers::LlmClient;
use p3394_router::{OutboundRouter, SubagentManifest, TransportSpec};
use p3394_sessions::SessionManager;
use p3394_skills::SkillRegistry;

use crate::builtins;
use crate::channels::ChannelCapabilities;
use crate::core::Gateway;
use crate::kstar_agent::{KstarAgent, KSTAR_AGENT_ID};
use crate::session_lock::SessionLockMap;
use crate::state::AppState;

/// Permissions a capability may require. Registration rejects anything
/// outside this set.
pub const PERMISSION_UNIVERSE: &[&str] = &[
    "*",
    "read",
    "write",
    "execute",
    "admin",
    "status",
    "shell",
    "cap:admin",
    "agent:invoke",
    "kstar:*",
    "llm:*",
];

/// Build the application state against a storage root. Tests pass a fresh
/// temp root; the binary passes the configured one.
pub fn build_state(config: Arc<Config>, llm: Arc<dyn LlmClient>) -> Result<AppState> {
    let storage = config.storage.path.clone();
    std::fs::create_dir_all(&storage)?;

    let principals = Arc::new(PrincipalRegistry::new(&storage)?);
    let policy = Arc::new(PolicyEngine::with_default_policy(
        config.policy.enforce,
        config.policy.enforce_channels.clone(),
    ));
    tracing::info!(
        enforce = config.policy.enforce,
        enforced_channels = config.policy.enforce_channels.len(),
        "policy engine ready"
    );

    let registry = Arc::new(CapabilityRegistry::with_permission_universe(
        PERMISSION_UNIVERSE,
    ));
    let catalog = Arc::new(CapabilityCatalog::load(&storage)?);

    let sessions = Arc::new(SessionManager::new(
        &storage,
        config.sessions.ttl_hours,
        SYSTEM_URN,
    ));
    let kstar = Arc::new(KstarStore::new(&storage)?);
    let xapi = Arc::new(XapiWriter::new(&storage));

    let skills = Arc::new(SkillRegistry::load(&config.skills.path)?);
    tracing::info!(skills = skills.len(), "skills loaded");

    let router = Arc::new(OutboundRouter::new(config.routing.deadline_secs));

    let api_key_hashes = Arc::new(crate::channels::llm_compat::hash_api_keys(
        &config.llm_compat.api_keys,
    ));

    Ok(AppState {
        config,
        principals,
        policy,
        registry,
        catalog,
        symbolic_handlers: Arc::new(RwLock::new(Default::default())),
        sessions,
        session_locks: Arc::new(SessionLockMap::new()),
        kstar,
        xapi,
        llm,
        router,
        skills,
        channels: Arc::new(RwLock::new(Vec::new())),
        started_at: Instant::now(),
        api_key_hashes,
    })
}

/// Discovery + reconcile: register builtin handlers, assemble descriptors
/// from every system source, reconcile against long-term memory, and
/// connect the KSTAR subagent over the direct transport.
pub fn initialize_capabilities(
    state: &AppState,
    active_channels: &[ChannelCapabilities],
) -> Result<()> {
    builtins::register_handlers(state);

    let mut discovered = builtins::builtin_descriptors();
    discovered.extend(builtins::skill_descriptors(&state.skills));
    discovered.extend(KstarAgent::descriptors());
    discovered.extend(builtins::channel_descriptors(active_channels));

    let report = state.catalog.reconcile(&state.registry, discovered)?;
    tracing::info!(
        in_both = report.in_both.len(),
        only_system = report.only_system.len(),
        only_memory = report.only_memory.len(),
        "capability catalog reconciled"
    );

    state.router.connect(
        &SubagentManifest {
            agent_id: KSTAR_AGENT_ID.into(),
            transports: vec![TransportSpec::Direct],
        },
        Some(Arc::new(KstarAgent::new(
            state.kstar.clone(),
            state.config.storage.path.clone(),
        ))),
    )?;

    Ok(())
}

/// Convenience used by the binary and the integration tests: state,
/// capabilities, gateway.
pub fn build_gateway(
    config: Arc<Config>,
    llm: Arc<dyn LlmClient>,
    active_channels: &[ChannelCapabilities],
) -> Result<Arc<Gateway>> {
    let state = build_state(config, llm)?;
    for caps in active_channels {
        state.register_channel(caps.clone());
    }
    initialize_capabilities(&state, active_channels)?;
    Ok(Arc::new(Gateway::new(state)))
}
