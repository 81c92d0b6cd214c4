//! Shared application state passed to the gateway core, the invocation
//! engine, and every channel adapter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use p3394_capabilities::{CapabilityCatalog, CapabilityRegistry};
use p3394_domain::config::Config;
use p3394_domain::error::Result;
use p3394_domain::umf::Umf;
use p3394_kstar::{KstarStore, XapiWriter};
use p3394_principals::{PolicyEngine, PrincipalRegistry};
use p3394_providers::LlmClient;
use p3394_router::OutboundRouter;
use p3394_sessions::{Session, SessionManager};
use p3394_skills::SkillRegistry;

use crate::session_lock::SessionLockMap;

/// In-process handler behind a symbolic capability. Executed synchronously
/// on the caller's task.
pub type SymbolicHandler =
    Arc<dyn Fn(&Umf, &Session, &AppState) -> Result<Umf> + Send + Sync>;

/// Shared application state.
///
/// Fields are grouped by concern:
/// - **Identity & policy** — principal registry, policy engine
/// - **Capabilities** — registry, catalog, symbolic handler table
/// - **Sessions & memory** — session manager, KSTAR store, xAPI writer
/// - **Execution** — LLM client, outbound router, skills
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    // ── Identity & policy ─────────────────────────────────────────────
    pub principals: Arc<PrincipalRegistry>,
    pub policy: Arc<PolicyEngine>,

    // ── Capabilities ──────────────────────────────────────────────────
    pub registry: Arc<CapabilityRegistry>,
    pub catalog: Arc<CapabilityCatalog>,
    /// Entrypoint name → in-process handler for the symbolic substrate.
    pub symbolic_handlers: Arc<RwLock<HashMap<String, SymbolicHandler>>>,

    // ── Sessions & memory ─────────────────────────────────────────────
    pub sessions: Arc<SessionManager>,
    pub session_locks: Arc<SessionLockMap>,
    pub kstar: Arc<KstarStore>,
    pub xapi: Arc<XapiWriter>,

    // ── Execution ─────────────────────────────────────────────────────
    pub llm: Arc<dyn LlmClient>,
    pub router: Arc<OutboundRouter>,
    pub skills: Arc<SkillRegistry>,

    /// Capabilities of every active channel adapter, registered at startup
    /// and published in the manifest.
    pub channels: Arc<RwLock<Vec<crate::channels::ChannelCapabilities>>>,

    /// Startup instant, for `/status`.
    pub started_at: Instant,

    /// SHA-256 digests of the accepted LLM-compatible API keys
    /// (empty = open endpoint).
    pub api_key_hashes: Arc<Vec<Vec<u8>>>,
}

impl AppState {
    pub fn register_symbolic(&self, entrypoint: &str, handler: SymbolicHandler) {
        self.symbolic_handlers
            .write()
            .insert(entrypoint.to_owned(), handler);
    }

    pub fn symbolic_handler(&self, entrypoint: &str) -> Option<SymbolicHandler> {
        self.symbolic_handlers.read().get(entrypoint).cloned()
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent.agent_id
    }

    pub fn register_channel(&self, caps: crate::channels::ChannelCapabilities) {
        self.channels.write().push(caps);
    }

    pub fn channel_list(&self) -> Vec<crate::channels::ChannelCapabilities> {
        self.channels.read().clone()
    }
}
