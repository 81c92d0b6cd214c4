use serde::Serialize;

/// Structured trace events emitted across all gateway crates.
///
/// These are operational logs (one JSON object per event under the
/// `p3394_event` field), distinct from the KSTAR episodic traces the memory
/// subsystem persists.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    GatewayRequest {
        message_id: String,
        channel_id: String,
        session_id: String,
        principal_urn: String,
    },
    RouteSelected {
        message_id: String,
        route: String,
        capability_id: String,
    },
    PolicyDecision {
        capability_id: String,
        principal_urn: String,
        decision: String,
        rule: String,
        enforced: bool,
    },
    SessionCreated {
        session_id: String,
        channel_id: String,
    },
    SessionExpired {
        session_id: String,
        idle_secs: i64,
    },
    CapabilityInvoked {
        capability_id: String,
        substrate: String,
        duration_ms: u64,
        success: bool,
    },
    TransportFailover {
        agent_id: String,
        from_transport: String,
        to_transport: String,
        reason: String,
    },
    SkillMatched {
        skill_name: String,
        trigger: String,
    },
    ContentAdapted {
        channel_id: String,
        dropped_blocks: usize,
    },
    CatalogReconciled {
        in_both: usize,
        only_system: usize,
        only_memory: usize,
    },
    KstarAppend {
        family: String,
        record_id: String,
        session_id: Option<String>,
    },
    XapiEmitted {
        verb: String,
        message_id: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(p3394_event = %json, "gw_event");
    }
}
