//! The outbound router: deliver UMF messages to subagents over the best
//! healthy transport.
//!
//! Transport order comes from the subagent's manifest preference list. A
//! transient failure (timeout, connection reset) marks the transport
//! unhealthy and falls over to the next; exhausting the list yields
//! NO_TRANSPORT. In-flight requests per subagent are bounded by a
//! semaphore — over-limit calls suspend until a slot frees.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};

use p3394_domain::error::{Error, Result};
use p3394_domain::trace::TraceEvent;
use p3394_domain::umf::Umf;

use crate::transport::{
    DirectTransport, HttpTransport, SocketTransport, StdioRpcTransport, Subagent,
    SubagentTransport, TransportKind, TransportSpec,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manifest
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a subagent declares about itself: identity and transport
/// preference order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentManifest {
    pub agent_id: String,
    pub transports: Vec<TransportSpec>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TransportSlot {
    transport: Arc<dyn SubagentTransport>,
    healthy: Arc<AtomicBool>,
}

struct AgentEntry {
    transports: Vec<TransportSlot>,
    /// Bounds in-flight requests to this subagent.
    in_flight: Arc<Semaphore>,
    /// Serializes transport selection (not the sends themselves).
    selection: Arc<Mutex<()>>,
}

pub struct OutboundRouter {
    agents: RwLock<HashMap<String, Arc<AgentEntry>>>,
    probe_timeout: Duration,
    default_deadline: Duration,
    max_in_flight: usize,
}

impl OutboundRouter {
    pub fn new(default_deadline_secs: u64) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            probe_timeout: Duration::from_secs(5),
            default_deadline: Duration::from_secs(default_deadline_secs),
            max_in_flight: 8,
        }
    }

    /// Register a subagent. `direct` supplies the in-process object when
    /// the manifest lists the direct transport.
    pub fn connect(
        &self,
        manifest: &SubagentManifest,
        direct: Option<Arc<dyn Subagent>>,
    ) -> Result<()> {
        let mut slots = Vec::new();
        for spec in &manifest.transports {
            let transport: Arc<dyn SubagentTransport> = match spec {
                TransportSpec::Direct => {
                    let subagent = direct.clone().ok_or_else(|| {
                        Error::Config(format!(
                            "manifest for {} lists the direct transport but no subagent object was supplied",
                            manifest.agent_id
                        ))
                    })?;
                    Arc::new(DirectTransport::new(subagent))
                }
                TransportSpec::StdioRpc { command, args } => {
                    Arc::new(StdioRpcTransport::spawn(command, args)?)
                }
                TransportSpec::Http { endpoint } => Arc::new(HttpTransport::new(endpoint.clone())?),
                TransportSpec::Socket { path } => Arc::new(SocketTransport::new(path.clone())),
            };
            slots.push(TransportSlot {
                transport,
                healthy: Arc::new(AtomicBool::new(true)),
            });
        }
        if slots.is_empty() {
            return Err(Error::Config(format!(
                "manifest for {} declares no transports",
                manifest.agent_id
            )));
        }

        self.agents.write().insert(
            manifest.agent_id.clone(),
            Arc::new(AgentEntry {
                transports: slots,
                in_flight: Arc::new(Semaphore::new(self.max_in_flight)),
                selection: Arc::new(Mutex::new(())),
            }),
        );
        tracing::info!(agent_id = %manifest.agent_id, "subagent connected");
        Ok(())
    }

    /// Register with a pre-built transport (used by tests and by channels
    /// that advertise themselves as transports).
    pub fn connect_with_transports(
        &self,
        agent_id: &str,
        transports: Vec<Arc<dyn SubagentTransport>>,
    ) {
        let slots = transports
            .into_iter()
            .map(|transport| TransportSlot {
                transport,
                healthy: Arc::new(AtomicBool::new(true)),
            })
            .collect();
        self.agents.write().insert(
            agent_id.to_owned(),
            Arc::new(AgentEntry {
                transports: slots,
                in_flight: Arc::new(Semaphore::new(self.max_in_flight)),
                selection: Arc::new(Mutex::new(())),
            }),
        );
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.agents.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn send(&self, agent_id: &str, msg: &Umf) -> Result<Umf> {
        self.send_with_deadline(agent_id, msg, self.default_deadline)
            .await
    }

    pub async fn send_with_deadline(
        &self,
        agent_id: &str,
        msg: &Umf,
        deadline: Duration,
    ) -> Result<Umf> {
        let entry = self
            .agents
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::NoTransport(format!("{agent_id} (not connected)")))?;

        // Backpressure: suspend until an in-flight slot frees.
        let _permit = entry
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("router semaphore closed".into()))?;

        let mut last_failure: Option<Error> = None;
        let mut previous_kind: Option<TransportKind> = None;

        loop {
            // Serialize selection per subagent; the send itself runs
            // outside the lock.
            let selected = {
                let _selecting = entry.selection.lock().await;
                entry
                    .transports
                    .iter()
                    .find(|slot| slot.healthy.load(Ordering::SeqCst))
                    .map(|slot| (slot.transport.clone(), slot.healthy.clone()))
            };

            let (transport, healthy) = match selected {
                Some(pair) => pair,
                None => {
                    return Err(last_failure
                        .map(|e| {
                            Error::NoTransport(format!("{agent_id} (last failure: {e})"))
                        })
                        .unwrap_or_else(|| Error::NoTransport(agent_id.to_owned())));
                }
            };

            if let Some(from) = previous_kind {
                TraceEvent::TransportFailover {
                    agent_id: agent_id.to_owned(),
                    from_transport: from.name().into(),
                    to_transport: transport.kind().name().into(),
                    reason: last_failure
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default(),
                }
                .emit();
            }

            match transport.send(msg, deadline).await {
                Ok(reply) => return Ok(reply),
                Err(e @ (Error::Timeout(_) | Error::Http(_) | Error::Io(_))) => {
                    tracing::warn!(
                        agent_id = %agent_id,
                        transport = transport.kind().name(),
                        error = %e,
                        "transport failed, trying next"
                    );
                    healthy.store(false, Ordering::SeqCst);
                    previous_kind = Some(transport.kind());
                    last_failure = Some(e);
                }
                // Anything else is a real reply-path error, not a
                // transport problem.
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-probe every transport of every subagent, restoring ones that
    /// answer again.
    pub async fn probe_all(&self) {
        let agents: Vec<(String, Arc<AgentEntry>)> = self
            .agents
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (agent_id, entry) in agents {
            for slot in &entry.transports {
                let alive = slot.transport.probe(self.probe_timeout).await;
                let was = slot.healthy.swap(alive, Ordering::SeqCst);
                if was != alive {
                    tracing::info!(
                        agent_id = %agent_id,
                        transport = slot.transport.kind().name(),
                        healthy = alive,
                        "transport health changed"
                    );
                }
            }
        }
    }

    /// Mark one transport of a subagent unavailable (operational control;
    /// also used to drain before shutdown).
    pub async fn close_transport(&self, agent_id: &str, kind: TransportKind) {
        let entry = self.agents.read().get(agent_id).cloned();
        if let Some(entry) = entry {
            for slot in &entry.transports {
                if slot.transport.kind() == kind {
                    slot.transport.close().await;
                    slot.healthy.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    pub async fn close(&self, agent_id: &str) {
        let entry = self.agents.write().remove(agent_id);
        if let Some(entry) = entry {
            for slot in &entry.transports {
                slot.transport.close().await;
            }
            tracing::info!(agent_id = %agent_id, "subagent disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use p3394_domain::umf::ContentBlock;
    use std::sync::atomic::AtomicUsize;

    struct Echo;

    #[async_trait]
    impl Subagent for Echo {
        fn agent_id(&self) -> &str {
            "echo"
        }
        async fn handle(&self, msg: Umf) -> Result<Umf> {
            Ok(Umf::reply_to(
                &msg,
                vec![ContentBlock::text(format!(
                    "echo: {}",
                    msg.first_text().unwrap_or_default()
                ))],
            ))
        }
    }

    /// Scripted transport: fails the first `fail_first` sends.
    struct Flaky {
        kind: TransportKind,
        fail_first: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SubagentTransport for Flaky {
        fn kind(&self) -> TransportKind {
            self.kind
        }
        async fn send(&self, msg: &Umf, _deadline: Duration) -> Result<Umf> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(Error::Timeout("scripted".into()));
            }
            Ok(Umf::reply_to(
                msg,
                vec![ContentBlock::text(self.kind.name())],
            ))
        }
        async fn probe(&self, _timeout: Duration) -> bool {
            true
        }
        async fn close(&self) {}
    }

    fn flaky(kind: TransportKind, fail_first: usize) -> Arc<dyn SubagentTransport> {
        Arc::new(Flaky {
            kind,
            fail_first,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn direct_send_round_trips() {
        let router = OutboundRouter::new(5);
        router
            .connect(
                &SubagentManifest {
                    agent_id: "echo".into(),
                    transports: vec![TransportSpec::Direct],
                },
                Some(Arc::new(Echo)),
            )
            .unwrap();

        let req = Umf::text_request("hi");
        let reply = router.send("echo", &req).await.unwrap();
        assert_eq!(reply.reply_to.as_deref(), Some(req.id.as_str()));
        assert_eq!(reply.first_text(), Some("echo: hi"));
    }

    #[tokio::test]
    async fn unknown_agent_is_no_transport() {
        let router = OutboundRouter::new(5);
        let err = router.send("ghost", &Umf::text_request("x")).await.unwrap_err();
        assert_eq!(err.code(), "NO_TRANSPORT");
    }

    #[tokio::test]
    async fn failover_follows_preference_order() {
        let router = OutboundRouter::new(5);
        router.connect_with_transports(
            "sub",
            vec![
                flaky(TransportKind::Direct, usize::MAX),
                flaky(TransportKind::StdioRpc, 0),
            ],
        );
        let reply = router.send("sub", &Umf::text_request("x")).await.unwrap();
        assert_eq!(reply.first_text(), Some("stdio-rpc"));
    }

    #[tokio::test]
    async fn exhaustion_yields_no_transport() {
        let router = OutboundRouter::new(5);
        router.connect_with_transports(
            "sub",
            vec![
                flaky(TransportKind::Direct, usize::MAX),
                flaky(TransportKind::Http, usize::MAX),
            ],
        );
        let err = router.send("sub", &Umf::text_request("x")).await.unwrap_err();
        assert_eq!(err.code(), "NO_TRANSPORT");
    }

    #[tokio::test]
    async fn close_transport_forces_failover() {
        let router = OutboundRouter::new(5);
        router.connect_with_transports(
            "sub",
            vec![
                flaky(TransportKind::Direct, 0),
                flaky(TransportKind::StdioRpc, 0),
            ],
        );
        // Healthy direct serves first.
        let reply = router.send("sub", &Umf::text_request("x")).await.unwrap();
        assert_eq!(reply.first_text(), Some("direct"));

        router.close_transport("sub", TransportKind::Direct).await;
        let reply = router.send("sub", &Umf::text_request("x")).await.unwrap();
        assert_eq!(reply.first_text(), Some("stdio-rpc"));

        router.close_transport("sub", TransportKind::StdioRpc).await;
        let err = router.send("sub", &Umf::text_request("x")).await.unwrap_err();
        assert_eq!(err.code(), "NO_TRANSPORT");
    }

    #[tokio::test]
    async fn probe_all_restores_closed_flags() {
        let router = OutboundRouter::new(5);
        router.connect_with_transports("sub", vec![flaky(TransportKind::Direct, 1)]);
        // First call fails and marks the transport unhealthy.
        let _ = router.send("sub", &Umf::text_request("x")).await;
        let err = router.send("sub", &Umf::text_request("x")).await.unwrap_err();
        assert_eq!(err.code(), "NO_TRANSPORT");

        // Probe succeeds (Flaky probes true) and restores health.
        router.probe_all().await;
        let reply = router.send("sub", &Umf::text_request("x")).await.unwrap();
        assert_eq!(reply.first_text(), Some("direct"));
    }
}
