//! Outbound routing of UMF messages to subagents over direct, stdio-rpc,
//! http, and socket transports with health-aware failover.

pub mod router;
pub mod transport;

pub use router::{OutboundRouter, SubagentManifest};
pub use transport::{Subagent, SubagentTransport, TransportKind, TransportSpec};
