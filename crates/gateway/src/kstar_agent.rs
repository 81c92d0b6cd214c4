//! The KSTAR memory subsystem addressed as a subagent.
//!
//! `kstar-memory` is registered with the outbound router like any other
//! subagent and speaks UMF: a request carries a `tool_call` block naming
//! one of the `kstar:*` operations, the reply carries a `tool_result` plus
//! a JSON block with the operation's result.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use p3394_capabilities::{
    CapabilityDescriptor, CapabilityKind, ExposureScope, InvocationMode, SourceTag, Substrate,
};
use std::path::PathBuf;

use p3394_domain::error::{Error, Result};
use p3394_domain::umf::{ContentBlock, ContentKind, ToolResultRecord, Umf};
use p3394_kstar::{ExportOptions, KstarStore, Trace, TraceFilter};
use p3394_router::Subagent;

pub const KSTAR_AGENT_ID: &str = "kstar-memory";

pub struct KstarAgent {
    store: Arc<KstarStore>,
    storage_root: PathBuf,
}

impl KstarAgent {
    pub fn new(store: Arc<KstarStore>, storage_root: PathBuf) -> Self {
        Self {
            store,
            storage_root,
        }
    }

    /// Proxy descriptors advertising the memory operations, for catalog
    /// discovery.
    pub fn descriptors() -> Vec<(CapabilityDescriptor, SourceTag)> {
        let op = |id: &str, description: &str, permission: &str| {
            let mut d = CapabilityDescriptor::atomic(id, id, Substrate::Agent);
            d.kind = CapabilityKind::Proxy;
            d.description = description.into();
            d.invocation_modes = vec![InvocationMode::Direct];
            d.exposure = ExposureScope::Agent;
            d.entrypoint = Some(KSTAR_AGENT_ID.into());
            d.required_permissions = vec![permission.into()];
            (d, SourceTag::Builtin)
        };
        vec![
            op("kstar:store_trace", "Store an episodic trace", "kstar:store"),
            op("kstar:query_traces", "Query stored traces", "kstar:read"),
            op("kstar:verify_token", "Verify a control token", "kstar:read"),
            op("kstar:revoke_token", "Revoke a control token", "kstar:admin"),
            op("kstar:export_bundle", "Export a memory bundle", "kstar:read"),
        ]
    }

    fn run_operation(&self, tool: &str, arguments: &Value) -> Result<Value> {
        match tool {
            "kstar:store_trace" => {
                let mut trace: Trace = serde_json::from_value(arguments.clone())
                    .unwrap_or_else(|_| Trace::new("external"));
                if trace.id.is_empty() {
                    trace.id = uuid::Uuid::new_v4().to_string();
                }
                self.store.store_trace(&trace)?;
                Ok(json!({ "trace_id": trace.id }))
            }
            "kstar:query_traces" => {
                let filter = TraceFilter {
                    session_id: arguments
                        .get("session_id")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    actor: arguments.get("actor").and_then(Value::as_str).map(str::to_owned),
                    channel: arguments
                        .get("channel")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    action_type: arguments
                        .get("action_type")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    success: arguments.get("success").and_then(Value::as_bool),
                    since: None,
                    until: None,
                };
                let limit = arguments.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
                let offset = arguments.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
                let traces = self.store.query_traces(&filter, limit, offset)?;
                let count = traces.len();
                Ok(json!({ "traces": traces, "count": count }))
            }
            "kstar:verify_token" => {
                let token_id = arguments
                    .get("token_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Config("verify_token requires token_id".into()))?;
                let scope = arguments
                    .get("scope")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Config("verify_token requires scope".into()))?;
                let verification = self.store.verify_control_token(token_id, scope);
                Ok(serde_json::to_value(verification)?)
            }
            "kstar:revoke_token" => {
                let token_id = arguments
                    .get("token_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Config("revoke_token requires token_id".into()))?;
                let reason = arguments
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified");
                let token = self.store.revoke_control_token(token_id, reason)?;
                Ok(json!({ "token_id": token.token_id, "revoked": token.revoked }))
            }
            "kstar:export_bundle" => {
                let options = ExportOptions {
                    include_tokens: arguments
                        .get("include_tokens")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    agent: Default::default(),
                };
                let bundle = self.store.export_bundle(&options)?;
                let path = self.store.write_bundle_file(&self.storage_root, &bundle)?;
                Ok(json!({
                    "path": path.display().to_string(),
                    "statistics": bundle.statistics,
                    "integrity": bundle.integrity,
                }))
            }
            other => Err(Error::CapNotFound(other.to_owned())),
        }
    }
}

#[async_trait]
impl Subagent for KstarAgent {
    fn agent_id(&self) -> &str {
        KSTAR_AGENT_ID
    }

    async fn handle(&self, msg: Umf) -> Result<Umf> {
        let call = msg
            .content
            .iter()
            .find(|b| b.kind == ContentKind::ToolCall)
            .ok_or_else(|| Error::Config("kstar-memory expects a tool_call block".into()))?;

        let tool = call
            .data
            .get("tool")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let call_id = call
            .data
            .get("call_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let arguments = call.data.get("arguments").cloned().unwrap_or(Value::Null);

        match self.run_operation(&tool, &arguments) {
            Ok(result) => Ok(Umf::reply_to(
                &msg,
                vec![
                    ContentBlock::tool_result(ToolResultRecord {
                        call_id,
                        success: true,
                        output: result.clone(),
                    }),
                    ContentBlock::json(result),
                ],
            )),
            Err(e) => Ok(Umf::error_reply(&msg, &e)),
        }
    }
}
