//! Stdio-RPC channel (MCP-compatible).
//!
//! Line-delimited JSON-RPC 2.0 over stdin/stdout. Every enabled capability
//! is exposed as a tool named by a deterministic prefix rule, plus a
//! `send_message` built-in equivalent to posting a TEXT message. The
//! server also answers `p3394/send` and `p3394/ping`, so a peer gateway's
//! stdio transport can drive it directly. Authentication mirrors the
//! terminal channel with MEDIUM assurance.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use p3394_domain::error::{Error, Result};
use p3394_domain::principal::{AssuranceLevel, ClientAssertion};
use p3394_domain::umf::{ContentBlock, ContentKind, Umf};

use crate::channels::{AuthContext, ChannelAdapter, ChannelCapabilities, CommandSyntax};
use crate::core::Gateway;

pub const CHANNEL_ID: &str = "mcp";

/// Deterministic tool-name rule: prefix plus the capability id with
/// separators flattened.
pub fn tool_name(capability_id: &str) -> String {
    format!("p3394_{}", capability_id.replace(['.', ':'], "_"))
}

pub fn channel_capabilities() -> ChannelCapabilities {
    ChannelCapabilities {
        channel_id: CHANNEL_ID.into(),
        channel_type: "stdio-rpc".into(),
        content_types: vec![ContentKind::Text, ContentKind::Json],
        max_message_bytes: 4 * 1024 * 1024,
        max_attachment_bytes: 0,
        supports_streaming: false,
        supports_attachments: false,
        supports_images: false,
        supports_folders: false,
        supports_multipart: false,
        supports_markdown: false,
        supports_html: false,
        rate_limit_per_minute: None,
        command_syntax: CommandSyntax::Text,
        command_prefix: "".into(),
    }
}

pub struct McpServer {
    gateway: Arc<Gateway>,
    /// One session for the lifetime of the server process.
    session_id: Mutex<Option<String>>,
}

impl McpServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            session_id: Mutex::new(None),
        }
    }

    fn assertion() -> ClientAssertion {
        let os_user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
        ClientAssertion {
            channel_id: "cli".into(),
            channel_identity: format!("local:{os_user}"),
            assurance: AssuranceLevel::Medium,
            method: "os_user".into(),
        }
    }

    /// Serve stdin/stdout until EOF.
    pub async fn run(&self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut lines = BufReader::new(stdin).lines();
        tracing::info!("stdio-rpc channel serving on stdin/stdout");

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_request(&line).await {
                stdout.write_all(response.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
        Ok(())
    }

    /// Process one JSON-RPC line. `None` for notifications (no id).
    pub async fn handle_request(&self, line: &str) -> Option<String> {
        let request: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                return Some(
                    json!({
                        "jsonrpc": "2.0",
                        "id": Value::Null,
                        "error": { "code": -32700, "message": format!("parse error: {e}") },
                    })
                    .to_string(),
                );
            }
        };

        let id = request.get("id").cloned();
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let result = self.dispatch(&method, params).await;

        // Notifications get no response.
        let id = id?;
        Some(
            match result {
                Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                Err(e) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32000, "message": e.to_string(), "data": { "p3394_code": e.code() } },
                }),
            }
            .to_string(),
        )
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {
                    "name": self.gateway.state().config.agent.name,
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": { "tools": {} },
            })),
            "tools/list" => Ok(self.list_tools()),
            "tools/call" => self.call_tool(params).await,
            "p3394/ping" => Ok(json!("pong")),
            "p3394/send" => {
                let mut msg = crate::channels::http_api::normalize_inbound(params)?;
                msg.set_client_assertion(&Self::assertion());
                let reply = self.gateway.handle(msg).await;
                Ok(serde_json::to_value(&reply)?)
            }
            other => Err(Error::Config(format!("unknown method: {other}"))),
        }
    }

    fn list_tools(&self) -> Value {
        let mut tools: Vec<Value> = self
            .gateway
            .state()
            .registry
            .list()
            .into_iter()
            .filter(|d| d.enabled())
            .map(|d| {
                json!({
                    "name": tool_name(&d.capability_id),
                    "description": d.description,
                    "inputSchema": {
                        "type": "object",
                        "properties": { "text": { "type": "string" } },
                    },
                })
            })
            .collect();
        tools.push(json!({
            "name": "send_message",
            "description": "Send a text message to the agent",
            "inputSchema": {
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"],
            },
        }));
        json!({ "tools": tools })
    }

    async fn call_tool(&self, params: Value) -> Result<Value> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Config("tools/call requires name".into()))?
            .to_owned();
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let reply = if name == "send_message" {
            self.send_text(text).await
        } else {
            // Reverse the prefix rule back to a capability id.
            let capability_id = self
                .gateway
                .state()
                .registry
                .list()
                .into_iter()
                .map(|d| d.capability_id)
                .find(|id| tool_name(id) == name)
                .ok_or_else(|| Error::CapNotFound(name.clone()))?;

            let session = self.session().await?;
            let mut msg = if text.is_empty() {
                Umf::request(vec![ContentBlock::json(arguments)])
            } else {
                Umf::text_request(text)
            };
            msg.session_id = Some(session.session_id.clone());
            Ok(self.gateway.engine().invoke(&capability_id, &msg, &session).await?)
        };
        let reply = reply?;

        let reply_text = reply
            .content
            .iter()
            .filter_map(|b| b.as_text())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(json!({ "content": [{ "type": "text", "text": reply_text }] }))
    }

    async fn send_text(&self, text: String) -> Result<Umf> {
        let session_id = self.session_id.lock().await.clone();
        let mut msg = Umf::text_request(text);
        msg.session_id = session_id;
        msg.set_client_assertion(&Self::assertion());
        let reply = self.gateway.handle(msg).await;
        *self.session_id.lock().await = reply.session_id.clone();
        Ok(reply)
    }

    /// The server's session, created and bound on first use.
    async fn session(&self) -> Result<p3394_sessions::Session> {
        let mut guard = self.session_id.lock().await;
        if let Some(sid) = guard.as_deref() {
            if let Some(session) = self.gateway.state().sessions.get(sid) {
                return Ok(session);
            }
        }
        let assertion = Self::assertion();
        let state = self.gateway.state();
        let session = state.sessions.create_session(p3394_sessions::CreateSession {
            client_id: Some(assertion.channel_identity.clone()),
            channel_id: Some(assertion.channel_id.clone()),
            ttl: None,
        })?;
        let (principal, scopes) = state
            .principals
            .resolve_or_anonymous(&assertion.channel_id, &assertion.channel_identity);
        let session = state
            .sessions
            .bind_principal(
                &session.session_id,
                &principal.urn,
                assertion.assurance,
                scopes,
                true,
            )
            .unwrap_or(session);
        *guard = Some(session.session_id.clone());
        Ok(session)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter wrapper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct McpAdapter {
    server: Arc<McpServer>,
}

impl McpAdapter {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            server: Arc::new(McpServer::new(gateway)),
        }
    }

    pub fn server(&self) -> Arc<McpServer> {
        self.server.clone()
    }
}

#[async_trait]
impl ChannelAdapter for McpAdapter {
    fn capabilities(&self) -> ChannelCapabilities {
        channel_capabilities()
    }

    fn authenticate_client(&self, context: &AuthContext) -> ClientAssertion {
        let os_user = context
            .os_user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".into());
        ClientAssertion {
            channel_id: "cli".into(),
            channel_identity: format!("local:{os_user}"),
            assurance: AssuranceLevel::Medium,
            method: "os_user".into(),
        }
    }

    async fn start(&self) -> Result<()> {
        let server = self.server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "stdio-rpc channel error");
            }
        });
        Ok(())
    }

    async fn stop(&self) {}

    async fn send_to_client(&self, _reply_to: &str, _msg: &Umf) -> Result<()> {
        Err(Error::Config("stdio-rpc replies are request-scoped".into()))
    }

    fn get_endpoints(&self) -> BTreeMap<String, String> {
        let mut endpoints = BTreeMap::new();
        for d in self.server.gateway.state().registry.list() {
            endpoints.insert(
                d.capability_id.clone(),
                tool_name(&d.capability_id),
            );
        }
        endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_are_deterministic() {
        assert_eq!(tool_name("cmd.version"), "p3394_cmd_version");
        assert_eq!(tool_name("kstar:store_trace"), "p3394_kstar_store_trace");
    }
}
