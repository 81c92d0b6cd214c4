//! HTTP channels: the native API and the agent-to-agent (P3394 server)
//! variant.
//!
//! Both expose `GET /manifest`, `POST /messages` (UMF in, UMF out),
//! `WS /ws`, and a generated `GET /{command}` route for every symbolic
//! capability exposed to humans. The agent variant serves the detailed
//! manifest with per-channel command syntax for discovery.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};

use p3394_domain::error::{Error, Result};
use p3394_domain::principal::{AssuranceLevel, ClientAssertion};
use p3394_domain::umf::{self, ContentBlock, ContentKind, MessageType, Umf};

use crate::channels::{
    adapt_content, AuthContext, ChannelAdapter, ChannelCapabilities, CommandSyntax,
    normalize_command,
};
use crate::core::Gateway;
use crate::manifest;

pub const NATIVE_CHANNEL_ID: &str = "http-api";
pub const AGENT_CHANNEL_ID: &str = "p3394";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct HttpChannelState {
    pub gateway: Arc<Gateway>,
    pub caps: ChannelCapabilities,
    /// Serve the detailed (agent-discovery) manifest.
    pub detailed_manifest: bool,
}

pub fn native_capabilities() -> ChannelCapabilities {
    ChannelCapabilities {
        channel_id: NATIVE_CHANNEL_ID.into(),
        channel_type: "http".into(),
        content_types: vec![
            ContentKind::Text,
            ContentKind::Json,
            ContentKind::Markdown,
            ContentKind::Html,
            ContentKind::Binary,
            ContentKind::Image,
            ContentKind::File,
            ContentKind::ToolCall,
            ContentKind::ToolResult,
            ContentKind::Folder,
        ],
        max_message_bytes: 100 * 1024 * 1024,
        max_attachment_bytes: 100 * 1024 * 1024,
        supports_streaming: true,
        supports_attachments: true,
        supports_images: true,
        supports_folders: true,
        supports_multipart: true,
        supports_markdown: true,
        supports_html: true,
        rate_limit_per_minute: None,
        command_syntax: CommandSyntax::Http,
        command_prefix: "/".into(),
    }
}

pub fn agent_capabilities() -> ChannelCapabilities {
    ChannelCapabilities {
        channel_id: AGENT_CHANNEL_ID.into(),
        channel_type: "p3394".into(),
        ..native_capabilities()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Upper bound on concurrently processed requests per HTTP channel;
/// excess connections queue at the TCP level rather than being dropped.
const MAX_CONCURRENT_REQUESTS: usize = 256;

pub fn router(state: HttpChannelState) -> Router {
    let body_limit = state.caps.max_message_bytes;
    Router::new()
        .route("/manifest", get(get_manifest))
        .route("/messages", post(post_messages))
        .route("/ws", get(ws_upgrade))
        .route("/:command", get(get_command))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .with_state(state)
}

fn assertion_from_headers(channel_id: &str, headers: &HeaderMap) -> ClientAssertion {
    match headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        Some(key) if !key.is_empty() => ClientAssertion {
            channel_id: channel_id.to_owned(),
            channel_identity: format!("api_key:{key}"),
            assurance: AssuranceLevel::Medium,
            method: "api_key".into(),
        },
        _ => ClientAssertion::anonymous(channel_id),
    }
}

/// Fill in what a lenient HTTP client may omit (`id`, `type`,
/// `timestamp`), then run the strict decoder.
pub fn normalize_inbound(mut body: Value) -> Result<Umf> {
    if !body.is_object() {
        return Err(Error::DecodeInvalid("message body must be a JSON object".into()));
    }
    let obj = body.as_object_mut().expect("checked above");
    obj.entry("id")
        .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
    obj.entry("type").or_insert_with(|| json!("request"));
    obj.entry("timestamp")
        .or_insert_with(|| json!(chrono::Utc::now().to_rfc3339()));
    umf::decode(&serde_json::to_vec(&body)?)
}

fn decode_failure_response(e: &Error) -> Response {
    let status = match e {
        Error::DecodeUnsupported(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        _ => StatusCode::BAD_REQUEST,
    };
    let mut reply = Umf::new(
        MessageType::Error,
        vec![ContentBlock::text(e.to_string())],
    );
    reply
        .metadata
        .insert("error_code".into(), Value::String(e.code().into()));
    (status, Json(serde_json::to_value(&reply).unwrap_or(Value::Null))).into_response()
}

async fn get_manifest(State(state): State<HttpChannelState>) -> Json<Value> {
    Json(manifest::build(state.gateway.state(), state.detailed_manifest))
}

async fn post_messages(
    State(state): State<HttpChannelState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut msg = match normalize_inbound(body) {
        Ok(msg) => msg,
        Err(e) => return decode_failure_response(&e),
    };
    if msg.payload_size() > state.caps.max_message_bytes {
        return decode_failure_response(&Error::DecodeInvalid(format!(
            "message exceeds channel limit of {} bytes",
            state.caps.max_message_bytes
        )));
    }

    msg.set_client_assertion(&assertion_from_headers(&state.caps.channel_id, &headers));
    let reply = state.gateway.handle(msg).await;
    let reply = adapt_content(reply, &state.caps);
    Json(serde_json::to_value(&reply).unwrap_or(Value::Null)).into_response()
}

/// `GET /{command}` — generated route for symbolic capabilities exposed to
/// humans.
async fn get_command(
    State(state): State<HttpChannelState>,
    headers: HeaderMap,
    Path(command): Path<String>,
) -> Response {
    let canonical = normalize_command(&command);
    let exposed = state
        .gateway
        .state()
        .registry
        .resolve_alias(&canonical)
        .and_then(|id| state.gateway.state().registry.get(&id))
        // Only human/public symbolic capabilities get generated routes.
        .map(|d| d.exposure >= p3394_capabilities::ExposureScope::Human)
        .unwrap_or(false);
    if !exposed {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown command: {command}") })),
        )
            .into_response();
    }

    let mut msg = Umf::text_request(canonical);
    msg.set_client_assertion(&assertion_from_headers(&state.caps.channel_id, &headers));
    let reply = state.gateway.handle(msg).await;
    let reply = adapt_content(reply, &state.caps);
    Json(serde_json::to_value(&reply).unwrap_or(Value::Null)).into_response()
}

// ── WebSocket: one UMF in, one UMF reply out ─────────────────────────

async fn ws_upgrade(
    State(state): State<HttpChannelState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let assertion = assertion_from_headers(&state.caps.channel_id, &headers);
    ws.on_upgrade(move |socket| ws_loop(state, assertion, socket))
}

async fn ws_loop(state: HttpChannelState, assertion: ClientAssertion, mut socket: WebSocket) {
    while let Some(Ok(frame)) = socket.recv().await {
        let text = match frame {
            WsMessage::Text(t) => t,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let body: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                let err = Error::DecodeInvalid(e.to_string());
                let payload = json!({ "type": "error", "error_code": err.code(), "text": err.to_string() });
                if socket.send(WsMessage::Text(payload.to_string())).await.is_err() {
                    break;
                }
                continue;
            }
        };
        let reply = match normalize_inbound(body) {
            Ok(mut msg) => {
                msg.set_client_assertion(&assertion);
                let reply = state.gateway.handle(msg).await;
                adapt_content(reply, &state.caps)
            }
            Err(e) => {
                let mut reply =
                    Umf::new(MessageType::Error, vec![ContentBlock::text(e.to_string())]);
                reply
                    .metadata
                    .insert("error_code".into(), Value::String(e.code().into()));
                reply
            }
        };
        let encoded = serde_json::to_string(&reply).unwrap_or_default();
        if socket.send(WsMessage::Text(encoded)).await.is_err() {
            break;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter wrapper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serves the axum router on a TCP port; `detailed_manifest` selects the
/// agent-to-agent variant.
pub struct HttpApiAdapter {
    gateway: Arc<Gateway>,
    caps: ChannelCapabilities,
    host: String,
    port: u16,
    detailed_manifest: bool,
}

impl HttpApiAdapter {
    pub fn native(gateway: Arc<Gateway>, host: String, port: u16) -> Self {
        Self {
            gateway,
            caps: native_capabilities(),
            host,
            port,
            detailed_manifest: false,
        }
    }

    pub fn agent(gateway: Arc<Gateway>, host: String, port: u16) -> Self {
        Self {
            gateway,
            caps: agent_capabilities(),
            host,
            port,
            detailed_manifest: true,
        }
    }
}

#[async_trait]
impl ChannelAdapter for HttpApiAdapter {
    fn capabilities(&self) -> ChannelCapabilities {
        self.caps.clone()
    }

    fn authenticate_client(&self, context: &AuthContext) -> ClientAssertion {
        match &context.api_key {
            Some(key) => ClientAssertion {
                channel_id: self.caps.channel_id.clone(),
                channel_identity: format!("api_key:{key}"),
                assurance: AssuranceLevel::Medium,
                method: "api_key".into(),
            },
            None => ClientAssertion::anonymous(&self.caps.channel_id),
        }
    }

    async fn start(&self) -> Result<()> {
        let app = router(HttpChannelState {
            gateway: self.gateway.clone(),
            caps: self.caps.clone(),
            detailed_manifest: self.detailed_manifest,
        });
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("cannot bind {addr}: {e}")))?;
        tracing::info!(
            addr = %addr,
            channel = %self.caps.channel_id,
            "http channel listening"
        );
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "http channel server error");
            }
        });
        Ok(())
    }

    async fn stop(&self) {}

    async fn send_to_client(&self, _reply_to: &str, _msg: &Umf) -> Result<()> {
        Err(Error::Config("http channel replies are request-scoped".into()))
    }

    fn get_endpoints(&self) -> BTreeMap<String, String> {
        let mut endpoints = BTreeMap::new();
        for d in self.gateway.state().registry.list() {
            if let Some(alias) = d.command_aliases.first() {
                endpoints.insert(
                    alias.trim_start_matches('/').to_owned(),
                    self.map_command_syntax(alias),
                );
            }
        }
        endpoints
    }
}
