//! LLM-provider-compatible `POST /v1/messages` endpoint.
//!
//! Accepts the Anthropic Messages request shape, flattens the conversation
//! into a single TEXT message for the gateway, and wraps the reply in the
//! provider's response envelope (streaming via SSE or blocking JSON). This
//! gives drop-in compatibility with clients that speak the provider API.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use p3394_domain::error::{Error, Result};
use p3394_domain::principal::{AssuranceLevel, ClientAssertion};
use p3394_domain::umf::{ContentKind, Umf};

use crate::channels::{AuthContext, ChannelAdapter, ChannelCapabilities, CommandSyntax};
use crate::core::Gateway;

pub const CHANNEL_ID: &str = "llm-compat";

/// Streaming chunk size in characters.
const DELTA_CHUNK_CHARS: usize = 80;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CompatRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<CompatMessage>,
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct CompatMessage {
    pub role: String,
    /// A string, or an array of `{type: "text", text}` blocks.
    pub content: Value,
}

impl CompatMessage {
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct LlmCompatState {
    pub gateway: Arc<Gateway>,
    /// SHA-256 digests of accepted keys; empty = open endpoint.
    pub api_key_hashes: Arc<Vec<Vec<u8>>>,
    pub chars_per_token: usize,
}

pub fn channel_capabilities() -> ChannelCapabilities {
    ChannelCapabilities {
        channel_id: CHANNEL_ID.into(),
        channel_type: "llm-compat".into(),
        content_types: vec![ContentKind::Text],
        max_message_bytes: 10 * 1024 * 1024,
        max_attachment_bytes: 0,
        supports_streaming: true,
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

pub fn router(state: LlmCompatState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages))
        .with_state(state)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Hash the configured key list once at startup.
pub fn hash_api_keys(keys: &[String]) -> Vec<Vec<u8>> {
    keys.iter()
        .map(|k| Sha256::digest(k.as_bytes()).to_vec())
        .collect()
}

fn check_api_key(state: &LlmCompatState, headers: &HeaderMap) -> std::result::Result<Option<String>, Response> {
    if state.api_key_hashes.is_empty() {
        return Ok(None); // open endpoint
    }
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let digest = Sha256::digest(provided.as_bytes());
    let accepted = state
        .api_key_hashes
        .iter()
        .any(|expected| bool::from(digest.ct_eq(expected.as_slice())));
    if accepted {
        Ok(Some(provided.to_owned()))
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "type": "error",
                "error": { "type": "authentication_error", "message": "invalid x-api-key" },
            })),
        )
            .into_response())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Flatten a provider-style conversation into a single gateway request.
pub fn flatten_request(body: &CompatRequest, api_key: Option<&str>) -> Result<Umf> {
    let last_user = body
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .ok_or_else(|| Error::DecodeInvalid("no user message in messages array".into()))?;

    let mut history = String::new();
    if let Some(system) = &body.system {
        let text = match system {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        history.push_str(&format!("system: {text}\n"));
    }
    for m in &body.messages {
        history.push_str(&format!("{}: {}\n", m.role, m.text()));
    }

    let mut msg = Umf::text_request(last_user.text());
    msg.metadata.insert("history".into(), Value::String(history));
    msg.metadata
        .insert("model".into(), Value::String(body.model.clone()));
    msg.metadata
        .insert("max_tokens".into(), Value::from(body.max_tokens));
    msg.metadata
        .insert("source_api".into(), Value::String("anthropic".into()));

    let assertion = match api_key {
        Some(key) => ClientAssertion {
            channel_id: CHANNEL_ID.into(),
            channel_identity: format!("api_key:{key}"),
            assurance: AssuranceLevel::Medium,
            method: "api_key".into(),
        },
        None => ClientAssertion::anonymous(CHANNEL_ID),
    };
    msg.set_client_assertion(&assertion);
    Ok(msg)
}

/// Character-ratio token estimation (a configuration knob, not a contract).
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> u32 {
    (text.chars().count() / chars_per_token.max(1)).max(1) as u32
}

async fn messages(
    State(state): State<LlmCompatState>,
    headers: HeaderMap,
    Json(body): Json<CompatRequest>,
) -> Response {
    let api_key = match check_api_key(&state, &headers) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let msg = match flatten_request(&body, api_key.as_deref()) {
        Ok(msg) => msg,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "type": "error",
                    "error": { "type": "invalid_request_error", "message": e.to_string() },
                })),
            )
                .into_response();
        }
    };

    let input_estimate = estimate_tokens(
        msg.first_text().unwrap_or_default(),
        state.chars_per_token,
    );
    let reply = state.gateway.handle(msg).await;
    let reply_text = reply
        .content
        .iter()
        .filter_map(|b| b.as_text())
        .collect::<Vec<_>>()
        .join("\n");

    if reply.is_error() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "type": "error",
                "error": {
                    "type": "api_error",
                    "message": reply_text,
                    "code": reply.error_code(),
                },
            })),
        )
            .into_response();
    }

    let output_estimate = estimate_tokens(&reply_text, state.chars_per_token);
    let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());

    if body.stream {
        stream_response(message_id, body.model, reply_text, input_estimate, output_estimate)
            .into_response()
    } else {
        Json(json!({
            "id": message_id,
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "text", "text": reply_text }],
            "model": body.model,
            "stop_reason": "end_turn",
            "usage": { "input_tokens": input_estimate, "output_tokens": output_estimate },
        }))
        .into_response()
    }
}

/// Provider-style SSE framing: `message_start`, `content_block_start`,
/// repeated `content_block_delta`, `message_stop`.
fn stream_response(
    message_id: String,
    model: String,
    text: String,
    input_tokens: u32,
    output_tokens: u32,
) -> Sse<impl futures_core::Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        yield Ok(Event::default().event("message_start").data(
            json!({
                "type": "message_start",
                "message": {
                    "id": message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": model,
                    "usage": { "input_tokens": input_tokens, "output_tokens": 0 },
                },
            })
            .to_string(),
        ));
        yield Ok(Event::default().event("content_block_start").data(
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "text", "text": "" },
            })
            .to_string(),
        ));

        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(DELTA_CHUNK_CHARS) {
            let delta: String = chunk.iter().collect();
            yield Ok(Event::default().event("content_block_delta").data(
                json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": { "type": "text_delta", "text": delta },
                })
                .to_string(),
            ));
        }

        yield Ok(Event::default().event("message_stop").data(
            json!({
                "type": "message_stop",
                "usage": { "input_tokens": input_tokens, "output_tokens": output_tokens },
            })
            .to_string(),
        ));
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter wrapper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LlmCompatAdapter {
    gateway: Arc<Gateway>,
    host: String,
    port: u16,
    api_key_hashes: Arc<Vec<Vec<u8>>>,
    chars_per_token: usize,
}

impl LlmCompatAdapter {
    pub fn new(
        gateway: Arc<Gateway>,
        host: String,
        port: u16,
        api_key_hashes: Arc<Vec<Vec<u8>>>,
        chars_per_token: usize,
    ) -> Self {
        Self {
            gateway,
            host,
            port,
            api_key_hashes,
            chars_per_token,
        }
    }
}

#[async_trait]
impl ChannelAdapter for LlmCompatAdapter {
    fn capabilities(&self) -> ChannelCapabilities {
        channel_capabilities()
    }

    fn authenticate_client(&self, context: &AuthContext) -> ClientAssertion {
        match &context.api_key {
            Some(key) => ClientAssertion {
                channel_id: CHANNEL_ID.into(),
                channel_identity: format!("api_key:{key}"),
                assurance: AssuranceLevel::Medium,
                method: "api_key".into(),
            },
            None => ClientAssertion::anonymous(CHANNEL_ID),
        }
    }

    async fn start(&self) -> Result<()> {
        let app = router(LlmCompatState {
            gateway: self.gateway.clone(),
            api_key_hashes: self.api_key_hashes.clone(),
            chars_per_token: self.chars_per_token,
        });
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("cannot bind {addr}: {e}")))?;
        tracing::info!(addr = %addr, "llm-compatible channel listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "llm-compatible channel server error");
            }
        });
        Ok(())
    }

    async fn stop(&self) {}

    async fn send_to_client(&self, _reply_to: &str, _msg: &Umf) -> Result<()> {
        Err(Error::Config("llm-compatible channel replies are request-scoped".into()))
    }

    fn get_endpoints(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_takes_last_user_message_and_history() {
        let body = CompatRequest {
            model: "local-exemplar".into(),
            max_tokens: 1024,
            messages: vec![
                CompatMessage {
                    role: "user".into(),
                    content: json!("first"),
                },
                CompatMessage {
                    role: "assistant".into(),
                    content: json!("reply"),
                },
                CompatMessage {
                    role: "user".into(),
                    content: json!([{ "type": "text", "text": "/help" }]),
                },
            ],
            system: Some(json!("be helpful")),
            temperature: None,
            stream: false,
        };
        let msg = flatten_request(&body, Some("sk-agent-key1")).unwrap();
        assert_eq!(msg.first_text(), Some("/help"));
        let history = msg.metadata["history"].as_str().unwrap();
        assert!(history.contains("system: be helpful"));
        assert!(history.contains("user: first"));
        assert!(history.contains("assistant: reply"));
        assert_eq!(msg.metadata["source_api"], "anthropic");
        assert_eq!(msg.metadata["model"], "local-exemplar");
        let assertion = msg.client_assertion().unwrap();
        assert_eq!(assertion.channel_identity, "api_key:sk-agent-key1");
        assert_eq!(assertion.assurance, AssuranceLevel::Medium);
    }

    #[test]
    fn flatten_without_user_message_fails() {
        let body = CompatRequest {
            model: "m".into(),
            max_tokens: 10,
            messages: vec![CompatMessage {
                role: "assistant".into(),
                content: json!("hi"),
            }],
            system: None,
            temperature: None,
            stream: false,
        };
        assert!(flatten_request(&body, None).is_err());
    }

    #[test]
    fn token_estimation_uses_char_ratio() {
        assert_eq!(estimate_tokens("12345678", 4), 2);
        assert_eq!(estimate_tokens("123", 4), 1); // at least one
        assert_eq!(estimate_tokens("", 4), 1);
    }

    #[test]
    fn api_key_hashing_round_trips() {
        let hashes = hash_api_keys(&["sk-agent-key1".to_string()]);
        let digest = Sha256::digest(b"sk-agent-key1");
        assert!(bool::from(digest.ct_eq(hashes[0].as_slice())));
        let wrong = Sha256::digest(b"sk-other");
        assert!(!bool::from(wrong.ct_eq(hashes[0].as_slice())));
    }
}
