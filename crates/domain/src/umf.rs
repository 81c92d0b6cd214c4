//! Universal Message Format — the canonical envelope for every in-process
//! and on-wire message.
//!
//! The wire form is JSON: textual content blocks carry their payload as a
//! JSON string, binary blocks carry base64, tool call/result blocks carry a
//! structured record. Decoders accept unknown metadata keys and unknown
//! top-level keys; an unknown content-block *type* is a hard
//! `DECODE_UNSUPPORTED`.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::principal::ClientAssertion;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Addresses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A P3394 address: `p3394://{agent_id}[/{channel_id}][?session={session_id}]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub agent_id: String,
    pub channel_id: Option<String>,
    pub session_id: Option<String>,
}

impl Address {
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            channel_id: None,
            session_id: None,
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p3394://{}", self.agent_id)?;
        if let Some(ref channel) = self.channel_id {
            write!(f, "/{channel}")?;
        }
        if let Some(ref session) = self.session_id {
            write!(f, "?session={session}")?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("p3394://")
            .ok_or_else(|| Error::DecodeInvalid(format!("not a p3394 address: {s}")))?;

        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };

        let session_id = query.and_then(|q| {
            q.split('&')
                .find_map(|kv| kv.strip_prefix("session=").map(str::to_owned))
        });

        let mut segments = path.splitn(2, '/');
        let agent_id = segments.next().unwrap_or_default();
        if agent_id.is_empty() {
            return Err(Error::DecodeInvalid(format!("address has no agent id: {s}")));
        }
        let channel_id = segments.next().filter(|c| !c.is_empty()).map(str::to_owned);

        Ok(Self {
            agent_id: agent_id.to_owned(),
            channel_id,
            session_id,
        })
    }
}

impl TryFrom<String> for Address {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> String {
        a.to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message + content kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Json,
    Markdown,
    Html,
    Binary,
    Image,
    File,
    ToolCall,
    ToolResult,
    Folder,
}

impl ContentKind {
    /// Wire names accepted by the decoder. Anything else is
    /// `DECODE_UNSUPPORTED`.
    pub const KNOWN: &'static [&'static str] = &[
        "text",
        "json",
        "markdown",
        "html",
        "binary",
        "image",
        "file",
        "tool_call",
        "tool_result",
        "folder",
    ];

    pub fn wire_name(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Json => "json",
            ContentKind::Markdown => "markdown",
            ContentKind::Html => "html",
            ContentKind::Binary => "binary",
            ContentKind::Image => "image",
            ContentKind::File => "file",
            ContentKind::ToolCall => "tool_call",
            ContentKind::ToolResult => "tool_result",
            ContentKind::Folder => "folder",
        }
    }

    /// Kinds whose payload is a base64 string on the wire.
    pub fn is_binary(&self) -> bool {
        matches!(self, ContentKind::Binary | ContentKind::Image | ContentKind::File)
    }

    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            ContentKind::Text | ContentKind::Markdown | ContentKind::Html
        )
    }
}

/// Structured record carried by a `tool_call` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Structured record carried by a `tool_result` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub call_id: String,
    pub success: bool,
    #[serde(default)]
    pub output: Value,
}

/// One content block of a UMF message.
///
/// `data` holds the wire-form payload: a JSON string for textual kinds, a
/// base64 string for binary kinds, a structured record for tool kinds, and
/// an array of filenames for `folder`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ContentBlock {
    pub fn text(data: impl Into<String>) -> Self {
        Self::textual(ContentKind::Text, data)
    }

    pub fn markdown(data: impl Into<String>) -> Self {
        Self::textual(ContentKind::Markdown, data)
    }

    pub fn html(data: impl Into<String>) -> Self {
        Self::textual(ContentKind::Html, data)
    }

    fn textual(kind: ContentKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: Value::String(data.into()),
            filename: None,
            mime_type: None,
            metadata: Map::new(),
        }
    }

    pub fn json(data: Value) -> Self {
        Self {
            kind: ContentKind::Json,
            data,
            filename: None,
            mime_type: Some("application/json".into()),
            metadata: Map::new(),
        }
    }

    /// Base64-wraps `bytes`; `kind` must be one of the binary kinds.
    pub fn binary(kind: ContentKind, bytes: &[u8], filename: impl Into<String>) -> Self {
        debug_assert!(kind.is_binary());
        Self {
            kind,
            data: Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
            filename: Some(filename.into()),
            mime_type: None,
            metadata: Map::new(),
        }
    }

    pub fn tool_call(record: ToolCallRecord) -> Self {
        Self {
            kind: ContentKind::ToolCall,
            data: serde_json::to_value(record).unwrap_or(Value::Null),
            filename: None,
            mime_type: None,
            metadata: Map::new(),
        }
    }

    pub fn tool_result(record: ToolResultRecord) -> Self {
        Self {
            kind: ContentKind::ToolResult,
            data: serde_json::to_value(record).unwrap_or(Value::Null),
            filename: None,
            mime_type: None,
            metadata: Map::new(),
        }
    }

    pub fn folder(filenames: Vec<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Folder,
            data: Value::Array(filenames.into_iter().map(Value::String).collect()),
            filename: Some(name.into()),
            mime_type: None,
            metadata: Map::new(),
        }
    }

    /// The payload as text, for textual kinds.
    pub fn as_text(&self) -> Option<&str> {
        if self.kind.is_textual() {
            self.data.as_str()
        } else {
            None
        }
    }

    /// Decode the base64 payload of a binary kind.
    pub fn decode_bytes(&self) -> Result<Vec<u8>> {
        let s = self
            .data
            .as_str()
            .ok_or_else(|| Error::DecodeInvalid("binary block payload is not a string".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| Error::DecodeInvalid(format!("invalid base64 payload: {e}")))
    }

    /// Approximate payload size in bytes (post-decode for binary kinds).
    pub fn payload_size(&self) -> usize {
        match &self.data {
            Value::String(s) if self.kind.is_binary() => s.len() / 4 * 3,
            Value::String(s) => s.len(),
            other => other.to_string().len(),
        }
    }
}

/// An entry in `metadata.dropped_content`, recording a block the channel
/// could not deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroppedBlock {
    #[serde(rename = "type")]
    pub kind: ContentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Umf {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Umf {
    pub fn new(kind: MessageType, content: Vec<ContentBlock>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            source: None,
            destination: None,
            reply_to: None,
            session_id: None,
            conversation_id: None,
            content,
            metadata: Map::new(),
        }
    }

    pub fn request(content: Vec<ContentBlock>) -> Self {
        Self::new(MessageType::Request, content)
    }

    pub fn text_request(text: impl Into<String>) -> Self {
        Self::request(vec![ContentBlock::text(text)])
    }

    /// A RESPONSE wired to `req`: reply_to, session and conversation ids
    /// carried over.
    pub fn reply_to(req: &Umf, content: Vec<ContentBlock>) -> Self {
        let mut reply = Self::new(MessageType::Response, content);
        reply.reply_to = Some(req.id.clone());
        reply.session_id = req.session_id.clone();
        reply.conversation_id = req.conversation_id.clone();
        reply
    }

    /// An ERROR reply for `req` carrying the human message, the stable
    /// machine code, and (when safe) the failing capability id.
    pub fn error_reply(req: &Umf, err: &Error) -> Self {
        let mut reply = Self::new(
            MessageType::Error,
            vec![ContentBlock::text(err.to_string())],
        );
        reply.reply_to = Some(req.id.clone());
        reply.session_id = req.session_id.clone();
        reply.conversation_id = req.conversation_id.clone();
        reply
            .metadata
            .insert("error_code".into(), Value::String(err.code().into()));
        if let Some(cap) = err.capability_id() {
            reply
                .metadata
                .insert("capability_id".into(), Value::String(cap.into()));
        }
        reply
    }

    /// First textual content block, the common case for routing.
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|b| b.as_text())
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageType::Error
    }

    pub fn error_code(&self) -> Option<&str> {
        self.metadata.get("error_code").and_then(Value::as_str)
    }

    /// Store the inbound adapter's client-principal assertion under
    /// `metadata.security.client_assertion`.
    pub fn set_client_assertion(&mut self, assertion: &ClientAssertion) {
        let security = self
            .metadata
            .entry("security".to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = security {
            map.insert(
                "client_assertion".into(),
                serde_json::to_value(assertion).unwrap_or(Value::Null),
            );
        }
    }

    /// Read back the client-principal assertion, if an adapter set one.
    pub fn client_assertion(&self) -> Option<ClientAssertion> {
        self.metadata
            .get("security")?
            .get("client_assertion")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Total payload size across content blocks.
    pub fn payload_size(&self) -> usize {
        self.content.iter().map(ContentBlock::payload_size).sum()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire codec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Encode a message to its JSON wire form.
pub fn encode(msg: &Umf) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode a message from its JSON wire form.
///
/// Required fields missing or type-mismatched → `DECODE_INVALID`; a content
/// block whose `type` is not in [`ContentKind::KNOWN`] → `DECODE_UNSUPPORTED`.
/// Unknown top-level and metadata keys are accepted.
pub fn decode(bytes: &[u8]) -> Result<Umf> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::DecodeInvalid(format!("not valid JSON: {e}")))?;

    // Unknown content-block types are a distinct failure from malformed
    // envelopes, so check them before the typed parse.
    if let Some(blocks) = value.get("content").and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some(t) if ContentKind::KNOWN.contains(&t) => {}
                Some(t) => {
                    return Err(Error::DecodeUnsupported(format!(
                        "unknown content block type: {t}"
                    )))
                }
                None => {
                    return Err(Error::DecodeInvalid(
                        "content block missing type".into(),
                    ))
                }
            }
        }
    }

    for field in ["id", "type", "timestamp"] {
        if value.get(field).is_none() {
            return Err(Error::DecodeInvalid(format!("missing required field: {field}")));
        }
    }

    serde_json::from_value(value).map_err(|e| Error::DecodeInvalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips() {
        let cases = [
            "p3394://exemplar",
            "p3394://exemplar/terminal",
            "p3394://exemplar/terminal?session=abc-123",
            "p3394://exemplar?session=abc-123",
        ];
        for s in cases {
            let addr: Address = s.parse().unwrap();
            assert_eq!(addr.to_string(), s);
        }
    }

    #[test]
    fn address_rejects_garbage() {
        assert!("http://nope".parse::<Address>().is_err());
        assert!("p3394://".parse::<Address>().is_err());
    }

    #[test]
    fn encode_decode_identity() {
        let mut msg = Umf::text_request("hello");
        msg.source = Some(Address::agent("client").with_channel("terminal"));
        msg.session_id = Some("s1".into());
        msg.metadata
            .insert("k".into(), Value::String("v".into()));
        msg.content
            .push(ContentBlock::binary(ContentKind::Image, b"pngbytes", "chart.png"));

        let bytes = encode(&msg).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.kind, MessageType::Request);
        assert_eq!(back.session_id.as_deref(), Some("s1"));
        assert_eq!(back.source, msg.source);
        assert_eq!(back.content, msg.content);
        assert_eq!(back.metadata, msg.metadata);
        assert_eq!(back.content[1].decode_bytes().unwrap(), b"pngbytes");
    }

    #[test]
    fn decode_missing_field_is_invalid() {
        let err = decode(br#"{"type":"request","content":[]}"#).unwrap_err();
        assert_eq!(err.code(), "DECODE_INVALID");
    }

    #[test]
    fn decode_unknown_block_type_is_unsupported() {
        let raw = format!(
            r#"{{"id":"m1","type":"request","timestamp":"{}","content":[{{"type":"hologram","data":"x"}}]}}"#,
            Utc::now().to_rfc3339()
        );
        let err = decode(raw.as_bytes()).unwrap_err();
        assert_eq!(err.code(), "DECODE_UNSUPPORTED");
    }

    #[test]
    fn decode_accepts_unknown_top_level_keys() {
        let raw = format!(
            r#"{{"id":"m1","type":"request","timestamp":"{}","content":[],"x_future":42}}"#,
            Utc::now().to_rfc3339()
        );
        let msg = decode(raw.as_bytes()).unwrap();
        assert_eq!(msg.id, "m1");
    }

    #[test]
    fn reply_carries_request_linkage() {
        let mut req = Umf::text_request("hi");
        req.session_id = Some("s9".into());
        let reply = Umf::reply_to(&req, vec![ContentBlock::text("hello")]);
        assert_eq!(reply.reply_to.as_deref(), Some(req.id.as_str()));
        assert_eq!(reply.session_id.as_deref(), Some("s9"));
        assert_eq!(reply.kind, MessageType::Response);
    }

    #[test]
    fn error_reply_has_code_and_capability() {
        let req = Umf::text_request("do it");
        let err = Error::CapDenied {
            capability_id: "cap.configure".into(),
            reason: "HIGH assurance required".into(),
        };
        let reply = Umf::error_reply(&req, &err);
        assert!(reply.is_error());
        assert_eq!(reply.error_code(), Some("CAP_DENIED"));
        assert_eq!(
            reply.metadata.get("capability_id").and_then(Value::as_str),
            Some("cap.configure")
        );
        assert!(reply.first_text().unwrap().contains("HIGH assurance"));
    }

    #[test]
    fn client_assertion_round_trips_through_metadata() {
        use crate::principal::AssuranceLevel;
        let mut msg = Umf::text_request("hi");
        let assertion = ClientAssertion {
            channel_id: "terminal".into(),
            channel_identity: "local:alice".into(),
            assurance: AssuranceLevel::High,
            method: "os_user".into(),
        };
        msg.set_client_assertion(&assertion);
        let back = msg.client_assertion().unwrap();
        assert_eq!(back.channel_identity, "local:alice");
        assert_eq!(back.assurance, AssuranceLevel::High);
    }
}
