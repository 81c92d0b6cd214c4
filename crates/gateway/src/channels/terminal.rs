//! Interactive terminal channel: newline-delimited JSON over a local Unix
//! domain socket.
//!
//! Inbound: `{"text": "..."}`. Outbound: `{"type": "response"|"error",
//! "message_id", "session_id", "text"}`. Each connection authenticates as
//! `local:{os_user}` with HIGH assurance and keeps one session for its
//! lifetime.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use p3394_domain::error::{Error, Result};
use p3394_domain::principal::{AssuranceLevel, ClientAssertion};
use p3394_domain::umf::{ContentKind, Umf};

use crate::channels::{
    adapt_content, AuthContext, ChannelAdapter, ChannelCapabilities, CommandSyntax,
};
use crate::core::Gateway;

pub const CHANNEL_ID: &str = "terminal";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct TerminalRequest {
    text: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TerminalAdapter {
    gateway: Arc<Gateway>,
    socket_path: PathBuf,
    stop: watch::Sender<bool>,
}

impl TerminalAdapter {
    pub fn new(gateway: Arc<Gateway>, socket_path: PathBuf) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            gateway,
            socket_path,
            stop,
        }
    }

    pub fn channel_capabilities() -> ChannelCapabilities {
        ChannelCapabilities {
            channel_id: CHANNEL_ID.into(),
            channel_type: "terminal".into(),
            content_types: vec![ContentKind::Text, ContentKind::Markdown],
            max_message_bytes: 100 * 1024,
            max_attachment_bytes: 0,
            supports_streaming: false,
            supports_attachments: false,
            supports_images: false,
            supports_folders: false,
            supports_multipart: false,
            supports_markdown: true,
            supports_html: false,
            rate_limit_per_minute: None,
            command_syntax: CommandSyntax::Slash,
            command_prefix: "/".into(),
        }
    }

    async fn serve_connection(gateway: Arc<Gateway>, stream: UnixStream) {
        let assertion = local_assertion();
        let caps = Self::channel_capabilities();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        // One session per connection, established by the first reply.
        let mut session_id: Option<String> = None;

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let out = handle_line(&gateway, &caps, &assertion, &mut session_id, &line).await;
            let mut encoded = serde_json::to_string(&out).unwrap_or_default();
            encoded.push('\n');
            if write_half.write_all(encoded.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

/// Process one inbound line into one outbound reply record.
pub async fn handle_line(
    gateway: &Gateway,
    caps: &ChannelCapabilities,
    assertion: &ClientAssertion,
    session_id: &mut Option<String>,
    line: &str,
) -> TerminalReplyRecord {
    let request: TerminalRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return TerminalReplyRecord::error(
                String::new(),
                session_id.clone().unwrap_or_default(),
                format!("cannot decode message: {e}"),
            );
        }
    };

    // Boundary: at most max_message_bytes of text; one byte over fails.
    if request.text.len() > caps.max_message_bytes {
        let err = Error::DecodeInvalid(format!(
            "message of {} bytes exceeds channel limit of {}",
            request.text.len(),
            caps.max_message_bytes
        ));
        return TerminalReplyRecord::error(
            String::new(),
            session_id.clone().unwrap_or_default(),
            err.to_string(),
        );
    }

    let mut msg = Umf::text_request(request.text);
    msg.session_id = session_id.clone();
    msg.set_client_assertion(assertion);

    let reply = gateway.handle(msg).await;
    let reply = adapt_content(reply, caps);
    *session_id = reply.session_id.clone();

    let text = reply
        .content
        .iter()
        .filter_map(|b| b.as_text())
        .collect::<Vec<_>>()
        .join("\n");

    if reply.is_error() {
        TerminalReplyRecord::error(reply.id, reply.session_id.unwrap_or_default(), text)
    } else {
        TerminalReplyRecord::response(reply.id, reply.session_id.unwrap_or_default(), text)
    }
}

/// Serializable reply line (public so channel tests can assert on it).
#[derive(Debug, Serialize)]
pub struct TerminalReplyRecord {
    #[serde(rename = "type")]
    pub reply_type: &'static str,
    pub message_id: String,
    pub session_id: String,
    pub text: String,
}

impl TerminalReplyRecord {
    fn response(message_id: String, session_id: String, text: String) -> Self {
        Self {
            reply_type: "response",
            message_id,
            session_id,
            text,
        }
    }

    fn error(message_id: String, session_id: String, text: String) -> Self {
        Self {
            reply_type: "error",
            message_id,
            session_id,
            text,
        }
    }
}

fn local_assertion() -> ClientAssertion {
    let os_user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
    ClientAssertion {
        channel_id: "cli".into(),
        channel_identity: format!("local:{os_user}"),
        assurance: AssuranceLevel::High,
        method: "os_user".into(),
    }
}

#[async_trait]
impl ChannelAdapter for TerminalAdapter {
    fn capabilities(&self) -> ChannelCapabilities {
        Self::channel_capabilities()
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
            assurance: AssuranceLevel::High,
            method: "os_user".into(),
        }
    }

    async fn start(&self) -> Result<()> {
        // A stale socket file from a previous run would fail the bind.
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            Error::Config(format!(
                "cannot bind terminal socket {}: {e}",
                self.socket_path.display()
            ))
        })?;
        tracing::info!(path = %self.socket_path.display(), "terminal channel listening");

        let gateway = self.gateway.clone();
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _addr)) => {
                                tokio::spawn(Self::serve_connection(gateway.clone(), stream));
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "terminal accept failed");
                            }
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.stop.send(true);
        let _ = std::fs::remove_file(&self.socket_path);
    }

    async fn send_to_client(&self, _reply_to: &str, _msg: &Umf) -> Result<()> {
        // Terminal replies flow back on the connection inline.
        Err(Error::Config("terminal channel cannot push messages".into()))
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
