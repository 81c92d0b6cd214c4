//! Channel-adapter framework.
//!
//! Every concrete channel (terminal socket, HTTP, LLM-compatible HTTP,
//! stdio-RPC) implements [`ChannelAdapter`]: it declares capabilities,
//! authenticates clients into principal assertions, normalizes command
//! syntax, and adapts outbound content down to what the channel can carry,
//! recording anything dropped in `metadata.dropped_content`.

pub mod http_api;
pub mod llm_compat;
pub mod mcp_server;
pub mod terminal;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use p3394_domain::error::Result;
use p3394_domain::principal::ClientAssertion;
use p3394_domain::trace::TraceEvent;
use p3394_domain::umf::{ContentBlock, ContentKind, DroppedBlock, Umf};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capabilities
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSyntax {
    Slash,
    CliFlags,
    Http,
    Text,
    Mixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelCapabilities {
    pub channel_id: String,
    pub channel_type: String,
    pub content_types: Vec<ContentKind>,
    pub max_message_bytes: usize,
    pub max_attachment_bytes: usize,
    pub supports_streaming: bool,
    pub supports_attachments: bool,
    pub supports_images: bool,
    pub supports_folders: bool,
    pub supports_multipart: bool,
    pub supports_markdown: bool,
    pub supports_html: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
    pub command_syntax: CommandSyntax,
    pub command_prefix: String,
}

impl ChannelCapabilities {
    pub fn supports(&self, kind: ContentKind) -> bool {
        self.content_types.contains(&kind)
    }
}

/// What an adapter knows about the connecting client.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub os_user: Option<String>,
    pub api_key: Option<String>,
    pub remote_addr: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The adapter trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn capabilities(&self) -> ChannelCapabilities;

    /// Produce the client-principal assertion for an inbound connection.
    fn authenticate_client(&self, context: &AuthContext) -> ClientAssertion;

    async fn start(&self) -> Result<()>;

    async fn stop(&self);

    /// Push a message to a connected client (channels that can).
    async fn send_to_client(&self, reply_to: &str, msg: &Umf) -> Result<()>;

    /// Command name → channel-native syntax, published in the manifest.
    fn get_endpoints(&self) -> BTreeMap<String, String>;

    /// `--help`, `help`, `/help`, `GET /help` → `/help`.
    fn normalize_command(&self, raw: &str) -> String {
        normalize_command(raw)
    }

    /// Canonical `/help` → this channel's native spelling.
    fn map_command_syntax(&self, canonical: &str) -> String {
        map_command_syntax(canonical, self.capabilities().command_syntax)
    }

    /// Downgrade outbound content to this channel's capabilities.
    fn adapt_content(&self, msg: Umf) -> Umf {
        adapt_content(msg, &self.capabilities())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Normalize any channel spelling of a command to the canonical slash
/// form: `--help`, `help`, `/help`, and `GET /help` all become `/help`.
pub fn normalize_command(raw: &str) -> String {
    let mut token = raw.trim();
    // HTTP-style: strip a leading method.
    for verb in ["GET ", "POST ", "PUT ", "DELETE "] {
        if let Some(rest) = token.strip_prefix(verb) {
            token = rest.trim_start();
            break;
        }
    }
    let token = token
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_start_matches("--")
        .trim_start_matches('/');
    format!("/{}", token.to_lowercase())
}

/// Render the canonical slash form in a channel's native syntax.
pub fn map_command_syntax(canonical: &str, syntax: CommandSyntax) -> String {
    let bare = canonical.trim_start_matches('/');
    match syntax {
        CommandSyntax::Slash | CommandSyntax::Mixed => format!("/{bare}"),
        CommandSyntax::CliFlags => format!("--{bare}"),
        CommandSyntax::Http => format!("GET /{bare}"),
        CommandSyntax::Text => bare.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content adaptation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Human-readable payload size: `512 B`, `40 KB`, `2.1 KB`, `3 MB`.
pub fn format_size(bytes: usize) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let (value, unit) = if bytes < 1024 * 1024 {
        (bytes as f64 / 1024.0, "KB")
    } else {
        (bytes as f64 / (1024.0 * 1024.0), "MB")
    };
    if (value - value.round()).abs() < 0.05 {
        format!("{} {unit}", value.round() as u64)
    } else {
        format!("{value:.1} {unit}")
    }
}

/// Transform each content block of an outbound message into a form the
/// channel supports, per the mandatory downgrade rules. Dropped or
/// downgraded blocks are recorded in `metadata.dropped_content`; adjacent
/// textual blocks produced by downgrades merge into their predecessor.
pub fn adapt_content(mut msg: Umf, caps: &ChannelCapabilities) -> Umf {
    let mut dropped: Vec<DroppedBlock> = Vec::new();
    let mut adapted: Vec<ContentBlock> = Vec::new();

    let blocks = std::mem::take(&mut msg.content);
    for block in blocks {
        match block.kind {
            ContentKind::Image if !caps.supports_images => {
                let filename = block.filename.clone().unwrap_or_else(|| "image".into());
                dropped.push(DroppedBlock {
                    kind: ContentKind::Image,
                    filename: Some(filename.clone()),
                    reason: "channel lacks image support".into(),
                    suggestion: None,
                });
                merge_text(&mut adapted, format!("[Image: {filename}]"));
            }
            ContentKind::File | ContentKind::Binary if !caps.supports_attachments => {
                let filename = block.filename.clone().unwrap_or_else(|| "file".into());
                let size = format_size(block.payload_size());
                dropped.push(DroppedBlock {
                    kind: block.kind,
                    filename: Some(filename.clone()),
                    reason: "channel lacks attachments".into(),
                    suggestion: Some("use web interface".into()),
                });
                merge_text(&mut adapted, format!("[File: {filename} ({size})]"));
            }
            ContentKind::Html if !caps.supports_html => {
                let html = block.as_text().unwrap_or_default();
                if caps.supports_markdown {
                    dropped.push(DroppedBlock {
                        kind: ContentKind::Html,
                        filename: None,
                        reason: "channel lacks html support; converted to markdown".into(),
                        suggestion: None,
                    });
                    adapted.push(ContentBlock::markdown(html_to_markdown(html)));
                } else {
                    dropped.push(DroppedBlock {
                        kind: ContentKind::Html,
                        filename: None,
                        reason: "channel lacks html and markdown support; tags stripped".into(),
                        suggestion: None,
                    });
                    merge_text(&mut adapted, strip_tags(html));
                }
            }
            ContentKind::Folder if !caps.supports_folders => {
                let name = block.filename.clone().unwrap_or_else(|| "folder".into());
                let listing = block
                    .data
                    .as_array()
                    .map(|files| {
                        files
                            .iter()
                            .filter_map(Value::as_str)
                            .map(|f| format!("- {f}"))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                dropped.push(DroppedBlock {
                    kind: ContentKind::Folder,
                    filename: Some(name.clone()),
                    reason: "channel lacks folder support".into(),
                    suggestion: None,
                });
                merge_text(&mut adapted, format!("[Folder: {name}]\n{listing}"));
            }
            ContentKind::ToolCall | ContentKind::ToolResult
                if !caps.supports(block.kind) =>
            {
                dropped.push(DroppedBlock {
                    kind: block.kind,
                    filename: None,
                    reason: "channel lacks structured content support".into(),
                    suggestion: None,
                });
                merge_text(&mut adapted, summarize_tool_block(&block));
            }
            ContentKind::Markdown if !caps.supports_markdown => {
                // Lossy but quiet: markdown renders acceptably as text.
                adapted.push(ContentBlock::text(
                    block.as_text().unwrap_or_default().to_owned(),
                ));
            }
            ContentKind::Json if !caps.supports(ContentKind::Json) => {
                dropped.push(DroppedBlock {
                    kind: ContentKind::Json,
                    filename: None,
                    reason: "channel lacks structured content support".into(),
                    suggestion: None,
                });
                merge_text(&mut adapted, block.data.to_string());
            }
            _ => adapted.push(block),
        }
    }

    if !dropped.is_empty() {
        TraceEvent::ContentAdapted {
            channel_id: caps.channel_id.clone(),
            dropped_blocks: dropped.len(),
        }
        .emit();
        msg.metadata.insert(
            "dropped_content".into(),
            serde_json::to_value(&dropped).unwrap_or(Value::Null),
        );
    }
    msg.content = adapted;
    msg
}

/// Append downgrade text onto a preceding textual block when there is one,
/// so a run of downgrades reads as one message.
fn merge_text(adapted: &mut Vec<ContentBlock>, text: String) {
    if let Some(last) = adapted.last_mut() {
        if last.kind.is_textual() {
            if let Value::String(existing) = &mut last.data {
                existing.push('\n');
                existing.push_str(&text);
                return;
            }
        }
    }
    adapted.push(ContentBlock::text(text));
}

fn summarize_tool_block(block: &ContentBlock) -> String {
    match block.kind {
        ContentKind::ToolCall => {
            let tool = block.data.get("tool").and_then(Value::as_str).unwrap_or("?");
            format!("[Tool call: {tool}]")
        }
        _ => {
            let success = block
                .data
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            format!("[Tool result: success={success}]")
        }
    }
}

/// Lossy tag→structure conversion for channels with markdown but no HTML.
pub fn html_to_markdown(html: &str) -> String {
    let mut out = html.to_string();
    for (from, to) in [
        ("<h1>", "# "),
        ("<h2>", "## "),
        ("<h3>", "### "),
        ("</h1>", "\n"),
        ("</h2>", "\n"),
        ("</h3>", "\n"),
        ("<strong>", "**"),
        ("</strong>", "**"),
        ("<b>", "**"),
        ("</b>", "**"),
        ("<em>", "*"),
        ("</em>", "*"),
        ("<i>", "*"),
        ("</i>", "*"),
        ("<li>", "- "),
        ("</li>", "\n"),
        ("<br>", "\n"),
        ("<br/>", "\n"),
        ("<p>", "\n"),
        ("</p>", "\n"),
        ("<code>", "`"),
        ("</code>", "`"),
    ] {
        out = out.replace(from, to);
    }
    strip_tags(&out).trim().to_string()
}

/// Remove any remaining tags.
pub fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn text_only_caps() -> ChannelCapabilities {
        ChannelCapabilities {
            channel_id: "terminal".into(),
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

    #[test]
    fn normalize_accepts_all_spellings() {
        for raw in ["--help", "help", "/help", "GET /help", "  /HELP  "] {
            assert_eq!(normalize_command(raw), "/help", "raw = {raw}");
        }
        assert_eq!(normalize_command("/version now please"), "/version");
    }

    #[test]
    fn map_syntax_per_channel() {
        assert_eq!(map_command_syntax("/help", CommandSyntax::Slash), "/help");
        assert_eq!(map_command_syntax("/help", CommandSyntax::CliFlags), "--help");
        assert_eq!(map_command_syntax("/help", CommandSyntax::Http), "GET /help");
        assert_eq!(map_command_syntax("/help", CommandSyntax::Text), "help");
    }

    #[test]
    fn format_sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(40 * 1024), "40 KB");
        assert_eq!(format_size(2150), "2.1 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3 MB");
    }

    #[test]
    fn image_and_file_downgrade_to_one_text_block() {
        let mut msg = Umf::reply_to(
            &Umf::text_request("x"),
            vec![
                ContentBlock::text("Here is the chart:"),
                ContentBlock::binary(ContentKind::Image, &vec![0u8; 40 * 1024], "chart.png"),
                ContentBlock::binary(ContentKind::File, &vec![0u8; 2150], "data.csv"),
            ],
        );
        msg = adapt_content(msg, &text_only_caps());

        assert_eq!(msg.content.len(), 1);
        assert_eq!(
            msg.content[0].as_text().unwrap(),
            "Here is the chart:\n[Image: chart.png]\n[File: data.csv (2.1 KB)]"
        );

        let dropped = msg.metadata.get("dropped_content").unwrap();
        assert_eq!(dropped[0]["type"], "image");
        assert_eq!(dropped[0]["filename"], "chart.png");
        assert_eq!(dropped[0]["reason"], "channel lacks image support");
        assert_eq!(dropped[1]["type"], "file");
        assert_eq!(dropped[1]["reason"], "channel lacks attachments");
        assert_eq!(dropped[1]["suggestion"], "use web interface");
    }

    #[test]
    fn html_downgrades_to_markdown_when_supported() {
        let msg = Umf::reply_to(
            &Umf::text_request("x"),
            vec![ContentBlock::html("<h1>Title</h1><p><b>bold</b> body</p>")],
        );
        let adapted = adapt_content(msg, &text_only_caps());
        assert_eq!(adapted.content[0].kind, ContentKind::Markdown);
        let md = adapted.content[0].as_text().unwrap();
        assert!(md.contains("# Title"));
        assert!(md.contains("**bold**"));
    }

    #[test]
    fn html_strips_tags_without_markdown() {
        let mut caps = text_only_caps();
        caps.supports_markdown = false;
        caps.content_types = vec![ContentKind::Text];
        let msg = Umf::reply_to(
            &Umf::text_request("x"),
            vec![ContentBlock::html("<p>plain <b>body</b></p>")],
        );
        let adapted = adapt_content(msg, &caps);
        assert_eq!(adapted.content[0].kind, ContentKind::Text);
        assert_eq!(adapted.content[0].as_text().unwrap(), "plain body");
    }

    #[test]
    fn folder_downgrades_to_listing() {
        let msg = Umf::reply_to(
            &Umf::text_request("x"),
            vec![ContentBlock::folder(
                vec!["a.txt".into(), "b.txt".into()],
                "out",
            )],
        );
        let adapted = adapt_content(msg, &text_only_caps());
        let text = adapted.content[0].as_text().unwrap();
        assert!(text.contains("[Folder: out]"));
        assert!(text.contains("- a.txt"));
        assert!(text.contains("- b.txt"));
    }

    #[test]
    fn supported_blocks_pass_through_untouched() {
        let msg = Umf::reply_to(
            &Umf::text_request("x"),
            vec![
                ContentBlock::text("hello"),
                ContentBlock::markdown("## heading"),
            ],
        );
        let adapted = adapt_content(msg.clone(), &text_only_caps());
        assert_eq!(adapted.content, msg.content);
        assert!(adapted.metadata.get("dropped_content").is_none());
    }

    #[test]
    fn tool_call_summarized() {
        use p3394_domain::umf::ToolCallRecord;
        let msg = Umf::reply_to(
            &Umf::text_request("x"),
            vec![ContentBlock::tool_call(ToolCallRecord {
                call_id: "c1".into(),
                tool: "kstar:store_trace".into(),
                arguments: serde_json::json!({}),
            })],
        );
        let adapted = adapt_content(msg, &text_only_caps());
        assert_eq!(
            adapted.content[0].as_text().unwrap(),
            "[Tool call: kstar:store_trace]"
        );
    }
}
