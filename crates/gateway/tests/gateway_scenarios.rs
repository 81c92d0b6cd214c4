//! End-to-end gateway scenarios: terminal command round-trips, HTTP and
//! LLM-compatible channels, policy denials, subagent routing, and the
//! session/reply invariants. Each test builds an isolated gateway against
//! a fresh storage root with the mock LLM client.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use p3394_domain::config::Config;
use p3394_domain::principal::{
    principal_urn, AssuranceLevel, BindingType, ClientAssertion, CredentialBinding, Principal,
    PrincipalType,
};
use p3394_domain::umf::{ContentBlock, ContentKind, ToolCallRecord, Umf};
use p3394_gateway::bootstrap;
use p3394_gateway::channels::http_api::{self, HttpChannelState};
use p3394_gateway::channels::llm_compat::{self, LlmCompatState};
use p3394_gateway::channels::terminal;
use p3394_gateway::Gateway;
use p3394_providers::mock::MockLlm;
use p3394_router::TransportKind;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn write_sample_skill(skills_dir: &Path) {
    std::fs::create_dir_all(skills_dir).unwrap();
    std::fs::write(
        skills_dir.join("weekly-report.md"),
        "---\nname: weekly-report\ndescription: Build the weekly report\ntriggers:\n  - weekly report\n---\nCollect the numbers, then summarize them.\n",
    )
    .unwrap();
}

fn test_gateway(root: &Path) -> Arc<Gateway> {
    let skills_dir = root.join("skills");
    write_sample_skill(&skills_dir);

    let mut config = Config::default();
    config.storage.path = root.join("data");
    config.skills.path = skills_dir;
    config.policy.enforce = true;
    config.llm_compat.api_keys = vec!["sk-agent-key1".into()];

    let channels = vec![
        terminal::TerminalAdapter::channel_capabilities(),
        http_api::native_capabilities(),
        http_api::agent_capabilities(),
        llm_compat::channel_capabilities(),
    ];
    bootstrap::build_gateway(Arc::new(config), Arc::new(MockLlm::default()), &channels).unwrap()
}

fn terminal_assertion(user: &str) -> ClientAssertion {
    ClientAssertion {
        channel_id: "cli".into(),
        channel_identity: format!("local:{user}"),
        assurance: AssuranceLevel::High,
        method: "os_user".into(),
    }
}

async fn http_post_messages(gateway: Arc<Gateway>, body: Value, api_key: Option<&str>) -> Value {
    let app = http_api::router(HttpChannelState {
        gateway,
        caps: http_api::native_capabilities(),
        detailed_manifest: false,
    });
    let mut request = Request::builder()
        .method("POST")
        .uri("/messages")
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        request = request.header("x-api-key", key);
    }
    let response = app
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S1 — terminal /version
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn terminal_version_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());
    let caps = terminal::TerminalAdapter::channel_capabilities();
    let assertion = terminal_assertion("alice");
    let mut session_id = None;

    let reply = terminal::handle_line(
        &gateway,
        &caps,
        &assertion,
        &mut session_id,
        r#"{"text": "/version"}"#,
    )
    .await;

    assert_eq!(reply.reply_type, "response");
    assert!(!reply.message_id.is_empty());
    assert!(!reply.session_id.is_empty());
    assert!(
        reply.text.starts_with("P3394 Exemplar Agent v"),
        "unexpected text: {}",
        reply.text
    );

    // KSTAR trace with verb `executed` for cmd.version.
    let traces = gateway
        .state()
        .kstar
        .session_traces(&reply.session_id)
        .unwrap();
    assert!(traces.iter().any(|t| {
        t.action.action_type == "executed" && t.metadata.tags.contains(&"cmd.version".to_string())
    }));

    // xAPI statement with verb `executed` on the message activity.
    let statements = gateway
        .state()
        .xapi
        .session_statements(&reply.session_id)
        .unwrap();
    assert!(statements.iter().any(|s| {
        s.verb["display"]["en-US"] == "executed"
            && s.object["id"]
                .as_str()
                .map(|id| id.starts_with("p3394://message/"))
                .unwrap_or(false)
    }));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S2 — HTTP native /messages + manifest
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn http_help_and_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());

    // Manifest lists the core commands.
    let app = http_api::router(HttpChannelState {
        gateway: gateway.clone(),
        caps: http_api::native_capabilities(),
        detailed_manifest: false,
    });
    let response = app
        .oneshot(
            Request::builder()
                .uri("/manifest")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let manifest: Value = serde_json::from_slice(
        &axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["protocol"], "P3394");
    let names: Vec<&str> = manifest["commands"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    for expected in ["/help", "/about", "/status", "/version", "/listCommands"] {
        assert!(names.contains(&expected), "manifest missing {expected}");
    }

    // /help over POST /messages returns a markdown command table.
    let reply = http_post_messages(
        gateway,
        json!({ "type": "request", "content": [{ "type": "text", "data": "/help" }] }),
        None,
    )
    .await;
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["content"][0]["type"], "markdown");
    let table = reply["content"][0]["data"].as_str().unwrap();
    assert!(table.contains("| Command |"));
    assert!(table.contains("/help"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S3 — LLM-compatible endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn compat_post(gateway: Arc<Gateway>, body: Value, api_key: Option<&str>) -> (StatusCode, Value) {
    let app = llm_compat::router(LlmCompatState {
        api_key_hashes: gateway.state().api_key_hashes.clone(),
        chars_per_token: 4,
        gateway,
    });
    let mut request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        request = request.header("x-api-key", key);
    }
    let response = app
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn llm_compat_help_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());

    let (status, reply) = compat_post(
        gateway,
        json!({
            "model": "local-exemplar",
            "max_tokens": 1024,
            "messages": [{ "role": "user", "content": "/help" }],
        }),
        Some("sk-agent-key1"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["type"], "message");
    assert_eq!(reply["role"], "assistant");
    assert_eq!(reply["stop_reason"], "end_turn");
    assert_eq!(reply["model"], "local-exemplar");
    assert_eq!(reply["content"].as_array().unwrap().len(), 1);
    let text = reply["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("| Command |"));
    assert!(reply["usage"]["input_tokens"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn llm_compat_rejects_bad_key() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());
    let (status, reply) = compat_post(
        gateway,
        json!({
            "model": "m", "max_tokens": 16,
            "messages": [{ "role": "user", "content": "hi" }],
        }),
        Some("sk-wrong"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply["error"]["type"], "authentication_error");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S4 — admin capability denied at MEDIUM assurance
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn admin_capability_needs_high_assurance() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());
    let state = gateway.state();

    // An api-key binding with full scopes, but a non-admin role.
    let urn = principal_urn("local", "operator", "key1");
    state
        .principals
        .register_principal(Principal::new(&urn, "Key 1", PrincipalType::Service))
        .unwrap();
    state
        .principals
        .register_binding(CredentialBinding {
            binding_id: "b-key1".into(),
            channel_id: "http-api".into(),
            external_subject: "api_key:sk-agent-key1".into(),
            principal_urn: urn,
            binding_type: BindingType::ApiKey,
            scopes: vec!["*".into()],
            registered_at: chrono::Utc::now(),
            revoked: false,
        })
        .unwrap();

    let reply = http_post_messages(
        gateway.clone(),
        json!({ "type": "request", "content": [{ "type": "text", "data": "/configure" }] }),
        Some("sk-agent-key1"),
    )
    .await;

    assert_eq!(reply["type"], "error");
    assert_eq!(reply["metadata"]["error_code"], "AUTH_DENIED");
    let text = reply["content"][0]["data"].as_str().unwrap();
    assert!(
        text.contains("HIGH assurance required"),
        "unexpected reason: {text}"
    );

    // The substrate handler never ran: no successful invoke trace exists.
    let session_id = reply["session_id"].as_str().unwrap();
    let traces = state.kstar.session_traces(session_id).unwrap();
    assert!(traces
        .iter()
        .all(|t| !(t.action.action_type == "invoke" && t.result.success)));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S6 — kstar-memory over the outbound router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn kstar_subagent_store_and_transport_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());
    let state = gateway.state();

    let request = Umf::request(vec![ContentBlock::tool_call(ToolCallRecord {
        call_id: "c1".into(),
        tool: "kstar:store_trace".into(),
        arguments: json!({ "task": { "goal": "remember this" } }),
    })]);

    let reply = state.router.send("kstar-memory", &request).await.unwrap();
    let result = reply
        .content
        .iter()
        .find(|b| b.kind == ContentKind::Json)
        .unwrap();
    assert!(!result.data["trace_id"].as_str().unwrap().is_empty());

    // All transports down → NO_TRANSPORT.
    state
        .router
        .close_transport("kstar-memory", TransportKind::Direct)
        .await;
    let err = state.router.send("kstar-memory", &request).await.unwrap_err();
    assert_eq!(err.code(), "NO_TRANSPORT");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reply linkage, session lifecycle, routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn reply_carries_request_linkage_and_live_session() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());

    let mut msg = Umf::text_request("hello there");
    msg.set_client_assertion(&terminal_assertion("alice"));
    let request_id = msg.id.clone();

    let reply = gateway.handle(msg).await;
    assert_eq!(reply.reply_to.as_deref(), Some(request_id.as_str()));
    let session_id = reply.session_id.clone().unwrap();
    assert!(gateway.state().sessions.get(&session_id).is_some());

    // Same session id on a follow-up keeps the session.
    let mut follow_up = Umf::text_request("/status");
    follow_up.session_id = Some(session_id.clone());
    follow_up.set_client_assertion(&terminal_assertion("alice"));
    let second = gateway.handle(follow_up).await;
    assert_eq!(second.session_id.as_deref(), Some(session_id.as_str()));
    assert!(second.metadata.get("warnings").is_none());
}

#[tokio::test]
async fn unknown_session_is_replaced_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());

    let mut msg = Umf::text_request("/status");
    msg.session_id = Some("session-that-never-existed".into());
    msg.set_client_assertion(&terminal_assertion("alice"));

    let reply = gateway.handle(msg).await;
    let new_session = reply.session_id.as_deref().unwrap();
    assert_ne!(new_session, "session-that-never-existed");
    let warnings = reply.metadata.get("warnings").unwrap().as_array().unwrap();
    assert!(warnings.iter().any(|w| w == "session_replaced"));
}

#[tokio::test]
async fn free_text_routes_to_llm_and_triggers_route_to_skills() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());

    // Free text → LLM capability (mock echoes the prompt tail).
    let mut chat = Umf::text_request("tell me something interesting");
    chat.set_client_assertion(&terminal_assertion("alice"));
    let reply = gateway.handle(chat).await;
    assert!(reply.first_text().unwrap().starts_with("[mock]"));

    // Trigger text → skill capability.
    let mut skill = Umf::text_request("please build the weekly report for June");
    skill.set_client_assertion(&terminal_assertion("alice"));
    let reply = gateway.handle(skill).await;
    assert!(!reply.is_error());
    let traces = gateway
        .state()
        .kstar
        .session_traces(reply.session_id.as_deref().unwrap())
        .unwrap();
    assert!(traces
        .iter()
        .any(|t| t.metadata.tags.contains(&"skill.weekly-report".to_string())));
}

#[tokio::test]
async fn concurrent_requests_for_one_session_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());

    // Establish a session first.
    let mut first = Umf::text_request("/status");
    first.set_client_assertion(&terminal_assertion("alice"));
    let session_id = gateway.handle(first).await.session_id.unwrap();

    let mut handles = Vec::new();
    for i in 0..4 {
        let gateway = gateway.clone();
        let session_id = session_id.clone();
        handles.push(tokio::spawn(async move {
            let mut msg = Umf::text_request(format!("message number {i}"));
            msg.session_id = Some(session_id);
            msg.set_client_assertion(&terminal_assertion("alice"));
            gateway.handle(msg).await
        }));
    }
    for handle in handles {
        let reply = handle.await.unwrap();
        assert!(!reply.is_error());
        assert_eq!(reply.session_id.as_deref(), Some(session_id.as_str()));
    }
}

#[tokio::test]
async fn oversized_terminal_message_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());
    let caps = terminal::TerminalAdapter::channel_capabilities();
    let assertion = terminal_assertion("alice");

    // Exactly at the limit succeeds.
    let mut session_id = None;
    let at_limit = "x".repeat(caps.max_message_bytes);
    let line = serde_json::to_string(&json!({ "text": at_limit })).unwrap();
    let reply =
        terminal::handle_line(&gateway, &caps, &assertion, &mut session_id, &line).await;
    assert_eq!(reply.reply_type, "response");

    // One byte over fails with a decode error.
    let over = "x".repeat(caps.max_message_bytes + 1);
    let line = serde_json::to_string(&json!({ "text": over })).unwrap();
    let reply =
        terminal::handle_line(&gateway, &caps, &assertion, &mut session_id, &line).await;
    assert_eq!(reply.reply_type, "error");
    assert!(reply.text.contains("exceeds channel limit"));
}

#[tokio::test]
async fn unknown_content_block_type_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());
    let app = http_api::router(HttpChannelState {
        gateway,
        caps: http_api::native_capabilities(),
        detailed_manifest: false,
    });
    let body = json!({
        "type": "request",
        "content": [{ "type": "hologram", "data": "??" }],
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/messages")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let reply: Value = serde_json::from_slice(
        &axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(reply["metadata"]["error_code"], "DECODE_UNSUPPORTED");
}

#[tokio::test]
async fn generated_command_route_serves_symbolic_capabilities() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());
    let app = http_api::router(HttpChannelState {
        gateway,
        caps: http_api::native_capabilities(),
        detailed_manifest: false,
    });

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/version").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let reply: Value = serde_json::from_slice(
        &axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap(),
    )
    .unwrap();
    assert!(reply["content"][0]["data"]
        .as_str()
        .unwrap()
        .starts_with("P3394 Exemplar Agent v"));

    let missing = app
        .oneshot(Request::builder().uri("/nosuchcmd").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn detailed_manifest_embeds_syntax_and_trigger_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = test_gateway(dir.path());
    let app = http_api::router(HttpChannelState {
        gateway,
        caps: http_api::agent_capabilities(),
        detailed_manifest: true,
    });
    let response = app
        .oneshot(Request::builder().uri("/manifest").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let manifest: Value = serde_json::from_slice(
        &axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap(),
    )
    .unwrap();

    let help = manifest["commands"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == "/help")
        .unwrap();
    assert_eq!(help["syntax_by_channel"]["terminal"], "/help");
    assert_eq!(help["syntax_by_channel"]["http-api"], "GET /help");

    let ordering = manifest["skill_trigger_ordering"].as_array().unwrap();
    assert!(ordering
        .iter()
        .any(|o| o["skill"] == "weekly-report" && o["trigger"] == "weekly report"));

    // Channels expose per-command endpoints.
    let channels = manifest["channels"].as_array().unwrap();
    assert!(channels.iter().any(|c| c["id"] == "terminal"
        && c["endpoints"]["help"] == "/help"));
}
