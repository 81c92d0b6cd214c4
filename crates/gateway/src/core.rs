//! Gateway core: receive → authenticate → resolve session → route →
//! dispatch → reply.
//!
//! `handle` never fails — every failure becomes an ERROR reply with a
//! stable machine code. Requests for one session are processed strictly
//! serially; the session permit is held for the whole cycle.

use std::sync::Arc;

use serde_json::Value;

use p3394_domain::error::{Error, Result};
use p3394_domain::principal::ClientAssertion;
use p3394_domain::trace::TraceEvent;
use p3394_domain::umf::{Address, Umf};
use p3394_kstar::{Trace, XapiStatement, XapiVerb};
use p3394_sessions::{CreateSession, Session};

use crate::builtins::{DELEGATE_CAPABILITY, LLM_CAPABILITY};
use crate::channels::normalize_command;
use crate::engine::InvocationEngine;
use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Symbolic(String),
    Skill(String),
    Subagent,
    Llm,
}

impl Route {
    pub fn capability_id(&self) -> &str {
        match self {
            Route::Symbolic(id) | Route::Skill(id) => id,
            Route::Subagent => DELEGATE_CAPABILITY,
            Route::Llm => LLM_CAPABILITY,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Route::Symbolic(_) => "symbolic",
            Route::Skill(_) => "skill",
            Route::Subagent => "subagent",
            Route::Llm => "llm",
        }
    }
}

pub struct Gateway {
    state: AppState,
    engine: Arc<InvocationEngine>,
    secret_pattern: regex::Regex,
}

impl Gateway {
    pub fn new(state: AppState) -> Self {
        let engine = Arc::new(InvocationEngine::new(state.clone()));
        Self {
            state,
            engine,
            secret_pattern: regex::Regex::new(
                r"(?i)(sk-[A-Za-z0-9_-]{6,})|((?:api[_-]?key|token|secret|password)\s*[=:]\s*\S+)",
            )
            .expect("secret pattern compiles"),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn engine(&self) -> &Arc<InvocationEngine> {
        &self.engine
    }

    /// Handle one inbound message end to end.
    pub async fn handle(&self, mut msg: Umf) -> Umf {
        // ── 1. Client-principal assertion ─────────────────────────────
        let assertion = msg
            .client_assertion()
            .unwrap_or_else(|| ClientAssertion::anonymous("unknown"));

        // ── 2. Principal resolution ───────────────────────────────────
        let (principal, scopes) = self
            .state
            .principals
            .resolve_or_anonymous(&assertion.channel_id, &assertion.channel_identity);

        // ── 3. Session ────────────────────────────────────────────────
        let mut warnings: Vec<String> = Vec::new();
        let session = match self.resolve_session(&msg, &assertion, &mut warnings) {
            Ok(session) => session,
            Err(e) => return self.finish_error(&msg, e, None),
        };
        msg.session_id = Some(session.session_id.clone());

        let authenticated = assertion.assurance > p3394_domain::AssuranceLevel::None
            && principal.principal_type != p3394_domain::PrincipalType::Anonymous;
        let session = self
            .state
            .sessions
            .bind_principal(
                &session.session_id,
                &principal.urn,
                assertion.assurance,
                scopes,
                authenticated,
            )
            .unwrap_or(session);

        TraceEvent::GatewayRequest {
            message_id: msg.id.clone(),
            channel_id: assertion.channel_id.clone(),
            session_id: session.session_id.clone(),
            principal_urn: principal.urn.clone(),
        }
        .emit();

        // Serialize per session: hold the permit for the whole cycle.
        let _permit = self.state.session_locks.acquire(&session.session_id).await;

        // ── 4. Route ──────────────────────────────────────────────────
        let route = self.determine_route(&mut msg);
        TraceEvent::RouteSelected {
            message_id: msg.id.clone(),
            route: route.name().into(),
            capability_id: route.capability_id().to_owned(),
        }
        .emit();

        // ── 5. Pre-route trace + xAPI ─────────────────────────────────
        let verb = XapiStatement::derive_verb(&msg, matches!(route, Route::Symbolic(_)));
        self.write_route_trace(&msg, &session, &route, verb);
        self.emit_xapi(&principal.urn, verb, &msg, &session.session_id, None);

        // ── 6. Dispatch ───────────────────────────────────────────────
        let result = self
            .engine
            .invoke(route.capability_id(), &msg, &session)
            .await;

        // ── 7/8. Reply with post-trace ────────────────────────────────
        let mut reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                let reply = self.finish_error(&msg, e, Some(&session));
                self.emit_xapi(
                    &principal.urn,
                    XapiVerb::Completed,
                    &reply,
                    &session.session_id,
                    Some(false),
                );
                return self.stamp_reply(reply, &session, warnings);
            }
        };

        self.emit_xapi(
            &principal.urn,
            XapiVerb::Responded,
            &reply,
            &session.session_id,
            Some(true),
        );
        reply = self.stamp_reply(reply, &session, warnings);
        reply
    }

    fn resolve_session(
        &self,
        msg: &Umf,
        assertion: &ClientAssertion,
        warnings: &mut Vec<String>,
    ) -> Result<Session> {
        if let Some(sid) = msg.session_id.as_deref() {
            if let Some(session) = self.state.sessions.get(sid) {
                self.state.sessions.touch(sid);
                return Ok(session);
            }
            // Expired or unknown: replace, and tell the client.
            warnings.push("session_replaced".into());
        }
        self.state.sessions.create_session(CreateSession {
            client_id: Some(assertion.channel_identity.clone()),
            channel_id: Some(assertion.channel_id.clone()),
            ttl: None,
        })
    }

    /// Command → skill trigger → delegation keyword → LLM.
    fn determine_route(&self, msg: &mut Umf) -> Route {
        let Some(text) = msg.first_text().map(str::to_owned) else {
            return Route::Llm;
        };
        let trimmed = text.trim();

        let canonical = normalize_command(trimmed);
        if canonical.starts_with(&self.state.config.routing.command_sigil) {
            if let Some(id) = self.state.registry.resolve_alias(&canonical) {
                return Route::Symbolic(id);
            }
        }

        if let Some((doc, _trigger)) = self.state.skills.select(trimmed) {
            return Route::Skill(doc.capability_id());
        }

        let lowered = trimmed.to_lowercase();
        for keyword in &self.state.config.routing.delegation_keywords {
            if let Some(pos) = lowered.find(keyword.as_str()) {
                // "delegate to kstar-memory: store this" — the token after
                // the keyword names the target when no destination is set.
                if msg.destination.is_none() {
                    // Index into the lowered string; lowercasing can change
                    // byte offsets relative to the original.
                    let rest = &lowered[pos + keyword.len()..];
                    if let Some(target) = rest
                        .split_whitespace()
                        .next()
                        .map(|t| t.trim_matches([':', ',', '.']).to_owned())
                        .filter(|t| !t.is_empty())
                    {
                        msg.destination = Some(Address::agent(target));
                    }
                }
                return Route::Subagent;
            }
        }

        Route::Llm
    }

    fn write_route_trace(&self, msg: &Umf, session: &Session, route: &Route, verb: XapiVerb) {
        let mut trace = Trace::new(verb.display_name());
        trace.session_id = Some(session.session_id.clone());
        trace.situation.actor = session.client_principal.clone();
        trace.situation.channel = session.channel_id.clone();
        trace.situation.domain = route.name().into();
        trace.situation.now = Some(chrono::Utc::now());
        trace.task.goal = msg.first_text().unwrap_or_default().chars().take(200).collect();
        trace.metadata.mode = "route".into();
        trace.metadata.tags = vec![route.capability_id().to_owned()];
        if let Err(e) = self.state.kstar.store_trace(&trace) {
            tracing::warn!(error = %e, "failed to write route trace");
        }
    }

    fn emit_xapi(
        &self,
        principal_urn: &str,
        verb: XapiVerb,
        msg: &Umf,
        session_id: &str,
        success: Option<bool>,
    ) {
        let statement = XapiStatement::for_message(principal_urn, verb, msg, session_id, success);
        if let Err(e) = self.state.xapi.emit(session_id, &statement) {
            tracing::warn!(error = %e, "failed to emit xAPI statement");
        }
    }

    /// Build the ERROR reply for a failure, with secrets redacted and a
    /// failure trace written.
    fn finish_error(&self, msg: &Umf, err: Error, session: Option<&Session>) -> Umf {
        let mut reply = Umf::error_reply(msg, &err);
        for block in &mut reply.content {
            if let Value::String(text) = &mut block.data {
                *text = self.redact(text);
            }
        }

        let mut trace = Trace::new("error");
        trace.session_id = session.map(|s| s.session_id.clone());
        if let Some(session) = session {
            trace.situation.actor = session.client_principal.clone();
            trace.situation.channel = session.channel_id.clone();
        }
        trace.task.goal = msg.first_text().unwrap_or_default().chars().take(200).collect();
        trace.result.success = false;
        trace.result.outcome = format!("{}: {}", err.code(), self.redact(&err.to_string()));
        trace.metadata.tags = err
            .capability_id()
            .map(|c| vec![c.to_owned()])
            .unwrap_or_default();
        if let Err(e) = self.state.kstar.store_trace(&trace) {
            tracing::warn!(error = %e, "failed to write failure trace");
        }
        reply
    }

    fn stamp_reply(&self, mut reply: Umf, session: &Session, warnings: Vec<String>) -> Umf {
        reply.session_id = Some(session.session_id.clone());
        reply.source = Some(
            Address::agent(self.state.agent_id()).with_session(session.session_id.clone()),
        );
        if !warnings.is_empty() {
            reply.metadata.insert(
                "warnings".into(),
                Value::Array(warnings.into_iter().map(Value::String).collect()),
            );
        }
        reply
    }

    fn redact(&self, text: &str) -> String {
        self.secret_pattern.replace_all(text, "[redacted]").into_owned()
    }
}
