//! Capability invocation engine.
//!
//! `invoke` runs the full lifecycle: descriptor fetch, policy check,
//! pre-invoke hooks (short-circuit on deny), substrate dispatch under the
//! request deadline, post-invoke hooks, on-error hooks, and the audit trace.
//! Hooks are themselves capabilities and are invoked recursively;
//! registration-time cycle checks make that recursion finite, with a depth
//! backstop here.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde_json::Value;

use p3394_capabilities::{CapabilityDescriptor, CapabilityKind, SchemaRef, Substrate};
use p3394_domain::error::{Error, Result};
use p3394_domain::trace::TraceEvent;
use p3394_domain::umf::{Address, ContentBlock, ContentKind, Umf};
use p3394_kstar::Trace;
use p3394_principals::AuthzRequest;
use p3394_providers::LlmRequest;
use p3394_sessions::Session;

use crate::state::AppState;

/// Runtime backstop for hook recursion; registration-time DFS should make
/// this unreachable.
const MAX_HOOK_DEPTH: usize = 16;

/// Kept stderr tail on shell failures.
const STDERR_TAIL_CHARS: usize = 500;

pub struct InvocationEngine {
    state: AppState,
    http: reqwest::Client,
}

impl InvocationEngine {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            http: reqwest::Client::new(),
        }
    }

    pub async fn invoke(&self, capability_id: &str, request: &Umf, session: &Session) -> Result<Umf> {
        self.invoke_depth(capability_id, request, session, 0).await
    }

    fn invoke_depth<'a>(
        &'a self,
        capability_id: &'a str,
        request: &'a Umf,
        session: &'a Session,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Umf>> + Send + 'a>> {
        Box::pin(async move {
            if depth > MAX_HOOK_DEPTH {
                return Err(Error::HookCycle(capability_id.to_owned()));
            }

            // ── 1. Descriptor ─────────────────────────────────────────
            let descriptor = self
                .state
                .registry
                .get(capability_id)
                .ok_or_else(|| Error::CapNotFound(capability_id.to_owned()))?;
            if !descriptor.enabled() {
                return Err(Error::CapDenied {
                    capability_id: capability_id.to_owned(),
                    reason: "capability is disabled".into(),
                });
            }

            // ── 2. Policy ─────────────────────────────────────────────
            let principal = self
                .state
                .principals
                .get(&session.client_principal)
                .unwrap_or_else(|| self.state.principals.anonymous());
            let outcome = self.state.policy.authorize(&AuthzRequest {
                principal: &principal,
                assurance: session.assurance,
                capability_id,
                requested: &descriptor.required_permissions,
                granted: &session.permissions,
                channel_id: &session.channel_id,
            });
            if !outcome.allowed() {
                return Err(Error::AuthDenied(format!(
                    "{capability_id}: {}",
                    outcome.reason
                )));
            }

            // ── 3. Pre-invoke hooks (short-circuit on deny) ───────────
            for hook_id in &descriptor.hooks.pre_invoke {
                match self.invoke_depth(hook_id, request, session, depth + 1).await {
                    Ok(reply) if !reply.is_error() => {}
                    Ok(reply) => {
                        return Err(Error::CapDenied {
                            capability_id: capability_id.to_owned(),
                            reason: format!(
                                "pre-invoke hook {hook_id} denied: {}",
                                reply.first_text().unwrap_or("(no detail)")
                            ),
                        });
                    }
                    Err(e) => {
                        return Err(Error::CapDenied {
                            capability_id: capability_id.to_owned(),
                            reason: format!("pre-invoke hook {hook_id} failed: {e}"),
                        });
                    }
                }
            }

            // ── 4. Substrate dispatch under the deadline ──────────────
            let started = Instant::now();
            let deadline = Duration::from_secs(self.state.config.routing.deadline_secs);
            let dispatched = match descriptor.substrate {
                // Symbolic handlers are synchronous; no suspension point.
                Substrate::Symbolic => self.dispatch_symbolic(&descriptor, request, session),
                Substrate::Llm | Substrate::Shell | Substrate::Agent | Substrate::ExternalService => {
                    match tokio::time::timeout(
                        deadline,
                        self.dispatch_async(&descriptor, request, session),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(format!(
                            "{capability_id} exceeded {}s deadline",
                            deadline.as_secs()
                        ))),
                    }
                }
                Substrate::Transport => Err(Error::CapExecutionError {
                    capability_id: capability_id.to_owned(),
                    message: "transport capabilities are advertised, not invoked".into(),
                }),
            };

            let duration_ms = started.elapsed().as_millis() as u64;

            let result = match dispatched {
                Ok(reply) => {
                    // ── 5. Post-invoke hooks (errors logged, result kept) ──
                    for hook_id in &descriptor.hooks.post_invoke {
                        if let Err(e) =
                            self.invoke_depth(hook_id, &reply, session, depth + 1).await
                        {
                            tracing::warn!(
                                capability_id = %capability_id,
                                hook = %hook_id,
                                error = %e,
                                "post-invoke hook failed"
                            );
                        }
                    }
                    Ok(reply)
                }
                Err(e) => {
                    // ── 6. On-error hooks, then surface the failure ────
                    for hook_id in &descriptor.hooks.on_error {
                        if let Err(hook_err) =
                            self.invoke_depth(hook_id, request, session, depth + 1).await
                        {
                            tracing::warn!(
                                capability_id = %capability_id,
                                hook = %hook_id,
                                error = %hook_err,
                                "on-error hook failed"
                            );
                        }
                    }
                    match e {
                        e @ Error::Timeout(_) => Err(e),
                        e => Err(Error::CapExecutionError {
                            capability_id: capability_id.to_owned(),
                            message: e.to_string(),
                        }),
                    }
                }
            };

            // ── 7. Audit ──────────────────────────────────────────────
            TraceEvent::CapabilityInvoked {
                capability_id: capability_id.to_owned(),
                substrate: descriptor.substrate.wire_name().into(),
                duration_ms,
                success: result.is_ok(),
            }
            .emit();
            if descriptor.audit.log_invocation {
                self.write_audit_trace(&descriptor, request, session, &result, duration_ms);
            }

            result
        })
    }

    // ── Substrate dispatch ───────────────────────────────────────────

    fn dispatch_symbolic(
        &self,
        descriptor: &CapabilityDescriptor,
        request: &Umf,
        session: &Session,
    ) -> Result<Umf> {
        let entrypoint = descriptor
            .entrypoint
            .clone()
            .unwrap_or_else(|| descriptor.capability_id.clone());
        let handler = self.state.symbolic_handler(&entrypoint).ok_or_else(|| {
            Error::Internal(format!("no symbolic handler registered for {entrypoint}"))
        })?;
        handler(request, session, &self.state)
    }

    async fn dispatch_async(
        &self,
        descriptor: &CapabilityDescriptor,
        request: &Umf,
        session: &Session,
    ) -> Result<Umf> {
        match descriptor.substrate {
            Substrate::Llm => self.dispatch_llm(descriptor, request, session).await,
            Substrate::Shell => self.dispatch_shell(descriptor, request, session).await,
            Substrate::Agent => self.dispatch_agent(descriptor, request, session).await,
            Substrate::ExternalService => self.dispatch_external(descriptor, request).await,
            _ => unreachable!("sync substrates handled by the caller"),
        }
    }

    async fn dispatch_llm(
        &self,
        descriptor: &CapabilityDescriptor,
        request: &Umf,
        session: &Session,
    ) -> Result<Umf> {
        let user_text = request.first_text().unwrap_or_default();

        let mut prompt = String::new();
        prompt.push_str(&self.state.config.agent.persona);
        prompt.push_str("\n\n");
        prompt.push_str(&format!(
            "[session id={} channel={} user={}]\n\n",
            session.session_id, session.channel_id, session.client_principal
        ));
        // Skill-routed invocations prepend the skill's instruction body.
        if descriptor.kind == CapabilityKind::Composite {
            if let Some(name) = descriptor.entrypoint.as_deref() {
                if let Some(doc) = self.state.skills.get(name) {
                    prompt.push_str(&doc.instructions);
                    prompt.push_str("\n\n");
                }
            }
        }
        prompt.push_str(user_text);

        let model_hint = request
            .metadata
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let max_tokens_hint = request
            .metadata
            .get("max_tokens")
            .and_then(Value::as_u64)
            .map(|v| v as u32);

        let reply = self
            .state
            .llm
            .complete(LlmRequest {
                prompt,
                model: model_hint,
                max_tokens: max_tokens_hint,
            })
            .await?;

        let mut out = Umf::reply_to(request, vec![ContentBlock::text(reply.text)]);
        out.metadata
            .insert("model".into(), Value::String(reply.model));
        out.metadata
            .insert("input_tokens".into(), Value::from(reply.input_tokens));
        out.metadata
            .insert("output_tokens".into(), Value::from(reply.output_tokens));
        Ok(out)
    }

    async fn dispatch_shell(
        &self,
        descriptor: &CapabilityDescriptor,
        request: &Umf,
        session: &Session,
    ) -> Result<Umf> {
        let command = descriptor.entrypoint.clone().ok_or_else(|| {
            Error::Config(format!(
                "shell capability {} has no entrypoint",
                descriptor.capability_id
            ))
        })?;

        let workspace = session.workspace_dir();
        std::fs::create_dir_all(&workspace)?;

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&workspace)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(Umf::reply_to(request, vec![ContentBlock::text(stdout)]))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .chars()
                .rev()
                .take(STDERR_TAIL_CHARS)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            Err(Error::Internal(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                tail
            )))
        }
    }

    async fn dispatch_agent(
        &self,
        descriptor: &CapabilityDescriptor,
        request: &Umf,
        session: &Session,
    ) -> Result<Umf> {
        let target = request
            .destination
            .as_ref()
            .map(|a| a.agent_id.clone())
            .or_else(|| descriptor.entrypoint.clone())
            .ok_or_else(|| {
                Error::Config(format!(
                    "agent capability {} has no target",
                    descriptor.capability_id
                ))
            })?;

        let mut outgoing = request.clone();
        // Project the acting principal into the outgoing source address.
        outgoing.source = Some(
            Address::agent(self.state.agent_id())
                .with_channel(session.channel_id.clone())
                .with_session(session.session_id.clone()),
        );
        outgoing.metadata.insert(
            "on_behalf_of".into(),
            Value::String(session.client_principal.clone()),
        );

        self.state.router.send(&target, &outgoing).await
    }

    async fn dispatch_external(
        &self,
        descriptor: &CapabilityDescriptor,
        request: &Umf,
    ) -> Result<Umf> {
        let endpoint = descriptor.entrypoint.clone().ok_or_else(|| {
            Error::Config(format!(
                "external capability {} has no endpoint",
                descriptor.capability_id
            ))
        })?;

        let arguments = request
            .content
            .iter()
            .find(|b| b.kind == ContentKind::Json)
            .map(|b| b.data.clone())
            .unwrap_or_else(|| Value::Object(Default::default()));

        if let Some(ref schema) = descriptor.input_schema {
            validate_schema(schema, &arguments)?;
        }

        let response = self
            .http
            .post(&endpoint)
            .json(&arguments)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http(format!("{endpoint} returned {status}")));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Umf::reply_to(request, vec![ContentBlock::json(body)]))
    }

    // ── Audit ────────────────────────────────────────────────────────

    fn write_audit_trace(
        &self,
        descriptor: &CapabilityDescriptor,
        request: &Umf,
        session: &Session,
        result: &Result<Umf>,
        duration_ms: u64,
    ) {
        let mut trace = Trace::new("invoke");
        trace.session_id = Some(session.session_id.clone());
        trace.situation.actor = session.client_principal.clone();
        trace.situation.channel = session.channel_id.clone();
        trace.situation.domain = descriptor.substrate.wire_name().into();
        trace.situation.now = Some(chrono::Utc::now());
        trace.task.goal = format!("invoke {}", descriptor.capability_id);
        trace.metadata.tags = vec![descriptor.capability_id.clone()];
        trace.action.tools_used = vec![descriptor.capability_id.clone()];
        if descriptor.audit.log_inputs {
            trace.action.parameters = request
                .first_text()
                .map(|t| Value::String(t.to_owned()))
                .unwrap_or(Value::Null);
        }
        match result {
            Ok(reply) => {
                trace.result.success = true;
                if descriptor.audit.log_outputs {
                    trace.result.outcome = reply.first_text().unwrap_or_default().to_owned();
                } else {
                    trace.result.outcome = format!("ok in {duration_ms}ms");
                }
            }
            Err(e) => {
                trace.result.success = false;
                trace.result.outcome = format!("{}: {e}", e.code());
            }
        }
        if let Err(e) = self.state.kstar.store_trace(&trace) {
            tracing::warn!(error = %e, "failed to write audit trace");
        }
    }
}

/// Minimal inline JSON-schema validation: `type: object`, `required`
/// fields, and per-property primitive `type` checks. By-reference schemas
/// are accepted as-is.
pub fn validate_schema(schema: &SchemaRef, value: &Value) -> Result<()> {
    let schema = match schema {
        SchemaRef::Inline(s) => s,
        SchemaRef::Reference(_) => return Ok(()),
    };

    if schema.get("type").and_then(Value::as_str) == Some("object") && !value.is_object() {
        return Err(Error::Config("input must be an object".into()));
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if value.get(field).is_none() {
                return Err(Error::Config(format!("missing required input field: {field}")));
            }
        }
    }
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (field, prop) in properties {
            let Some(v) = value.get(field) else { continue };
            let Some(expected) = prop.get("type").and_then(Value::as_str) else {
                continue;
            };
            let ok = match expected {
                "string" => v.is_string(),
                "number" | "integer" => v.is_number(),
                "boolean" => v.is_boolean(),
                "array" => v.is_array(),
                "object" => v.is_object(),
                _ => true,
            };
            if !ok {
                return Err(Error::Config(format!(
                    "input field {field} is not a {expected}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_validation_checks_required_and_types() {
        let schema = SchemaRef::Inline(json!({
            "type": "object",
            "required": ["text"],
            "properties": { "text": { "type": "string" }, "count": { "type": "number" } }
        }));

        assert!(validate_schema(&schema, &json!({ "text": "hi" })).is_ok());
        assert!(validate_schema(&schema, &json!({ "text": "hi", "count": 3 })).is_ok());
        assert!(validate_schema(&schema, &json!({})).is_err());
        assert!(validate_schema(&schema, &json!({ "text": 42 })).is_err());
        assert!(validate_schema(&schema, &json!("not an object")).is_err());
    }

    #[test]
    fn reference_schemas_pass_through() {
        let schema = SchemaRef::Reference("p3394://schema/anything".into());
        assert!(validate_schema(&schema, &json!(null)).is_ok());
    }
}
