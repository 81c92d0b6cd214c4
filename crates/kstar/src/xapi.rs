//! xAPI statement emission.
//!
//! One Actor-Verb-Object statement per UMF traversing the gateway, appended
//! to `stm/{session_id}/xapi.jsonl` in the same order as the session's
//! trace log.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use p3394_domain::error::Result;
use p3394_domain::trace::TraceEvent;
use p3394_domain::umf::{MessageType, Umf};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Verbs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XapiVerb {
    Asked,
    Responded,
    Executed,
    Completed,
    Interacted,
}

impl XapiVerb {
    pub fn display_name(&self) -> &'static str {
        match self {
            XapiVerb::Asked => "asked",
            XapiVerb::Responded => "responded",
            XapiVerb::Executed => "executed",
            XapiVerb::Completed => "completed",
            XapiVerb::Interacted => "interacted",
        }
    }

    pub fn iri(&self) -> String {
        format!("http://adlnet.gov/expapi/verbs/{}", self.display_name())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Statement
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XapiStatement {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: Value,
    pub verb: Value,
    pub object: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub context: Value,
}

impl XapiStatement {
    /// Build the statement for one gateway-traversing message.
    pub fn for_message(
        principal_urn: &str,
        verb: XapiVerb,
        msg: &Umf,
        session_id: &str,
        success: Option<bool>,
    ) -> Self {
        let mut extensions = Map::new();
        extensions.insert(
            "p3394://ext/message_id".into(),
            Value::String(msg.id.clone()),
        );
        extensions.insert(
            "p3394://ext/message_type".into(),
            serde_json::to_value(msg.kind).unwrap_or(Value::Null),
        );
        if let Some(ref reply_to) = msg.reply_to {
            extensions.insert(
                "p3394://ext/reply_to".into(),
                Value::String(reply_to.clone()),
            );
        }

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: json!({
                "objectType": "Agent",
                "name": principal_urn,
                "account": { "homePage": "p3394://principals", "name": principal_urn },
            }),
            verb: json!({
                "id": verb.iri(),
                "display": { "en-US": verb.display_name() },
            }),
            object: json!({
                "objectType": "Activity",
                "id": format!("p3394://message/{}", msg.id),
            }),
            result: success.map(|s| json!({ "success": s })),
            context: json!({
                "contextActivities": {
                    "parent": [{
                        "objectType": "Activity",
                        "id": format!("p3394://session/{session_id}"),
                    }],
                },
                "extensions": Value::Object(extensions),
            }),
        }
    }

    /// Verb from message and routing semantics: commands are `executed`,
    /// plain requests `asked`, responses `responded`, errors and results
    /// `completed`, everything else `interacted`.
    pub fn derive_verb(msg: &Umf, is_command: bool) -> XapiVerb {
        match msg.kind {
            MessageType::Request if is_command => XapiVerb::Executed,
            MessageType::Request => XapiVerb::Asked,
            MessageType::Response => XapiVerb::Responded,
            MessageType::Error => XapiVerb::Completed,
            MessageType::Notification => XapiVerb::Interacted,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Appends statements to `stm/{session_id}/xapi.jsonl`, serialized so the
/// per-session ordering matches emission order.
pub struct XapiWriter {
    storage_root: PathBuf,
    write_lock: Mutex<()>,
}

impl XapiWriter {
    pub fn new(storage_root: &Path) -> Self {
        Self {
            storage_root: storage_root.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn emit(&self, session_id: &str, statement: &XapiStatement) -> Result<()> {
        let dir = self.storage_root.join("stm").join(session_id);
        let _guard = self.write_lock.lock();
        std::fs::create_dir_all(&dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("xapi.jsonl"))?;
        file.write_all(serde_json::to_string(statement)?.as_bytes())?;
        file.write_all(b"\n")?;

        TraceEvent::XapiEmitted {
            verb: statement.verb["display"]["en-US"]
                .as_str()
                .unwrap_or_default()
                .to_owned(),
            message_id: statement.object["id"].as_str().unwrap_or_default().to_owned(),
        }
        .emit();
        Ok(())
    }

    pub fn session_statements(&self, session_id: &str) -> Result<Vec<XapiStatement>> {
        let path = self
            .storage_root
            .join("stm")
            .join(session_id)
            .join("xapi.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_shape_for_executed_command() {
        let msg = Umf::text_request("/version");
        let statement = XapiStatement::for_message(
            "urn:principal:org:local:role:admin:person:owner",
            XapiVerb::Executed,
            &msg,
            "s1",
            None,
        );
        assert_eq!(
            statement.verb["id"],
            "http://adlnet.gov/expapi/verbs/executed"
        );
        assert_eq!(
            statement.object["id"],
            format!("p3394://message/{}", msg.id)
        );
        assert_eq!(
            statement.context["contextActivities"]["parent"][0]["id"],
            "p3394://session/s1"
        );
        let ext = &statement.context["extensions"];
        assert_eq!(ext["p3394://ext/message_id"], msg.id);
        assert_eq!(ext["p3394://ext/message_type"], "request");
    }

    #[test]
    fn failed_completion_carries_result_success_false() {
        let req = Umf::text_request("boom");
        let err_reply = Umf::error_reply(&req, &p3394_domain::Error::Internal("x".into()));
        let statement = XapiStatement::for_message(
            "urn:p",
            XapiVerb::Completed,
            &err_reply,
            "s1",
            Some(false),
        );
        assert_eq!(statement.result.unwrap()["success"], false);
        assert_eq!(
            statement.context["extensions"]["p3394://ext/reply_to"],
            req.id
        );
    }

    #[test]
    fn verb_derivation() {
        let req = Umf::text_request("hi");
        assert_eq!(XapiStatement::derive_verb(&req, true), XapiVerb::Executed);
        assert_eq!(XapiStatement::derive_verb(&req, false), XapiVerb::Asked);
        let reply = Umf::reply_to(&req, vec![]);
        assert_eq!(XapiStatement::derive_verb(&reply, false), XapiVerb::Responded);
    }

    #[test]
    fn writer_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = XapiWriter::new(dir.path());
        for i in 0..3 {
            let mut msg = Umf::text_request(format!("m{i}"));
            msg.id = format!("id-{i}");
            let statement =
                XapiStatement::for_message("urn:p", XapiVerb::Asked, &msg, "s1", None);
            writer.emit("s1", &statement).unwrap();
        }
        let statements = writer.session_statements("s1").unwrap();
        let objects: Vec<_> = statements
            .iter()
            .map(|s| s.object["id"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(
            objects,
            vec![
                "p3394://message/id-0",
                "p3394://message/id-1",
                "p3394://message/id-2"
            ]
        );
    }
}
