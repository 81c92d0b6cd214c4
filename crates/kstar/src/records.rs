//! The four KSTAR record families: traces (episodic), perceptions
//! (declarative), skills (procedural), and control tokens (authority),
//! plus schema-tagged facts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Traces
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Situation {
    #[serde(default)]
    pub domain: String,
    /// Principal URN of the acting party.
    #[serde(default)]
    pub actor: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type", default)]
    pub action_type: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub tools_used: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub side_effects: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceMetadata {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Updates to an existing trace are expressed as a new trace linking
    /// back here — traces themselves are append-only.
    #[serde(default)]
    pub linked_traces: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Session partition for STM; LTM keeps all traces regardless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub situation: Situation,
    #[serde(default)]
    pub task: Task,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub result: TraceResult,
    #[serde(default)]
    pub metadata: TraceMetadata,
}

impl Trace {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            session_id: None,
            situation: Situation::default(),
            task: Task::default(),
            action: Action {
                action_type: action_type.into(),
                ..Default::default()
            },
            result: TraceResult::default(),
            metadata: TraceMetadata::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Perceptions & facts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Perception {
    pub id: String,
    #[serde(rename = "type")]
    pub perception_type: String,
    pub subject: String,
    pub content: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    /// Trace ids backing this perception.
    #[serde(default)]
    pub evidence: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

/// A schema-tagged fact; the schema tag tells readers how to interpret
/// `content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub schema: String,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skills
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillMaturity {
    Candidate,
    Practiced,
    Proven,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    /// Where the procedure lives (e.g. a skill document path or capability id).
    pub procedure_ref: String,
    pub maturity: SkillMaturity,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Control tokens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlToken {
    pub token_id: String,
    #[serde(rename = "type")]
    pub token_type: String,
    /// Scope the token authorizes; verification matches requested scopes by
    /// prefix-or-equal.
    pub scope: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    /// Ancestor token ids, root first.
    #[serde(default)]
    pub delegation_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_reason: Option<String>,
    /// HMAC-SHA256 over (token_id, scope, granted_at), hex.
    #[serde(default)]
    pub signature: String,
    /// SHA-256 over the delegation chain, hex.
    #[serde(default)]
    pub lineage_hash: String,
}

/// Why a token failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenInvalidReason {
    NotFound,
    Revoked,
    Expired,
    ScopeMismatch,
    SignatureInvalid,
    ChainBroken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenVerification {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TokenInvalidReason>,
}

impl TokenVerification {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn invalid(reason: TokenInvalidReason) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }
}
