//! Local-first KSTAR storage: append-only JSON-lines files, one per family
//! under `ltm/memory/`, with traces additionally partitioned per session
//! under `stm/{session_id}/trace.jsonl`.
//!
//! Writers are serialized per family; readers parse a consistent snapshot
//! of the file. Control tokens are also kept in an in-memory index
//! (last record per token id wins) so verification never re-reads the log.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use p3394_domain::error::{Error, Result};
use p3394_domain::trace::TraceEvent;

use crate::records::{
    ControlToken, Fact, Perception, SkillRecord, TokenInvalidReason, TokenVerification, Trace,
};

type HmacSha256 = Hmac<Sha256>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Families
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Traces,
    Perceptions,
    Facts,
    Skills,
    Tokens,
}

impl Family {
    pub const ALL: [Family; 5] = [
        Family::Traces,
        Family::Perceptions,
        Family::Facts,
        Family::Skills,
        Family::Tokens,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Family::Traces => "traces.jsonl",
            Family::Perceptions => "perceptions.jsonl",
            Family::Facts => "facts.jsonl",
            Family::Skills => "skills.jsonl",
            Family::Tokens => "tokens.jsonl",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Family::Traces => "traces",
            Family::Perceptions => "perceptions",
            Family::Facts => "facts",
            Family::Skills => "skills",
            Family::Tokens => "tokens",
        }
    }
}

struct FamilyLocks {
    traces: Mutex<()>,
    perceptions: Mutex<()>,
    facts: Mutex<()>,
    skills: Mutex<()>,
    tokens: Mutex<()>,
}

impl FamilyLocks {
    fn new() -> Self {
        Self {
            traces: Mutex::new(()),
            perceptions: Mutex::new(()),
            facts: Mutex::new(()),
            skills: Mutex::new(()),
            tokens: Mutex::new(()),
        }
    }

    fn get(&self, family: Family) -> &Mutex<()> {
        match family {
            Family::Traces => &self.traces,
            Family::Perceptions => &self.perceptions,
            Family::Facts => &self.facts,
            Family::Skills => &self.skills,
            Family::Tokens => &self.tokens,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trace queries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    pub session_id: Option<String>,
    pub actor: Option<String>,
    pub channel: Option<String>,
    pub action_type: Option<String>,
    pub success: Option<bool>,
    pub since: Option<chrono::DateTime<Utc>>,
    pub until: Option<chrono::DateTime<Utc>>,
}

impl TraceFilter {
    fn matches(&self, t: &Trace) -> bool {
        if let Some(ref sid) = self.session_id {
            if t.session_id.as_deref() != Some(sid.as_str()) {
                return false;
            }
        }
        if let Some(ref actor) = self.actor {
            if &t.situation.actor != actor {
                return false;
            }
        }
        if let Some(ref channel) = self.channel {
            if &t.situation.channel != channel {
                return false;
            }
        }
        if let Some(ref action_type) = self.action_type {
            if &t.action.action_type != action_type {
                return false;
            }
        }
        if let Some(success) = self.success {
            if t.result.success != success {
                return false;
            }
        }
        if let Some(since) = self.since {
            if t.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if t.timestamp > until {
                return false;
            }
        }
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct KstarStore {
    storage_root: PathBuf,
    signing_key: Vec<u8>,
    locks: FamilyLocks,
    tokens: RwLock<HashMap<String, ControlToken>>,
}

impl KstarStore {
    pub fn new(storage_root: &Path) -> Result<Self> {
        let memory_dir = storage_root.join("ltm").join("memory");
        std::fs::create_dir_all(&memory_dir)?;

        let signing_key = load_or_create_signing_key(&memory_dir)?;

        let store = Self {
            storage_root: storage_root.to_path_buf(),
            signing_key,
            locks: FamilyLocks::new(),
            tokens: RwLock::new(HashMap::new()),
        };

        // Rebuild the token index; the log may contain several records per
        // token (grant, then revocations) — the last one wins.
        let mut index = HashMap::new();
        for value in store.read_family_values(Family::Tokens)? {
            if let Ok(token) = serde_json::from_value::<ControlToken>(value) {
                index.insert(token.token_id.clone(), token);
            }
        }
        tracing::info!(tokens = index.len(), "kstar store loaded");
        *store.tokens.write() = index;
        Ok(store)
    }

    fn family_path(&self, family: Family) -> PathBuf {
        self.storage_root
            .join("ltm")
            .join("memory")
            .join(family.file_name())
    }

    fn session_trace_path(&self, session_id: &str) -> PathBuf {
        self.storage_root
            .join("stm")
            .join(session_id)
            .join("trace.jsonl")
    }

    fn append_line(&self, path: &Path, record: &impl Serialize) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let line = serde_json::to_string(record)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn append_family(&self, family: Family, record: &impl Serialize) -> Result<()> {
        let _guard = self.locks.get(family).lock();
        self.append_line(&self.family_path(family), record)
    }

    pub(crate) fn read_family_values(&self, family: Family) -> Result<Vec<Value>> {
        let path = self.family_path(family);
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

    /// Rewrite a family file in place (bundle import with `replace`).
    pub(crate) fn replace_family(&self, family: Family, values: &[Value]) -> Result<()> {
        let _guard = self.locks.get(family).lock();
        let mut out = String::new();
        for v in values {
            out.push_str(&serde_json::to_string(v)?);
            out.push('\n');
        }
        std::fs::write(self.family_path(family), out)?;
        Ok(())
    }

    pub(crate) fn append_value(&self, family: Family, value: &Value) -> Result<()> {
        self.append_family(family, value)
    }

    pub(crate) fn rebuild_token_index(&self) -> Result<()> {
        let mut index = HashMap::new();
        for value in self.read_family_values(Family::Tokens)? {
            if let Ok(token) = serde_json::from_value::<ControlToken>(value) {
                index.insert(token.token_id.clone(), token);
            }
        }
        *self.tokens.write() = index;
        Ok(())
    }

    // ── Stores ───────────────────────────────────────────────────────

    /// Append a trace to LTM and, when it carries a session id, to that
    /// session's STM log. Traces are never rewritten; corrections are new
    /// traces referencing the original via `metadata.linked_traces`.
    pub fn store_trace(&self, trace: &Trace) -> Result<()> {
        {
            let _guard = self.locks.get(Family::Traces).lock();
            self.append_line(&self.family_path(Family::Traces), trace)?;
            if let Some(ref session_id) = trace.session_id {
                self.append_line(&self.session_trace_path(session_id), trace)?;
            }
        }
        TraceEvent::KstarAppend {
            family: "traces".into(),
            record_id: trace.id.clone(),
            session_id: trace.session_id.clone(),
        }
        .emit();
        Ok(())
    }

    pub fn store_perception(&self, perception: &Perception) -> Result<()> {
        if !(0.0..=1.0).contains(&perception.confidence) {
            return Err(Error::Config(format!(
                "perception confidence {} outside [0, 1]",
                perception.confidence
            )));
        }
        self.append_family(Family::Perceptions, perception)
    }

    pub fn store_fact(&self, fact: &Fact) -> Result<()> {
        self.append_family(Family::Facts, fact)
    }

    pub fn store_skill(&self, skill: &SkillRecord) -> Result<()> {
        self.append_family(Family::Skills, skill)
    }

    pub fn store_control_token(&self, token: ControlToken) -> Result<()> {
        self.append_family(Family::Tokens, &token)?;
        self.tokens.write().insert(token.token_id.clone(), token);
        Ok(())
    }

    // ── Token authority ──────────────────────────────────────────────

    /// Fill in `signature` and `lineage_hash` with this store's key.
    pub fn sign_token(&self, token: &mut ControlToken) {
        token.signature = self.token_signature(token);
        token.lineage_hash = lineage_hash(&token.delegation_chain);
    }

    fn token_signature(&self, token: &ControlToken) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .expect("HMAC accepts any key length");
        mac.update(token.token_id.as_bytes());
        mac.update(b"|");
        mac.update(token.scope.as_bytes());
        mac.update(b"|");
        mac.update(token.granted_at.to_rfc3339().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn get_token(&self, token_id: &str) -> Option<ControlToken> {
        self.tokens.read().get(token_id).cloned()
    }

    /// Check a token against a requested scope. Reasons come back in a
    /// fixed precedence: not_found, revoked, expired, scope_mismatch,
    /// signature_invalid, chain_broken.
    pub fn verify_control_token(&self, token_id: &str, scope: &str) -> TokenVerification {
        let tokens = self.tokens.read();
        let token = match tokens.get(token_id) {
            Some(t) => t,
            None => return TokenVerification::invalid(TokenInvalidReason::NotFound),
        };
        if token.revoked {
            return TokenVerification::invalid(TokenInvalidReason::Revoked);
        }
        if let Some(expires_at) = token.expires_at {
            if Utc::now() >= expires_at {
                return TokenVerification::invalid(TokenInvalidReason::Expired);
            }
        }
        if !scope_matches(&token.scope, scope) {
            return TokenVerification::invalid(TokenInvalidReason::ScopeMismatch);
        }
        if token.signature != self.token_signature(token) {
            return TokenVerification::invalid(TokenInvalidReason::SignatureInvalid);
        }
        if token.lineage_hash != lineage_hash(&token.delegation_chain) {
            return TokenVerification::invalid(TokenInvalidReason::ChainBroken);
        }
        for ancestor in &token.delegation_chain {
            match tokens.get(ancestor) {
                Some(a) if !a.revoked => {}
                _ => return TokenVerification::invalid(TokenInvalidReason::ChainBroken),
            }
        }
        TokenVerification::ok()
    }

    /// Revoke a token. Revoked tokens remain addressable; `revoked_at` is
    /// set once and kept on repeat revocations.
    pub fn revoke_control_token(&self, token_id: &str, reason: &str) -> Result<ControlToken> {
        let updated = {
            let mut tokens = self.tokens.write();
            let token = tokens
                .get_mut(token_id)
                .ok_or_else(|| Error::CapNotFound(format!("token {token_id}")))?;
            if !token.revoked {
                token.revoked = true;
                token.revoked_at = Some(Utc::now());
                token.revoke_reason = Some(reason.to_owned());
            }
            token.clone()
        };
        self.append_family(Family::Tokens, &updated)?;
        Ok(updated)
    }

    /// The token's ancestry, root first, ending with the token itself.
    /// Missing ancestors are skipped (chain verification reports them).
    pub fn get_token_lineage(&self, token_id: &str) -> Vec<ControlToken> {
        let tokens = self.tokens.read();
        let Some(token) = tokens.get(token_id) else {
            return Vec::new();
        };
        let mut lineage: Vec<ControlToken> = token
            .delegation_chain
            .iter()
            .filter_map(|id| tokens.get(id).cloned())
            .collect();
        lineage.push(token.clone());
        lineage
    }

    // ── Trace queries ────────────────────────────────────────────────

    pub fn query_traces(
        &self,
        filter: &TraceFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Trace>> {
        let traces = self.all_traces()?;
        Ok(traces
            .into_iter()
            .filter(|t| filter.matches(t))
            .skip(offset)
            .take(if limit == 0 { usize::MAX } else { limit })
            .collect())
    }

    /// Case-insensitive text search over selected fields
    /// (`goal`, `outcome`, `domain`, `tags`). Empty `fields` = all.
    pub fn search_traces(&self, text_query: &str, fields: &[&str]) -> Result<Vec<Trace>> {
        let needle = text_query.to_lowercase();
        let wants = |f: &str| fields.is_empty() || fields.contains(&f);
        let traces = self.all_traces()?;
        Ok(traces
            .into_iter()
            .filter(|t| {
                (wants("goal") && t.task.goal.to_lowercase().contains(&needle))
                    || (wants("outcome") && t.result.outcome.to_lowercase().contains(&needle))
                    || (wants("domain") && t.situation.domain.to_lowercase().contains(&needle))
                    || (wants("tags")
                        && t.metadata
                            .tags
                            .iter()
                            .any(|tag| tag.to_lowercase().contains(&needle)))
            })
            .collect())
    }

    /// All traces appended for one session, in append order.
    pub fn session_traces(&self, session_id: &str) -> Result<Vec<Trace>> {
        let path = self.session_trace_path(session_id);
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

    fn all_traces(&self) -> Result<Vec<Trace>> {
        Ok(self
            .read_family_values(Family::Traces)?
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    pub fn family_count(&self, family: Family) -> Result<usize> {
        Ok(self.read_family_values(family)?.len())
    }
}

/// `token_scope` authorizes `requested` when equal or a `:`-separated
/// prefix of it.
pub fn scope_matches(token_scope: &str, requested: &str) -> bool {
    requested == token_scope
        || requested
            .strip_prefix(token_scope)
            .map(|rest| rest.starts_with(':'))
            .unwrap_or(false)
}

fn lineage_hash(chain: &[String]) -> String {
    let mut hasher = Sha256::new();
    for id in chain {
        hasher.update(id.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

fn load_or_create_signing_key(memory_dir: &Path) -> Result<Vec<u8>> {
    let key_path = memory_dir.join("signing.key");
    if key_path.exists() {
        let hex_key = std::fs::read_to_string(&key_path)?;
        return hex::decode(hex_key.trim())
            .map_err(|e| Error::Config(format!("corrupt signing key: {e}")));
    }
    let key: Vec<u8> = uuid::Uuid::new_v4()
        .as_bytes()
        .iter()
        .chain(uuid::Uuid::new_v4().as_bytes())
        .copied()
        .collect();
    std::fs::write(&key_path, hex::encode(&key))?;
    Ok(key)
}
