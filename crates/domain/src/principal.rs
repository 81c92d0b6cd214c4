//! Principal identity model: Org-Role-Person URNs, credential bindings,
//! and the client-principal assertion channel adapters attach to every
//! inbound message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalType {
    Human,
    Agent,
    Service,
    System,
    Anonymous,
}

/// Strength of the authentication backing an assertion. Ordered: a policy
/// rule saying "assurance ≥ MEDIUM" compares variants directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssuranceLevel {
    None,
    Low,
    Medium,
    High,
    Cryptographic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// `urn:principal:org:{org}:role:{role}:person:{person}`
    pub urn: String,
    pub name: String,
    #[serde(rename = "type")]
    pub principal_type: PrincipalType,
    pub created_at: DateTime<Utc>,
}

impl Principal {
    pub fn new(urn: impl Into<String>, name: impl Into<String>, principal_type: PrincipalType) -> Self {
        Self {
            urn: urn.into(),
            name: name.into(),
            principal_type,
            created_at: Utc::now(),
        }
    }

    /// The `role` segment of the URN, when well-formed.
    pub fn role(&self) -> Option<&str> {
        urn_segment(&self.urn, "role")
    }

    pub fn org(&self) -> Option<&str> {
        urn_segment(&self.urn, "org")
    }
}

/// Build the canonical principal URN.
pub fn principal_urn(org: &str, role: &str, person: &str) -> String {
    format!("urn:principal:org:{org}:role:{role}:person:{person}")
}

fn urn_segment<'a>(urn: &'a str, key: &str) -> Option<&'a str> {
    let mut parts = urn.strip_prefix("urn:principal:")?.split(':');
    while let Some(k) = parts.next() {
        let v = parts.next()?;
        if k == key {
            return Some(v);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingType {
    Account,
    Oauth,
    ApiKey,
    Certificate,
    SshKey,
    Phone,
    Email,
    Local,
}

/// Maps a channel-local identity (possibly wildcard, e.g. `local:*`) to a
/// principal URN with a scope set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialBinding {
    pub binding_id: String,
    pub channel_id: String,
    /// Channel-local subject: `local:alice`, `api_key:sk-agent`, `phone:+1…`,
    /// or a wildcard such as `local:*`.
    pub external_subject: String,
    pub principal_urn: String,
    pub binding_type: BindingType,
    pub scopes: Vec<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

impl CredentialBinding {
    /// Whether this binding's subject matches `identity`. A trailing `*`
    /// matches any suffix.
    pub fn matches(&self, identity: &str) -> bool {
        if self.revoked {
            return false;
        }
        match self.external_subject.strip_suffix('*') {
            Some(prefix) => identity.starts_with(prefix),
            None => self.external_subject == identity,
        }
    }

    /// Exact subjects beat wildcards when several bindings match.
    pub fn is_exact(&self) -> bool {
        !self.external_subject.ends_with('*')
    }
}

/// What a channel adapter asserts about the party behind an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAssertion {
    pub channel_id: String,
    pub channel_identity: String,
    pub assurance: AssuranceLevel,
    /// Authentication method name, e.g. `os_user`, `api_key`, `none`.
    pub method: String,
}

impl ClientAssertion {
    pub fn anonymous(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_identity: "anonymous".into(),
            assurance: AssuranceLevel::None,
            method: "none".into(),
        }
    }
}
