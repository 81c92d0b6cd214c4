//! Authorization policy engine.
//!
//! A policy is an ordered rule list; rules are data (a condition enum, not
//! closures) so the default policy can be inspected, logged, and tested.
//! Lower priority evaluates first; the first matching rule decides.
//!
//! Two toggles gate enforcement: a global flag and a per-channel set. With
//! enforcement off the decision is still computed and logged, but the caller
//! is told ALLOW; the computed decision is preserved on the outcome for
//! audit.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use p3394_domain::principal::{AssuranceLevel, Principal, PrincipalType};
use p3394_domain::trace::TraceEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission classes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermClass {
    Read,
    Execute,
    Write,
    Admin,
}

/// Classify a permission string. Namespaced permissions (`kstar:write`)
/// classify by their final segment; `*` is admin-class.
pub fn perm_class(permission: &str) -> PermClass {
    let leaf = permission.rsplit(':').next().unwrap_or(permission);
    match leaf {
        "*" | "admin" | "configure" => PermClass::Admin,
        "write" | "update" | "delete" | "store" => PermClass::Write,
        "execute" | "invoke" | "shell" => PermClass::Execute,
        _ => PermClass::Read,
    }
}

/// Is `requested` satisfied by any granted scope? `*` grants everything,
/// `ns:*` grants the namespace.
fn scope_grants(granted: &str, requested: &str) -> bool {
    if granted == "*" || granted == requested {
        return true;
    }
    match granted.strip_suffix(":*") {
        Some(ns) => requested
            .strip_prefix(ns)
            .map(|rest| rest.starts_with(':'))
            .unwrap_or(false),
        None => false,
    }
}

fn is_subset(requested: &[String], granted: &[String]) -> bool {
    requested
        .iter()
        .all(|r| granted.iter().any(|g| scope_grants(g, r)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Deny,
}

/// The condition half of a rule, evaluated against an [`AuthzRequest`].
#[derive(Debug, Clone)]
pub enum Condition {
    PrincipalTypeIs(PrincipalType),
    RoleIs(String),
    /// Anonymous principal requesting anything above read level.
    AnonymousRequestsRestricted,
    /// Any admin-class permission requested with assurance below `min`.
    AdminRequestedBelow(AssuranceLevel),
    /// Any write-class permission requested with assurance below `min`.
    WriteRequestedBelow(AssuranceLevel),
    RequestedSubsetOfGranted,
    /// Authenticated principal and every requested permission is read-class.
    AuthenticatedReadOnly,
    Always,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub priority: i32,
    pub condition: Condition,
    pub decision: Decision,
    pub reason: String,
}

pub struct AuthzRequest<'a> {
    pub principal: &'a Principal,
    pub assurance: AssuranceLevel,
    pub capability_id: &'a str,
    pub requested: &'a [String],
    pub granted: &'a [String],
    pub channel_id: &'a str,
}

impl Condition {
    fn matches(&self, req: &AuthzRequest<'_>) -> bool {
        match self {
            Condition::PrincipalTypeIs(t) => req.principal.principal_type == *t,
            Condition::RoleIs(role) => req.principal.role() == Some(role.as_str()),
            Condition::AnonymousRequestsRestricted => {
                req.principal.principal_type == PrincipalType::Anonymous
                    && req.requested.iter().any(|p| perm_class(p) != PermClass::Read)
            }
            Condition::AdminRequestedBelow(min) => {
                req.requested.iter().any(|p| perm_class(p) == PermClass::Admin)
                    && req.assurance < *min
            }
            Condition::WriteRequestedBelow(min) => {
                req.requested.iter().any(|p| perm_class(p) == PermClass::Write)
                    && req.assurance < *min
            }
            Condition::RequestedSubsetOfGranted => is_subset(req.requested, req.granted),
            Condition::AuthenticatedReadOnly => {
                req.principal.principal_type != PrincipalType::Anonymous
                    && req.assurance > AssuranceLevel::None
                    && req.requested.iter().all(|p| perm_class(p) == PermClass::Read)
            }
            Condition::Always => true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What `authorize` hands back. `decision` is what the caller must obey;
/// `computed` is what the policy actually concluded (they differ only when
/// enforcement is off).
#[derive(Debug, Clone)]
pub struct Outcome {
    pub decision: Decision,
    pub computed: Decision,
    pub rule: String,
    pub reason: String,
    pub enforced: bool,
}

impl Outcome {
    pub fn allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

pub struct PolicyEngine {
    rules: Vec<Rule>,
    enforce_global: bool,
    enforce_channels: HashSet<String>,
}

impl PolicyEngine {
    pub fn new(mut rules: Vec<Rule>, enforce_global: bool, enforce_channels: Vec<String>) -> Self {
        rules.sort_by_key(|r| r.priority);
        Self {
            rules,
            enforce_global,
            enforce_channels: enforce_channels.into_iter().collect(),
        }
    }

    /// The default policy with the standard eight rules.
    pub fn with_default_policy(enforce_global: bool, enforce_channels: Vec<String>) -> Self {
        Self::new(default_rules(), enforce_global, enforce_channels)
    }

    pub fn is_enforced(&self, channel_id: &str) -> bool {
        self.enforce_global || self.enforce_channels.contains(channel_id)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn authorize(&self, req: &AuthzRequest<'_>) -> Outcome {
        let (computed, rule, reason) = self
            .rules
            .iter()
            .find(|r| r.condition.matches(req))
            .map(|r| (r.decision, r.name.clone(), r.reason.clone()))
            // The default policy ends in an Always rule; a custom policy
            // without one denies by default too.
            .unwrap_or((Decision::Deny, "implicit-default".into(), "no rule matched".into()));

        let enforced = self.is_enforced(req.channel_id);
        let decision = if enforced { computed } else { Decision::Allow };

        TraceEvent::PolicyDecision {
            capability_id: req.capability_id.to_owned(),
            principal_urn: req.principal.urn.clone(),
            decision: format!("{computed:?}"),
            rule: rule.clone(),
            enforced,
        }
        .emit();

        Outcome {
            decision,
            computed,
            rule,
            reason,
            enforced,
        }
    }
}

/// The default policy, priority ascending; first match wins.
pub fn default_rules() -> Vec<Rule> {
    let rule = |priority: i32, name: &str, condition: Condition, decision: Decision, reason: &str| Rule {
        name: name.into(),
        priority,
        condition,
        decision,
        reason: reason.into(),
    };
    vec![
        rule(
            1,
            "system-principal",
            Condition::PrincipalTypeIs(PrincipalType::System),
            Decision::Allow,
            "internal system principal",
        ),
        rule(
            2,
            "admin-role",
            Condition::RoleIs("admin".into()),
            Decision::Allow,
            "principal holds the admin role",
        ),
        rule(
            3,
            "anonymous-restricted",
            Condition::AnonymousRequestsRestricted,
            Decision::Deny,
            "anonymous principals may not request admin, write, or execute permissions",
        ),
        rule(
            4,
            "admin-needs-high-assurance",
            Condition::AdminRequestedBelow(AssuranceLevel::High),
            Decision::Deny,
            "HIGH assurance required for admin-level permissions",
        ),
        rule(
            5,
            "write-needs-medium-assurance",
            Condition::WriteRequestedBelow(AssuranceLevel::Medium),
            Decision::Deny,
            "MEDIUM assurance required for write-level permissions",
        ),
        rule(
            6,
            "granted-covers-requested",
            Condition::RequestedSubsetOfGranted,
            Decision::Allow,
            "requested permissions are covered by the session grant",
        ),
        rule(
            7,
            "authenticated-read",
            Condition::AuthenticatedReadOnly,
            Decision::Allow,
            "authenticated principal requesting read-level permissions only",
        ),
        rule(
            999,
            "default-deny",
            Condition::Always,
            Decision::Deny,
            "no policy rule allowed the request",
        ),
    ]
}
