//! In-process capability registry: CRUD, indexed query, invariants.
//!
//! Mutations go through a single writer lock; queries read a consistent
//! snapshot. Hook chains and declared dependencies must form a DAG — a
//! bounded DFS at registration time rejects cycles.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use p3394_domain::error::{Error, Result};

use crate::descriptor::{
    normalize_alias, CapabilityDescriptor, CapabilityKind, DangerLevel, ExposureScope,
    InvocationMode, Substrate,
};

/// Maximum hook/dependency chain depth the cycle check will walk.
const MAX_CHAIN_DEPTH: usize = 32;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query filter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct CapabilityFilter {
    pub kind: Option<CapabilityKind>,
    pub substrate: Option<Substrate>,
    pub exposure: Option<ExposureScope>,
    pub invocation_mode: Option<InvocationMode>,
    pub enabled: Option<bool>,
    pub command_alias: Option<String>,
    pub trigger_substring: Option<String>,
}

impl CapabilityFilter {
    pub fn matches(&self, d: &CapabilityDescriptor) -> bool {
        if let Some(kind) = self.kind {
            if d.kind != kind {
                return false;
            }
        }
        if let Some(substrate) = self.substrate {
            if d.substrate != substrate {
                return false;
            }
        }
        if let Some(exposure) = self.exposure {
            if d.exposure != exposure {
                return false;
            }
        }
        if let Some(mode) = self.invocation_mode {
            if !d.invocation_modes.contains(&mode) {
                return false;
            }
        }
        if let Some(enabled) = self.enabled {
            if d.status.enabled != enabled {
                return false;
            }
        }
        if let Some(ref alias) = self.command_alias {
            let wanted = normalize_alias(alias);
            if !d.command_aliases.iter().any(|a| normalize_alias(a) == wanted) {
                return false;
            }
        }
        if let Some(ref sub) = self.trigger_substring {
            let sub = sub.to_lowercase();
            if !d.message_triggers.iter().any(|t| t.to_lowercase().contains(&sub)) {
                return false;
            }
        }
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Partial update
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fields that may change at runtime on a mutable descriptor.
#[derive(Debug, Clone, Default)]
pub struct DescriptorPatch {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub command_aliases: Option<Vec<String>>,
    pub message_triggers: Option<Vec<String>>,
    pub required_permissions: Option<Vec<String>>,
    pub danger_level: Option<DangerLevel>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, CapabilityDescriptor>,
    /// Normalized alias → capability id.
    by_alias: HashMap<String, String>,
    by_kind: HashMap<CapabilityKind, HashSet<String>>,
    by_substrate: HashMap<Substrate, HashSet<String>>,
    /// Lowercased trigger keyword → capability ids (insertion-ordered).
    by_trigger: HashMap<String, Vec<String>>,
}

pub struct CapabilityRegistry {
    inner: RwLock<Inner>,
    /// When non-empty, `required_permissions` must fall inside this set
    /// (namespace wildcards allowed).
    permission_universe: HashSet<String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            permission_universe: HashSet::new(),
        }
    }

    pub fn with_permission_universe(universe: &[&str]) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            permission_universe: universe.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn register(&self, descriptor: CapabilityDescriptor) -> Result<()> {
        let id = descriptor.capability_id.clone();
        if id.is_empty() {
            return Err(Error::Config("capability_id must not be empty".into()));
        }

        self.check_permissions(&descriptor)?;

        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }
        for alias in &descriptor.command_aliases {
            let normalized = normalize_alias(alias);
            if let Some(owner) = inner.by_alias.get(&normalized) {
                if owner != &id {
                    return Err(Error::DuplicateAlias(format!(
                        "{alias} already registered by {owner}"
                    )));
                }
            }
        }

        check_chain_acyclic(&inner.by_id, &descriptor)?;

        index(&mut inner, &descriptor);
        inner.by_id.insert(id.clone(), descriptor);
        tracing::debug!(capability_id = %id, "capability registered");
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Result<CapabilityDescriptor> {
        let mut inner = self.inner.write();
        let descriptor = inner
            .by_id
            .remove(id)
            .ok_or_else(|| Error::CapNotFound(id.to_owned()))?;
        unindex(&mut inner, &descriptor);
        Ok(descriptor)
    }

    pub fn get(&self, id: &str) -> Option<CapabilityDescriptor> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().by_id.contains_key(id)
    }

    pub fn update(&self, id: &str, patch: DescriptorPatch) -> Result<CapabilityDescriptor> {
        let mut inner = self.inner.write();
        let current = inner
            .by_id
            .get(id)
            .ok_or_else(|| Error::CapNotFound(id.to_owned()))?;
        if !current.status.mutable {
            return Err(Error::MutableViolation(id.to_owned()));
        }

        // Alias changes must stay unique across the registry.
        if let Some(ref aliases) = patch.command_aliases {
            for alias in aliases {
                let normalized = normalize_alias(alias);
                if let Some(owner) = inner.by_alias.get(&normalized) {
                    if owner != id {
                        return Err(Error::DuplicateAlias(format!(
                            "{alias} already registered by {owner}"
                        )));
                    }
                }
            }
        }

        let mut updated = current.clone();
        if let Some(name) = patch.name {
            updated.name = name;
        }
        if let Some(version) = patch.version {
            updated.version = version;
        }
        if let Some(description) = patch.description {
            updated.description = description;
        }
        if let Some(enabled) = patch.enabled {
            updated.status.enabled = enabled;
        }
        if let Some(aliases) = patch.command_aliases {
            updated.command_aliases = aliases;
        }
        if let Some(triggers) = patch.message_triggers {
            updated.message_triggers = triggers;
        }
        if let Some(permissions) = patch.required_permissions {
            updated.required_permissions = permissions;
        }
        if let Some(danger) = patch.danger_level {
            updated.danger_level = danger;
        }
        self.check_permissions(&updated)?;

        let old = inner.by_id.insert(id.to_owned(), updated.clone()).unwrap();
        unindex(&mut inner, &old);
        index(&mut inner, &updated);
        Ok(updated)
    }

    pub fn query(&self, filter: &CapabilityFilter) -> Vec<CapabilityDescriptor> {
        let inner = self.inner.read();

        // Alias lookups can use the index directly.
        if let Some(ref alias) = filter.command_alias {
            let normalized = normalize_alias(alias);
            return inner
                .by_alias
                .get(&normalized)
                .and_then(|id| inner.by_id.get(id))
                .filter(|d| filter.matches(d))
                .cloned()
                .into_iter()
                .collect();
        }

        let mut results: Vec<_> = inner
            .by_id
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.capability_id.cmp(&b.capability_id));
        results
    }

    pub fn list(&self) -> Vec<CapabilityDescriptor> {
        self.query(&CapabilityFilter::default())
    }

    /// Resolve a command alias (any syntax) to a capability id.
    pub fn resolve_alias(&self, alias: &str) -> Option<String> {
        self.inner
            .read()
            .by_alias
            .get(&normalize_alias(alias))
            .cloned()
    }

    /// All `(trigger, capability_id)` pairs whose trigger occurs in `text`
    /// (lowercased substring match), in insertion order per trigger.
    pub fn matching_triggers(&self, text: &str) -> Vec<(String, String)> {
        let lowered = text.to_lowercase();
        let inner = self.inner.read();
        let mut hits = Vec::new();
        for (trigger, ids) in &inner.by_trigger {
            if lowered.contains(trigger.as_str()) {
                for id in ids {
                    if inner.by_id.get(id).map(|d| d.enabled()).unwrap_or(false) {
                        hits.push((trigger.clone(), id.clone()));
                    }
                }
            }
        }
        hits
    }

    fn check_permissions(&self, descriptor: &CapabilityDescriptor) -> Result<()> {
        if self.permission_universe.is_empty() {
            return Ok(());
        }
        for p in &descriptor.required_permissions {
            let known = self.permission_universe.contains(p)
                || self.permission_universe.iter().any(|u| {
                    u.strip_suffix(":*")
                        .map(|ns| p.starts_with(ns) && p[ns.len()..].starts_with(':'))
                        .unwrap_or(false)
                });
            if !known {
                return Err(Error::Config(format!(
                    "capability {} requires unknown permission {p}",
                    descriptor.capability_id
                )));
            }
        }
        Ok(())
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn index(inner: &mut Inner, d: &CapabilityDescriptor) {
    let id = d.capability_id.clone();
    for alias in &d.command_aliases {
        inner.by_alias.insert(normalize_alias(alias), id.clone());
    }
    inner.by_kind.entry(d.kind).or_default().insert(id.clone());
    inner
        .by_substrate
        .entry(d.substrate)
        .or_default()
        .insert(id.clone());
    for trigger in &d.message_triggers {
        inner
            .by_trigger
            .entry(trigger.to_lowercase())
            .or_default()
            .push(id.clone());
    }
}

fn unindex(inner: &mut Inner, d: &CapabilityDescriptor) {
    for alias in &d.command_aliases {
        inner.by_alias.remove(&normalize_alias(alias));
    }
    if let Some(set) = inner.by_kind.get_mut(&d.kind) {
        set.remove(&d.capability_id);
    }
    if let Some(set) = inner.by_substrate.get_mut(&d.substrate) {
        set.remove(&d.capability_id);
    }
    for trigger in &d.message_triggers {
        if let Some(ids) = inner.by_trigger.get_mut(&trigger.to_lowercase()) {
            ids.retain(|i| i != &d.capability_id);
        }
    }
}

/// Depth-limited DFS over hook and dependency edges. The candidate is not
/// yet in `by_id`, so its edges are seeded explicitly; a path back to the
/// candidate's id is a cycle.
fn check_chain_acyclic(
    by_id: &HashMap<String, CapabilityDescriptor>,
    candidate: &CapabilityDescriptor,
) -> Result<()> {
    let edges = |id: &str| -> Vec<String> {
        let d = if id == candidate.capability_id {
            Some(candidate)
        } else {
            by_id.get(id)
        };
        match d {
            Some(d) => d
                .hooks
                .all()
                .chain(&d.dependencies.capabilities)
                .cloned()
                .collect(),
            None => Vec::new(), // forward reference — checked when it registers
        }
    };

    let mut stack: Vec<(String, usize)> =
        edges(&candidate.capability_id).into_iter().map(|e| (e, 1)).collect();
    let mut visited = HashSet::new();
    while let Some((id, depth)) = stack.pop() {
        if id == candidate.capability_id {
            return Err(Error::HookCycle(candidate.capability_id.clone()));
        }
        if depth >= MAX_CHAIN_DEPTH || !visited.insert(id.clone()) {
            continue;
        }
        for next in edges(&id) {
            stack.push((next, depth + 1));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Hooks;

    fn cap(id: &str) -> CapabilityDescriptor {
        CapabilityDescriptor::atomic(id, id, Substrate::Symbolic)
    }

    #[test]
    fn register_and_get() {
        let registry = CapabilityRegistry::new();
        registry.register(cap("cmd.version").with_command("/version")).unwrap();
        assert!(registry.get("cmd.version").is_some());
        assert_eq!(registry.resolve_alias("/VERSION").as_deref(), Some("cmd.version"));
    }

    #[test]
    fn duplicate_id_rejected() {
        let registry = CapabilityRegistry::new();
        registry.register(cap("cmd.a")).unwrap();
        let err = registry.register(cap("cmd.a")).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_ID");
    }

    #[test]
    fn duplicate_alias_rejected_case_insensitively() {
        let registry = CapabilityRegistry::new();
        registry.register(cap("cmd.a").with_command("/Help")).unwrap();
        let err = registry
            .register(cap("cmd.b").with_command("help"))
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_ALIAS");
    }

    #[test]
    fn immutable_descriptor_rejects_update() {
        let registry = CapabilityRegistry::new();
        let mut d = cap("cmd.sealed");
        d.status.mutable = false;
        registry.register(d).unwrap();
        let err = registry
            .update(
                "cmd.sealed",
                DescriptorPatch {
                    description: Some("new".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "MUTABLE_VIOLATION");
    }

    #[test]
    fn update_reindexes_aliases() {
        let registry = CapabilityRegistry::new();
        registry.register(cap("cmd.a").with_command("/old")).unwrap();
        registry
            .update(
                "cmd.a",
                DescriptorPatch {
                    command_aliases: Some(vec!["/new".into()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(registry.resolve_alias("/old").is_none());
        assert_eq!(registry.resolve_alias("/new").as_deref(), Some("cmd.a"));
    }

    #[test]
    fn query_by_kind_and_substrate() {
        let registry = CapabilityRegistry::new();
        registry.register(cap("cmd.a")).unwrap();
        let mut skill = cap("skill.report");
        skill.kind = CapabilityKind::Composite;
        skill.substrate = Substrate::Llm;
        registry.register(skill).unwrap();

        let commands = registry.query(&CapabilityFilter {
            kind: Some(CapabilityKind::Atomic),
            ..Default::default()
        });
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].capability_id, "cmd.a");

        let llm = registry.query(&CapabilityFilter {
            substrate: Some(Substrate::Llm),
            ..Default::default()
        });
        assert_eq!(llm.len(), 1);
    }

    #[test]
    fn trigger_matching_is_lowercased_substring() {
        let registry = CapabilityRegistry::new();
        let mut skill = cap("skill.weather");
        skill.message_triggers = vec!["weather".into(), "forecast".into()];
        registry.register(skill).unwrap();

        let hits = registry.matching_triggers("What's the WEATHER tomorrow?");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "weather");
        assert!(registry.matching_triggers("unrelated").is_empty());
    }

    #[test]
    fn disabled_capability_excluded_from_trigger_matches() {
        let registry = CapabilityRegistry::new();
        let mut skill = cap("skill.weather");
        skill.message_triggers = vec!["weather".into()];
        skill.status.enabled = false;
        registry.register(skill).unwrap();
        assert!(registry.matching_triggers("weather?").is_empty());
    }

    #[test]
    fn hook_cycle_rejected() {
        let registry = CapabilityRegistry::new();
        let mut a = cap("hook.a");
        a.hooks = Hooks {
            pre_invoke: vec!["hook.b".into()],
            ..Default::default()
        };
        registry.register(a).unwrap(); // forward reference, fine

        let mut b = cap("hook.b");
        b.hooks = Hooks {
            pre_invoke: vec!["hook.a".into()],
            ..Default::default()
        };
        let err = registry.register(b).unwrap_err();
        assert_eq!(err.code(), "HOOK_CYCLE");
    }

    #[test]
    fn self_hook_is_a_cycle() {
        let registry = CapabilityRegistry::new();
        let mut a = cap("hook.self");
        a.hooks = Hooks {
            post_invoke: vec!["hook.self".into()],
            ..Default::default()
        };
        assert_eq!(registry.register(a).unwrap_err().code(), "HOOK_CYCLE");
    }

    #[test]
    fn dependency_cycle_rejected() {
        let registry = CapabilityRegistry::new();
        let mut a = cap("dep.a");
        a.dependencies.capabilities = vec!["dep.b".into()];
        registry.register(a).unwrap();
        let mut b = cap("dep.b");
        b.dependencies.capabilities = vec!["dep.a".into()];
        assert_eq!(registry.register(b).unwrap_err().code(), "HOOK_CYCLE");
    }

    #[test]
    fn permission_universe_enforced() {
        let registry =
            CapabilityRegistry::with_permission_universe(&["read", "write", "kstar:*"]);
        registry
            .register(cap("ok").with_permissions(&["read", "kstar:store"]))
            .unwrap();
        let err = registry
            .register(cap("bad").with_permissions(&["launch_missiles"]))
            .unwrap_err();
        assert!(err.to_string().contains("unknown permission"));
    }

    #[test]
    fn unregister_clears_indices() {
        let registry = CapabilityRegistry::new();
        registry.register(cap("cmd.a").with_command("/a")).unwrap();
        registry.unregister("cmd.a").unwrap();
        assert!(registry.resolve_alias("/a").is_none());
        assert!(registry.get("cmd.a").is_none());
        assert_eq!(registry.unregister("cmd.a").unwrap_err().code(), "CAP_NOT_FOUND");
    }
}
