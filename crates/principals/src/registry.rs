//! Persistent principal registry.
//!
//! Principals and credential bindings live in two JSON files under
//! `ltm/principals/`. The registry seeds SYSTEM, ANONYMOUS, and a local
//! admin (with a wildcard `local:*` CLI binding) the first time it starts
//! against an empty store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;

use p3394_domain::error::{Error, Result};
use p3394_domain::principal::{
    principal_urn, BindingType, CredentialBinding, Principal, PrincipalType,
};

pub const SYSTEM_URN: &str = "urn:principal:org:local:role:system:person:agent";
pub const ANONYMOUS_URN: &str = "urn:principal:org:local:role:anonymous:person:unknown";
pub const LOCAL_ADMIN_URN: &str = "urn:principal:org:local:role:admin:person:owner";

struct Inner {
    principals: HashMap<String, Principal>,
    bindings: Vec<CredentialBinding>,
}

pub struct PrincipalRegistry {
    principals_path: PathBuf,
    bindings_path: PathBuf,
    inner: RwLock<Inner>,
}

impl PrincipalRegistry {
    /// Load or create the registry under `{storage}/ltm/principals/`.
    pub fn new(storage_root: &Path) -> Result<Self> {
        let dir = storage_root.join("ltm").join("principals");
        std::fs::create_dir_all(&dir)?;

        let principals_path = dir.join("principals.json");
        let bindings_path = dir.join("credential_bindings.json");

        let principals: HashMap<String, Principal> = if principals_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&principals_path)?)?
        } else {
            HashMap::new()
        };
        let bindings: Vec<CredentialBinding> = if bindings_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&bindings_path)?)?
        } else {
            Vec::new()
        };

        let registry = Self {
            principals_path,
            bindings_path,
            inner: RwLock::new(Inner {
                principals,
                bindings,
            }),
        };

        if registry.inner.read().principals.is_empty() {
            registry.seed()?;
        }

        tracing::info!(
            principals = registry.inner.read().principals.len(),
            bindings = registry.inner.read().bindings.len(),
            "principal registry loaded"
        );
        Ok(registry)
    }

    /// First-start seeding: SYSTEM, ANONYMOUS, local admin + wildcard CLI
    /// binding.
    fn seed(&self) -> Result<()> {
        tracing::info!("empty principal store — seeding builtin principals");
        {
            let mut inner = self.inner.write();
            for p in [
                Principal::new(SYSTEM_URN, "System", PrincipalType::System),
                Principal::new(ANONYMOUS_URN, "Anonymous", PrincipalType::Anonymous),
                Principal::new(LOCAL_ADMIN_URN, "Local Admin", PrincipalType::Human),
            ] {
                inner.principals.insert(p.urn.clone(), p);
            }
            inner.bindings.push(CredentialBinding {
                binding_id: uuid::Uuid::new_v4().to_string(),
                channel_id: "cli".into(),
                external_subject: "local:*".into(),
                principal_urn: LOCAL_ADMIN_URN.into(),
                binding_type: BindingType::Local,
                scopes: vec!["*".into()],
                registered_at: Utc::now(),
                revoked: false,
            });
        }
        self.flush()
    }

    pub fn register_principal(&self, principal: Principal) -> Result<()> {
        {
            let mut inner = self.inner.write();
            inner.principals.insert(principal.urn.clone(), principal);
        }
        self.flush()
    }

    pub fn register_binding(&self, binding: CredentialBinding) -> Result<()> {
        {
            let inner = self.inner.read();
            if !inner.principals.contains_key(&binding.principal_urn) {
                return Err(Error::Config(format!(
                    "binding references unknown principal {}",
                    binding.principal_urn
                )));
            }
        }
        self.inner.write().bindings.push(binding);
        self.flush()
    }

    /// Most-specific match wins: exact subjects beat wildcards; among
    /// equally specific matches the most recently registered wins.
    pub fn resolve_channel_identity(
        &self,
        channel_id: &str,
        channel_identity: &str,
    ) -> Option<(Principal, CredentialBinding)> {
        let inner = self.inner.read();
        let best = inner
            .bindings
            .iter()
            .filter(|b| b.channel_id == channel_id && b.matches(channel_identity))
            .max_by_key(|b| (b.is_exact(), b.registered_at))?;
        let principal = inner.principals.get(&best.principal_urn)?.clone();
        Some((principal, best.clone()))
    }

    /// Like [`resolve_channel_identity`] but degrades to ANONYMOUS with
    /// empty scopes instead of failing.
    ///
    /// [`resolve_channel_identity`]: Self::resolve_channel_identity
    pub fn resolve_or_anonymous(
        &self,
        channel_id: &str,
        channel_identity: &str,
    ) -> (Principal, Vec<String>) {
        match self.resolve_channel_identity(channel_id, channel_identity) {
            Some((principal, binding)) => (principal, binding.scopes),
            None => (self.anonymous(), Vec::new()),
        }
    }

    pub fn get(&self, urn: &str) -> Option<Principal> {
        self.inner.read().principals.get(urn).cloned()
    }

    pub fn system(&self) -> Principal {
        self.get(SYSTEM_URN)
            .unwrap_or_else(|| Principal::new(SYSTEM_URN, "System", PrincipalType::System))
    }

    pub fn anonymous(&self) -> Principal {
        self.get(ANONYMOUS_URN)
            .unwrap_or_else(|| Principal::new(ANONYMOUS_URN, "Anonymous", PrincipalType::Anonymous))
    }

    pub fn list_principals(&self) -> Vec<Principal> {
        let mut list: Vec<_> = self.inner.read().principals.values().cloned().collect();
        list.sort_by(|a, b| a.urn.cmp(&b.urn));
        list
    }

    pub fn list_bindings(&self) -> Vec<CredentialBinding> {
        self.inner.read().bindings.clone()
    }

    pub fn revoke_binding(&self, binding_id: &str) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let binding = inner
                .bindings
                .iter_mut()
                .find(|b| b.binding_id == binding_id)
                .ok_or_else(|| Error::Config(format!("no such binding: {binding_id}")))?;
            binding.revoked = true;
        }
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        let inner = self.inner.read();
        std::fs::write(
            &self.principals_path,
            serde_json::to_string_pretty(&inner.principals)?,
        )?;
        std::fs::write(
            &self.bindings_path,
            serde_json::to_string_pretty(&inner.bindings)?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (tempfile::TempDir, PrincipalRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = PrincipalRegistry::new(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn seeds_builtins_on_first_start() {
        let (_dir, registry) = fresh();
        assert!(registry.get(SYSTEM_URN).is_some());
        assert!(registry.get(ANONYMOUS_URN).is_some());
        assert!(registry.get(LOCAL_ADMIN_URN).is_some());

        let (principal, binding) = registry
            .resolve_channel_identity("cli", "local:alice")
            .unwrap();
        assert_eq!(principal.urn, LOCAL_ADMIN_URN);
        assert_eq!(binding.scopes, vec!["*".to_string()]);
    }

    #[test]
    fn does_not_reseed_existing_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = PrincipalRegistry::new(dir.path()).unwrap();
            registry
                .register_principal(Principal::new(
                    principal_urn("acme", "user", "bob"),
                    "Bob",
                    PrincipalType::Human,
                ))
                .unwrap();
        }
        let registry = PrincipalRegistry::new(dir.path()).unwrap();
        assert_eq!(registry.list_principals().len(), 4);
    }

    #[test]
    fn exact_binding_beats_wildcard() {
        let (_dir, registry) = fresh();
        let bob_urn = principal_urn("local", "user", "bob");
        registry
            .register_principal(Principal::new(&bob_urn, "Bob", PrincipalType::Human))
            .unwrap();
        registry
            .register_binding(CredentialBinding {
                binding_id: "b-exact".into(),
                channel_id: "cli".into(),
                external_subject: "local:bob".into(),
                principal_urn: bob_urn.clone(),
                binding_type: BindingType::Local,
                scopes: vec!["read".into()],
                registered_at: Utc::now(),
                revoked: false,
            })
            .unwrap();

        // The seeded wildcard local:* also matches, but exact wins.
        let (principal, _) = registry
            .resolve_channel_identity("cli", "local:bob")
            .unwrap();
        assert_eq!(principal.urn, bob_urn);
    }

    #[test]
    fn most_recent_wins_among_equally_specific() {
        let (_dir, registry) = fresh();
        let old_urn = principal_urn("local", "user", "old");
        let new_urn = principal_urn("local", "user", "new");
        for urn in [&old_urn, &new_urn] {
            registry
                .register_principal(Principal::new(urn, "p", PrincipalType::Human))
                .unwrap();
        }
        let mut early = CredentialBinding {
            binding_id: "b-old".into(),
            channel_id: "api".into(),
            external_subject: "api_key:sk-1".into(),
            principal_urn: old_urn,
            binding_type: BindingType::ApiKey,
            scopes: vec![],
            registered_at: Utc::now() - chrono::Duration::hours(1),
            revoked: false,
        };
        registry.register_binding(early.clone()).unwrap();
        early.binding_id = "b-new".into();
        early.principal_urn = new_urn.clone();
        early.registered_at = Utc::now();
        registry.register_binding(early).unwrap();

        let (principal, binding) = registry
            .resolve_channel_identity("api", "api_key:sk-1")
            .unwrap();
        assert_eq!(principal.urn, new_urn);
        assert_eq!(binding.binding_id, "b-new");
    }

    #[test]
    fn unmatched_resolution_degrades_to_anonymous() {
        let (_dir, registry) = fresh();
        let (principal, scopes) = registry.resolve_or_anonymous("sms", "phone:+1555");
        assert_eq!(principal.principal_type, PrincipalType::Anonymous);
        assert!(scopes.is_empty());
    }

    #[test]
    fn revoked_binding_no_longer_resolves() {
        let (_dir, registry) = fresh();
        let binding_id = registry.list_bindings()[0].binding_id.clone();
        registry.revoke_binding(&binding_id).unwrap();
        assert!(registry
            .resolve_channel_identity("cli", "local:alice")
            .is_none());
    }

    #[test]
    fn binding_requires_known_principal() {
        let (_dir, registry) = fresh();
        let err = registry
            .register_binding(CredentialBinding {
                binding_id: "b1".into(),
                channel_id: "cli".into(),
                external_subject: "local:ghost".into(),
                principal_urn: "urn:principal:org:x:role:y:person:ghost".into(),
                binding_type: BindingType::Local,
                scopes: vec![],
                registered_at: Utc::now(),
                revoked: false,
            })
            .unwrap_err();
        assert!(err.to_string().contains("unknown principal"));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let urn = principal_urn("acme", "user", "carol");
        {
            let registry = PrincipalRegistry::new(dir.path()).unwrap();
            registry
                .register_principal(Principal::new(&urn, "Carol", PrincipalType::Human))
                .unwrap();
            registry
                .register_binding(CredentialBinding {
                    binding_id: "b-carol".into(),
                    channel_id: "sms".into(),
                    external_subject: "phone:+15550001111".into(),
                    principal_urn: urn.clone(),
                    binding_type: BindingType::Phone,
                    scopes: vec!["read".into(), "write".into()],
                    registered_at: Utc::now(),
                    revoked: false,
                })
                .unwrap();
        }
        let registry = PrincipalRegistry::new(dir.path()).unwrap();
        let (principal, binding) = registry
            .resolve_channel_identity("sms", "phone:+15550001111")
            .unwrap();
        assert_eq!(principal.urn, urn);
        assert_eq!(binding.scopes.len(), 2);
    }
}
