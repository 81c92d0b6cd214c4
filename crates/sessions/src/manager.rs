//! Session lifecycle and per-session working directories.
//!
//! Creating a session materializes `stm/{id}/shared/{workspace,artifacts,
//! temp,tools}/` under the storage root and writes a `context.json`
//! descriptor. Sessions expire after a TTL measured from last activity; an
//! expired session leaves the live map but its on-disk state is retained
//! for external cleanup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use p3394_domain::error::Result;
use p3394_domain::principal::AssuranceLevel;
use p3394_domain::trace::TraceEvent;

pub const SHARED_SUBDIRS: [&str; 4] = ["workspace", "artifacts", "temp", "tools"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub client_principal: String,
    pub service_principal: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub assurance: AssuranceLevel,
    pub channel_id: String,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return true;
            }
        }
        now - self.last_activity >= ttl
    }

    /// The shell-substrate working directory for this session.
    pub fn workspace_dir(&self) -> PathBuf {
        self.working_dir.join("workspace")
    }
}

/// Creation parameters; everything is optional.
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub client_id: Option<String>,
    pub channel_id: Option<String>,
    /// Absolute expiry override; the idle TTL still applies.
    pub ttl: Option<Duration>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionManager {
    storage_root: PathBuf,
    ttl: Duration,
    service_principal: String,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(storage_root: &Path, ttl_hours: u64, service_principal: impl Into<String>) -> Self {
        Self {
            storage_root: storage_root.to_path_buf(),
            ttl: Duration::hours(ttl_hours as i64),
            service_principal: service_principal.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a session: id, shared subdirectories, context descriptor.
    /// Directory creation is idempotent.
    pub fn create_session(&self, params: CreateSession) -> Result<Session> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let shared = self
            .storage_root
            .join("stm")
            .join(&session_id)
            .join("shared");
        for sub in SHARED_SUBDIRS {
            std::fs::create_dir_all(shared.join(sub))?;
        }

        let now = Utc::now();
        let channel_id = params.channel_id.unwrap_or_default();
        let session = Session {
            session_id: session_id.clone(),
            client_id: params.client_id,
            client_principal: String::new(),
            service_principal: self.service_principal.clone(),
            created_at: now,
            last_activity: now,
            expires_at: params.ttl.map(|ttl| now + ttl),
            authenticated: false,
            permissions: Vec::new(),
            assurance: AssuranceLevel::None,
            channel_id: channel_id.clone(),
            working_dir: shared,
            metadata: Map::new(),
        };

        self.write_context(&session)?;
        self.sessions
            .write()
            .insert(session_id.clone(), session.clone());

        TraceEvent::SessionCreated {
            session_id,
            channel_id,
        }
        .emit();
        Ok(session)
    }

    /// A live (non-expired) session. An expired session is evicted from the
    /// live map here; its directories stay on disk.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let now = Utc::now();
        {
            let sessions = self.sessions.read();
            match sessions.get(session_id) {
                Some(s) if !s.is_expired(now, self.ttl) => return Some(s.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: evict under the write lock.
        if let Some(s) = self.sessions.write().remove(session_id) {
            TraceEvent::SessionExpired {
                session_id: s.session_id,
                idle_secs: (now - s.last_activity).num_seconds(),
            }
            .emit();
        }
        None
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(s) = self.sessions.write().get_mut(session_id) {
            s.last_activity = Utc::now();
        }
    }

    /// Bind the resolved principal, assurance, and granted scopes after
    /// authentication.
    pub fn bind_principal(
        &self,
        session_id: &str,
        principal_urn: &str,
        assurance: AssuranceLevel,
        permissions: Vec<String>,
        authenticated: bool,
    ) -> Option<Session> {
        let mut sessions = self.sessions.write();
        let s = sessions.get_mut(session_id)?;
        s.client_principal = principal_urn.to_owned();
        s.assurance = assurance;
        s.permissions = permissions;
        s.authenticated = authenticated;
        Some(s.clone())
    }

    /// Merge a key into the session's metadata map.
    pub fn set_metadata(&self, session_id: &str, key: &str, value: Value) {
        if let Some(s) = self.sessions.write().get_mut(session_id) {
            s.metadata.insert(key.to_owned(), value);
        }
    }

    /// Remove from the live map; on-disk state is retained.
    pub fn end(&self, session_id: &str) -> Option<Session> {
        self.sessions.write().remove(session_id)
    }

    /// Sweep expired sessions out of the live map. Returns how many left.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| {
            let expired = s.is_expired(now, self.ttl);
            if expired {
                TraceEvent::SessionExpired {
                    session_id: s.session_id.clone(),
                    idle_secs: (now - s.last_activity).num_seconds(),
                }
                .emit();
            }
            !expired
        });
        before - sessions.len()
    }

    pub fn live_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    /// The per-session STM directory (`stm/{id}`), where trace and xAPI
    /// logs live alongside `shared/`.
    pub fn stm_dir(&self, session_id: &str) -> PathBuf {
        self.storage_root.join("stm").join(session_id)
    }

    fn write_context(&self, session: &Session) -> Result<()> {
        let path = self.stm_dir(&session.session_id).join("context.json");
        std::fs::write(path, serde_json::to_string_pretty(session)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> SessionManager {
        SessionManager::new(dir, 24, "urn:principal:org:local:role:system:person:agent")
    }

    #[test]
    fn create_materializes_shared_dirs_and_context() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let session = mgr.create_session(CreateSession::default()).unwrap();

        for sub in SHARED_SUBDIRS {
            assert!(session.working_dir.join(sub).is_dir(), "missing {sub}");
        }
        let context = dir
            .path()
            .join("stm")
            .join(&session.session_id)
            .join("context.json");
        assert!(context.is_file());
        let parsed: Session =
            serde_json::from_str(&std::fs::read_to_string(context).unwrap()).unwrap();
        assert_eq!(parsed.session_id, session.session_id);
    }

    #[test]
    fn get_touch_end() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let session = mgr.create_session(CreateSession {
            channel_id: Some("terminal".into()),
            ..Default::default()
        })
        .unwrap();

        let before = mgr.get(&session.session_id).unwrap().last_activity;
        mgr.touch(&session.session_id);
        let after = mgr.get(&session.session_id).unwrap().last_activity;
        assert!(after >= before);

        mgr.end(&session.session_id);
        assert!(mgr.get(&session.session_id).is_none());
        // On-disk state retained after end.
        assert!(session.working_dir.is_dir());
    }

    #[test]
    fn expired_session_is_evicted_but_disk_retained() {
        let dir = tempfile::tempdir().unwrap();
        // Zero-hour TTL: every session is expired immediately.
        let mgr = SessionManager::new(dir.path(), 0, "urn:x");
        let session = mgr.create_session(CreateSession::default()).unwrap();
        assert!(mgr.get(&session.session_id).is_none());
        assert_eq!(mgr.live_count(), 0);
        assert!(session.working_dir.is_dir());
    }

    #[test]
    fn cleanup_expired_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path(), 0, "urn:x");
        mgr.create_session(CreateSession::default()).unwrap();
        mgr.create_session(CreateSession::default()).unwrap();
        assert_eq!(mgr.cleanup_expired(), 2);
        assert_eq!(mgr.live_count(), 0);
    }

    #[test]
    fn bind_principal_updates_grants() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let session = mgr.create_session(CreateSession::default()).unwrap();
        let bound = mgr
            .bind_principal(
                &session.session_id,
                "urn:principal:org:local:role:admin:person:owner",
                AssuranceLevel::High,
                vec!["*".into()],
                true,
            )
            .unwrap();
        assert!(bound.authenticated);
        assert_eq!(bound.assurance, AssuranceLevel::High);
        assert_eq!(bound.permissions, vec!["*".to_string()]);
    }

    #[test]
    fn directory_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let a = mgr.create_session(CreateSession::default()).unwrap();
        // Creating more sessions never disturbs existing ones.
        let b = mgr.create_session(CreateSession::default()).unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert!(a.working_dir.join("workspace").is_dir());
        assert!(b.working_dir.join("tools").is_dir());
    }
}
