//! Session records and the session store.
//!
//! Sessions are the server-side authority behind refresh tokens: a token is
//! only as valid as the active session it points at. Invalidation is
//! one-way — a session that leaves `Active` can never be reactivated, which
//! is what makes "revoke everything for this user" a reliable containment
//! action after token replay.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use uuid::Uuid;

/// Upper bound on concurrently active sessions per user. Establishing a new
/// session beyond this evicts the oldest active one.
pub const MAX_CONCURRENT_SESSIONS: usize = 5;

/// Lifecycle state of a session. There is no transition back to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Invalidated,
}

/// Server-side session record.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub user_id: String,
    pub tenant_id: Option<String>,
    /// IP the session was established from.
    pub client_ip: IpAddr,
    /// Opaque fingerprint of the establishing user agent, recorded for audit.
    pub user_agent_fingerprint: String,
    pub created_at_millis: u64,
    pub last_accessed_at_millis: u64,
    state: SessionState,
}

impl SessionRecord {
    pub fn new(
        user_id: impl Into<String>,
        tenant_id: Option<String>,
        client_ip: IpAddr,
        user_agent_fingerprint: impl Into<String>,
        now_millis: u64,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id: user_id.into(),
            tenant_id,
            client_ip,
            user_agent_fingerprint: user_agent_fingerprint.into(),
            created_at_millis: now_millis,
            last_accessed_at_millis: now_millis,
            state: SessionState::Active,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

/// Storage interface for session records.
///
/// Implementations must preserve one-way invalidation: once a record reports
/// `Invalidated`, no operation may return it to `Active`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, record: SessionRecord);

    async fn get(&self, session_id: Uuid) -> Option<SessionRecord>;

    /// Update the last-accessed time of an active session. Returns `false`
    /// when the session is absent or no longer active.
    async fn touch(&self, session_id: Uuid, at_millis: u64) -> bool;

    /// Invalidate one session. Idempotent; returns `true` only when the
    /// session was active before this call.
    async fn invalidate(&self, session_id: Uuid) -> bool;

    /// Invalidate every active session belonging to `user_id`. Returns the
    /// number of sessions that were active.
    async fn invalidate_all_for_user(&self, user_id: &str) -> usize;

    /// All currently active sessions for `user_id`.
    async fn active_for_user(&self, user_id: &str) -> Vec<SessionRecord>;
}

/// In-memory [`SessionStore`] for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<Uuid, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, SessionRecord>> {
        self.sessions.lock().expect("session store mutex poisoned")
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, record: SessionRecord) {
        self.lock().insert(record.session_id, record);
    }

    async fn get(&self, session_id: Uuid) -> Option<SessionRecord> {
        self.lock().get(&session_id).cloned()
    }

    async fn touch(&self, session_id: Uuid, at_millis: u64) -> bool {
        let mut map = self.lock();
        match map.get_mut(&session_id) {
            Some(record) if record.is_active() => {
                record.last_accessed_at_millis = at_millis;
                true
            }
            _ => false,
        }
    }

    async fn invalidate(&self, session_id: Uuid) -> bool {
        let mut map = self.lock();
        match map.get_mut(&session_id) {
            Some(record) if record.is_active() => {
                record.state = SessionState::Invalidated;
                true
            }
            _ => false,
        }
    }

    async fn invalidate_all_for_user(&self, user_id: &str) -> usize {
        let mut map = self.lock();
        let mut revoked = 0;
        for record in map.values_mut() {
            if record.user_id == user_id && record.is_active() {
                record.state = SessionState::Invalidated;
                revoked += 1;
            }
        }
        revoked
    }

    async fn active_for_user(&self, user_id: &str) -> Vec<SessionRecord> {
        self.lock()
            .values()
            .filter(|r| r.user_id == user_id && r.is_active())
            .cloned()
            .collect()
    }
}
