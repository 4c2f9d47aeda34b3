//! Token refresh authority.
//!
//! [`TokenAuthority`] owns the full refresh protocol: verify the presented
//! token, consume its id atomically (replay detection), validate the backing
//! session, enforce per-user and per-IP hourly attempt limits, and only then
//! rotate the pair. The checks run in that exact order so a replayed token is
//! caught and contained before anything else is revealed about the session.

use crate::audit::{AuditEvent, AuditKind, AuditSink, SecurityIncident, TracingAuditSink};
use crate::clock::{Clock, MonotonicClock};
use crate::error::RefreshError;
use crate::session::{SessionRecord, SessionStore, MAX_CONCURRENT_SESSIONS};
use crate::store::CounterStore;
use crate::token::{TokenClaims, TokenCodec, TokenError, TokenKind, TokenPair, UnsignedCodec};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const HOUR: Duration = Duration::from_secs(3600);

/// Lifetimes and limits of the refresh protocol.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    /// Idle timeout: a session untouched for this long is invalidated on the
    /// next refresh attempt.
    pub session_idle_timeout: Duration,
    /// Per-user rolling hourly refresh-attempt cap. The per-IP cap is twice
    /// this, so shared NATs do not starve before a single abusive user does.
    pub max_refresh_attempts_per_hour: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            access_ttl: Duration::from_secs(3600),
            refresh_ttl: Duration::from_secs(30 * 24 * 3600),
            session_idle_timeout: Duration::from_secs(24 * 3600),
            max_refresh_attempts_per_hour: 10,
        }
    }
}

/// One refresh attempt as received from the transport layer.
#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
    pub client_ip: IpAddr,
    pub request_id: String,
}

/// Session and token issuing authority.
pub struct TokenAuthority<S, Sess> {
    store: Arc<S>,
    sessions: Arc<Sess>,
    codec: Arc<dyn TokenCodec>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: RefreshConfig,
}

impl<S, Sess> TokenAuthority<S, Sess>
where
    S: CounterStore,
    Sess: SessionStore,
{
    pub fn new(store: Arc<S>, sessions: Arc<Sess>) -> Self {
        Self {
            store,
            sessions,
            codec: Arc::new(UnsignedCodec),
            audit: Arc::new(TracingAuditSink),
            clock: Arc::new(MonotonicClock::default()),
            config: RefreshConfig::default(),
        }
    }

    pub fn with_codec<C: TokenCodec + 'static>(mut self, codec: C) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_audit<A: AuditSink + 'static>(mut self, audit: Arc<A>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_config(mut self, config: RefreshConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Create a session for an authenticated user and issue its first token
    /// pair.
    ///
    /// At most [`MAX_CONCURRENT_SESSIONS`] sessions may be active per user;
    /// the oldest active ones are evicted to make room.
    pub async fn establish_session(
        &self,
        user_id: &str,
        tenant_id: Option<String>,
        client_ip: IpAddr,
        user_agent_fingerprint: &str,
        request_id: &str,
    ) -> (SessionRecord, TokenPair) {
        let now = self.clock.now_millis();

        let mut active = self.sessions.active_for_user(user_id).await;
        if active.len() >= MAX_CONCURRENT_SESSIONS {
            active.sort_by_key(|r| r.created_at_millis);
            let excess = active.len() + 1 - MAX_CONCURRENT_SESSIONS;
            for victim in active.iter().take(excess) {
                self.sessions.invalidate(victim.session_id).await;
                self.audit.security_event(AuditEvent {
                    timestamp_millis: now,
                    kind: AuditKind::SessionEvicted,
                    request_id: request_id.to_string(),
                    client_ip,
                    user_id: Some(user_id.to_string()),
                    session_id: Some(victim.session_id),
                    detail: "concurrent session limit reached".into(),
                    success: true,
                });
                tracing::info!(
                    user_id,
                    session_id = %victim.session_id,
                    "evicted oldest session at concurrency cap"
                );
            }
        }

        let record =
            SessionRecord::new(user_id, tenant_id, client_ip, user_agent_fingerprint, now);
        self.sessions.insert(record.clone()).await;

        let pair = self.issue_pair(&record, now);
        self.audit.security_event(AuditEvent {
            timestamp_millis: now,
            kind: AuditKind::SessionCreated,
            request_id: request_id.to_string(),
            client_ip,
            user_id: Some(user_id.to_string()),
            session_id: Some(record.session_id),
            detail: String::new(),
            success: true,
        });
        (record, pair)
    }

    /// Execute the refresh protocol for one request.
    ///
    /// Checks run strictly in order: token verification, atomic single-use
    /// consumption, session validation, hourly attempt limits, rotation.
    /// Every rejection is audited; replay additionally revokes all of the
    /// user's sessions and raises a security incident.
    pub async fn refresh(&self, request: &RefreshRequest) -> Result<TokenPair, RefreshError> {
        let now = self.clock.now_millis();

        // 1. Verify the presented token.
        let claims = match self.verify_refresh_token(request, now) {
            Ok(claims) => claims,
            Err(e) => {
                self.audit_rejection(request, None, None, &e, now);
                return Err(e);
            }
        };

        // 2. Consume the token id. First caller wins; anyone else holds a
        // replayed token.
        let marker = format!("used_token:{}", claims.token_id);
        let fresh = match self.store.set_if_absent(&marker, self.config.refresh_ttl).await {
            Ok(fresh) => fresh,
            Err(e) => {
                let err = RefreshError::from(e);
                self.audit_rejection(
                    request,
                    Some(&claims.user_id),
                    Some(claims.session_id),
                    &err,
                    now,
                );
                return Err(err);
            }
        };
        if !fresh {
            return Err(self.contain_replay(request, &claims, now).await);
        }

        // 3. Validate the backing session.
        if let Err(e) = self.validate_session(&claims, now).await {
            self.audit_rejection(request, Some(&claims.user_id), Some(claims.session_id), &e, now);
            return Err(e);
        }

        // 4. Hourly attempt limits. Counted only for structurally valid
        // attempts, so unauthenticated junk cannot consume a user's budget.
        if let Err(e) = self.check_attempt_limits(&claims.user_id, request.client_ip).await {
            self.audit_rejection(request, Some(&claims.user_id), Some(claims.session_id), &e, now);
            return Err(e);
        }

        // 5. Rotate. A logout can land between validation and here, so the
        // touch doubles as a final liveness check.
        let session = self.sessions.get(claims.session_id).await;
        let touched = self.sessions.touch(claims.session_id, now).await;
        let pair = match session {
            Some(ref s) if touched => self.issue_pair(s, now),
            _ => {
                let err = RefreshError::InvalidSession;
                self.audit_rejection(
                    request,
                    Some(&claims.user_id),
                    Some(claims.session_id),
                    &err,
                    now,
                );
                return Err(err);
            }
        };

        self.audit.security_event(AuditEvent {
            timestamp_millis: now,
            kind: AuditKind::RefreshAccepted,
            request_id: request.request_id.clone(),
            client_ip: request.client_ip,
            user_id: Some(claims.user_id.clone()),
            session_id: Some(claims.session_id),
            detail: String::new(),
            success: true,
        });
        tracing::debug!(user_id = %claims.user_id, session_id = %claims.session_id, "token pair rotated");
        Ok(pair)
    }

    /// Invalidate one session. Idempotent: logging out an already
    /// invalidated session succeeds without effect.
    pub async fn logout(&self, session_id: Uuid, client_ip: IpAddr, request_id: &str) {
        let now = self.clock.now_millis();
        let user_id = self.sessions.get(session_id).await.map(|r| r.user_id);
        let was_active = self.sessions.invalidate(session_id).await;
        self.audit.security_event(AuditEvent {
            timestamp_millis: now,
            kind: AuditKind::Logout,
            request_id: request_id.to_string(),
            client_ip,
            user_id,
            session_id: Some(session_id),
            detail: if was_active { String::new() } else { "already inactive".into() },
            success: true,
        });
    }

    /// Invalidate every active session of a user. Returns how many were
    /// revoked.
    pub async fn logout_all(&self, user_id: &str, client_ip: IpAddr, request_id: &str) -> usize {
        let now = self.clock.now_millis();
        let revoked = self.sessions.invalidate_all_for_user(user_id).await;
        self.audit.security_event(AuditEvent {
            timestamp_millis: now,
            kind: AuditKind::Logout,
            request_id: request_id.to_string(),
            client_ip,
            user_id: Some(user_id.to_string()),
            session_id: None,
            detail: format!("revoked {revoked} sessions"),
            success: true,
        });
        revoked
    }

    fn verify_refresh_token(
        &self,
        request: &RefreshRequest,
        now: u64,
    ) -> Result<TokenClaims, RefreshError> {
        let token = request
            .refresh_token
            .as_deref()
            .ok_or(RefreshError::MissingRefreshToken)?;
        let claims = self.codec.verify(token, now).map_err(|e| match e {
            TokenError::Malformed => RefreshError::MalformedRefreshToken,
            TokenError::Expired => RefreshError::RefreshTokenExpired,
        })?;
        if claims.kind != TokenKind::Refresh {
            return Err(RefreshError::MalformedRefreshToken);
        }
        Ok(claims)
    }

    async fn validate_session(&self, claims: &TokenClaims, now: u64) -> Result<(), RefreshError> {
        let session = self
            .sessions
            .get(claims.session_id)
            .await
            .ok_or(RefreshError::InvalidSession)?;
        if !session.is_active() || session.user_id != claims.user_id {
            return Err(RefreshError::InvalidSession);
        }
        let idle = now.saturating_sub(session.last_accessed_at_millis);
        if idle > self.config.session_idle_timeout.as_millis() as u64 {
            // Lazy invalidation: the timeout is enforced at use time.
            self.sessions.invalidate(claims.session_id).await;
            return Err(RefreshError::InvalidSession);
        }
        Ok(())
    }

    async fn check_attempt_limits(
        &self,
        user_id: &str,
        client_ip: IpAddr,
    ) -> Result<(), RefreshError> {
        let max_user = self.config.max_refresh_attempts_per_hour;
        let user_key = format!("refresh_attempts:user:{user_id}");
        let ip_key = format!("refresh_attempts:ip:{client_ip}");
        // Both counters advance on every attempt, admitted or not.
        let user_count = self.store.incr_with_ttl(&user_key, HOUR).await?;
        let ip_count = self.store.incr_with_ttl(&ip_key, HOUR).await?;
        if user_count.count > max_user || ip_count.count > max_user * 2 {
            return Err(RefreshError::RateLimitExceeded);
        }
        Ok(())
    }

    /// Replay containment: revoke every session of the token's user and
    /// raise a security incident.
    async fn contain_replay(
        &self,
        request: &RefreshRequest,
        claims: &TokenClaims,
        now: u64,
    ) -> RefreshError {
        let revoked = self.sessions.invalidate_all_for_user(&claims.user_id).await;
        tracing::error!(
            user_id = %claims.user_id,
            token_id = %claims.token_id,
            sessions_revoked = revoked,
            client_ip = %request.client_ip,
            "refresh token replay detected"
        );
        self.audit.security_incident(SecurityIncident {
            timestamp_millis: now,
            request_id: request.request_id.clone(),
            client_ip: request.client_ip,
            user_id: claims.user_id.clone(),
            description: format!("refresh token {} presented after consumption", claims.token_id),
            sessions_revoked: revoked,
        });
        let err = RefreshError::SecurityViolation;
        self.audit_rejection(request, Some(&claims.user_id), Some(claims.session_id), &err, now);
        err
    }

    fn audit_rejection(
        &self,
        request: &RefreshRequest,
        user_id: Option<&str>,
        session_id: Option<Uuid>,
        error: &RefreshError,
        now: u64,
    ) {
        let kind = if error.is_security_violation() {
            AuditKind::SecurityViolation
        } else {
            AuditKind::RefreshRejected
        };
        self.audit.security_event(AuditEvent {
            timestamp_millis: now,
            kind,
            request_id: request.request_id.clone(),
            client_ip: request.client_ip,
            user_id: user_id.map(str::to_string),
            session_id,
            detail: error.code().to_string(),
            success: false,
        });
        tracing::warn!(
            request_id = %request.request_id,
            client_ip = %request.client_ip,
            code = error.code(),
            "refresh attempt rejected"
        );
    }

    fn issue_pair(&self, session: &SessionRecord, now: u64) -> TokenPair {
        let access = TokenClaims {
            token_id: Uuid::new_v4(),
            session_id: session.session_id,
            user_id: session.user_id.clone(),
            tenant_id: session.tenant_id.clone(),
            kind: TokenKind::Access,
            expires_at_millis: now + self.config.access_ttl.as_millis() as u64,
        };
        let refresh = TokenClaims {
            token_id: Uuid::new_v4(),
            session_id: session.session_id,
            user_id: session.user_id.clone(),
            tenant_id: session.tenant_id.clone(),
            kind: TokenKind::Refresh,
            expires_at_millis: now + self.config.refresh_ttl.as_millis() as u64,
        };
        TokenPair::new(
            self.codec.issue(&access),
            self.codec.issue(&refresh),
            self.config.access_ttl,
        )
    }
}
