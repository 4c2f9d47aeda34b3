//! Security audit events.
//!
//! Refresh rejections and limiter violations feed an [`AuditSink`] so they
//! end up somewhere durable. The default sink writes structured tracing
//! events under the `portcullis::audit` target; tests use [`MemoryAuditSink`]
//! to assert on what was recorded.

use serde::Serialize;
use std::net::IpAddr;
use std::sync::Mutex;
use uuid::Uuid;

/// Event taxonomy. Serialized codes are stable and consumed by SIEM rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    SessionCreated,
    SessionEvicted,
    Logout,
    RefreshAccepted,
    RefreshRejected,
    RateLimitViolation,
    SecurityViolation,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub timestamp_millis: u64,
    pub kind: AuditKind,
    pub request_id: String,
    pub client_ip: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// Machine-readable detail, e.g. a rejection code or blocked scope.
    pub detail: String,
    pub success: bool,
}

/// Raised when token replay is detected; carries the containment outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityIncident {
    pub timestamp_millis: u64,
    pub request_id: String,
    pub client_ip: IpAddr,
    pub user_id: String,
    pub description: String,
    /// Sessions revoked as part of containment.
    pub sessions_revoked: usize,
}

/// Destination for audit records.
///
/// Sinks must be non-blocking; the refresh path calls them inline.
pub trait AuditSink: Send + Sync {
    fn security_event(&self, event: AuditEvent);

    fn security_incident(&self, incident: SecurityIncident);
}

/// Default sink: structured tracing events under `portcullis::audit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn security_event(&self, event: AuditEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        if event.success {
            tracing::info!(target: "portcullis::audit", %payload, "audit event");
        } else {
            tracing::warn!(target: "portcullis::audit", %payload, "audit event");
        }
    }

    fn security_incident(&self, incident: SecurityIncident) {
        let payload = serde_json::to_string(&incident).unwrap_or_default();
        tracing::error!(target: "portcullis::audit", %payload, "security incident");
    }
}

/// Collecting sink for test assertions.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    incidents: Mutex<Vec<SecurityIncident>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit sink mutex poisoned").clone()
    }

    pub fn incidents(&self) -> Vec<SecurityIncident> {
        self.incidents.lock().expect("audit sink mutex poisoned").clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn security_event(&self, event: AuditEvent) {
        self.events.lock().expect("audit sink mutex poisoned").push(event);
    }

    fn security_incident(&self, incident: SecurityIncident) {
        self.incidents.lock().expect("audit sink mutex poisoned").push(incident);
    }
}
