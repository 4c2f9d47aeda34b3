//! Per-request identity and classification.

use serde::Serialize;
use std::net::IpAddr;

/// Traffic class a request belongs to for rate-limiting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Authentication,
    ApiUpload,
    ApiSearch,
    AdminOperations,
    TokenRefresh,
    ApiGeneral,
}

impl RequestType {
    /// Lowercase identifier used in store keys and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::ApiUpload => "api_upload",
            Self::ApiSearch => "api_search",
            Self::AdminOperations => "admin_operations",
            Self::TokenRefresh => "token_refresh",
            Self::ApiGeneral => "api_general",
        }
    }

    /// Classify a request path.
    ///
    /// `/api/auth/refresh` is checked before any other pattern: refresh abuse
    /// is a distinct threat class from general authentication traffic, so it
    /// must never fall through to the `Authentication` bucket.
    pub fn classify(path: &str) -> Self {
        if path.starts_with("/api/auth/refresh") {
            return Self::TokenRefresh;
        }
        if path.starts_with("/api/auth") || path.starts_with("/auth") {
            return Self::Authentication;
        }
        if path.starts_with("/api/admin") || path.starts_with("/admin") {
            return Self::AdminOperations;
        }
        if path.starts_with("/api/upload") || path.starts_with("/api/documents/upload") {
            return Self::ApiUpload;
        }
        if path.starts_with("/api/search") || path.starts_with("/api/query") {
            return Self::ApiSearch;
        }
        Self::ApiGeneral
    }
}

/// Paths that bypass the limiter entirely and are never counted.
pub fn is_exempt(path: &str) -> bool {
    matches!(path, "/health" | "/ready" | "/metrics" | "/favicon.ico")
        || path.starts_with("/static/")
}

/// Immutable per-request value carrying everything the limiter needs.
///
/// Built once per request from upstream middleware (IP extraction and auth
/// happen before this layer) and never mutated.
#[derive(Debug, Clone)]
pub struct RateLimitContext {
    pub client_ip: IpAddr,
    /// Authenticated user, when upstream auth resolved one.
    pub user_id: Option<String>,
    /// Tenant the request is attributed to, when known.
    pub tenant_id: Option<String>,
    /// Normalized path prefix used for the endpoint scope.
    pub endpoint: String,
    pub full_path: String,
    pub request_type: RequestType,
}

impl RateLimitContext {
    /// Build a context for `path`, classifying it and deriving the endpoint
    /// scope key from its leading segments.
    pub fn new(client_ip: IpAddr, path: &str) -> Self {
        Self {
            client_ip,
            user_id: None,
            tenant_id: None,
            endpoint: normalize_endpoint(path),
            full_path: path.to_string(),
            request_type: RequestType::classify(path),
        }
    }

    /// Attach the authenticated user id.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach the tenant id.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Whether this request bypasses admission control entirely.
    pub fn is_exempt(&self) -> bool {
        is_exempt(&self.full_path)
    }
}

/// Collapse a path to a stable prefix so per-endpoint counters are not
/// fragmented by resource ids (`/api/documents/123` and `/api/documents/456`
/// share one counter). Takes up to three leading segments, stopping at the
/// first id-like segment.
fn normalize_endpoint(path: &str) -> String {
    let trimmed = path.split('?').next().unwrap_or(path);
    let mut out = String::new();
    for segment in trimmed.split('/').filter(|s| !s.is_empty()).take(3) {
        if looks_like_id(segment) {
            break;
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

fn looks_like_id(segment: &str) -> bool {
    segment.chars().all(|c| c.is_ascii_digit())
        || (segment.len() >= 16
            && segment.chars().all(|c| c.is_ascii_hexdigit() || c == '-'))
}
