//! Access Guard: caller authentication, role enforcement, identifier
//! validation and path sandboxing.
//!
//! Every decision this module takes, grant or deny, lands in the security
//! audit log together with its reason.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use crate::audit::{record_or_log, AuditSink, SecurityEventType, SecurityLogEntry};
use crate::error::{AuthError, Result, ValidationError};

/// Roles known to the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Staff,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Staff => "staff",
            Role::Client => "client",
        }
    }
}

/// A verified caller identity.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
    pub role: Role,
}

/// Transport-level request attributes carried into audit records.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// External identity collaborator: resolves a bearer token to an identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` means the token is unknown or expired.
    async fn verify(&self, token: &str) -> Result<Option<Identity>>;
}

/// Identity provider backed by a fixed token table. Suitable for tests and
/// local setups; production deployments wire the real identity service.
#[derive(Default)]
pub struct StaticTokenProvider {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenProvider {
    async fn verify(&self, token: &str) -> Result<Option<Identity>> {
        Ok(self.tokens.get(token).cloned())
    }
}

/// The guard itself. Construction compiles the case-id pattern once; the
/// guard is then shared read-only across all requests.
pub struct AccessGuard {
    identity: Arc<dyn IdentityProvider>,
    audit: Arc<dyn AuditSink>,
    extra_roots: Vec<String>,
    case_id_re: Regex,
}

impl AccessGuard {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        audit: Arc<dyn AuditSink>,
        extra_roots: Vec<String>,
    ) -> Self {
        Self {
            identity,
            audit,
            extra_roots,
            case_id_re: Regex::new(r"^[A-Za-z0-9_-]+$").expect("case id pattern"),
        }
    }

    /// Authenticates the `Authorization` header value and requires the
    /// `admin` role. One audit entry per decision.
    pub async fn authorize_admin(
        &self,
        authorization: Option<&str>,
        meta: &RequestMeta,
    ) -> Result<Identity> {
        let decision = self.check_admin(authorization).await;

        let (actor, entry) = match &decision {
            Ok(identity) => (
                Some(identity.user_id.clone()),
                SecurityLogEntry::new(SecurityEventType::Login, json!({ "decision": "grant" })),
            ),
            Err(reason) => (
                None,
                SecurityLogEntry::new(
                    SecurityEventType::Login,
                    json!({ "decision": "deny", "reason": reason.reason() }),
                )
                .success(false),
            ),
        };
        let mut entry = entry.request(meta.ip_address.clone(), meta.user_agent.clone());
        if let Some(actor) = actor {
            entry = entry.actor(actor);
        }
        record_or_log(self.audit.as_ref(), entry).await;

        match decision {
            Ok(identity) => Ok(identity),
            Err(e) => {
                tracing::warn!(reason = e.reason(), "workbench access denied");
                Err(e.into())
            }
        }
    }

    async fn check_admin(
        &self,
        authorization: Option<&str>,
    ) -> std::result::Result<Identity, AuthError> {
        let header = authorization.ok_or(AuthError::MissingToken)?;
        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let identity = self
            .identity
            .verify(token)
            .await
            .map_err(|_| AuthError::InvalidToken)?
            .ok_or(AuthError::InvalidToken)?;

        if identity.role != Role::Admin {
            return Err(AuthError::InsufficientRole);
        }
        Ok(identity)
    }

    /// Validates a case identifier: letters, digits, hyphen and underscore
    /// only. Rejected before any side effect.
    pub fn validate_case_id(&self, raw: &str) -> Result<String> {
        if raw.is_empty() || !self.case_id_re.is_match(raw) {
            return Err(ValidationError::InvalidCaseId(raw.to_string()).into());
        }
        Ok(raw.to_string())
    }

    /// Sanitizes a storage path and verifies it falls under one of the
    /// allowed root scopes for the case. One audit entry per decision.
    pub async fn authorize_path(
        &self,
        case_id: &str,
        raw_path: &str,
        actor: &Identity,
        meta: &RequestMeta,
    ) -> Result<String> {
        let sanitized = sanitize_path(raw_path);
        let allowed = self.path_is_allowed(case_id, &sanitized);

        let entry = SecurityLogEntry::new(
            SecurityEventType::DocumentAccess,
            if allowed {
                json!({ "decision": "grant", "caseId": case_id, "path": sanitized })
            } else {
                json!({
                    "decision": "deny",
                    "reason": AuthError::PathNotAllowed.reason(),
                    "caseId": case_id,
                    "path": raw_path,
                })
            },
        )
        .actor(actor.user_id.clone())
        .request(meta.ip_address.clone(), meta.user_agent.clone())
        .success(allowed);
        record_or_log(self.audit.as_ref(), entry).await;

        if allowed {
            Ok(sanitized)
        } else {
            tracing::warn!(case_id, path = raw_path, "path outside allowed roots");
            Err(AuthError::PathNotAllowed.into())
        }
    }

    // Compile-time override for local fixture trees; absent from release
    // artifacts built without the feature.
    #[cfg(feature = "relaxed-paths")]
    fn path_is_allowed(&self, _case_id: &str, _sanitized: &str) -> bool {
        true
    }

    #[cfg(not(feature = "relaxed-paths"))]
    fn path_is_allowed(&self, case_id: &str, sanitized: &str) -> bool {
        let case_docs = format!("/cases/{case_id}/docs");
        let case_drafts = format!("/cases/{case_id}/drafts");
        sanitized.starts_with(&case_docs)
            || sanitized.starts_with(&case_drafts)
            || sanitized.starts_with("/templates")
            || sanitized.starts_with("/portal/exports")
            || self.extra_roots.iter().any(|r| sanitized.starts_with(r))
    }
}

/// Strips every parent-directory sequence and every character outside the
/// path-safe set. Purely lexical; root-scope checks happen afterwards.
pub fn sanitize_path(raw: &str) -> String {
    let mut cleaned = raw.to_string();
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", "");
    }
    cleaned
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;

    fn admin() -> Identity {
        Identity {
            user_id: "admin-1".into(),
            email: Some("ops@example.com".into()),
            role: Role::Admin,
        }
    }

    fn guard_with(sink: Arc<MemoryAuditSink>) -> AccessGuard {
        let provider = StaticTokenProvider::new()
            .with_token("good-token", admin())
            .with_token(
                "client-token",
                Identity {
                    user_id: "client-1".into(),
                    email: None,
                    role: Role::Client,
                },
            );
        AccessGuard::new(Arc::new(provider), sink, Vec::new())
    }

    #[tokio::test]
    async fn missing_header_is_401_and_audited() {
        let sink = Arc::new(MemoryAuditSink::new());
        let guard = guard_with(sink.clone());

        let err = guard
            .authorize_admin(None, &RequestMeta::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 401);

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_success);
        assert_eq!(entries[0].metadata["reason"], "missing_token");
    }

    #[tokio::test]
    async fn non_admin_is_403_with_reason() {
        let sink = Arc::new(MemoryAuditSink::new());
        let guard = guard_with(sink.clone());

        let err = guard
            .authorize_admin(Some("Bearer client-token"), &RequestMeta::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);
        assert_eq!(sink.entries()[0].metadata["reason"], "insufficient_role");
    }

    #[tokio::test]
    async fn admin_token_grants_and_audits() {
        let sink = Arc::new(MemoryAuditSink::new());
        let guard = guard_with(sink.clone());

        let identity = guard
            .authorize_admin(Some("Bearer good-token"), &RequestMeta::default())
            .await
            .unwrap();
        assert_eq!(identity.user_id, "admin-1");

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_success);
    }

    #[test]
    fn case_id_pattern() {
        let guard = guard_with(Arc::new(MemoryAuditSink::new()));
        assert!(guard.validate_case_id("C1-2024_a").is_ok());
        assert!(guard.validate_case_id("").is_err());
        assert!(guard.validate_case_id("C1/evil").is_err());
        assert!(guard.validate_case_id("C1 2024").is_err());
    }

    #[test]
    fn sanitize_strips_traversal_and_junk() {
        let out = sanitize_path("/cases/../../etc/passwd");
        assert!(!out.contains(".."));
        assert_eq!(out, "/cases///etc/passwd");

        assert_eq!(sanitize_path("/cases/C1/docs/a b!.pdf"), "/cases/C1/docs/ab.pdf");
    }

    #[cfg(not(feature = "relaxed-paths"))]
    #[tokio::test]
    async fn traversal_path_is_rejected() {
        let sink = Arc::new(MemoryAuditSink::new());
        let guard = guard_with(sink.clone());

        let err = guard
            .authorize_path(
                "C1",
                "/cases/../../etc/passwd",
                &admin(),
                &RequestMeta::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);
        assert_eq!(sink.entries()[0].metadata["reason"], "invalid_path");
    }

    #[cfg(not(feature = "relaxed-paths"))]
    #[tokio::test]
    async fn case_docs_path_is_allowed() {
        let sink = Arc::new(MemoryAuditSink::new());
        let guard = guard_with(sink.clone());

        let path = guard
            .authorize_path(
                "C1",
                "/cases/C1/docs/POA_Adult.pdf",
                &admin(),
                &RequestMeta::default(),
            )
            .await
            .unwrap();
        assert_eq!(path, "/cases/C1/docs/POA_Adult.pdf");
    }
}
