use agentmesh_core::subject;
use agentmesh_core::{Action, MeshError, MeshResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Default subject root a tenant owns when no explicit permissions exist.
pub const DEFAULT_ROOT: &str = "tenant";

/// Publish and subscribe allow-lists for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPermissions {
    pub tenant_id: String,
    #[serde(default)]
    pub publish: Vec<String>,
    #[serde(default)]
    pub subscribe: Vec<String>,
}

impl TenantPermissions {
    /// The tenant may touch everything under `<root>.<tenant_id>` for each root.
    pub fn defaults(tenant_id: &str, roots: &[String]) -> Self {
        let patterns: Vec<String> = roots
            .iter()
            .map(|root| subject::namespace_pattern(root, tenant_id))
            .collect();
        Self {
            tenant_id: tenant_id.to_string(),
            publish: patterns.clone(),
            subscribe: patterns,
        }
    }

    pub fn patterns(&self, action: Action) -> &[String] {
        match action {
            Action::Publish => &self.publish,
            Action::Subscribe => &self.subscribe,
        }
    }

    /// First matching pattern wins; no match denies.
    pub fn allows(&self, subject: &str, action: Action) -> bool {
        subject::matches_any(self.patterns(action), subject)
    }
}

/// Decides whether a tenant may publish or subscribe on a subject.
///
/// Holds one permission set per tenant, created lazily with defaults on first
/// sight and replaced only by an explicit [`SubjectAuthorizer::register`].
pub struct SubjectAuthorizer {
    default_roots: Vec<String>,
    tenants: RwLock<HashMap<String, TenantPermissions>>,
}

impl SubjectAuthorizer {
    pub fn new() -> Self {
        Self::with_default_roots(vec![DEFAULT_ROOT.to_string()])
    }

    /// Use `roots` to build the default permission set of unregistered tenants.
    pub fn with_default_roots(roots: Vec<String>) -> Self {
        Self {
            default_roots: roots,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Explicitly set a tenant's permissions, replacing any previous set.
    pub fn register(&self, permissions: TenantPermissions) -> MeshResult<()> {
        subject::validate_identifier("tenant_id", &permissions.tenant_id)?;
        info!(
            tenant_id = %permissions.tenant_id,
            publish = ?permissions.publish,
            subscribe = ?permissions.subscribe,
            "Tenant permissions registered"
        );
        self.tenants
            .write()
            .insert(permissions.tenant_id.clone(), permissions);
        Ok(())
    }

    /// The permission set in force for `tenant_id`, registering defaults if
    /// unseen. A tenant id that is not a single subject token gets nothing.
    pub fn permissions(&self, tenant_id: &str) -> TenantPermissions {
        if !subject::is_valid_token(tenant_id) {
            return TenantPermissions {
                tenant_id: tenant_id.to_string(),
                publish: Vec::new(),
                subscribe: Vec::new(),
            };
        }
        if let Some(perms) = self.tenants.read().get(tenant_id) {
            return perms.clone();
        }
        self.tenants
            .write()
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                debug!(tenant_id = %tenant_id, "Registering default tenant permissions");
                TenantPermissions::defaults(tenant_id, &self.default_roots)
            })
            .clone()
    }

    /// Returns `true` if the tenant may perform `action` on `subject`.
    pub fn check(&self, tenant_id: &str, subject: &str, action: Action) -> bool {
        if !subject::is_valid_token(tenant_id) || !subject::is_valid(subject) {
            return false;
        }
        if let Some(perms) = self.tenants.read().get(tenant_id) {
            return perms.allows(subject, action);
        }
        self.permissions(tenant_id).allows(subject, action)
    }

    /// Like [`check`](Self::check) but fails with `AuthorizationDenied`.
    pub fn validate(&self, tenant_id: &str, subject: &str, action: Action) -> MeshResult<()> {
        if self.check(tenant_id, subject, action) {
            Ok(())
        } else {
            debug!(tenant_id = %tenant_id, subject = %subject, action = %action, "Subject denied");
            Err(MeshError::denied(tenant_id, subject, action))
        }
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.read().len()
    }
}

impl Default for SubjectAuthorizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_own_namespace_only() {
        let auth = SubjectAuthorizer::new();
        assert!(auth.check("T1", "tenant.T1.orders", Action::Publish));
        assert!(auth.check("T1", "tenant.T1.a.b.c", Action::Subscribe));
        assert!(!auth.check("T1", "tenant.T2.orders", Action::Publish));
        assert!(!auth.check("T1", "tenant.T1", Action::Subscribe));
        assert!(!auth.check("T1", ">", Action::Subscribe));
    }

    #[test]
    fn test_lazy_registration() {
        let auth = SubjectAuthorizer::new();
        assert_eq!(auth.tenant_count(), 0);
        auth.check("T1", "tenant.T1.x", Action::Publish);
        assert_eq!(auth.tenant_count(), 1);
        assert_eq!(auth.permissions("T1").publish, vec!["tenant.T1.>".to_string()]);
    }

    #[test]
    fn test_single_wildcard_pattern() {
        let auth = SubjectAuthorizer::new();
        auth.register(TenantPermissions {
            tenant_id: "T".into(),
            publish: vec!["tenant.T.*".into()],
            subscribe: vec![],
        })
        .unwrap();
        assert!(auth.check("T", "tenant.T.a", Action::Publish));
        assert!(!auth.check("T", "tenant.T.a.b", Action::Publish));
        assert!(!auth.check("T", "tenant.T", Action::Publish));
        assert!(!auth.check("T", "tenant.T.a", Action::Subscribe));
    }

    #[test]
    fn test_register_replaces_defaults() {
        let auth = SubjectAuthorizer::new();
        assert!(auth.check("T", "tenant.T.x", Action::Publish));
        auth.register(TenantPermissions {
            tenant_id: "T".into(),
            publish: vec!["presence.online".into()],
            subscribe: vec!["presence.>".into()],
        })
        .unwrap();
        assert!(!auth.check("T", "tenant.T.x", Action::Publish));
        assert!(auth.check("T", "presence.online", Action::Publish));
        assert!(auth.check("T", "presence.a.b", Action::Subscribe));
    }

    #[test]
    fn test_multiple_default_roots() {
        let auth = SubjectAuthorizer::with_default_roots(vec!["tenant".into(), "agents".into()]);
        assert!(auth.check("T", "agents.T.tasks.ocr", Action::Publish));
        assert!(auth.check("T", "tenant.T.x", Action::Publish));
        assert!(!auth.check("T", "agents.U.tasks.ocr", Action::Publish));
    }

    #[test]
    fn test_validate_raises_denied() {
        let auth = SubjectAuthorizer::new();
        assert!(auth.validate("T1", "tenant.T1.x", Action::Publish).is_ok());
        let err = auth.validate("T1", "tenant.T2.x", Action::Subscribe).unwrap_err();
        match err {
            MeshError::AuthorizationDenied { tenant_id, subject, action } => {
                assert_eq!(tenant_id, "T1");
                assert_eq!(subject, "tenant.T2.x");
                assert_eq!(action, Action::Subscribe);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_single_wildcard_grant_does_not_cover_tail_request() {
        let auth = SubjectAuthorizer::new();
        auth.register(TenantPermissions {
            tenant_id: "T".into(),
            publish: vec![],
            subscribe: vec!["X.*".into()],
        })
        .unwrap();
        assert!(auth.check("T", "X.a", Action::Subscribe));
        assert!(auth.check("T", "X.*", Action::Subscribe));
        assert!(!auth.check("T", "X.>", Action::Subscribe));
        assert!(!auth.check("T", "X.a.b", Action::Subscribe));
    }

    #[test]
    fn test_lookalike_tenants_stay_isolated() {
        let auth = SubjectAuthorizer::new();
        // "a.b" would collapse onto the namespace of "a_b" if rewritten.
        assert!(auth.check("a_b", "tenant.a_b.orders", Action::Subscribe));
        assert!(!auth.check("a.b", "tenant.a_b.orders", Action::Subscribe));
        assert!(!auth.check("a.b", "tenant.a_b.>", Action::Subscribe));
        assert!(!auth.check("a.b", "tenant.a.b.orders", Action::Publish));
        assert!(auth.permissions("a.b").subscribe.is_empty());
        assert_eq!(auth.tenant_count(), 1);

        let err = auth
            .register(TenantPermissions {
                tenant_id: "a.b".into(),
                publish: vec!["tenant.a_b.>".into()],
                subscribe: vec!["tenant.a_b.>".into()],
            })
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidIdentifier(_)));
        assert!(!auth.check("a.b", "tenant.a_b.orders", Action::Subscribe));
    }

    #[test]
    fn test_malformed_subjects_denied() {
        let auth = SubjectAuthorizer::new();
        assert!(!auth.check("T1", "tenant.T1..x", Action::Publish));
        assert!(!auth.check("T1", "", Action::Publish));
        assert!(!auth.check("T1", "tenant.T1.>.x", Action::Subscribe));
    }
}
