use agentmesh_core::subject;
use std::time::Duration;
use uuid::Uuid;

/// Runtime settings for one gateway instance.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Identifies this process in the `agentmesh-origin` header.
    pub instance_id: String,
    /// Root of the per-tenant namespace relative subjects are placed under.
    pub subject_root: String,
    /// Subject prefixes left untouched by namespace prefixing.
    pub global_prefixes: Vec<String>,
    /// Segments under the tenant namespace that dashboards may read and
    /// that trigger dashboard fanout on publish.
    pub channel_segments: Vec<String>,
    /// An agent not heard from for this long is marked offline.
    pub presence_timeout: Duration,
    pub presence_sweep: Duration,
    /// Burst size of the unauthenticated challenge endpoint.
    pub max_burst: f64,
    /// Refill rate of the unauthenticated challenge endpoint.
    pub max_requests_per_second: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            subject_root: "tenant".into(),
            global_prefixes: vec!["presence.".into()],
            channel_segments: vec!["channels".into(), "broadcast".into()],
            presence_timeout: Duration::from_secs(90),
            presence_sweep: Duration::from_secs(15),
            max_burst: 50.0,
            max_requests_per_second: 10.0,
        }
    }
}

impl GatewayConfig {
    /// `<root>.<tenant>`
    pub fn tenant_namespace(&self, tenant_id: &str) -> String {
        subject::namespace(&self.subject_root, tenant_id)
    }

    /// Place a client-supplied subject in the tenant namespace.
    ///
    /// Subjects already inside the namespace, or starting with a global
    /// prefix, are returned as given.
    pub fn resolve_subject(&self, tenant_id: &str, requested: &str) -> String {
        let requested = requested.trim();
        let namespace = self.tenant_namespace(tenant_id);
        if requested == namespace
            || subject::is_below(&namespace, requested)
            || self.is_global(requested)
        {
            return requested.to_string();
        }
        format!("{namespace}.{requested}")
    }

    pub fn is_global(&self, subject: &str) -> bool {
        self.global_prefixes
            .iter()
            .any(|prefix| subject.starts_with(prefix.as_str()))
    }

    /// `true` if `subject` is a channel or broadcast subject of the tenant.
    pub fn is_channel_subject(&self, tenant_id: &str, subject: &str) -> bool {
        let namespace = self.tenant_namespace(tenant_id);
        self.channel_segments.iter().any(|segment| {
            let prefix = format!("{namespace}.{segment}");
            subject == prefix || subject::is_below(&prefix, subject)
        })
    }
}
