use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved namespace bucket for services declared in the config file
/// rather than discovered from the cluster.
pub const CONFIG_NAMESPACE: &str = "config";

pub type ServiceKey = (String, String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
    AuthBlocked,
    Unknown,
}

impl Default for Status {
    fn default() -> Self {
        Status::Unknown
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceSource {
    Kubernetes,
    Config,
}

/// Attributes an override overlays on top of a kubernetes-discovered
/// service. Stashed on first override so a later removal of the override
/// can restore what the cluster actually reported.
#[derive(Clone, Debug, Default)]
pub struct OverrideBackup {
    pub display_name: String,
    pub health_url: Option<String>,
    pub expected_status_codes: Vec<u16>,
    pub icon: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub namespace: String,
    pub name: String,
    pub display_name: String,
    pub group: Option<String>,
    pub icon: Option<String>,
    pub source: ServiceSource,

    pub url: String,
    pub health_url: Option<String>,
    #[serde(default)]
    pub expected_status_codes: Vec<u16>,

    pub status: Status,
    pub http_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub error_snippet: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_state_change: Option<DateTime<Utc>>,

    pub ready_endpoints: Option<u32>,
    pub total_endpoints: Option<u32>,

    pub composite_status: Status,
    pub auth_guarded: bool,

    /// Pre-override attributes of a kubernetes-sourced service, kept so a
    /// later reconciliation that drops the override can restore them.
    /// Never exposed to subscribers.
    #[serde(skip)]
    pub override_backup: Option<OverrideBackup>,
}

impl Service {
    pub fn key(&self) -> ServiceKey {
        (self.namespace.clone(), self.name.clone())
    }

    pub fn new_kubernetes(namespace: String, name: String, url: String) -> Self {
        let display_name = name.clone();
        Service {
            namespace,
            name,
            display_name,
            group: None,
            icon: None,
            source: ServiceSource::Kubernetes,
            url,
            health_url: None,
            expected_status_codes: Vec::new(),
            status: Status::Unknown,
            http_code: None,
            response_time_ms: None,
            error_snippet: None,
            last_checked: None,
            last_state_change: None,
            ready_endpoints: None,
            total_endpoints: None,
            composite_status: Status::Unknown,
            auth_guarded: false,
            override_backup: None,
        }
    }

    pub fn new_config(name: String, display_name: String, url: String) -> Self {
        Service {
            namespace: CONFIG_NAMESPACE.to_string(),
            name,
            display_name,
            group: None,
            icon: None,
            source: ServiceSource::Config,
            url,
            health_url: None,
            expected_status_codes: Vec::new(),
            status: Status::Unknown,
            http_code: None,
            response_time_ms: None,
            error_snippet: None,
            last_checked: None,
            last_state_change: None,
            ready_endpoints: None,
            total_endpoints: None,
            composite_status: Status::Unknown,
            auth_guarded: false,
            override_backup: None,
        }
    }
}

/// Fan-out record emitted on every store mutation (and on cluster/config
/// liveness ticks). `Discovered`/`Updated` carry a deep copy of the
/// service; `Removed` carries only the identity pair.
#[derive(Clone, Debug)]
pub enum Event {
    Discovered(Service),
    Updated(Service),
    Removed(ServiceKey),
    ClusterStatus {
        connected: bool,
        last_event: Option<DateTime<Utc>>,
    },
    ConfigErrorsChanged(Vec<String>),
}

/// A single line of the transition journal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub ts: DateTime<Utc>,
    pub svc: String,
    pub prev: Status,
    pub next: Status,
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub ms: Option<u64>,
}

/// Point-in-time view of the whole store, handed to a new SSE subscriber
/// and re-sent whenever `configErrors` changes.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub services: Vec<Service>,
    pub cluster_connected: bool,
    pub last_cluster_event: Option<DateTime<Utc>>,
    pub config_errors: Vec<String>,
}

/// Split a `"ns/name"` journal/override key. Requires exactly one `/`
/// with non-empty content on both sides.
pub fn split_service_key(s: &str) -> Option<(&str, &str)> {
    if s.matches('/').count() != 1 {
        return None;
    }
    let (ns, name) = s.split_once('/')?;
    if ns.is_empty() || name.is_empty() {
        return None;
    }
    Some((ns, name))
}

/// Truncate a possibly multi-line message to its first line, capped at
/// 256 bytes (on a UTF-8 boundary).
pub fn first_line_snippet(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("");
    if first_line.len() <= 256 {
        return first_line.to_string();
    }
    let mut end = 256;
    while !first_line.is_char_boundary(end) {
        end -= 1;
    }
    first_line[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_truncates_to_first_line_and_256_bytes() {
        let body = format!("{}\nsecond line", "x".repeat(300));
        let snippet = first_line_snippet(&body);
        assert!(snippet.len() <= 256);
        assert!(!snippet.contains('\n'));
    }

    #[test]
    fn snippet_keeps_short_first_line_whole() {
        assert_eq!(first_line_snippet("boom\nmore context"), "boom");
    }

    #[test]
    fn split_service_key_requires_exactly_one_slash() {
        assert_eq!(split_service_key("default/web"), Some(("default", "web")));
        assert_eq!(split_service_key("default/web/extra"), None);
        assert_eq!(split_service_key("defaultweb"), None);
        assert_eq!(split_service_key("/web"), None);
        assert_eq!(split_service_key("default/"), None);
    }
}
