//! Declarative configuration loader and hot-reload reconciler
//! (spec.md §4.3). Parsing is partial-failure preserving: a malformed
//! top-level document yields no config at all, but a document that
//! parses with some invalid entries yields a config with just the
//! offenders dropped, alongside the list of messages that get surfaced
//! to subscribers via `store.setConfigErrors`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::store::ServiceStore;
use crate::types::{split_service_key, Service, ServiceSource, CONFIG_NAMESPACE};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawServiceEntry {
    name: Option<String>,
    display_name: Option<String>,
    url: Option<String>,
    group: Option<String>,
    health_url: Option<String>,
    expected_status_codes: Vec<u16>,
    icon: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawOverrideEntry {
    #[serde(rename = "match")]
    match_key: Option<String>,
    display_name: Option<String>,
    health_url: Option<String>,
    expected_status_codes: Option<Vec<u16>>,
    icon: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawGroup {
    display_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawHistory {
    retention_days: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawDocument {
    services: Vec<RawServiceEntry>,
    overrides: Vec<RawOverrideEntry>,
    groups: HashMap<String, RawGroup>,
    /// Reserved for a future probe-cadence override; parsed so the
    /// document round-trips, but not consumed (see DESIGN.md).
    #[allow(dead_code)]
    health: Option<serde_yaml::Value>,
    history: RawHistory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEntry {
    pub name: String,
    pub display_name: String,
    pub url: String,
    pub group: String,
    pub health_url: Option<String>,
    pub expected_status_codes: Vec<u16>,
    pub icon: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverrideEntry {
    pub namespace: String,
    pub name: String,
    pub display_name: Option<String>,
    pub health_url: Option<String>,
    pub expected_status_codes: Option<Vec<u16>>,
    pub icon: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct GroupMeta {
    pub display_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryConfig {
    pub retention_days: i64,
}

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig { retention_days: DEFAULT_RETENTION_DAYS }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DashboardConfig {
    pub services: Vec<ServiceEntry>,
    pub overrides: Vec<OverrideEntry>,
    pub groups: HashMap<String, GroupMeta>,
    pub history: HistoryConfig,
}

impl DashboardConfig {
    fn services_by_name(&self) -> HashMap<&str, &ServiceEntry> {
        self.services.iter().map(|s| (s.name.as_str(), s)).collect()
    }
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

fn valid_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(u) => !u.scheme().is_empty() && u.host().is_some(),
        Err(_) => false,
    }
}

/// Substitutes `${VAR}` references in the raw document text before YAML
/// parsing. Undefined variables substitute to the empty string.
/// Intentionally does not support nesting or `${VAR:-default}` syntax —
/// the spec names only the bare form.
pub fn substitute_env_vars(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(close) = raw[i + 2..].find('}') {
                let name = &raw[i + 2..i + 2 + close];
                if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    out.push_str(&std::env::var(name).unwrap_or_default());
                    i += 2 + close + 1;
                    continue;
                }
            }
        }
        out.push(raw[i..].chars().next().unwrap());
        i += raw[i..].chars().next().unwrap().len_utf8();
    }
    out
}

/// Parses a YAML document into a `(config, errors)` pair. A malformed
/// top-level document yields `(None, [parseError])`. A document that
/// parses but has invalid entries yields `(Some(config), [entryErrors])`
/// with the offenders omitted.
pub fn parse(raw: &str) -> (Option<DashboardConfig>, Vec<String>) {
    let substituted = substitute_env_vars(raw);
    let doc: RawDocument = match serde_yaml::from_str(&substituted) {
        Ok(doc) => doc,
        Err(e) => return (None, vec![format!("failed to parse config document: {e}")]),
    };

    let mut errors = Vec::new();
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut services = Vec::new();

    for (i, entry) in doc.services.into_iter().enumerate() {
        let name = match entry.name.as_deref().map(str::trim) {
            Some(n) if !is_blank(n) => n.to_string(),
            _ => {
                errors.push(format!("services[{i}]: name is required"));
                continue;
            }
        };
        if !seen_names.insert(name.clone()) {
            errors.push(format!("services[{i}]: duplicate service name '{name}', ignoring"));
            continue;
        }
        let group = match entry.group.as_deref().map(str::trim) {
            Some(g) if !is_blank(g) => g.to_string(),
            _ => {
                errors.push(format!("services[{i}] '{name}': group is required"));
                continue;
            }
        };
        let url = match entry.url.as_deref().map(str::trim) {
            Some(u) if !is_blank(u) && valid_url(u) => u.to_string(),
            _ => {
                errors.push(format!("services[{i}] '{name}': url is missing or invalid"));
                continue;
            }
        };
        let health_url = match entry.health_url.as_deref().map(str::trim) {
            Some(h) if is_blank(h) => None,
            Some(h) if valid_url(h) => Some(h.to_string()),
            Some(h) => {
                errors.push(format!(
                    "services[{i}] '{name}': healthUrl '{h}' is invalid, clearing"
                ));
                None
            }
            None => None,
        };
        let display_name = entry
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|d| !is_blank(d))
            .map(str::to_string)
            .unwrap_or_else(|| name.clone());

        services.push(ServiceEntry {
            name,
            display_name,
            url,
            group,
            health_url,
            expected_status_codes: entry.expected_status_codes,
            icon: entry.icon.filter(|v| !is_blank(v)),
        });
    }

    let mut overrides = Vec::new();
    for (i, entry) in doc.overrides.into_iter().enumerate() {
        let match_key = match entry.match_key.as_deref().map(str::trim) {
            Some(m) if !is_blank(m) => m,
            _ => {
                errors.push(format!("overrides[{i}]: match is required"));
                continue;
            }
        };
        let Some((namespace, name)) = split_service_key(match_key) else {
            errors.push(format!(
                "overrides[{i}]: match '{match_key}' must be of the form 'namespace/name'"
            ));
            continue;
        };
        let health_url = match entry.health_url.as_deref().map(str::trim) {
            Some(h) if is_blank(h) => None,
            Some(h) if valid_url(h) => Some(h.to_string()),
            Some(h) => {
                errors.push(format!(
                    "overrides[{i}] '{match_key}': healthUrl '{h}' is invalid, clearing"
                ));
                None
            }
            None => None,
        };
        overrides.push(OverrideEntry {
            namespace: namespace.to_string(),
            name: name.to_string(),
            display_name: entry.display_name.filter(|v| !is_blank(v)),
            health_url,
            expected_status_codes: entry.expected_status_codes,
            icon: entry.icon.filter(|v| !is_blank(v)),
        });
    }

    let groups = doc
        .groups
        .into_iter()
        .map(|(k, v)| (k, GroupMeta { display_name: v.display_name }))
        .collect();

    let retention_days = match doc.history.retention_days {
        Some(d) if d > 0 => d,
        _ => DEFAULT_RETENTION_DAYS,
    };

    (
        Some(DashboardConfig {
            services,
            overrides,
            groups,
            history: HistoryConfig { retention_days },
        }),
        errors,
    )
}

/// Reads and parses the config file at `path`. IO failure is a hard
/// error (distinct from a parse failure, which is reported as part of
/// the `(config, errors)` pair); a missing file is treated the same as
/// an empty document producing an all-defaults config with no errors,
/// mirroring how the orchestrator can run config-only-empty before a
/// file is ever created.
pub fn load_file(path: &Path) -> Result<(Option<DashboardConfig>, Vec<String>), ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(parse(&raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok((Some(DashboardConfig::default()), Vec::new()))
        }
        Err(e) => Err(ConfigError::Read { path: path.display().to_string(), source: e }),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileCounts {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

fn entry_to_service(entry: &ServiceEntry) -> Service {
    let mut svc = Service::new_config(entry.name.clone(), entry.display_name.clone(), entry.url.clone());
    svc.group = Some(entry.group.clone());
    svc.icon = entry.icon.clone();
    svc.health_url = entry.health_url.clone();
    svc.expected_status_codes = entry.expected_status_codes.clone();
    svc
}

/// Applies an override's explicitly-set attributes onto `svc`, stashing
/// the pre-override values the first time an override touches this
/// service so a later reconciliation that drops the override can
/// restore them (spec.md §4.3 "the override mutation is reversed").
fn apply_override(svc: &mut Service, ov: &OverrideEntry) {
    if svc.source != ServiceSource::Kubernetes {
        return;
    }
    if svc.override_backup.is_none() {
        svc.override_backup = Some(crate::types::OverrideBackup {
            display_name: svc.display_name.clone(),
            health_url: svc.health_url.clone(),
            expected_status_codes: svc.expected_status_codes.clone(),
            icon: svc.icon.clone(),
        });
    }
    if let Some(d) = &ov.display_name {
        svc.display_name = d.clone();
    }
    if let Some(h) = &ov.health_url {
        svc.health_url = Some(h.clone());
    }
    if let Some(codes) = &ov.expected_status_codes {
        svc.expected_status_codes = codes.clone();
    }
    if let Some(icon) = &ov.icon {
        svc.icon = Some(icon.clone());
    }
}

fn restore_override(svc: &mut Service) {
    if let Some(backup) = svc.override_backup.take() {
        svc.display_name = backup.display_name;
        svc.health_url = backup.health_url;
        svc.expected_status_codes = backup.expected_status_codes;
        svc.icon = backup.icon;
    }
}

/// Owns the last-known-good config and mediates every registration /
/// reconciliation pass against the store (spec.md §4.3 "Registration"
/// and "Hot reload").
pub struct ConfigManager {
    store: ServiceStore,
    last_good: tokio::sync::RwLock<DashboardConfig>,
}

impl ConfigManager {
    pub fn new(store: ServiceStore) -> Self {
        ConfigManager { store, last_good: tokio::sync::RwLock::new(DashboardConfig::default()) }
    }

    /// First-load registration (spec.md §4.3 "Registration"): every
    /// `services` entry is inserted, every `override` is applied only
    /// if its target already exists (it may appear later via a
    /// `Discovered` event, handled by the journal's pending-apply path
    /// for history but not for overrides — overrides re-apply on the
    /// next reconciliation pass instead).
    pub async fn apply_initial(&self, cfg: DashboardConfig) {
        for entry in &cfg.services {
            self.store.add_or_update(entry_to_service(entry)).await;
        }
        for ov in &cfg.overrides {
            let ov = ov.clone();
            self.store.update(&ov.namespace, &ov.name, move |svc| apply_override(svc, &ov)).await;
        }
        *self.last_good.write().await = cfg;
    }

    pub async fn current(&self) -> DashboardConfig {
        self.last_good.read().await.clone()
    }

    /// Re-applies every override from the last-known-good config
    /// without touching `services`. Used by the orchestrator after the
    /// cluster watcher's initial sync (or its 5s timeout, whichever
    /// comes first) so overrides reach kubernetes services that were
    /// not yet discovered at config-load time (spec.md §4.7 step 4:
    /// "apply them even if the wait times out").
    pub async fn apply_overrides(&self) {
        let cfg = self.last_good.read().await.clone();
        for ov in &cfg.overrides {
            let ov = ov.clone();
            self.store.update(&ov.namespace, &ov.name, move |svc| apply_override(svc, &ov)).await;
        }
    }

    /// Reconciles `new_cfg` against the last-known-good config: added
    /// entries are inserted, removed entries are dropped, changed
    /// entries are updated in place, and then every override in
    /// `new_cfg` is re-applied (restoring any override whose match no
    /// longer appears).
    pub async fn reconcile(&self, new_cfg: DashboardConfig) -> ReconcileCounts {
        let mut counts = ReconcileCounts::default();
        let old_cfg = self.last_good.read().await.clone();
        let old_by_name = old_cfg.services_by_name();
        let new_by_name = new_cfg.services_by_name();

        for (name, entry) in &new_by_name {
            match old_by_name.get(name) {
                None => {
                    self.store.add_or_update(entry_to_service(entry)).await;
                    counts.added += 1;
                }
                Some(old_entry) if old_entry != entry => {
                    let entry = (*entry).clone();
                    self.store
                        .update(CONFIG_NAMESPACE, name, move |svc| {
                            svc.display_name = entry.display_name.clone();
                            svc.url = entry.url.clone();
                            svc.group = Some(entry.group.clone());
                            svc.icon = entry.icon.clone();
                            svc.health_url = entry.health_url.clone();
                            svc.expected_status_codes = entry.expected_status_codes.clone();
                        })
                        .await;
                    counts.updated += 1;
                }
                Some(_) => {}
            }
        }
        for name in old_by_name.keys() {
            if !new_by_name.contains_key(name) {
                self.store.remove(CONFIG_NAMESPACE, name).await;
                counts.removed += 1;
            }
        }

        let old_override_keys: HashSet<(String, String)> = old_cfg
            .overrides
            .iter()
            .map(|o| (o.namespace.clone(), o.name.clone()))
            .collect();
        let new_override_keys: HashSet<(String, String)> = new_cfg
            .overrides
            .iter()
            .map(|o| (o.namespace.clone(), o.name.clone()))
            .collect();

        for (ns, name) in old_override_keys.difference(&new_override_keys) {
            self.store.update(ns, name, restore_override).await;
        }
        for ov in &new_cfg.overrides {
            let ov = ov.clone();
            self.store.update(&ov.namespace, &ov.name, move |svc| apply_override(svc, &ov)).await;
        }

        *self.last_good.write().await = new_cfg;
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_valid_document() {
        let raw = r#"
services:
  - name: truenas
    url: https://nas.local
    group: infrastructure
overrides:
  - match: default/radarr
    displayName: Radarr HD
history:
  retentionDays: 14
"#;
        let (cfg, errors) = parse(raw);
        assert!(errors.is_empty());
        let cfg = cfg.unwrap();
        assert_eq!(cfg.services.len(), 1);
        assert_eq!(cfg.services[0].display_name, "truenas");
        assert_eq!(cfg.overrides.len(), 1);
        assert_eq!(cfg.history.retention_days, 14);
    }

    #[test]
    fn malformed_document_yields_none_and_single_error() {
        let (cfg, errors) = parse("services: [this is: not: valid");
        assert!(cfg.is_none());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn invalid_entry_is_dropped_but_siblings_survive() {
        let raw = r#"
services:
  - name: good
    url: https://good.local
    group: infra
  - name: ""
    url: https://bad.local
    group: infra
"#;
        let (cfg, errors) = parse(raw);
        let cfg = cfg.unwrap();
        assert_eq!(cfg.services.len(), 1);
        assert_eq!(cfg.services[0].name, "good");
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn duplicate_service_names_drop_the_later_one() {
        let raw = r#"
services:
  - name: dup
    url: https://one.local
    group: infra
  - name: dup
    url: https://two.local
    group: infra
"#;
        let (cfg, errors) = parse(raw);
        let cfg = cfg.unwrap();
        assert_eq!(cfg.services.len(), 1);
        assert_eq!(cfg.services[0].url, "https://one.local");
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn invalid_health_url_is_cleared_not_rejected() {
        let raw = r#"
services:
  - name: svc
    url: https://svc.local
    group: infra
    healthUrl: "not-a-url"
"#;
        let (cfg, errors) = parse(raw);
        let cfg = cfg.unwrap();
        assert_eq!(cfg.services.len(), 1);
        assert_eq!(cfg.services[0].health_url, None);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn whitespace_only_required_field_is_treated_as_missing() {
        let raw = r#"
services:
  - name: "   "
    url: https://svc.local
    group: infra
"#;
        let (cfg, errors) = parse(raw);
        let cfg = cfg.unwrap();
        assert!(cfg.services.is_empty());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn env_var_substitution_replaces_defined_and_blanks_undefined() {
        std::env::set_var("HEALTHDASH_TEST_HOST", "nas.example.com");
        let raw = "url: https://${HEALTHDASH_TEST_HOST}/path?x=${HEALTHDASH_UNDEFINED_VAR}";
        let out = substitute_env_vars(raw);
        assert_eq!(out, "url: https://nas.example.com/path?x=");
        std::env::remove_var("HEALTHDASH_TEST_HOST");
    }

    #[test]
    fn non_positive_retention_days_falls_back_to_default() {
        let raw = "history:\n  retentionDays: 0\n";
        let (cfg, _) = parse(raw);
        assert_eq!(cfg.unwrap().history.retention_days, DEFAULT_RETENTION_DAYS);
    }

    #[tokio::test]
    async fn reconcile_computes_added_removed_updated_counts() {
        let store = ServiceStore::new();
        let mgr = ConfigManager::new(store.clone());
        let initial = DashboardConfig {
            services: vec![
                ServiceEntry {
                    name: "a".into(),
                    display_name: "a".into(),
                    url: "https://a.local".into(),
                    group: "g".into(),
                    health_url: None,
                    expected_status_codes: vec![],
                    icon: None,
                },
                ServiceEntry {
                    name: "b".into(),
                    display_name: "b".into(),
                    url: "https://b.local".into(),
                    group: "g".into(),
                    health_url: None,
                    expected_status_codes: vec![],
                    icon: None,
                },
            ],
            overrides: vec![],
            groups: HashMap::new(),
            history: HistoryConfig::default(),
        };
        mgr.apply_initial(initial).await;

        let next = DashboardConfig {
            services: vec![
                ServiceEntry {
                    name: "a".into(),
                    display_name: "a renamed".into(),
                    url: "https://a.local".into(),
                    group: "g".into(),
                    health_url: None,
                    expected_status_codes: vec![],
                    icon: None,
                },
                ServiceEntry {
                    name: "c".into(),
                    display_name: "c".into(),
                    url: "https://c.local".into(),
                    group: "g".into(),
                    health_url: None,
                    expected_status_codes: vec![],
                    icon: None,
                },
            ],
            overrides: vec![],
            groups: HashMap::new(),
            history: HistoryConfig::default(),
        };
        let counts = mgr.reconcile(next).await;
        assert_eq!(counts, ReconcileCounts { added: 1, removed: 1, updated: 1 });
        assert!(store.get(CONFIG_NAMESPACE, "b").await.is_none());
        assert!(store.get(CONFIG_NAMESPACE, "c").await.is_some());
        assert_eq!(store.get(CONFIG_NAMESPACE, "a").await.unwrap().display_name, "a renamed");
    }

    #[tokio::test]
    async fn override_restored_when_dropped_from_config() {
        let store = ServiceStore::new();
        store
            .add_or_update(Service::new_kubernetes(
                "default".into(),
                "radarr".into(),
                "http://radarr.default.svc".into(),
            ))
            .await;
        let mgr = ConfigManager::new(store.clone());
        let with_override = DashboardConfig {
            services: vec![],
            overrides: vec![OverrideEntry {
                namespace: "default".into(),
                name: "radarr".into(),
                display_name: Some("Radarr HD".into()),
                health_url: None,
                expected_status_codes: None,
                icon: None,
            }],
            groups: HashMap::new(),
            history: HistoryConfig::default(),
        };
        mgr.apply_initial(with_override).await;
        assert_eq!(store.get("default", "radarr").await.unwrap().display_name, "Radarr HD");

        let without_override = DashboardConfig::default();
        mgr.reconcile(without_override).await;
        assert_eq!(store.get("default", "radarr").await.unwrap().display_name, "radarr");
    }
}
