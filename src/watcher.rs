//! Cluster watcher (spec.md §4.2): discovers HTTP services from
//! `Ingress` objects and tracks endpoint readiness from
//! `EndpointSlice` objects, reconciling both into the service store.
//! Grounded on the teacher's `Api`/`Controller` usage in `operator.rs`
//! and on the reflector pattern in
//! `examples/other_examples/e1ac9d30_foriequal0-pod-graceful-drain__src-reflector.rs.rs`
//! (stream + `default_backoff` + `take_until(shutdown)`).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::ListParams;
use kube::config::Kubeconfig;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WatcherError;
use crate::store::ServiceStore;
use crate::types::{Service, ServiceKey, ServiceSource};

const ENDPOINTSLICE_SERVICE_LABEL: &str = "kubernetes.io/service-name";

#[derive(Clone)]
pub struct ClusterWatcher {
    kubeconfig_path: PathBuf,
    store: ServiceStore,
    ingress_synced: Arc<AtomicBool>,
    endpoints_synced: Arc<AtomicBool>,
    synced_notify: Arc<Notify>,
}

impl ClusterWatcher {
    pub fn new(kubeconfig_path: PathBuf, store: ServiceStore) -> Self {
        ClusterWatcher {
            kubeconfig_path,
            store,
            ingress_synced: Arc::new(AtomicBool::new(false)),
            endpoints_synced: Arc::new(AtomicBool::new(false)),
            synced_notify: Arc::new(Notify::new()),
        }
    }

    /// Returns once both informers have completed their initial list.
    /// Callers that want a bound (spec.md §4.7 step 4: "await up to
    /// 5s") wrap this in `tokio::time::timeout`.
    pub async fn wait_for_sync(&self) -> bool {
        loop {
            if self.ingress_synced.load(Ordering::SeqCst) && self.endpoints_synced.load(Ordering::SeqCst) {
                return true;
            }
            self.synced_notify.notified().await;
        }
    }

    /// Runs until `cancellation` fires. Credentials that don't exist at
    /// all are fatal (propagated to the orchestrator); credentials that
    /// exist but don't parse are a warning, and the watcher stays
    /// disabled while the rest of the system remains usable.
    pub async fn run(&self, cancellation: CancellationToken) -> Result<(), WatcherError> {
        if !self.kubeconfig_path.exists() {
            return Err(WatcherError::CredentialsMissing(self.kubeconfig_path.display().to_string()));
        }

        let kubeconfig = match Kubeconfig::read_from(&self.kubeconfig_path) {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, path = %self.kubeconfig_path.display(), "kubeconfig present but unparseable, continuing without cluster discovery");
                return Ok(());
            }
        };
        let client_config =
            match kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default()).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "failed to build client config from kubeconfig, continuing without cluster discovery");
                    return Ok(());
                }
            };
        let client = match Client::try_from(client_config) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to build kube client, continuing without cluster discovery");
                return Ok(());
            }
        };

        let ingress_api: Api<Ingress> = Api::all(client.clone());
        let endpoint_api: Api<EndpointSlice> = Api::all(client.clone());

        tokio::join!(
            self.run_ingress(ingress_api, cancellation.clone()),
            self.run_endpoints(endpoint_api, cancellation.clone()),
        );
        Ok(())
    }

    async fn run_ingress(&self, api: Api<Ingress>, cancellation: CancellationToken) {
        let stream = watcher(api, ListParams::default())
            .default_backoff()
            .take_until(cancellation.cancelled_owned());
        tokio::pin!(stream);

        let mut owned: HashMap<String, HashSet<ServiceKey>> = HashMap::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => {
                    self.store.set_cluster_connected(true).await;
                    self.handle_ingress_event(event, &mut owned).await;
                }
                Err(e) => {
                    warn!(error = %e, "ingress watch error, backing off and retrying");
                    self.store.set_cluster_connected(false).await;
                }
            }
        }
        debug!("ingress watcher stopped");
    }

    async fn handle_ingress_event(
        &self,
        event: Event<Ingress>,
        owned: &mut HashMap<String, HashSet<ServiceKey>>,
    ) {
        match event {
            Event::Applied(ing) => {
                let obj_key = ingress_object_key(&ing);
                let desired = synthesize_services(&ing);
                self.apply_ingress_delta(&obj_key, desired, owned).await;
            }
            Event::Deleted(ing) => {
                let obj_key = ingress_object_key(&ing);
                self.apply_ingress_delta(&obj_key, HashMap::new(), owned).await;
            }
            Event::Restarted(list) => {
                let mut new_owned: HashMap<String, HashSet<ServiceKey>> = HashMap::new();
                let mut all_new_keys: HashSet<ServiceKey> = HashSet::new();
                for ing in &list {
                    let obj_key = ingress_object_key(ing);
                    let desired = synthesize_services(ing);
                    for (key, svc) in &desired {
                        all_new_keys.insert(key.clone());
                        self.store.add_or_update(svc.clone()).await;
                    }
                    new_owned.insert(obj_key, desired.into_keys().collect());
                }
                let all_old_keys: HashSet<ServiceKey> =
                    owned.values().flatten().cloned().collect();
                for stale in all_old_keys.difference(&all_new_keys) {
                    self.remove_if_still_kubernetes(stale).await;
                }
                *owned = new_owned;
                if !self.ingress_synced.swap(true, Ordering::SeqCst) {
                    self.synced_notify.notify_waiters();
                }
            }
        }
    }

    async fn apply_ingress_delta(
        &self,
        obj_key: &str,
        desired: HashMap<ServiceKey, Service>,
        owned: &mut HashMap<String, HashSet<ServiceKey>>,
    ) {
        for svc in desired.values() {
            self.store.add_or_update(svc.clone()).await;
        }
        let desired_keys: HashSet<ServiceKey> = desired.into_keys().collect();
        if let Some(previous) = owned.get(obj_key) {
            for stale in previous.difference(&desired_keys) {
                self.remove_if_still_kubernetes(stale).await;
            }
        }
        if desired_keys.is_empty() {
            owned.remove(obj_key);
        } else {
            owned.insert(obj_key.to_string(), desired_keys);
        }
    }

    /// Removes a discovered entry unless it has since been re-sourced
    /// to `config` (spec.md §4.2 step 3), which in this model can only
    /// mean a same-key config entry was never reachable (config
    /// services live under the reserved namespace), so this check is a
    /// defensive no-op matching the letter of the spec.
    async fn remove_if_still_kubernetes(&self, key: &ServiceKey) {
        if let Some(svc) = self.store.get(&key.0, &key.1).await {
            if svc.source == ServiceSource::Kubernetes {
                self.store.remove(&key.0, &key.1).await;
            }
        }
    }

    async fn run_endpoints(&self, api: Api<EndpointSlice>, cancellation: CancellationToken) {
        let stream = watcher(api, ListParams::default())
            .default_backoff()
            .take_until(cancellation.cancelled_owned());
        tokio::pin!(stream);

        let mut state: HashMap<ServiceKey, HashMap<String, (u32, u32)>> = HashMap::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => {
                    self.store.set_cluster_connected(true).await;
                    self.handle_endpoint_event(event, &mut state).await;
                }
                Err(e) => {
                    warn!(error = %e, "endpointslice watch error, backing off and retrying");
                    self.store.set_cluster_connected(false).await;
                }
            }
        }
        debug!("endpointslice watcher stopped");
    }

    async fn handle_endpoint_event(
        &self,
        event: Event<EndpointSlice>,
        state: &mut HashMap<ServiceKey, HashMap<String, (u32, u32)>>,
    ) {
        match event {
            Event::Applied(slice) => {
                if let Some((owner, slice_key, counts)) = slice_contribution(&slice) {
                    state.entry(owner.clone()).or_default().insert(slice_key, counts);
                    self.push_endpoint_totals(&owner, state).await;
                }
            }
            Event::Deleted(slice) => {
                if let Some((owner, slice_key, _)) = slice_contribution(&slice) {
                    if let Some(slices) = state.get_mut(&owner) {
                        slices.remove(&slice_key);
                    }
                    self.push_endpoint_totals(&owner, state).await;
                }
            }
            Event::Restarted(list) => {
                state.clear();
                let mut owners: HashSet<ServiceKey> = HashSet::new();
                for slice in &list {
                    if let Some((owner, slice_key, counts)) = slice_contribution(slice) {
                        state.entry(owner.clone()).or_default().insert(slice_key, counts);
                        owners.insert(owner);
                    }
                }
                for owner in owners {
                    self.push_endpoint_totals(&owner, state).await;
                }
                if !self.endpoints_synced.swap(true, Ordering::SeqCst) {
                    self.synced_notify.notify_waiters();
                }
            }
        }
    }

    async fn push_endpoint_totals(
        &self,
        owner: &ServiceKey,
        state: &HashMap<ServiceKey, HashMap<String, (u32, u32)>>,
    ) {
        let (ready, total) = state
            .get(owner)
            .map(|slices| slices.values().fold((0u32, 0u32), |(r, t), (sr, st)| (r + sr, t + st)))
            .unwrap_or((0, 0));
        self.store
            .update(&owner.0, &owner.1, move |svc| {
                svc.ready_endpoints = Some(ready);
                svc.total_endpoints = Some(total);
            })
            .await;
    }
}

fn ingress_object_key(ing: &Ingress) -> String {
    format!(
        "{}/{}",
        ing.metadata.namespace.as_deref().unwrap_or_default(),
        ing.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Synthesizes one `Service` per `(rule, backend.service)` pair in an
/// Ingress (spec.md §4.2 step 3). Backends that reference a custom
/// `resource` rather than a `service` are skipped — there is no service
/// name to key a dashboard entry on.
fn synthesize_services(ing: &Ingress) -> HashMap<ServiceKey, Service> {
    let mut out = HashMap::new();
    let namespace = match &ing.metadata.namespace {
        Some(ns) => ns.clone(),
        None => return out,
    };
    let spec = match &ing.spec {
        Some(s) => s,
        None => return out,
    };
    let tls_hosts: HashSet<&str> = spec
        .tls
        .iter()
        .flatten()
        .flat_map(|t| t.hosts.iter().flatten())
        .map(String::as_str)
        .collect();

    for rule in spec.rules.iter().flatten() {
        let Some(host) = &rule.host else { continue };
        let scheme = if tls_hosts.contains(host.as_str()) { "https" } else { "http" };
        let Some(http) = &rule.http else { continue };
        for path in &http.paths {
            let Some(backend_service) = &path.backend.service else { continue };
            let path_segment = path.path.as_deref().filter(|p| !p.is_empty() && *p != "/");
            let url = match path_segment {
                Some(p) => format!("{scheme}://{host}{p}"),
                None => format!("{scheme}://{host}"),
            };
            let key: ServiceKey = (namespace.clone(), backend_service.name.clone());
            out.insert(
                key.clone(),
                Service::new_kubernetes(namespace.clone(), backend_service.name.clone(), url),
            );
        }
    }
    out
}

/// Returns `(owning service key, slice identity, (ready, total))` for
/// an `EndpointSlice`, or `None` if it carries no service-name label
/// (spec.md §4.2 step 4: "For each EndpointSlice referencing a known
/// service").
fn slice_contribution(slice: &EndpointSlice) -> Option<(ServiceKey, String, (u32, u32))> {
    let namespace = slice.metadata.namespace.clone()?;
    let service_name = slice
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(ENDPOINTSLICE_SERVICE_LABEL))
        .cloned()?;
    let slice_key = format!(
        "{namespace}/{}",
        slice.metadata.name.as_deref().unwrap_or_default()
    );
    let total = slice.endpoints.len() as u32;
    let ready = slice
        .endpoints
        .iter()
        .filter(|ep| ep.conditions.as_ref().and_then(|c| c.ready).unwrap_or(true))
        .count() as u32;
    Some(((namespace, service_name), slice_key, (ready, total)))
}
