//! SSE broker (spec.md §4.6). One `actix-web` streaming handler per
//! subscriber connection: subscribes to the store before serializing
//! the snapshot (closing the window where a concurrent mutation
//! between snapshot and subscribe would otherwise be lost), writes the
//! initial `state` event, then multiplexes the subscriber's delivery
//! channel against a keepalive timer until the client disconnects.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpResponse, Responder};
use async_stream::stream;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::metrics::Metrics;
use crate::store::ServiceStore;
use crate::types::{Event, Service};

#[derive(Clone)]
pub struct BrokerState {
    pub store: ServiceStore,
    pub metrics: Metrics,
    pub app_version: String,
    pub health_check_interval_ms: u64,
    pub keepalive_interval: Duration,
}

/// Subscriber-visible projection of the store snapshot (spec.md §4.6
/// step 2). Carries every §3 attribute of each service; `Service`'s one
/// internal field (`override_backup`) is already `#[serde(skip)]`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatePayload<'a> {
    app_version: &'a str,
    services: &'a [Service],
    cluster_connected: bool,
    last_cluster_event: Option<DateTime<Utc>>,
    health_check_interval_ms: u64,
    config_errors: &'a [String],
}

#[derive(Serialize)]
struct RemovedPayload<'a> {
    namespace: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterStatusPayload {
    connected: bool,
    last_cluster_event: Option<DateTime<Utc>>,
}

/// Frames one SSE event per spec.md §4.6 wire format: `event:
/// <type>\ndata: <json>\n\n`.
fn frame(event_type: &str, payload: &impl Serialize) -> String {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "null".to_string());
    format!("event: {event_type}\ndata: {data}\n\n")
}

fn state_frame(state: &BrokerState, snapshot: &crate::types::Snapshot) -> String {
    frame(
        "state",
        &StatePayload {
            app_version: &state.app_version,
            services: &snapshot.services,
            cluster_connected: snapshot.cluster_connected,
            last_cluster_event: snapshot.last_cluster_event,
            health_check_interval_ms: state.health_check_interval_ms,
            config_errors: &snapshot.config_errors,
        },
    )
}

/// Drops the subscriber on the store the moment the client's stream is
/// torn down (normal completion or, more commonly, the subscriber
/// dropping the connection mid-stream, which simply stops polling the
/// generator without running the code after its last `yield`).
struct SubscriptionGuard {
    store: ServiceStore,
    id: u64,
    metrics: Metrics,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.metrics.sse_subscribers.dec();
        let store = self.store.clone();
        let id = self.id;
        tokio::spawn(async move {
            store.unsubscribe(id).await;
        });
    }
}

/// `GET /api/events` handler.
pub async fn serve(state: web::Data<BrokerState>) -> impl Responder {
    let state = state.get_ref().clone();
    let (id, mut rx, snapshot) = state.store.subscribe_with_snapshot().await;
    state.metrics.sse_subscribers.inc();
    let guard = Arc::new(SubscriptionGuard { store: state.store.clone(), id, metrics: state.metrics.clone() });

    let body = stream! {
        let _guard = guard;
        yield Ok::<_, actix_web::Error>(web::Bytes::from(state_frame(&state, &snapshot)));

        let mut keepalive_deadline = Instant::now() + state.keepalive_interval;
        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(event) = received else {
                        debug!("sse subscriber channel closed, ending stream");
                        break;
                    };
                    if let Some(rendered) = render_event(&event, &state).await {
                        yield Ok(web::Bytes::from(rendered));
                        keepalive_deadline = Instant::now() + state.keepalive_interval;
                    }
                }
                _ = tokio::time::sleep_until(keepalive_deadline) => {
                    yield Ok(web::Bytes::from(":keepalive\n\n".to_string()));
                    keepalive_deadline = Instant::now() + state.keepalive_interval;
                }
            }
        }
    };

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("Connection", "keep-alive"))
        .streaming(body)
}

async fn render_event(event: &Event, state: &BrokerState) -> Option<String> {
    match event {
        Event::Discovered(svc) => Some(frame("discovered", svc)),
        Event::Updated(svc) => Some(frame("update", svc)),
        Event::Removed((namespace, name)) => {
            Some(frame("removed", &RemovedPayload { namespace, name }))
        }
        Event::ClusterStatus { connected, last_event } => Some(frame(
            "clusterStatus",
            &ClusterStatusPayload { connected: *connected, last_cluster_event: *last_event },
        )),
        // A refreshed full `state` event, since `configErrors` lives on
        // the snapshot rather than on any single service (spec.md §4.6
        // step 3: "a refreshed `state` for `ConfigErrorsChanged`").
        Event::ConfigErrorsChanged(_) => {
            let snapshot = state.store.snapshot().await;
            Some(state_frame(state, &snapshot))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Service, ServiceSource, Status};
    use actix_web::{test, App};

    fn test_state(store: ServiceStore) -> web::Data<BrokerState> {
        web::Data::new(BrokerState {
            store,
            metrics: Metrics::new(),
            app_version: "test".to_string(),
            health_check_interval_ms: 30_000,
            keepalive_interval: Duration::from_millis(50),
        })
    }

    #[actix_web::test]
    async fn response_carries_sse_headers() {
        // The handler's body stream never completes on its own (it runs
        // until the client disconnects), so this only drives the
        // handler far enough to inspect headers, never the body.
        let store = ServiceStore::new();
        let app = test::init_service(
            App::new().app_data(test_state(store)).route("/api/events", web::get().to(serve)),
        )
        .await;
        let req = test::TestRequest::get().uri("/api/events").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/event-stream");
        assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");
        assert_eq!(resp.headers().get("connection").unwrap(), "keep-alive");
    }

    #[tokio::test]
    async fn state_frame_carries_the_full_snapshot() {
        let mut svc = Service::new_config("nas".into(), "nas".into(), "https://nas.local".into());
        svc.source = ServiceSource::Config;
        svc.status = Status::Healthy;
        svc.http_code = Some(200);
        let snapshot = crate::types::Snapshot {
            services: vec![svc],
            cluster_connected: false,
            last_cluster_event: None,
            config_errors: vec![],
        };
        let state = test_state(ServiceStore::new());
        let text = state_frame(state.get_ref(), &snapshot);
        assert!(text.starts_with("event: state\ndata: "));
        assert!(text.contains("\"namespace\":\"config\""));
        assert!(text.contains("\"httpCode\":200"));
        assert!(text.contains("\"appVersion\":\"test\""));
        assert!(text.contains("\"clusterConnected\":false"));
        assert!(text.contains("\"healthCheckIntervalMs\":30000"));
        assert!(text.contains("\"configErrors\":[]"));
        assert!(!text.contains("app_version"));
        assert!(!text.contains("cluster_connected"));
        assert!(text.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn removed_event_frames_identity_only() {
        let payload = RemovedPayload { namespace: "default", name: "web" };
        let framed = frame("removed", &payload);
        assert_eq!(framed, "event: removed\ndata: {\"namespace\":\"default\",\"name\":\"web\"}\n\n");
    }
}
