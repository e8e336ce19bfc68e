//! Periodic HTTP health checker (spec.md §4.4): one concurrent probe
//! per service per cycle, composite fusion via the pure `fusion::fuse`
//! function, and a write-back into the store plus the transition
//! journal when status changes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Error;
use crate::fusion;
use crate::journal::Journal;
use crate::metrics::Metrics;
use crate::store::ServiceStore;
use crate::types::{first_line_snippet, Service, Status, TransitionRecord};

/// Per-request timeout (spec.md §5 "a sane per-request timeout (≤10s)").
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HealthChecker {
    store: ServiceStore,
    journal: Arc<Journal>,
    client: reqwest::Client,
    interval: Duration,
    metrics: Metrics,
}

impl HealthChecker {
    /// `interval` must already satisfy the ≥1s floor (spec.md §4.4);
    /// that validation happens once, at config load time.
    pub fn new(
        store: ServiceStore,
        journal: Arc<Journal>,
        interval: Duration,
        metrics: Metrics,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(PROBE_TIMEOUT)
            .build()?;
        Ok(HealthChecker { store, journal, client, interval, metrics })
    }

    /// Runs one immediate cycle, then one every `interval` until
    /// `cancellation` fires. A cycle that runs long does not delay the
    /// next tick beyond "whichever is later" (spec.md §9 open
    /// question), realized here by sleeping only after the cycle
    /// completes rather than on a fixed-phase ticker.
    pub async fn run(&self, cancellation: CancellationToken) {
        loop {
            self.run_cycle().await;
            tokio::select! {
                _ = cancellation.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn run_cycle(&self) {
        let services = self.store.all().await;
        let probes = services.into_iter().map(|svc| self.probe_one(svc));
        join_all(probes).await;
    }

    async fn probe_one(&self, svc: Service) {
        let target = svc.health_url.clone().unwrap_or_else(|| svc.url.clone());
        let start = Instant::now();
        let outcome = self.client.get(&target).send().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        self.metrics.probes_total.inc();
        self.metrics.probe_duration_seconds.with_label_values(&[]).observe(start.elapsed().as_secs_f64());

        let (mut status, http_code, mut error_snippet) = match outcome {
            Err(e) => (Status::Unhealthy, None, Some(first_line_snippet(&e.to_string()))),
            Ok(resp) => classify_response(resp).await,
        };

        if !svc.expected_status_codes.is_empty() {
            if let Some(code) = http_code {
                if svc.expected_status_codes.contains(&code) {
                    status = Status::Healthy;
                    error_snippet = None;
                }
            }
        }

        if matches!(status, Status::Unhealthy | Status::AuthBlocked) {
            self.metrics.probe_failures_total.inc();
        }

        let readiness = match (svc.ready_endpoints, svc.total_endpoints) {
            (Some(ready), Some(total)) => Some((ready, total)),
            _ => None,
        };
        let (composite_status, auth_guarded) = fusion::fuse(status, readiness);

        let key = svc.key();
        let prev_status = svc.status;
        let transitioned = status != prev_status;
        let now = Utc::now();

        // Avoided if the service was removed between snapshot and
        // write-back (spec.md §4.4 "avoid zombie resurrection").
        let applied = self
            .store
            .update(&key.0, &key.1, move |s| {
                s.status = status;
                s.composite_status = composite_status;
                s.auth_guarded = auth_guarded;
                s.http_code = http_code;
                s.response_time_ms = Some(elapsed_ms);
                s.error_snippet = error_snippet;
                s.last_checked = Some(now);
                if transitioned {
                    s.last_state_change = Some(now);
                }
            })
            .await;

        if applied && transitioned {
            let record = TransitionRecord {
                ts: now,
                svc: format!("{}/{}", key.0, key.1),
                prev: prev_status,
                next: status,
                code: http_code,
                ms: Some(elapsed_ms),
            };
            match self.journal.record(&record).await {
                Ok(()) => self.metrics.journal_writes_total.inc(),
                Err(e) => {
                    self.metrics.journal_write_errors_total.inc();
                    warn!(error = %e, svc = %record.svc, "failed to write transition record, store update still applied");
                }
            }
        }
    }
}

/// Classifies a successful HTTP response into `(status, httpCode,
/// errorSnippet)`. 2xx is healthy, 401/403 is authBlocked, anything
/// else is unhealthy with a truncated first-line body snippet.
async fn classify_response(resp: reqwest::Response) -> (Status, Option<u16>, Option<String>) {
    let code = resp.status().as_u16();
    if (200..300).contains(&code) {
        (Status::Healthy, Some(code), None)
    } else if code == 401 || code == 403 {
        (Status::AuthBlocked, Some(code), None)
    } else {
        let body = resp.text().await.unwrap_or_default();
        (Status::Unhealthy, Some(code), Some(first_line_snippet(&body)))
    }
}
