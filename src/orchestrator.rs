//! Startup & shutdown orchestrator (spec.md §4.7). Wires the store,
//! cluster watcher, config loader/hot-reloader, journal, health
//! checker, pruner and SSE broker together in the order the spec
//! mandates, and tears them down via a `CancellationToken` tree on
//! signal — generalized from the teacher's `(Operator, controller)`
//! two-future `tokio::select!` in `main.rs` to a ten-step sequence with
//! a graceful-drain shutdown phase.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{middleware, web, App, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{self, BrokerState};
use crate::checker::HealthChecker;
use crate::config::AppConfig;
use crate::error::{Error, WatcherError};
use crate::journal::{self, Journal};
use crate::metrics::Metrics;
use crate::reload;
use crate::service_config::{self, ConfigManager};
use crate::store::ServiceStore;
use crate::watcher::ClusterWatcher;

/// Bound on how long the orchestrator waits for the cluster watcher's
/// initial list before applying overrides anyway (spec.md §4.7 step 4).
const WATCHER_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    config: AppConfig,
}

impl Orchestrator {
    pub fn new(config: AppConfig) -> Self {
        Orchestrator { config }
    }

    /// Runs until a shutdown signal (`SIGTERM`/`SIGINT`) arrives, then
    /// drains in the order spec.md §4.7 "Shutdown sequence" specifies.
    pub async fn run(self) -> Result<(), Error> {
        let metrics = Metrics::new();
        let store = ServiceStore::new();
        let root_cancel = CancellationToken::new();

        // Step 3: load config, register `source=config` services,
        // publish configErrors, and apply whatever overrides already
        // have a matching kubernetes service.
        let (cfg, errors) = service_config::load_file(&self.config.config_path)?;
        let manager = Arc::new(ConfigManager::new(store.clone()));
        if let Some(cfg) = cfg {
            manager.apply_initial(cfg).await;
        }
        store.set_config_errors(errors).await;

        // Step 4: launch the cluster watcher. A kubeconfig path that
        // does not exist at all is fatal at startup (spec.md §6 "Exit
        // codes"); a kubeconfig that exists but fails to parse is only
        // a warning handled inside `ClusterWatcher::run`.
        if !self.config.kubeconfig_path.exists() {
            return Err(Error::Watcher(WatcherError::CredentialsMissing(
                self.config.kubeconfig_path.display().to_string(),
            )));
        }
        let cluster_watcher = ClusterWatcher::new(self.config.kubeconfig_path.clone(), store.clone());
        let watcher_cancel = root_cancel.child_token();
        {
            let watcher = cluster_watcher.clone();
            let cancel = watcher_cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = watcher.run(cancel).await {
                    error!(error = %e, "cluster watcher terminated");
                }
            });
        }
        let synced = tokio::time::timeout(WATCHER_SYNC_TIMEOUT, cluster_watcher.wait_for_sync())
            .await
            .unwrap_or(false);
        if !synced {
            warn!("cluster watcher did not finish its initial sync within 5s, applying overrides anyway");
        }
        manager.apply_overrides().await;

        // Step 5: open the journal, restore history, install the
        // pending-apply subscriber for keys not yet in the store.
        let journal = Arc::new(Journal::open(&self.config.journal_path).await?);
        let pending = journal.restore_history(&store).await?;
        let pending = Arc::new(tokio::sync::Mutex::new(pending));
        let pending_cancel = root_cancel.child_token();
        tokio::spawn(journal::run_pending_apply(pending, store.clone(), pending_cancel));

        // Step 6: launch the config hot-reloader.
        let reload_cancel = root_cancel.child_token();
        tokio::spawn(reload::run(
            self.config.config_path.clone(),
            store.clone(),
            manager.clone(),
            metrics.clone(),
            reload_cancel,
        ));

        // Step 7: the SSE broker has no standalone task of its own —
        // each connection drives its own subscription (spec.md §4.6
        // "Broker lifecycle": "implementer's choice"). Registered on
        // the mux at step 10.

        // Step 8: launch the health checker.
        let checker = Arc::new(HealthChecker::new(
            store.clone(),
            journal.clone(),
            self.config.probe_interval,
            metrics.clone(),
        )?);
        let checker_cancel = root_cancel.child_token();
        {
            let checker = checker.clone();
            tokio::spawn(async move { checker.run(checker_cancel).await });
        }

        // Step 9: launch the retention pruner.
        let pruner_cancel = root_cancel.child_token();
        {
            let journal = journal.clone();
            let retention_days = manager.current().await.history.retention_days;
            tokio::spawn(async move { journal.run_pruner(retention_days, pruner_cancel).await });
        }

        // Step 10: bind the HTTP listener with the SSE endpoint plus
        // the ambient `/health` and `/metrics` surfaces the teacher
        // crate already exposes (spec.md SPEC_FULL.md §6).
        let broker_state = web::Data::new(BrokerState {
            store: store.clone(),
            metrics: metrics.clone(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            health_check_interval_ms: self.config.probe_interval.as_millis() as u64,
            keepalive_interval: self.config.sse_keepalive_interval,
        });
        let metrics_data = web::Data::new(metrics.clone());

        let server = HttpServer::new(move || {
            App::new()
                .app_data(broker_state.clone())
                .app_data(metrics_data.clone())
                .wrap(middleware::Logger::default().exclude("/health"))
                .route("/api/events", web::get().to(broker::serve))
                .route("/health", web::get().to(health_handler))
                .route("/metrics", web::get().to(metrics_handler))
        })
        .bind(self.config.listen_addr)
        .map_err(Error::Io)?
        .shutdown_timeout(10)
        .run();

        let server_handle = server.handle();
        let mut server_task = tokio::spawn(server);

        let server_already_exited = tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received, draining");
                false
            }
            res = &mut server_task => {
                match res {
                    Ok(Ok(())) => info!("http server exited on its own"),
                    Ok(Err(e)) => error!(error = %e, "http server exited with error"),
                    Err(e) => error!(error = %e, "http server task panicked"),
                }
                true
            }
        };

        // Shutdown sequence (spec.md §4.7):
        // 1. Cancel the watcher context.
        watcher_cancel.cancel();
        // 2. Gracefully stop the HTTP listener with a 10s drain.
        server_handle.stop(true).await;
        if !server_already_exited {
            let _ = server_task.await;
        }
        // 3. Cancel remaining contexts; close the journal writer.
        root_cancel.cancel();
        journal.close().await;
        store.shutdown().await;

        Ok(())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler, only SIGINT will trigger shutdown");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn health_handler() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({"status": "healthy"}))
}

async fn metrics_handler(metrics: web::Data<Metrics>) -> impl Responder {
    let families = metrics.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        return HttpResponse::InternalServerError().body(format!("failed to encode metrics: {e}"));
    }
    HttpResponse::Ok().content_type(encoder.format_type()).body(buffer)
}
