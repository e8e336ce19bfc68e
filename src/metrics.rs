use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry};

/// Prometheus metrics exposed on `/metrics`, generalized from the
/// teacher's single-controller `Metrics` struct (reconciliations,
/// failures, reconcile duration) to the dashboard's probe/journal/SSE
/// counters. Each instance owns its own `Registry` rather than
/// registering into `prometheus`'s process-global default registry, so
/// more than one `Metrics` can coexist (e.g. across tests) without a
/// duplicate-registration panic.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,
    pub probes_total: IntCounter,
    pub probe_failures_total: IntCounter,
    pub probe_duration_seconds: HistogramVec,
    pub reconciliations_total: IntCounter,
    pub journal_writes_total: IntCounter,
    pub journal_write_errors_total: IntCounter,
    pub sse_subscribers: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let probes_total = IntCounter::with_opts(Opts::new(
            "healthdash_probes_total",
            "Total number of HTTP health probes issued",
        ))
        .unwrap();
        let probe_failures_total = IntCounter::with_opts(Opts::new(
            "healthdash_probe_failures_total",
            "Total number of HTTP health probes that ended unhealthy or auth-blocked",
        ))
        .unwrap();
        let probe_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "healthdash_probe_duration_seconds",
                "Duration of a single HTTP health probe in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1., 2.5, 5., 10.]),
            &[],
        )
        .unwrap();
        let reconciliations_total = IntCounter::with_opts(Opts::new(
            "healthdash_config_reconciliations_total",
            "Total number of config hot-reload reconciliation passes",
        ))
        .unwrap();
        let journal_writes_total = IntCounter::with_opts(Opts::new(
            "healthdash_journal_writes_total",
            "Total number of transition records appended to the journal",
        ))
        .unwrap();
        let journal_write_errors_total = IntCounter::with_opts(Opts::new(
            "healthdash_journal_write_errors_total",
            "Total number of failed journal append attempts",
        ))
        .unwrap();
        let sse_subscribers = IntGauge::with_opts(Opts::new(
            "healthdash_sse_subscribers",
            "Current number of connected SSE subscribers",
        ))
        .unwrap();

        registry.register(Box::new(probes_total.clone())).unwrap();
        registry.register(Box::new(probe_failures_total.clone())).unwrap();
        registry.register(Box::new(probe_duration_seconds.clone())).unwrap();
        registry.register(Box::new(reconciliations_total.clone())).unwrap();
        registry.register(Box::new(journal_writes_total.clone())).unwrap();
        registry.register(Box::new(journal_write_errors_total.clone())).unwrap();
        registry.register(Box::new(sse_subscribers.clone())).unwrap();

        Metrics {
            registry,
            probes_total,
            probe_failures_total,
            probe_duration_seconds,
            reconciliations_total,
            journal_writes_total,
            journal_write_errors_total,
            sse_subscribers,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
