use prometheus::{CounterVec, HistogramVec, Opts, Registry};

/// Per-controller counters/histograms, labeled by `controller` so every
/// control loop can share one `prometheus::Registry`.
#[derive(Clone)]
pub struct ControllerMetrics {
    controller: &'static str,
    pub reconcile_counter: CounterVec,
    pub action_counter: CounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &'static str) -> Self {
        Self {
            controller,
            reconcile_counter: CounterVec::new(
                Opts::new(
                    "eno_reconcile_total",
                    "Total number of reconciliations per object.",
                ),
                &["controller", "name", "namespace"],
            )
            .unwrap(),
            action_counter: CounterVec::new(
                Opts::new("eno_action_total", "Total number of actions taken."),
                &["controller", "name", "namespace", "action"],
            )
            .unwrap(),
            read_histogram: HistogramVec::new(
                prometheus::HistogramOpts::new(
                    "eno_reconcile_read_seconds",
                    "Duration of the read phase of reconciliation.",
                ),
                &["controller", "name", "namespace", "action"],
            )
            .unwrap(),
            write_histogram: HistogramVec::new(
                prometheus::HistogramOpts::new(
                    "eno_reconcile_write_seconds",
                    "Duration of the write phase of reconciliation.",
                ),
                &["controller", "name", "namespace", "action"],
            )
            .unwrap(),
        }
    }

    pub fn register(&self, registry: &Registry) {
        registry
            .register(Box::new(self.reconcile_counter.clone()))
            .ok();
        registry
            .register(Box::new(self.action_counter.clone()))
            .ok();
        registry
            .register(Box::new(self.read_histogram.clone()))
            .ok();
        registry
            .register(Box::new(self.write_histogram.clone()))
            .ok();
    }

    pub fn record_reconcile(&self, name: &str, namespace: &str) {
        self.reconcile_counter
            .with_label_values(&[self.controller, name, namespace])
            .inc();
    }

    pub fn record_action(&self, name: &str, namespace: &str, action: &str) {
        self.action_counter
            .with_label_values(&[self.controller, name, namespace, action])
            .inc();
    }

    pub fn observe_read(&self, name: &str, namespace: &str, action: &str, seconds: f64) {
        self.read_histogram
            .with_label_values(&[self.controller, name, namespace, action])
            .observe(seconds);
    }

    pub fn start_write_timer(
        &self,
        name: &str,
        namespace: &str,
        action: &str,
    ) -> prometheus::HistogramTimer {
        self.write_histogram
            .with_label_values(&[self.controller, name, namespace, action])
            .start_timer()
    }
}
