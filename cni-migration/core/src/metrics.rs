use prometheus_client::{metrics::counter::Counter, registry::Registry};

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    reconciles: Counter,
    failures: Counter,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "reconciles",
            "Count of reconciliations that completed without error",
            metrics.reconciles.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Count of reconciliations that returned an error",
            metrics.failures.clone(),
        );
        metrics
    }

    pub fn reconciled(&self) {
        self.reconciles.inc();
    }

    pub fn failed(&self) {
        self.failures.inc();
    }
}
