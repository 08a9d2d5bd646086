//! Prometheus metrics for launch orchestration.
//!
//! Compiled behind the `metrics` feature. Counters are recorded through the
//! helpers in [`crate::telemetry`]; the handler itself keeps only
//! per-instance state.
//!
//! # Metrics
//!
//! - `petrel_messages_received_total{delivery}` - inbound launch deliveries
//! - `petrel_redeliveries_absorbed_total` - duplicates suppressed by dedup
//! - `petrel_processes_finished_total{outcome}` - terminal process states
#![cfg(feature = "metrics")]

use std::sync::LazyLock;

use prometheus::{CounterVec, Opts, Registry};

/// Global Prometheus registry for petrel metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for inbound launch deliveries.
///
/// Labels:
/// - `delivery`: `first` or `redelivered`
pub static MESSAGES_RECEIVED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "petrel_messages_received_total",
        "Total inbound launch deliveries",
    );
    CounterVec::new(opts, &["delivery"])
        .expect("petrel_messages_received_total metric creation failed")
});

/// Counter for redeliveries absorbed by the ownership check.
pub static REDELIVERIES_ABSORBED_TOTAL: LazyLock<prometheus::Counter> = LazyLock::new(|| {
    prometheus::Counter::new(
        "petrel_redeliveries_absorbed_total",
        "Total redeliveries suppressed without a second pipeline run",
    )
    .expect("petrel_redeliveries_absorbed_total metric creation failed")
});

/// Counter for processes reaching a terminal state.
///
/// Labels:
/// - `outcome`: `completed`, `failed` or `canceled`
pub static PROCESSES_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "petrel_processes_finished_total",
        "Total processes reaching a terminal state",
    );
    CounterVec::new(opts, &["outcome"])
        .expect("petrel_processes_finished_total metric creation failed")
});

/// Register all petrel metrics with the global registry. Call once at
/// startup; double registration returns an error from prometheus.
pub fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_RECEIVED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REDELIVERIES_ABSORBED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROCESSES_FINISHED_TOTAL.clone()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_record() {
        MESSAGES_RECEIVED_TOTAL.with_label_values(&["first"]).inc();
        REDELIVERIES_ABSORBED_TOTAL.inc();
        PROCESSES_FINISHED_TOTAL
            .with_label_values(&["completed"])
            .inc();
        assert!(REDELIVERIES_ABSORBED_TOTAL.get() >= 1.0);
    }
}
