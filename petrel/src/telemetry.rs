//! Tracing spans and metric recording for the launch lifecycle.
//!
//! Span constructors are plain helpers so call sites stay uniform; the
//! `record_*` functions additionally feed the Prometheus counters when the
//! `metrics` feature is enabled and are no-ops otherwise.

use tracing::{Span, info_span};

/// Span covering the handling of one launch delivery.
#[must_use]
pub fn launch_span(process_id: &str, experiment_id: &str, redelivered: bool) -> Span {
    info_span!(
        "petrel.launch",
        process_id = %process_id,
        experiment_id = %experiment_id,
        redelivered,
    )
}

/// Span covering one pipeline stage of a process.
#[must_use]
pub fn stage_span(process_id: &str, stage: &str) -> Span {
    info_span!(
        "petrel.stage",
        process_id = %process_id,
        stage = %stage,
    )
}

/// Count an inbound delivery.
pub fn record_message_received(redelivered: bool) {
    #[cfg(feature = "metrics")]
    {
        let delivery = if redelivered { "redelivered" } else { "first" };
        crate::metrics::MESSAGES_RECEIVED_TOTAL
            .with_label_values(&[delivery])
            .inc();
    }
    #[cfg(not(feature = "metrics"))]
    let _ = redelivered;
}

/// Count a redelivery suppressed by the ownership check.
pub fn record_redelivery_absorbed() {
    #[cfg(feature = "metrics")]
    crate::metrics::REDELIVERIES_ABSORBED_TOTAL.inc();
}

/// Count a process reaching a terminal state.
pub fn record_process_finished(outcome: &str) {
    #[cfg(feature = "metrics")]
    crate::metrics::PROCESSES_FINISHED_TOTAL
        .with_label_values(&[outcome])
        .inc();
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}
