//! Prometheus metrics for context selection
//!
//! Enabled with the `metrics` feature. Attach [`PrometheusSink`] to a
//! `MessageSelector` to record every selection.

use lazy_static::lazy_static;
use prometheus::{register_counter, register_histogram, Counter, Histogram};

use crate::report::{ReportSink, SelectionReport};

lazy_static! {
    /// Selections performed
    pub static ref SELECTIONS_TOTAL: Counter =
        register_counter!("windlass_selections_total", "Total message selections performed").unwrap();

    /// Selections that dropped intermediate history
    pub static ref TRUNCATIONS_TOTAL: Counter =
        register_counter!("windlass_truncations_total", "Selections that elided history").unwrap();

    /// Selections whose final prompt exceeded the window
    pub static ref BUDGET_EXCEEDED_TOTAL: Counter =
        register_counter!("windlass_budget_exceeded_total", "Selections exceeding the window").unwrap();

    /// Tokens removed per selection
    pub static ref TOKENS_REMOVED: Histogram = register_histogram!(
        "windlass_tokens_removed",
        "Tokens removed by selection",
        vec![0.0, 64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0]
    ).unwrap();

    /// Window utilization of the selected prompt
    pub static ref WINDOW_UTILIZATION: Histogram = register_histogram!(
        "windlass_window_utilization_ratio",
        "Final prompt tokens as a fraction of the window",
        vec![0.1, 0.25, 0.5, 0.75, 0.9, 0.95, 1.0, 1.5]
    ).unwrap();
}

/// Records selection reports into the process-wide Prometheus registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

impl ReportSink for PrometheusSink {
    fn report(&self, report: &SelectionReport) {
        SELECTIONS_TOTAL.inc();
        if report.truncated {
            TRUNCATIONS_TOTAL.inc();
        }
        if report.budget_exceeded {
            BUDGET_EXCEEDED_TOTAL.inc();
        }
        TOKENS_REMOVED.observe(report.tokens_removed.max(0) as f64);
        WINDOW_UTILIZATION.observe(report.utilization);
    }
}

/// Encode all registered metrics in the Prometheus text format.
pub fn gather() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
