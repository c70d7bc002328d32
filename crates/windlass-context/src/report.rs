//! Request correlation and selection diagnostics

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Identifier threaded explicitly through sizing and selection so that every
/// log line and report can be correlated with the originating request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Diagnostic record of one selection run.
///
/// Deltas are signed: inserting a skip marker can make the output one
/// message longer than the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionReport {
    pub request_id: RequestId,
    pub window_size: usize,
    pub original_messages: usize,
    pub final_messages: usize,
    pub messages_removed: i64,
    pub original_tokens: usize,
    pub final_tokens: usize,
    pub tokens_removed: i64,
    /// Final tokens as a fraction of the window
    pub utilization: f64,
    pub intermediates_total: usize,
    pub intermediates_kept: usize,
    pub skip_marker: bool,
    pub truncated: bool,
    /// The final prompt is larger than the window; the result is best effort
    pub budget_exceeded: bool,
    /// Skip markers found away from the opener position and dropped
    #[serde(default)]
    pub stray_markers: usize,
}

impl SelectionReport {
    pub fn to_log_string(&self) -> String {
        format!(
            "request {}: {} -> {} messages, {} -> {} tokens ({:.0}% of {})",
            self.request_id,
            self.original_messages,
            self.final_messages,
            self.original_tokens,
            self.final_tokens,
            self.utilization * 100.0,
            self.window_size,
        )
    }
}

pub(crate) fn signed_delta(before: usize, after: usize) -> i64 {
    let before = i64::try_from(before).unwrap_or(i64::MAX);
    let after = i64::try_from(after).unwrap_or(i64::MAX);
    before.saturating_sub(after)
}

/// Receives the report of every finished selection
pub trait ReportSink: Send + Sync {
    fn report(&self, report: &SelectionReport);
}

/// Emits reports as structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn report(&self, report: &SelectionReport) {
        if report.budget_exceeded {
            warn!(
                request_id = %report.request_id,
                final_tokens = report.final_tokens,
                window_size = report.window_size,
                "Selection exceeds context window"
            );
        }
        info!(
            request_id = %report.request_id,
            original_messages = report.original_messages,
            final_messages = report.final_messages,
            messages_removed = report.messages_removed,
            original_tokens = report.original_tokens,
            final_tokens = report.final_tokens,
            tokens_removed = report.tokens_removed,
            window_size = report.window_size,
            truncated = report.truncated,
            stray_markers = report.stray_markers,
            utilization = report.utilization,
            "Post-truncation summary"
        );
    }
}

/// Discards reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ReportSink for NoopSink {
    fn report(&self, _report: &SelectionReport) {}
}
