//! Message-aware truncation
//!
//! Fits a conversation into a token window while keeping it coherent:
//! - every system message, moved to the front in original order
//! - the first non-system message (the conversation opener)
//! - the final message (the turn being answered)
//! - as many of the most recent intermediate messages as fit, contiguous
//!
//! When intermediates are dropped a single skip marker follows the opener.
//! Messages are tracked by their position in the original conversation, never
//! by value, so duplicate contents cannot confuse the anchors.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Instrument};
use windlass_protocol::{ImageData, Message};

use crate::error::ContextResult;
use crate::oracle::MeasurementOracle;
use crate::report::{signed_delta, NoopSink, ReportSink, RequestId, SelectionReport, TracingSink};

/// A candidate entry: a position in the original conversation or a freshly
/// inserted skip marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    At(usize),
    Marker,
}

/// Positions of the structural parts of a conversation.
#[derive(Debug, Default)]
struct Layout {
    system: Vec<usize>,
    first: Option<usize>,
    /// A skip marker left directly after the opener by an earlier selection
    marker: Option<usize>,
    intermediates: Vec<usize>,
    /// Absent when the opener is also the final message
    latest: Option<usize>,
    stray_markers: usize,
}

impl Layout {
    fn of(conversation: &[Message]) -> Self {
        let mut layout = Self::default();
        let mut track = Vec::new();

        for (index, message) in conversation.iter().enumerate() {
            if message.is_skip_marker() {
                if track.len() == 1 && layout.marker.is_none() {
                    layout.marker = Some(index);
                } else {
                    layout.stray_markers += 1;
                }
            } else if message.is_system() {
                layout.system.push(index);
            } else {
                track.push(index);
            }
        }

        layout.first = track.first().copied();
        if track.len() > 1 {
            layout.latest = track.last().copied();
        }
        if track.len() > 2 {
            layout.intermediates = track[1..track.len() - 1].to_vec();
        }
        layout
    }

    /// System block, opener, optional marker, `kept` intermediates, final message.
    fn candidate(&self, with_marker: bool, kept: &[usize]) -> Vec<Slot> {
        let mut slots = Vec::with_capacity(self.system.len() + kept.len() + 3);
        slots.extend(self.system.iter().copied().map(Slot::At));
        if let Some(first) = self.first {
            slots.push(Slot::At(first));
            if with_marker {
                slots.push(self.marker.map_or(Slot::Marker, Slot::At));
            }
        }
        slots.extend(kept.iter().copied().map(Slot::At));
        if let Some(latest) = self.latest {
            slots.push(Slot::At(latest));
        }
        slots
    }
}

/// Oracle costs memoised for the duration of one selection call.
struct CostCache<'s, 'o> {
    oracle: &'s MeasurementOracle<'o>,
    conversation: &'s [Message],
    marker: Message,
    costs: HashMap<Vec<Slot>, usize>,
    oracle_calls: usize,
}

impl<'s, 'o> CostCache<'s, 'o> {
    fn new(oracle: &'s MeasurementOracle<'o>, conversation: &'s [Message]) -> Self {
        Self {
            oracle,
            conversation,
            marker: Message::skip_marker(),
            costs: HashMap::new(),
            oracle_calls: 0,
        }
    }

    fn resolve(&self, slot: Slot) -> &Message {
        match slot {
            Slot::At(index) => &self.conversation[index],
            Slot::Marker => &self.marker,
        }
    }

    async fn cost(&mut self, slots: &[Slot]) -> ContextResult<usize> {
        if let Some(&cost) = self.costs.get(slots) {
            return Ok(cost);
        }
        let cost = {
            let messages: Vec<&Message> = slots.iter().map(|&s| self.resolve(s)).collect();
            self.oracle.cost_as_prompt(&messages).await?
        };
        self.oracle_calls += 1;
        self.costs.insert(slots.to_vec(), cost);
        Ok(cost)
    }
}

/// The slots chosen for output and how they were chosen.
struct Plan {
    slots: Vec<Slot>,
    kept: usize,
    truncated: bool,
    budget_exceeded: bool,
}

/// Output of a selection run.
#[derive(Debug, Clone)]
pub struct SelectionResult {
    /// Selected messages in prompt order, image tags already inserted
    pub messages: Vec<Message>,
    /// The rendered prompt handed to the model
    pub prompt: String,
    /// Image payloads referenced by the tags, indexed by tag id
    pub images: Vec<ImageData>,
    /// Counters describing this run
    pub report: SelectionReport,
}

impl SelectionResult {
    /// The selected prompt is larger than the window.
    pub fn budget_exceeded(&self) -> bool {
        self.report.budget_exceeded
    }
}

/// Selects the messages of a conversation that fit a token window.
///
/// Every finished run is handed to the configured [`ReportSink`].
#[derive(Clone)]
pub struct MessageSelector {
    sink: Arc<dyn ReportSink>,
}

impl Default for MessageSelector {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl std::fmt::Debug for MessageSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSelector").finish_non_exhaustive()
    }
}

impl MessageSelector {
    pub fn new(sink: Arc<dyn ReportSink>) -> Self {
        Self { sink }
    }

    pub fn silent() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    pub async fn select(
        &self,
        request_id: RequestId,
        conversation: &[Message],
        window_size: usize,
        oracle: &MeasurementOracle<'_>,
    ) -> ContextResult<SelectionResult> {
        let span = info_span!("select_messages", %request_id, window_size);
        let result = select_inner(request_id, conversation, window_size, oracle)
            .instrument(span)
            .await?;
        self.sink.report(&result.report);
        Ok(result)
    }
}

/// Selects with the default tracing report sink.
pub async fn select_messages(
    request_id: RequestId,
    conversation: &[Message],
    window_size: usize,
    oracle: &MeasurementOracle<'_>,
) -> ContextResult<SelectionResult> {
    MessageSelector::default()
        .select(request_id, conversation, window_size, oracle)
        .await
}

async fn select_inner(
    request_id: RequestId,
    conversation: &[Message],
    window_size: usize,
    oracle: &MeasurementOracle<'_>,
) -> ContextResult<SelectionResult> {
    oracle.image_policy().validate(conversation)?;

    if conversation.is_empty() {
        return Ok(SelectionResult {
            messages: Vec::new(),
            prompt: String::new(),
            images: Vec::new(),
            report: SelectionReport {
                request_id,
                window_size,
                original_messages: 0,
                final_messages: 0,
                messages_removed: 0,
                original_tokens: 0,
                final_tokens: 0,
                tokens_removed: 0,
                utilization: 0.0,
                intermediates_total: 0,
                intermediates_kept: 0,
                skip_marker: false,
                truncated: false,
                budget_exceeded: false,
                stray_markers: 0,
            },
        });
    }

    let layout = Layout::of(conversation);
    if layout.stray_markers > 0 {
        debug!(
            stray_markers = layout.stray_markers,
            "Dropping skip markers outside the opener position"
        );
    }

    let mut costs = CostCache::new(oracle, conversation);
    let original: Vec<Slot> = (0..conversation.len()).map(Slot::At).collect();
    let original_tokens = costs.cost(&original).await?;

    let plan = plan(&layout, &mut costs, window_size).await?;

    let mut messages: Vec<Message> = plan
        .slots
        .iter()
        .map(|&slot| costs.resolve(slot).clone())
        .collect();
    let skip_marker = messages.iter().any(Message::is_skip_marker);

    let images = oracle.image_policy().attach(&mut messages);
    let refs: Vec<&Message> = messages.iter().collect();
    let prompt = oracle.render(&refs)?;
    let final_tokens =
        oracle.count_text(&prompt).await? + oracle.image_policy().surcharge(refs.iter().copied());

    debug!(
        tokenizer = oracle.tokenizer_name(),
        oracle_calls = costs.oracle_calls,
        cached_candidates = costs.costs.len(),
        "Selection measured"
    );

    let report = SelectionReport {
        request_id,
        window_size,
        original_messages: conversation.len(),
        final_messages: messages.len(),
        messages_removed: signed_delta(conversation.len(), messages.len()),
        original_tokens,
        final_tokens,
        tokens_removed: signed_delta(original_tokens, final_tokens),
        utilization: final_tokens as f64 / window_size.max(1) as f64,
        intermediates_total: layout.intermediates.len(),
        intermediates_kept: plan.kept,
        skip_marker,
        truncated: plan.truncated,
        budget_exceeded: plan.budget_exceeded || final_tokens > window_size,
        stray_markers: layout.stray_markers,
    };

    Ok(SelectionResult {
        messages,
        prompt,
        images,
        report,
    })
}

async fn plan(
    layout: &Layout,
    costs: &mut CostCache<'_, '_>,
    window_size: usize,
) -> ContextResult<Plan> {
    let total = layout.intermediates.len();
    let full = layout.candidate(layout.marker.is_some(), &layout.intermediates);
    let full_tokens = costs.cost(&full).await?;

    info!(
        total_tokens = full_tokens,
        window_size,
        exceeds_limit = full_tokens > window_size,
        "Context size check before truncation"
    );

    if full_tokens <= window_size {
        info!(intermediate_messages = total, "No truncation required");
        return Ok(Plan {
            slots: full,
            kept: total,
            truncated: false,
            budget_exceeded: false,
        });
    }

    if total == 0 {
        warn!(
            total_tokens = full_tokens,
            window_size, "Context limit exceeded with no history left to elide"
        );
        return Ok(Plan {
            slots: full,
            kept: 0,
            truncated: false,
            budget_exceeded: true,
        });
    }

    let skeleton = layout.candidate(true, &[]);
    let skeleton_tokens = costs.cost(&skeleton).await?;
    if skeleton_tokens > window_size {
        warn!(
            basic_structure_tokens = skeleton_tokens,
            window_size, "Context limit exceeded even with basic structure"
        );
        return Ok(Plan {
            slots: skeleton,
            kept: 0,
            truncated: true,
            budget_exceeded: true,
        });
    }

    info!(
        basic_structure_tokens = skeleton_tokens,
        window_size,
        intermediate_messages = total,
        "Truncation required, skip marker will be used"
    );

    let kept = reverse_fill(layout, costs, window_size).await?;
    Ok(Plan {
        slots: layout.candidate(true, &layout.intermediates[total - kept..]),
        kept,
        truncated: kept < total,
        budget_exceeded: false,
    })
}

/// Length of the longest recent run of intermediates that fits.
///
/// Each step extends the run by one older message, so cost only grows and the
/// scan stops at the first candidate that overflows.
async fn reverse_fill(
    layout: &Layout,
    costs: &mut CostCache<'_, '_>,
    window_size: usize,
) -> ContextResult<usize> {
    let total = layout.intermediates.len();
    let mut kept = 0;
    let mut kept_tokens = 0;

    for start in (0..total).rev() {
        let candidate = layout.candidate(true, &layout.intermediates[start..]);
        let tokens = costs.cost(&candidate).await?;
        if tokens > window_size {
            break;
        }
        kept = total - start;
        kept_tokens = tokens;
    }

    if kept == 0 {
        warn!(
            total_intermediate_messages = total,
            "Extreme truncation, no intermediate messages fit"
        );
    } else {
        info!(
            final_tokens = kept_tokens,
            window_size,
            selected_intermediate_messages = kept,
            total_intermediate_messages = total,
            truncated_messages = total - kept,
            "Reverse truncation completed"
        );
    }
    Ok(kept)
}
