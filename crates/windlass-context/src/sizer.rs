//! Dynamic context window sizing
//!
//! The sizer is authoritative: the window is derived from the prompt length,
//! the requested response length and the model limit. A window supplied by
//! the client is ignored unless [`CallerWindowPolicy::UpperBound`] is
//! configured, in which case it can only shrink the result.

use serde::Serialize;
use tracing::{debug, warn};
use windlass_protocol::Message;

use crate::config::{CallerWindowPolicy, SizingConfig};
use crate::error::ContextResult;
use crate::oracle::MeasurementOracle;
use crate::report::RequestId;

/// Requested response length meaning "use whatever room remains".
pub const UNSPECIFIED_RESPONSE: i64 = -1;

/// A computed token window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowSize {
    /// Window length in tokens
    pub tokens: usize,
    /// The prompt alone reaches the model limit. The window is capped and a
    /// response should still be attempted.
    pub budget_exceeded: bool,
}

/// Window size for the default configuration.
pub fn compute_window_size(
    message_length: usize,
    requested_response: i64,
    model_max_ctx: usize,
) -> WindowSize {
    window_for(
        &SizingConfig::default(),
        message_length,
        requested_response,
        model_max_ctx,
        None,
    )
}

fn window_for(
    config: &SizingConfig,
    message_length: usize,
    requested_response: i64,
    model_max_ctx: usize,
    caller_window: Option<usize>,
) -> WindowSize {
    let quantum = config.quantum.max(1);
    let model_max_ctx = model_max_ctx.max(1);

    // The cap stays on the quantum grid whenever the grid leaves room for the floor.
    let (floor, cap) = if model_max_ctx < config.default_floor {
        (model_max_ctx, model_max_ctx)
    } else {
        let aligned = model_max_ctx / quantum * quantum;
        if aligned >= config.default_floor {
            (config.default_floor, aligned)
        } else {
            (config.default_floor, model_max_ctx)
        }
    };

    let response = match usize::try_from(requested_response) {
        Ok(explicit) if explicit > 0 => explicit,
        _ => model_max_ctx
            .saturating_sub(message_length)
            .max(config.default_floor),
    };

    let round_up = |n: usize| n.div_ceil(quantum).saturating_mul(quantum);

    let mut tokens = round_up(message_length.saturating_add(response)).clamp(floor, cap);

    if config.caller_window == CallerWindowPolicy::UpperBound {
        if let Some(requested) = caller_window.filter(|w| *w > 0) {
            tokens = tokens.min(round_up(requested).clamp(floor, cap));
        }
    }

    WindowSize {
        tokens,
        budget_exceeded: message_length >= model_max_ctx,
    }
}

/// Computes token windows for requests
#[derive(Debug, Clone, Default)]
pub struct ContextSizer {
    config: SizingConfig,
}

impl ContextSizer {
    /// Validates `config` and builds a sizer from it.
    pub fn new(config: SizingConfig) -> ContextResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration the sizer was built with
    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Sizes a window from an already measured prompt length.
    ///
    /// `caller_window` is the window the client asked for, if any; whether it
    /// has any effect depends on the configured policy.
    pub fn compute(
        &self,
        request_id: RequestId,
        message_length: usize,
        requested_response: i64,
        model_max_ctx: usize,
        caller_window: Option<usize>,
    ) -> WindowSize {
        let window = window_for(
            &self.config,
            message_length,
            requested_response,
            model_max_ctx,
            caller_window,
        );

        if window.budget_exceeded {
            warn!(
                %request_id,
                message_length,
                model_max_ctx,
                window = window.tokens,
                "Prompt reaches model context limit, window capped"
            );
        } else {
            debug!(
                %request_id,
                message_length,
                requested_response,
                model_max_ctx,
                ?caller_window,
                window = window.tokens,
                "Computed context window"
            );
        }

        window
    }

    /// Measures the full conversation with the oracle and sizes its window.
    pub async fn size_messages(
        &self,
        request_id: RequestId,
        oracle: &MeasurementOracle<'_>,
        messages: &[Message],
        requested_response: i64,
        model_max_ctx: usize,
        caller_window: Option<usize>,
    ) -> ContextResult<WindowSize> {
        let refs: Vec<&Message> = messages.iter().collect();
        let message_length = oracle.cost_as_prompt(&refs).await?;
        Ok(self.compute(
            request_id,
            message_length,
            requested_response,
            model_max_ctx,
            caller_window,
        ))
    }

    /// Sizes a raw, already templated prompt.
    pub async fn size_prompt(
        &self,
        request_id: RequestId,
        oracle: &MeasurementOracle<'_>,
        prompt: &str,
        requested_response: i64,
        model_max_ctx: usize,
        caller_window: Option<usize>,
    ) -> ContextResult<WindowSize> {
        let message_length = oracle.count_text(prompt).await?;
        Ok(self.compute(
            request_id,
            message_length,
            requested_response,
            model_max_ctx,
            caller_window,
        ))
    }
}
