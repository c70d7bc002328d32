//! End-to-end preparation of a chat request: size the window, select the
//! messages that fit, render the prompt.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use windlass_protocol::{Message, ModelInfo, Tool};

use crate::config::{SelectionConfig, SizingConfig};
use crate::error::{ContextError, ContextResult};
use crate::oracle::MeasurementOracle;
use crate::report::RequestId;
use crate::selector::{MessageSelector, SelectionResult};
use crate::sizer::{ContextSizer, WindowSize, UNSPECIFIED_RESPONSE};
use crate::template::TemplateRenderer;
use crate::tokenizer::Tokenizer;

/// The parts of an incoming chat request the context engine consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub think: Option<bool>,
    /// Requested response length; non-positive means unspecified
    #[serde(default = "unspecified_response")]
    pub num_predict: i64,
    /// Window the client asked for; see `CallerWindowPolicy`
    #[serde(default)]
    pub num_ctx: Option<usize>,
}

fn unspecified_response() -> i64 {
    UNSPECIFIED_RESPONSE
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            think: None,
            num_predict: UNSPECIFIED_RESPONSE,
            num_ctx: None,
        }
    }
}

/// A request ready for the inference backend.
#[derive(Debug, Clone)]
pub struct PreparedChat {
    pub window: WindowSize,
    pub selection: SelectionResult,
}

impl PreparedChat {
    /// Either the prompt alone reached the model limit or even the minimal
    /// message structure did not fit the window.
    pub fn budget_exceeded(&self) -> bool {
        self.window.budget_exceeded || self.selection.budget_exceeded()
    }
}

/// Sizer, selector and measurement collaborators for one model.
pub struct ContextPipeline<'a> {
    model: &'a ModelInfo,
    renderer: &'a dyn TemplateRenderer,
    tokenizer: &'a dyn Tokenizer,
    sizer: ContextSizer,
    selector: MessageSelector,
    selection_config: SelectionConfig,
}

impl<'a> ContextPipeline<'a> {
    pub fn new(
        model: &'a ModelInfo,
        renderer: &'a dyn TemplateRenderer,
        tokenizer: &'a dyn Tokenizer,
    ) -> Self {
        Self {
            model,
            renderer,
            tokenizer,
            sizer: ContextSizer::default(),
            selector: MessageSelector::default(),
            selection_config: SelectionConfig::default(),
        }
    }

    pub fn with_sizing(mut self, config: SizingConfig) -> ContextResult<Self> {
        self.sizer = ContextSizer::new(config)?;
        Ok(self)
    }

    pub fn with_selection(mut self, config: SelectionConfig) -> Self {
        self.selection_config = config;
        self
    }

    pub fn with_selector(mut self, selector: MessageSelector) -> Self {
        self.selector = selector;
        self
    }

    pub async fn prepare(
        &self,
        request_id: RequestId,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> ContextResult<PreparedChat> {
        let oracle = MeasurementOracle::new(self.renderer, self.tokenizer)
            .with_tools(&request.tools)
            .with_think(request.think)
            .with_model(self.model, &self.selection_config)
            .with_cancellation(cancel);

        let span = tracing::info_span!("prepare_chat", %request_id, model = %self.model.name);
        async {
            // Reject before spending any tokenizer time on the request.
            oracle.image_policy().validate(&request.messages)?;

            let window = self
                .sizer
                .size_messages(
                    request_id,
                    &oracle,
                    &request.messages,
                    request.num_predict,
                    self.model.max_ctx,
                    request.num_ctx,
                )
                .await?;

            let selection = self
                .selector
                .select(request_id, &request.messages, window.tokens, &oracle)
                .await?;

            Ok::<_, ContextError>(PreparedChat { window, selection })
        }
        .instrument(span)
        .await
    }
}
