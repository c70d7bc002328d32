//! Measurement oracle: the render + tokenize + image surcharge cost of a
//! candidate message list

use tokio_util::sync::CancellationToken;
use windlass_protocol::{Message, ModelInfo, Tool};

use crate::config::SelectionConfig;
use crate::error::{ContextError, ContextResult};
use crate::images::ImagePolicy;
use crate::template::{TemplateRenderer, TemplateValues};
use crate::tokenizer::Tokenizer;

/// Costs candidate message lists for one request.
///
/// Tools, the thinking flag and the image policy are fixed for the lifetime of
/// the oracle so that every candidate in a selection run is measured the same
/// way. Every call observes the cancellation token.
pub struct MeasurementOracle<'a> {
    renderer: &'a dyn TemplateRenderer,
    tokenizer: &'a dyn Tokenizer,
    tools: &'a [Tool],
    think: Option<bool>,
    images: ImagePolicy,
    cancel: CancellationToken,
}

impl<'a> MeasurementOracle<'a> {
    /// An oracle with no tools, no thinking flag, images free of charge and a
    /// token that is never cancelled.
    pub fn new(renderer: &'a dyn TemplateRenderer, tokenizer: &'a dyn Tokenizer) -> Self {
        Self {
            renderer,
            tokenizer,
            tools: &[],
            think: None,
            images: ImagePolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Tool definitions rendered into every candidate
    pub fn with_tools(mut self, tools: &'a [Tool]) -> Self {
        self.tools = tools;
        self
    }

    /// Thinking flag passed to the template; `None` leaves it unset
    pub fn with_think(mut self, think: Option<bool>) -> Self {
        self.think = think;
        self
    }

    /// Image surcharge and per-message limit derived from the model
    pub fn with_model(mut self, model: &ModelInfo, config: &SelectionConfig) -> Self {
        self.images = ImagePolicy::for_model(model, config);
        self
    }

    /// Overrides the image policy directly
    pub fn with_image_policy(mut self, images: ImagePolicy) -> Self {
        self.images = images;
        self
    }

    /// Aborts every later call with [`ContextError::Cancelled`] once cancelled
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Image policy in effect for this request
    pub fn image_policy(&self) -> &ImagePolicy {
        &self.images
    }

    /// Name of the tokenizer, for logging
    pub fn tokenizer_name(&self) -> &'static str {
        self.tokenizer.name()
    }

    /// Renders `messages` through the chat template without tokenizing.
    pub fn render(&self, messages: &[&Message]) -> ContextResult<String> {
        self.ensure_live()?;
        self.renderer.render_to_string(&TemplateValues {
            messages,
            tools: self.tools,
            think: self.think,
        })
    }

    /// Token length of `text`, racing the tokenizer against cancellation.
    pub async fn count_text(&self, text: &str) -> ContextResult<usize> {
        self.ensure_live()?;
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ContextError::Cancelled),
            tokens = self.tokenizer.tokenize(text) => tokens.map(|t| t.len()),
        }
    }

    /// Cost of `messages` exactly as given: render, tokenize, add the image
    /// surcharge.
    pub async fn cost(&self, messages: &[&Message]) -> ContextResult<usize> {
        let prompt = self.render(messages)?;
        let tokens = self.count_text(&prompt).await?;
        Ok(tokens + self.images.surcharge(messages.iter().copied()))
    }

    /// Cost of `messages` as they will reach the model, with image tags
    /// already inserted into their text.
    pub async fn cost_as_prompt(&self, messages: &[&Message]) -> ContextResult<usize> {
        if messages.iter().all(|m| m.images.is_empty()) {
            return self.cost(messages).await;
        }
        let mut tagged: Vec<Message> = messages.iter().map(|&m| m.clone()).collect();
        self.images.attach(&mut tagged);
        let refs: Vec<&Message> = tagged.iter().collect();
        self.cost(&refs).await
    }

    fn ensure_live(&self) -> ContextResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        Ok(())
    }
}
