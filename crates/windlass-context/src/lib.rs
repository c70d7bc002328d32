//! Windlass Context - context window sizing and message-aware truncation
//!
//! This crate provides:
//! - Dynamic window sizing from prompt and response lengths (`sizer`)
//! - Message selection that keeps system messages, the opener and the latest
//!   turn while fitting the most recent history (`selector`)
//! - A measurement oracle that costs candidates by rendering and tokenizing
//!   them (`oracle`)
//! - Image surcharge, limits and prompt tagging (`images`)
//! - Token counting with a real vocabulary (optional, feature-gated)
//! - Prometheus metrics (optional, feature-gated)

pub mod config;
pub mod error;
pub mod images;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod oracle;
pub mod pipeline;
pub mod report;
pub mod selector;
pub mod sizer;
pub mod template;
pub mod tokenizer;

pub use config::{CallerWindowPolicy, SelectionConfig, SizingConfig};
pub use error::{ContextError, ContextResult};
pub use images::ImagePolicy;
pub use oracle::MeasurementOracle;
pub use pipeline::{ChatRequest, ContextPipeline, PreparedChat};
pub use report::{NoopSink, ReportSink, RequestId, SelectionReport, TracingSink};
pub use selector::{select_messages, MessageSelector, SelectionResult};
pub use sizer::{compute_window_size, ContextSizer, WindowSize, UNSPECIFIED_RESPONSE};
pub use template::{ChatMlTemplate, TemplateRenderer, TemplateValues};
pub use tokenizer::{HeuristicTokenizer, Tokenizer, WordTokenizer};
#[cfg(feature = "token-counting")]
pub use tokenizer::HfTokenizer;

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{ContextError, ContextResult};
    pub use crate::oracle::MeasurementOracle;
    pub use crate::report::RequestId;
    pub use crate::selector::{select_messages, MessageSelector, SelectionResult};
    pub use crate::sizer::{compute_window_size, ContextSizer, WindowSize};
    pub use crate::template::TemplateRenderer;
    pub use crate::tokenizer::Tokenizer;
    pub use windlass_protocol::{ImageData, Message, ModelInfo, Role, Tool};
}
