//! Tokenizers used to measure rendered prompts
//!
//! Only the length of a tokenization matters to the context engine, so the
//! built-in tokenizers trade fidelity for speed. Real vocabularies are
//! available through [`HfTokenizer`] with the `token-counting` feature.

use async_trait::async_trait;

use crate::error::ContextResult;

/// Converts rendered prompt text into token ids
#[async_trait]
pub trait Tokenizer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn tokenize(&self, text: &str) -> ContextResult<Vec<u32>>;
}

/// One token per whitespace-separated word.
#[derive(Debug, Default, Clone, Copy)]
pub struct WordTokenizer;

#[async_trait]
impl Tokenizer for WordTokenizer {
    fn name(&self) -> &'static str {
        "word"
    }

    async fn tokenize(&self, text: &str) -> ContextResult<Vec<u32>> {
        Ok(text.split_whitespace().map(word_id).collect())
    }
}

// FNV-1a folded to 32 bits, so equal words share an id.
fn word_id(word: &str) -> u32 {
    word.bytes()
        .fold(0x811c_9dc5_u32, |hash, b| (hash ^ u32::from(b)).wrapping_mul(0x0100_0193))
}

/// Approximately four bytes per token.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicTokenizer {
    bytes_per_token: usize,
}

impl Default for HeuristicTokenizer {
    fn default() -> Self {
        Self { bytes_per_token: 4 }
    }
}

impl HeuristicTokenizer {
    pub fn new(bytes_per_token: usize) -> Self {
        Self {
            bytes_per_token: bytes_per_token.max(1),
        }
    }

    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        text.len().div_ceil(self.bytes_per_token)
    }
}

#[async_trait]
impl Tokenizer for HeuristicTokenizer {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn tokenize(&self, text: &str) -> ContextResult<Vec<u32>> {
        Ok(vec![0; self.estimate(text)])
    }
}

#[cfg(feature = "token-counting")]
pub use self::huggingface::HfTokenizer;

#[cfg(feature = "token-counting")]
mod huggingface {
    use std::path::Path;
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::Tokenizer;
    use crate::error::{ContextError, ContextResult};

    /// A `tokenizer.json` vocabulary loaded through the `tokenizers` crate.
    #[derive(Clone)]
    pub struct HfTokenizer {
        inner: Arc<tokenizers::Tokenizer>,
    }

    impl HfTokenizer {
        pub fn from_file(path: impl AsRef<Path>) -> ContextResult<Self> {
            let inner = tokenizers::Tokenizer::from_file(path)
                .map_err(|e| ContextError::Tokenize(e.to_string()))?;
            Ok(Self {
                inner: Arc::new(inner),
            })
        }
    }

    #[async_trait]
    impl Tokenizer for HfTokenizer {
        fn name(&self) -> &'static str {
            "huggingface"
        }

        async fn tokenize(&self, text: &str) -> ContextResult<Vec<u32>> {
            let inner = Arc::clone(&self.inner);
            let text = text.to_owned();
            // Encoding is CPU bound; keep it off the async workers.
            let encoding = tokio::task::spawn_blocking(move || inner.encode(text, false))
                .await
                .map_err(|e| ContextError::Tokenize(e.to_string()))?
                .map_err(|e| ContextError::Tokenize(e.to_string()))?;
            Ok(encoding.get_ids().to_vec())
        }
    }
}
