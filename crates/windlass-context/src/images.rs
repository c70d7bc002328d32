//! Image accounting: token surcharge, per-message limits and prompt tagging

use windlass_protocol::{ImageData, Message, ModelInfo};

use crate::config::{SelectionConfig, DEFAULT_IMAGE_PLACEHOLDER};
use crate::error::{ContextError, ContextResult};

/// How images are costed and referenced for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePolicy {
    /// Zero when the model cannot see images; they are still carried through
    pub tokens_per_image: usize,
    pub max_per_message: Option<usize>,
    pub placeholder: String,
}

impl Default for ImagePolicy {
    fn default() -> Self {
        Self {
            tokens_per_image: 0,
            max_per_message: None,
            placeholder: DEFAULT_IMAGE_PLACEHOLDER.to_string(),
        }
    }
}

impl ImagePolicy {
    pub fn for_model(model: &ModelInfo, config: &SelectionConfig) -> Self {
        Self {
            tokens_per_image: if model.has_image_projector {
                config.image_tokens
            } else {
                0
            },
            max_per_message: model.max_images_per_message(),
            placeholder: config.image_placeholder.clone(),
        }
    }

    /// Rejects the conversation if any message carries more images than the
    /// model family allows.
    pub fn validate(&self, messages: &[Message]) -> ContextResult<()> {
        let Some(limit) = self.max_per_message else {
            return Ok(());
        };
        match messages
            .iter()
            .enumerate()
            .find(|(_, m)| m.images.len() > limit)
        {
            Some((index, m)) => Err(ContextError::UnsupportedMultiImage {
                index,
                count: m.images.len(),
                limit,
            }),
            None => Ok(()),
        }
    }

    pub fn surcharge<'a>(&self, messages: impl IntoIterator<Item = &'a Message>) -> usize {
        if self.tokens_per_image == 0 {
            return 0;
        }
        messages
            .into_iter()
            .map(|m| m.images.len() * self.tokens_per_image)
            .sum()
    }

    /// Numbers every image across `messages` in order and rewrites each
    /// message's text to reference them. A tag replaces the first remaining
    /// placeholder, otherwise it is prepended.
    pub fn attach(&self, messages: &mut [Message]) -> Vec<ImageData> {
        let mut images = Vec::new();
        for message in messages.iter_mut() {
            if message.images.is_empty() {
                continue;
            }
            let mut prefix = String::new();
            let mut content = std::mem::take(&mut message.content);
            for data in &message.images {
                let image = ImageData {
                    id: images.len(),
                    data: data.clone(),
                };
                let tag = image.tag();
                if content.contains(self.placeholder.as_str()) {
                    content = content.replacen(self.placeholder.as_str(), &tag, 1);
                } else {
                    prefix.push_str(&tag);
                }
                images.push(image);
            }
            prefix.push_str(&content);
            message.content = prefix;
        }
        images
    }
}
