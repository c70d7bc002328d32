//! Windlass protocol types.
//!
//! This crate defines what crosses the boundary between an inference server's
//! request layer and the context engine:
//! - chat `Message`s with their `Role` and attached image payloads
//! - `ImageData` handed to the backend after prompt assembly
//! - `Tool` definitions forwarded to the chat template
//! - `ModelInfo`, the model metadata the engine consults
//! - the canonical skip marker signalling elided history

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Content of the synthetic message that stands in for elided history.
pub const SKIP_MARKER_CONTENT: &str = "[Several conversation turns removed to conserve context.]";

/// Role of the synthetic skip marker message.
pub const SKIP_MARKER_ROLE: Role = Role::System;

/// Model family that accepts at most one image per message.
pub const SINGLE_IMAGE_FAMILY: &str = "mllama";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("invalid image payload: {0}")]
    InvalidImage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

/// A single chat turn.
///
/// Equality is value equality over role, content and every image byte, which
/// is what skip-marker detection and duplicate checks rely on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "image_payloads")]
    pub images: Vec<Bytes>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    pub fn with_image(mut self, image: impl Into<Bytes>) -> Self {
        self.images.push(image.into());
        self
    }

    /// The canonical skip marker.
    pub fn skip_marker() -> Self {
        Self::new(SKIP_MARKER_ROLE, SKIP_MARKER_CONTENT)
    }

    /// Marker detection compares role and content against the one canonical
    /// sentinel only.
    pub fn is_skip_marker(&self) -> bool {
        self.role == SKIP_MARKER_ROLE && self.content == SKIP_MARKER_CONTENT
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

/// An image handed to the inference backend, referenced from the prompt as
/// `[img-{id}]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub id: usize,
    pub data: Bytes,
}

impl ImageData {
    pub fn tag(&self) -> String {
        format!("[img-{}]", self.id)
    }
}

/// A function the model may call, forwarded verbatim to the chat template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_parameters")]
    pub parameters: serde_json::Value,
}

fn empty_parameters() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: empty_parameters(),
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Metadata about the loaded model that the context engine consults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    /// Absolute context limit of the model, in tokens.
    pub max_ctx: usize,
    /// Whether a vision projector is loaded, making images cost tokens.
    #[serde(default)]
    pub has_image_projector: bool,
    #[serde(default)]
    pub families: Vec<String>,
}

impl ModelInfo {
    pub fn new(name: impl Into<String>, max_ctx: usize) -> Self {
        Self {
            name: name.into(),
            max_ctx,
            has_image_projector: false,
            families: Vec::new(),
        }
    }

    pub fn with_image_projector(mut self) -> Self {
        self.has_image_projector = true;
        self
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.families.push(family.into());
        self
    }

    /// Per-message image limit imposed by the model family, if any.
    pub fn max_images_per_message(&self) -> Option<usize> {
        self.families
            .iter()
            .any(|f| f == SINGLE_IMAGE_FAMILY)
            .then_some(1)
    }
}

/// Images travel as standard base64 strings on the wire.
mod image_payloads {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(images: &[Bytes], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(images.iter().map(|image| STANDARD.encode(image)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Bytes>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Vec<String> = Vec::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|s| {
                STANDARD
                    .decode(s.as_bytes())
                    .map(Bytes::from)
                    .map_err(|e| {
                        D::Error::custom(super::ProtocolError::InvalidImage(e.to_string()))
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::{ImageData, Message, ModelInfo, ProtocolError, Role, Tool, SKIP_MARKER_CONTENT};

    #[test]
    fn role_parses_known_values() {
        assert_eq!("system".parse::<Role>().unwrap(), Role::System);
        assert_eq!("tool".parse::<Role>().unwrap(), Role::Tool);
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }

    #[test]
    fn role_rejects_unknown_value() {
        let err = "narrator".parse::<Role>().unwrap_err();
        assert_eq!(err, ProtocolError::UnknownRole("narrator".to_string()));
    }

    #[test]
    fn skip_marker_is_detected_by_role_and_content() {
        assert!(Message::skip_marker().is_skip_marker());
        assert!(!Message::user(SKIP_MARKER_CONTENT).is_skip_marker());
        assert!(!Message::system("...").is_skip_marker());
    }

    #[test]
    fn message_equality_includes_images() {
        let a = Message::user("look").with_image(vec![1u8, 2, 3]);
        let b = Message::user("look").with_image(vec![1u8, 2, 3]);
        let c = Message::user("look").with_image(vec![1u8, 2, 4]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Message::user("look"));
    }

    #[test]
    fn message_serializes_images_as_base64() {
        let message = Message::user("what is this?").with_image(b"png".to_vec());

        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(encoded["role"], "user");
        assert_eq!(encoded["images"][0], "cG5n");

        let decoded: Message = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn message_without_images_omits_field() {
        let encoded = serde_json::to_value(Message::assistant("hi")).unwrap();
        assert!(encoded.get("images").is_none());

        let decoded: Message = serde_json::from_value(json!({"role": "user", "content": "x"})).unwrap();
        assert!(decoded.images.is_empty());
    }

    #[test]
    fn message_rejects_malformed_image() {
        let result: Result<Message, _> = serde_json::from_value(json!({
            "role": "user",
            "content": "x",
            "images": ["not base64!"]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn image_tag_uses_id() {
        let image = ImageData {
            id: 3,
            data: bytes::Bytes::from_static(b"x"),
        };
        assert_eq!(image.tag(), "[img-3]");
    }

    #[test]
    fn tool_defaults_parameters_when_missing() {
        let tool: Tool = serde_json::from_value(json!({"name": "get_weather"})).unwrap();
        assert_eq!(tool.parameters["type"], "object");
        assert_eq!(tool, Tool::new("get_weather", ""));
    }

    #[test]
    fn model_info_reports_single_image_family() {
        let plain = ModelInfo::new("llama3", 8192);
        let vision = ModelInfo::new("llama3.2-vision", 8192)
            .with_image_projector()
            .with_family("mllama");

        assert_eq!(plain.max_images_per_message(), None);
        assert_eq!(vision.max_images_per_message(), Some(1));
    }

    #[test]
    fn model_info_uses_camel_case_fields() {
        let info: ModelInfo = serde_json::from_value(json!({
            "name": "llava",
            "maxCtx": 4096,
            "hasImageProjector": true
        }))
        .unwrap();
        assert_eq!(info.max_ctx, 4096);
        assert!(info.has_image_projector);
        assert!(info.families.is_empty());
    }

    proptest! {
        #[test]
        fn message_json_preserves_arbitrary_images(
            content in ".*",
            images in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 0..4),
        ) {
            let mut message = Message::user(content);
            for image in images {
                message = message.with_image(image);
            }
            let encoded = serde_json::to_string(&message).unwrap();
            let decoded: Message = serde_json::from_str(&encoded).unwrap();
            prop_assert_eq!(decoded, message);
        }
    }
}
