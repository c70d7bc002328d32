//! Sizing and selection configuration

use serde::{Deserialize, Serialize};

use crate::error::{ContextError, ContextResult};

/// Rounding granularity for computed window sizes.
pub const DEFAULT_QUANTUM: usize = 1024;

/// Smallest window ever computed, and the minimum response budget granted when
/// the caller leaves it unspecified.
pub const DEFAULT_FLOOR: usize = 1024;

/// Token surcharge per image when a vision projector is loaded.
pub const DEFAULT_IMAGE_TOKENS: usize = 768;

/// Placeholder in message text that an image tag replaces in place.
pub const DEFAULT_IMAGE_PLACEHOLDER: &str = "[img]";

/// Context sizer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Window sizes are rounded up to a multiple of this
    pub quantum: usize,
    /// Lower bound of the window and of the default response budget
    pub default_floor: usize,
    /// How a window size supplied with the request is treated
    pub caller_window: CallerWindowPolicy,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            quantum: DEFAULT_QUANTUM,
            default_floor: DEFAULT_FLOOR,
            caller_window: CallerWindowPolicy::Ignore,
        }
    }
}

impl SizingConfig {
    /// Defaults overridden by `WINDLASS_QUANTUM`, `WINDLASS_DEFAULT_FLOOR`
    /// and `WINDLASS_CALLER_WINDOW`.
    pub fn from_env() -> ContextResult<Self> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("WINDLASS_QUANTUM") {
            config.quantum = parse_env("WINDLASS_QUANTUM", &value)?;
        }
        if let Ok(value) = std::env::var("WINDLASS_DEFAULT_FLOOR") {
            config.default_floor = parse_env("WINDLASS_DEFAULT_FLOOR", &value)?;
        }
        if let Ok(value) = std::env::var("WINDLASS_CALLER_WINDOW") {
            config.caller_window = value.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Both values must be positive and the floor must lie on the quantum grid.
    pub fn validate(&self) -> ContextResult<()> {
        if self.quantum == 0 {
            return Err(ContextError::InvalidConfig(
                "quantum must be positive".to_string(),
            ));
        }
        if self.default_floor == 0 {
            return Err(ContextError::InvalidConfig(
                "default_floor must be positive".to_string(),
            ));
        }
        if self.default_floor % self.quantum != 0 {
            return Err(ContextError::InvalidConfig(format!(
                "default_floor {} is not a multiple of quantum {}",
                self.default_floor, self.quantum
            )));
        }
        Ok(())
    }
}

fn parse_env(name: &str, value: &str) -> ContextResult<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| ContextError::InvalidConfig(format!("{name} must be an integer, got {value:?}")))
}

/// Treatment of a window size supplied by the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallerWindowPolicy {
    /// Always recompute; the client value has no effect
    #[default]
    Ignore,
    /// The client value may shrink the computed window but never grow it
    UpperBound,
}

impl std::str::FromStr for CallerWindowPolicy {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ignore" => Ok(Self::Ignore),
            "upper-bound" => Ok(Self::UpperBound),
            other => Err(ContextError::InvalidConfig(format!(
                "unknown caller window policy: {other}"
            ))),
        }
    }
}

/// Message selection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Tokens charged per image when the model has a vision projector
    pub image_tokens: usize,
    /// Text an image tag replaces in place
    pub image_placeholder: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            image_tokens: DEFAULT_IMAGE_TOKENS,
            image_placeholder: DEFAULT_IMAGE_PLACEHOLDER.to_string(),
        }
    }
}
