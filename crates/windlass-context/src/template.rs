//! Chat template rendering

use std::fmt;

use windlass_protocol::{Message, Tool};

use crate::error::{ContextError, ContextResult};

/// Everything a chat template sees for one render.
#[derive(Debug, Clone, Copy)]
pub struct TemplateValues<'a> {
    pub messages: &'a [&'a Message],
    pub tools: &'a [Tool],
    /// `None` when the request did not mention thinking at all
    pub think: Option<bool>,
}

impl TemplateValues<'_> {
    pub fn think_enabled(&self) -> bool {
        self.think.unwrap_or(false)
    }

    pub fn is_think_set(&self) -> bool {
        self.think.is_some()
    }
}

/// Turns an ordered message list into the literal prompt text a model consumes
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, out: &mut dyn fmt::Write, values: &TemplateValues<'_>) -> ContextResult<()>;

    fn render_to_string(&self, values: &TemplateValues<'_>) -> ContextResult<String> {
        let mut out = String::new();
        self.render(&mut out, values)?;
        Ok(out)
    }
}

/// ChatML: `<|im_start|>{role}\n{content}<|im_end|>` turns followed by an open
/// assistant turn.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChatMlTemplate;

impl ChatMlTemplate {
    fn render_tools(out: &mut dyn fmt::Write, tools: &[Tool]) -> ContextResult<()> {
        writeln!(out, "<|im_start|>system")?;
        writeln!(out, "# Tools\n\nYou may call one or more functions:\n<tools>")?;
        for tool in tools {
            let encoded = serde_json::to_string(tool)
                .map_err(|e| ContextError::Render(format!("tool {}: {e}", tool.name)))?;
            writeln!(out, "{encoded}")?;
        }
        writeln!(out, "</tools><|im_end|>")?;
        Ok(())
    }
}

impl TemplateRenderer for ChatMlTemplate {
    fn render(&self, out: &mut dyn fmt::Write, values: &TemplateValues<'_>) -> ContextResult<()> {
        if !values.tools.is_empty() {
            Self::render_tools(out, values.tools)?;
        }

        for message in values.messages {
            writeln!(out, "<|im_start|>{}\n{}<|im_end|>", message.role, message.content)?;
        }

        writeln!(out, "<|im_start|>assistant")?;
        if values.is_think_set() {
            if values.think_enabled() {
                writeln!(out, "<think>")?;
            } else {
                write!(out, "<think>\n\n</think>\n\n")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(messages: &[Message], tools: &[Tool], think: Option<bool>) -> String {
        let refs: Vec<&Message> = messages.iter().collect();
        ChatMlTemplate
            .render_to_string(&TemplateValues {
                messages: &refs,
                tools,
                think,
            })
            .unwrap()
    }

    #[test]
    fn test_renders_turns_in_order() {
        let prompt = render(
            &[Message::system("be brief"), Message::user("hi")],
            &[],
            None,
        );
        assert_eq!(
            prompt,
            "<|im_start|>system\nbe brief<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_renders_tools_before_messages() {
        let prompt = render(
            &[Message::user("weather?")],
            &[Tool::new("get_weather", "Current weather")],
            None,
        );
        let tools_at = prompt.find("\"get_weather\"").unwrap();
        let user_at = prompt.find("weather?").unwrap();
        assert!(tools_at < user_at);
        assert!(prompt.starts_with("<|im_start|>system\n# Tools"));
    }

    #[test]
    fn test_think_flag_only_rendered_when_set() {
        let messages = [Message::user("2+2")];
        assert!(!render(&messages, &[], None).contains("<think>"));
        assert!(render(&messages, &[], Some(true)).ends_with("<think>\n"));
        assert!(render(&messages, &[], Some(false)).ends_with("</think>\n\n"));
    }
}
