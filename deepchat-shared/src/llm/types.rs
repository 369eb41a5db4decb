use serde::{Deserialize, Serialize};

use crate::models::chat::MessageRole;

/// One configured provider model slot, selected once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelSpec {
    /// Provider-side model name.
    pub model: String,
    /// Whether tagged reasoning blocks are split out of the text stream.
    pub reasoning_extraction: bool,
    /// Tag delimiting reasoning blocks, e.g. `think` for `<think>..</think>`.
    pub reasoning_tag: Option<String>,
}

/// One flattened message submitted to the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A completion request submitted to a [`crate::llm::LanguageModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    pub system_prompt: Option<String>,
    /// Maximum sequential tool-invocation rounds for this turn.
    pub tool_budget: u32,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    #[must_use]
    pub fn new(messages: Vec<PromptMessage>) -> Self {
        Self {
            messages,
            system_prompt: None,
            tool_budget: 1,
            max_tokens: None,
            temperature: None,
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_tool_budget(mut self, budget: u32) -> Self {
        self.tool_budget = budget;
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error,
}

impl FinishReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::Error => "error",
        }
    }

    /// Maps a provider finish-reason string; unknown values fold to `Stop`.
    #[must_use]
    pub fn from_provider(value: &str) -> Self {
        match value {
            "length" | "max_tokens" => Self::Length,
            "tool_calls" => Self::ToolCalls,
            "error" => Self::Error,
            _ => Self::Stop,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One incremental unit of model output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    pub text_delta: String,
    pub reasoning_delta: String,
    pub is_final: bool,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    #[must_use]
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            text_delta: delta.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn reasoning(delta: impl Into<String>) -> Self {
        Self {
            reasoning_delta: delta.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn finished(finish_reason: FinishReason, usage: Option<TokenUsage>) -> Self {
        Self {
            is_final: true,
            finish_reason: Some(finish_reason),
            usage,
            ..Self::default()
        }
    }
}
