//! Conversation title derivation from the first user message.

use std::sync::Arc;

use async_trait::async_trait;
use shared::llm::{CompletionRequest, LanguageModel, LlmResult, PromptMessage};
use shared::models::MessageRole;
use tracing::warn;

const TITLE_PROMPT: &str = "Summarize the following message as a short conversation \
title. Respond with the title only: no quotes, no colons, at most 80 characters.";

const MAX_TITLE_CHARS: usize = 80;

/// Derives a short title from the opening user message.
#[async_trait]
pub trait TitleSummarizer: Send + Sync {
    /// # Errors
    /// Returns an error on provider failure; callers fall back to a
    /// truncation of the message itself.
    async fn summarize(&self, message: &str) -> LlmResult<String>;
}

/// Title summarizer backed by the provider's title model slot.
pub struct ModelTitleSummarizer {
    model: Arc<dyn LanguageModel>,
}

impl ModelTitleSummarizer {
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl TitleSummarizer for ModelTitleSummarizer {
    async fn summarize(&self, message: &str) -> LlmResult<String> {
        let request =
            CompletionRequest::new(vec![PromptMessage::new(MessageRole::User, message)])
                .with_system_prompt(TITLE_PROMPT)
                .with_max_tokens(64);

        let raw = self.model.complete(request).await?;
        Ok(clean_title(&raw))
    }
}

/// Derives a title for a conversation, falling back to a truncated copy of
/// the user message when the summarizer fails. Creation never fails on the
/// title path.
pub async fn derive_title(titles: &dyn TitleSummarizer, user_text: &str) -> String {
    match titles.summarize(user_text).await {
        Ok(title) if !title.is_empty() => title,
        Ok(_) => fallback_title(user_text),
        Err(err) => {
            warn!(error = %err, "title summarization failed; using fallback");
            fallback_title(user_text)
        }
    }
}

fn clean_title(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(['"', '\'']).trim();
    truncate_chars(trimmed, MAX_TITLE_CHARS)
}

fn fallback_title(user_text: &str) -> String {
    let line = user_text.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        "New conversation".to_string()
    } else {
        truncate_chars(line, MAX_TITLE_CHARS)
    }
}

fn truncate_chars(value: &str, limit: usize) -> String {
    value.chars().take(limit).collect()
}
