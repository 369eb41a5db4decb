//! System prompts selected by the routable model id.

/// The single client-routable chat model.
pub const SUPPORTED_CHAT_MODEL: &str = "perplexity-deep-research";

const DEEP_RESEARCH_PROMPT: &str = "You are a research assistant with access to \
up-to-date information. Ground every claim in what you actually found, cite \
sources when you can, and say so plainly when the evidence is thin. Keep \
answers concise and well structured.";

const REGULAR_PROMPT: &str = "You are a friendly assistant. Keep your responses \
concise and helpful.";

/// System prompt for a model selector. Unknown selectors never reach this
/// point (validation rejects them), but the fallback keeps the function total.
#[must_use]
pub fn system_prompt(selected_chat_model: &str) -> &'static str {
    if selected_chat_model == SUPPORTED_CHAT_MODEL {
        DEEP_RESEARCH_PROMPT
    } else {
        REGULAR_PROMPT
    }
}
