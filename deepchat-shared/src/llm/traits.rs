use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;

use crate::llm::{
    errors::LlmResult,
    types::{CompletionRequest, StreamChunk},
};

/// A lazy, finite, non-restartable sequence of output chunks.
pub type CompletionStream = Pin<Box<dyn Stream<Item = LlmResult<StreamChunk>> + Send + 'static>>;

/// The streaming text-completion seam the server depends on.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Opens a streaming completion for the given request.
    ///
    /// # Errors
    /// Returns an error if the stream cannot be initiated. Individual stream
    /// items may also carry errors.
    async fn stream(&self, request: CompletionRequest) -> LlmResult<CompletionStream>;

    /// Runs a non-streaming completion and returns the full text.
    ///
    /// # Errors
    /// Returns an error on provider or transport failure.
    async fn complete(&self, request: CompletionRequest) -> LlmResult<String>;

    /// Provider-side name of the configured model.
    fn model_name(&self) -> &str;
}

/// A tool the model may invoke during a turn.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

/// Executes model-requested tool calls between streaming rounds.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn list_tools(&self) -> Vec<ToolDefinition>;

    /// # Errors
    /// Returns an error if the named tool fails or does not exist.
    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> LlmResult<Value>;
}
