//! Language-model client layer.
//!
//! [`traits::LanguageModel`] is the seam the server depends on; the
//! [`remote`] module implements it against an OpenAI-compatible streaming
//! completions API.

pub mod errors;
pub mod remote;
pub mod traits;
pub mod types;

pub use errors::{LlmError, LlmResult};
pub use remote::RemoteModel;
pub use traits::{CompletionStream, LanguageModel, ToolDefinition, ToolExecutor};
pub use types::{CompletionRequest, FinishReason, ModelSpec, PromptMessage, StreamChunk, TokenUsage};
