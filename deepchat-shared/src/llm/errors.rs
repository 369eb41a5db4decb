use thiserror::Error;

pub type LlmResult<T> = Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed stream payload: {0}")]
    Protocol(String),
    #[error("missing credentials: {0}")]
    Credentials(String),
    #[error("tool execution failed: {0}")]
    Tool(String),
}
