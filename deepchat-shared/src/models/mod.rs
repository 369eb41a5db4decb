pub mod chat;
pub mod errors;
pub mod streaming;
pub mod timestamp;

pub use chat::{
    Conversation, IncomingContent, IncomingMessage, MessagePart, MessageRole, NewMessage,
    StoredMessage, Vote, VoteRequest, VoteType,
};
pub use errors::ErrorResponse;
pub use streaming::ChatStreamEvent;
pub use timestamp::Timestamp;
