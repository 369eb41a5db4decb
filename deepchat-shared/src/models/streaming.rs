use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted over the chat-turn SSE stream.
///
/// `text` and `reasoning` carry incremental deltas; `error` is the single
/// in-band chunk emitted when the model stream fails after headers were
/// committed; `done` closes the turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    Text {
        delta: String,
    },
    Reasoning {
        delta: String,
    },
    Error {
        message: String,
    },
    Done {
        message_id: Uuid,
        finish_reason: String,
    },
}

impl ChatStreamEvent {
    /// SSE event name for this payload.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_their_variant() {
        let event = ChatStreamEvent::Text {
            delta: "hi".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["delta"], "hi");
        assert_eq!(event.event_name(), "text");
    }

    #[test]
    fn done_event_round_trips() {
        let event = ChatStreamEvent::Done {
            message_id: Uuid::new_v4(),
            finish_reason: "stop".into(),
        };
        let serialized = serde_json::to_string(&event).unwrap();
        let deserialized: ChatStreamEvent = serde_json::from_str(&serialized).unwrap();
        assert_eq!(event, deserialized);
    }
}
