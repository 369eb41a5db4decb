//! Chat turn handler: validate, authorize, bootstrap the conversation,
//! stream the model reply, persist on completion.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{Extension, Query, State},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::post,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use shared::{
    llm::{CompletionRequest, CompletionStream, FinishReason, PromptMessage},
    models::{
        ChatStreamEvent, IncomingMessage, MessagePart, MessageRole, NewMessage,
    },
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    http::error::{ApiError, AppResult},
    middleware::request_context::RequestContext,
    services::{
        chat_store::ChatStore,
        prompts::{self, SUPPORTED_CHAT_MODEL},
        title_service,
    },
};

/// Generic message for faults surfaced after the response stream committed.
const STREAM_ERROR_MESSAGE: &str = "Oops, an error occurred!";

pub fn routes() -> Router<AppState> {
    Router::new().route("/chat", post(chat_turn).delete(delete_chat))
}

/// A validated chat turn. Validation runs before the session is even looked
/// at; the ordering is part of the endpoint contract.
struct ValidTurn {
    chat_id: Uuid,
    messages: Vec<IncomingMessage>,
    user_message: IncomingMessage,
}

fn parse_turn(body: &serde_json::Value) -> Result<ValidTurn, ApiError> {
    let id = body
        .get("id")
        .and_then(serde_json::Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::invalid_input("Missing required field: id"))?;
    let chat_id = Uuid::parse_str(id)
        .map_err(|_| ApiError::invalid_input("Invalid conversation id"))?;

    let messages = body
        .get("messages")
        .filter(|value| value.is_array())
        .ok_or_else(|| ApiError::invalid_input("Missing or invalid messages array"))?;
    let messages: Vec<IncomingMessage> = serde_json::from_value(messages.clone())
        .map_err(|_| ApiError::invalid_input("Missing or invalid messages array"))?;

    let selected_model = body
        .get("selectedChatModel")
        .and_then(serde_json::Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::invalid_input("Missing required field: selectedChatModel"))?;
    if selected_model != SUPPORTED_CHAT_MODEL {
        return Err(ApiError::invalid_input(format!(
            "Invalid model selected. Expected: {SUPPORTED_CHAT_MODEL}"
        )));
    }

    let user_message = most_recent_user_message(&messages)
        .cloned()
        .ok_or_else(|| ApiError::invalid_input("No user message found in messages array"))?;

    Ok(ValidTurn {
        chat_id,
        messages,
        user_message,
    })
}

fn most_recent_user_message(messages: &[IncomingMessage]) -> Option<&IncomingMessage> {
    messages
        .iter()
        .rev()
        .find(|message| message.role == MessageRole::User)
}

/// Setup-phase faults are reported like bad input with the diagnostic kept
/// in details; the boundary does not expose a distinct internal-fault type.
fn setup_fault(err: impl std::fmt::Display) -> ApiError {
    ApiError::invalid_input("Unknown error occurred").with_details(json!({ "cause": err.to_string() }))
}

#[instrument(skip(state, context, body), fields(request_id = %context.request_id))]
async fn chat_turn(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Json(body): Json<serde_json::Value>,
) -> AppResult<Response> {
    // Validation precedes authentication; no side effects before both pass.
    let turn = parse_turn(&body)?;

    let user_id = context.user_id().ok_or_else(ApiError::unauthenticated)?;

    let user_text = turn.user_message.content.plain_text();

    let conversation = match state
        .store
        .get_by_id(turn.chat_id)
        .await
        .map_err(setup_fault)?
    {
        Some(conversation) => conversation,
        None => {
            let title = title_service::derive_title(state.titles.as_ref(), &user_text).await;
            let (conversation, created) = state
                .store
                .get_or_create(turn.chat_id, user_id, &title)
                .await
                .map_err(setup_fault)?;
            if created {
                metrics::counter!("conversations_created_total").increment(1);
            }
            conversation
        }
    };

    // Covers both the plain foreign-owner case and the losing side of a
    // concurrent double-create on the same new id.
    if conversation.user_id != user_id {
        return Err(ApiError::unauthorized());
    }

    let user_message = NewMessage {
        id: turn.user_message.id.unwrap_or_else(Uuid::new_v4),
        chat_id: turn.chat_id,
        role: MessageRole::User,
        parts: turn.user_message.content.clone().into_parts(),
    };
    state
        .store
        .append_messages(std::slice::from_ref(&user_message))
        .await
        .map_err(setup_fault)?;

    let prompt_messages: Vec<PromptMessage> = turn
        .messages
        .iter()
        .map(|message| PromptMessage::new(message.role, message.content.plain_text()))
        .collect();
    let request = CompletionRequest::new(prompt_messages)
        .with_system_prompt(prompts::system_prompt(SUPPORTED_CHAT_MODEL))
        .with_tool_budget(state.config.provider.tool_round_limit);

    // Opening the stream is still setup; failures here become a normal
    // error response because nothing has been written to the client yet.
    let completion = state.model.stream(request).await.map_err(ApiError::from)?;

    metrics::counter!("chat_turns_total").increment(1);

    let (tx, rx) = mpsc::channel::<ChatStreamEvent>(64);
    let store = state.store.clone();
    let chat_id = turn.chat_id;
    tokio::spawn(async move {
        forward_stream(completion, tx, store, chat_id).await;
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let payload = serde_json::to_string(&event)
            .unwrap_or_else(|_| json!({ "type": "error", "message": STREAM_ERROR_MESSAGE }).to_string());
        Ok::<_, Infallible>(Event::default().event(event.event_name()).data(payload))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

/// Forwards model chunks to the client as word-smoothed SSE events and, on
/// natural completion, hands the assembled reply to a fire-and-forget
/// persistence task. A dropped receiver means the client went away: the
/// stream is abandoned and no assistant message is persisted.
async fn forward_stream(
    mut completion: CompletionStream,
    tx: mpsc::Sender<ChatStreamEvent>,
    store: Arc<dyn ChatStore>,
    chat_id: Uuid,
) {
    let mut smoother = WordSmoother::new();
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut finish = FinishReason::Stop;

    while let Some(item) = completion.next().await {
        match item {
            Ok(chunk) => {
                if !chunk.text_delta.is_empty() {
                    text.push_str(&chunk.text_delta);
                    for delta in smoother.push(&chunk.text_delta) {
                        if tx.send(ChatStreamEvent::Text { delta }).await.is_err() {
                            return;
                        }
                    }
                }
                if !chunk.reasoning_delta.is_empty() {
                    reasoning.push_str(&chunk.reasoning_delta);
                    let delta = chunk.reasoning_delta;
                    if tx.send(ChatStreamEvent::Reasoning { delta }).await.is_err() {
                        return;
                    }
                }
                if let Some(reason) = chunk.finish_reason {
                    finish = reason;
                }
                if chunk.is_final {
                    break;
                }
            }
            Err(err) => {
                // Headers are long gone; surface the fault in-band and stop.
                metrics::counter!("chat_stream_errors_total").increment(1);
                warn!(error = %err, "model stream failed mid-turn");
                let _ = tx
                    .send(ChatStreamEvent::Error {
                        message: STREAM_ERROR_MESSAGE.to_string(),
                    })
                    .await;
                return;
            }
        }
    }

    if let Some(delta) = smoother.finish() {
        if tx.send(ChatStreamEvent::Text { delta }).await.is_err() {
            return;
        }
    }

    let message_id = Uuid::new_v4();
    let _ = tx
        .send(ChatStreamEvent::Done {
            message_id,
            finish_reason: finish.as_str().to_string(),
        })
        .await;
    drop(tx);

    let assistant = NewMessage {
        id: message_id,
        chat_id,
        role: MessageRole::Assistant,
        parts: assemble_parts(&text, &reasoning),
    };
    let messages = sanitize_response_messages(vec![assistant]);
    if messages.is_empty() {
        return;
    }

    // Persistence failure must not disturb the already-delivered stream.
    tokio::spawn(async move {
        if let Err(err) = store.append_messages(&messages).await {
            warn!(error = %err, %chat_id, "failed to save assistant messages");
        }
    });
}

fn assemble_parts(text: &str, reasoning: &str) -> Vec<MessagePart> {
    let mut parts = Vec::new();
    if !reasoning.is_empty() {
        parts.push(MessagePart::Reasoning {
            reasoning: reasoning.to_string(),
        });
    }
    if !text.is_empty() {
        parts.push(MessagePart::Text {
            text: text.to_string(),
        });
    }
    parts
}

/// Strips partial tool-call artifacts and empty segments from assistant
/// output; messages left with no content are dropped entirely.
fn sanitize_response_messages(messages: Vec<NewMessage>) -> Vec<NewMessage> {
    messages
        .into_iter()
        .filter_map(|mut message| {
            message.parts.retain(|part| match part {
                MessagePart::Text { text } => !text.trim().is_empty(),
                MessagePart::Reasoning { reasoning } => !reasoning.trim().is_empty(),
                MessagePart::ToolCall { id, name, .. } => !id.is_empty() && !name.is_empty(),
                MessagePart::ToolResult { id, .. } => !id.is_empty(),
            });
            (!message.parts.is_empty()).then_some(message)
        })
        .collect()
}

/// Re-chunks text deltas at whitespace boundaries so output arrives as
/// words rather than arbitrary byte slices. Presentation only.
struct WordSmoother {
    buf: String,
}

impl WordSmoother {
    fn new() -> Self {
        Self { buf: String::new() }
    }

    fn push(&mut self, delta: &str) -> Vec<String> {
        self.buf.push_str(delta);

        let Some(idx) = self.buf.rfind(char::is_whitespace) else {
            return Vec::new();
        };
        let ws_len = self.buf[idx..].chars().next().map_or(1, char::len_utf8);
        let rest = self.buf.split_off(idx + ws_len);
        let flushed = std::mem::replace(&mut self.buf, rest);

        flushed
            .split_inclusive(char::is_whitespace)
            .map(str::to_string)
            .collect()
    }

    fn finish(self) -> Option<String> {
        (!self.buf.is_empty()).then_some(self.buf)
    }
}

#[derive(Debug, Deserialize)]
struct DeleteChatQuery {
    id: Option<String>,
}

#[instrument(skip(state, context, query), fields(request_id = %context.request_id))]
async fn delete_chat(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Query(query): Query<DeleteChatQuery>,
) -> AppResult<Response> {
    let chat_id = query
        .id
        .as_deref()
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| ApiError::not_found("Not Found"))?;

    let user_id = context.user_id().ok_or_else(ApiError::unauthenticated)?;

    let conversation = state
        .store
        .get_by_id(chat_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Chat not found"))?;

    if conversation.user_id != user_id {
        return Err(ApiError::unauthorized());
    }

    state.store.delete(chat_id).await?;
    metrics::counter!("conversations_deleted_total").increment(1);

    Ok("Chat deleted".into_response())
}
