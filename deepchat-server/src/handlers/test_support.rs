//! Hand-rolled fakes shared by handler tests: a call-recording in-memory
//! store and scripted model, title, and session collaborators.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream;
use shared::{
    config::{Config, Profile},
    llm::{
        CompletionRequest, CompletionStream, FinishReason, LanguageModel, LlmError, LlmResult,
        StreamChunk,
    },
    models::{Conversation, MessageRole, NewMessage, StoredMessage, Timestamp, Vote, VoteType},
};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    auth::session::{SessionError, SessionResolver, SessionUser},
    services::{
        chat_store::{ChatStore, ChatStoreError, ChatStoreResult},
        title_service::TitleSummarizer,
    },
};

pub const USER_A: Uuid = Uuid::from_u128(0xA1);
pub const USER_B: Uuid = Uuid::from_u128(0xB2);

pub type EventLog = Arc<Mutex<Vec<String>>>;

fn record(log: &EventLog, event: impl Into<String>) {
    log.lock().unwrap().push(event.into());
}

#[derive(Default)]
struct StoreData {
    conversations: HashMap<Uuid, Conversation>,
    messages: Vec<StoredMessage>,
    votes: HashMap<(Uuid, Uuid), VoteType>,
}

/// In-memory store that records every call in the shared event log.
pub struct RecordingStore {
    data: Mutex<StoreData>,
    log: EventLog,
}

impl RecordingStore {
    pub fn new(log: EventLog) -> Self {
        Self {
            data: Mutex::new(StoreData::default()),
            log,
        }
    }

    pub fn seed_conversation(&self, id: Uuid, user_id: Uuid, title: &str) {
        self.data.lock().unwrap().conversations.insert(
            id,
            Conversation {
                id,
                user_id,
                title: title.to_string(),
                created_at: Timestamp(Utc::now()),
            },
        );
    }

    pub fn conversation(&self, id: Uuid) -> Option<Conversation> {
        self.data.lock().unwrap().conversations.get(&id).cloned()
    }

    pub fn conversation_count(&self) -> usize {
        self.data.lock().unwrap().conversations.len()
    }

    pub fn messages_for(&self, chat_id: Uuid) -> Vec<StoredMessage> {
        self.data
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|message| message.chat_id == chat_id)
            .cloned()
            .collect()
    }

    pub fn assistant_messages_for(&self, chat_id: Uuid) -> Vec<StoredMessage> {
        self.messages_for(chat_id)
            .into_iter()
            .filter(|message| message.role == MessageRole::Assistant)
            .collect()
    }

    pub fn vote_for(&self, chat_id: Uuid, message_id: Uuid) -> Option<VoteType> {
        self.data
            .lock()
            .unwrap()
            .votes
            .get(&(chat_id, message_id))
            .copied()
    }

    pub fn vote_count(&self) -> usize {
        self.data.lock().unwrap().votes.len()
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn mutation_events(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|event| {
                event.starts_with("store.get_or_create")
                    || event.starts_with("store.append")
                    || event.starts_with("store.delete")
                    || event.starts_with("store.upsert_vote")
            })
            .collect()
    }
}

#[async_trait]
impl ChatStore for RecordingStore {
    async fn get_by_id(&self, id: Uuid) -> ChatStoreResult<Option<Conversation>> {
        record(&self.log, "store.get_by_id");
        Ok(self.data.lock().unwrap().conversations.get(&id).cloned())
    }

    async fn get_or_create(
        &self,
        id: Uuid,
        user_id: Uuid,
        title: &str,
    ) -> ChatStoreResult<(Conversation, bool)> {
        record(&self.log, format!("store.get_or_create:{title}"));
        let mut data = self.data.lock().unwrap();
        if let Some(existing) = data.conversations.get(&id) {
            return Ok((existing.clone(), false));
        }
        let conversation = Conversation {
            id,
            user_id,
            title: title.to_string(),
            created_at: Timestamp(Utc::now()),
        };
        data.conversations.insert(id, conversation.clone());
        Ok((conversation, true))
    }

    async fn append_messages(&self, messages: &[NewMessage]) -> ChatStoreResult<()> {
        let mut data = self.data.lock().unwrap();
        for message in messages {
            record(&self.log, format!("store.append:{}", message.role.as_str()));
            data.messages.push(StoredMessage {
                id: message.id,
                chat_id: message.chat_id,
                role: message.role,
                parts: message.parts.clone(),
                created_at: Timestamp(Utc::now()),
            });
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> ChatStoreResult<()> {
        record(&self.log, "store.delete");
        let mut data = self.data.lock().unwrap();
        if data.conversations.remove(&id).is_none() {
            return Err(ChatStoreError::NotFound(format!("conversation {id}")));
        }
        data.messages.retain(|message| message.chat_id != id);
        data.votes.retain(|(chat_id, _), _| *chat_id != id);
        Ok(())
    }

    async fn get_votes(&self, chat_id: Uuid) -> ChatStoreResult<Vec<Vote>> {
        record(&self.log, "store.get_votes");
        Ok(self
            .data
            .lock()
            .unwrap()
            .votes
            .iter()
            .filter(|((chat, _), _)| *chat == chat_id)
            .map(|((chat, message), vote)| Vote {
                chat_id: *chat,
                message_id: *message,
                vote: *vote,
            })
            .collect())
    }

    async fn upsert_vote(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        vote: VoteType,
    ) -> ChatStoreResult<()> {
        record(&self.log, format!("store.upsert_vote:{}", vote.as_str()));
        self.data
            .lock()
            .unwrap()
            .votes
            .insert((chat_id, message_id), vote);
        Ok(())
    }
}

/// One scripted stream item; errors are stored as strings because the
/// underlying error type is not `Clone`.
#[derive(Debug, Clone)]
pub enum ScriptedItem {
    Chunk(StreamChunk),
    Fault(String),
}

pub struct ScriptedModel {
    items: Vec<ScriptedItem>,
    log: EventLog,
}

impl ScriptedModel {
    pub fn new(items: Vec<ScriptedItem>, log: EventLog) -> Self {
        Self { items, log }
    }

    /// Two text chunks followed by a clean finish.
    pub fn default_items() -> Vec<ScriptedItem> {
        vec![
            ScriptedItem::Chunk(StreamChunk::text("Hello")),
            ScriptedItem::Chunk(StreamChunk::text(" world")),
            ScriptedItem::Chunk(StreamChunk::finished(FinishReason::Stop, None)),
        ]
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn stream(&self, _request: CompletionRequest) -> LlmResult<CompletionStream> {
        record(&self.log, "model.stream");
        let items: Vec<LlmResult<StreamChunk>> = self
            .items
            .iter()
            .cloned()
            .map(|item| match item {
                ScriptedItem::Chunk(chunk) => Ok(chunk),
                ScriptedItem::Fault(message) => Err(LlmError::Protocol(message)),
            })
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }

    async fn complete(&self, _request: CompletionRequest) -> LlmResult<String> {
        record(&self.log, "model.complete");
        Ok("scripted completion".to_string())
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }
}

pub struct StaticTitles {
    title: String,
    log: EventLog,
}

impl StaticTitles {
    pub fn new(title: &str, log: EventLog) -> Self {
        Self {
            title: title.to_string(),
            log,
        }
    }
}

#[async_trait]
impl TitleSummarizer for StaticTitles {
    async fn summarize(&self, _message: &str) -> LlmResult<String> {
        record(&self.log, "title.summarize");
        Ok(self.title.clone())
    }
}

pub struct StaticSessions {
    users: HashMap<String, Uuid>,
}

#[async_trait]
impl SessionResolver for StaticSessions {
    async fn resolve(&self, token: &str) -> Result<Option<SessionUser>, SessionError> {
        Ok(self.users.get(token).map(|id| SessionUser { id: *id }))
    }
}

pub struct TestEnv {
    pub state: AppState,
    pub store: Arc<RecordingStore>,
}

pub fn test_env() -> TestEnv {
    test_env_with_model_items(ScriptedModel::default_items())
}

pub fn test_env_with_model_items(items: Vec<ScriptedItem>) -> TestEnv {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(RecordingStore::new(log.clone()));

    let mut users = HashMap::new();
    users.insert("token-a".to_string(), USER_A);
    users.insert("token-b".to_string(), USER_B);

    let state = AppState {
        config: Arc::new(Config::default_for_profile(Profile::Test)),
        store: store.clone(),
        model: Arc::new(ScriptedModel::new(items, log.clone())),
        titles: Arc::new(StaticTitles::new("Test chat", log)),
        sessions: Arc::new(StaticSessions { users }),
    };

    TestEnv { state, store }
}

pub fn test_state() -> AppState {
    test_env().state
}
