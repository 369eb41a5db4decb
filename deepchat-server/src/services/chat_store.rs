//! Conversation store: the narrow persistence interface the handlers need,
//! plus its Postgres implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{Conversation, NewMessage, Timestamp, Vote, VoteType};
use sqlx::{PgPool, types::Json};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ChatStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type ChatStoreResult<T> = Result<T, ChatStoreError>;

/// Persistence operations for conversations, messages, and votes.
///
/// Each operation is atomic on its own; the multi-step turn sequence is not
/// transactional. `get_or_create` absorbs the create race so callers never
/// have to handle a duplicate-key failure.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> ChatStoreResult<Option<Conversation>>;

    /// Idempotent create: returns the canonical row and whether this call
    /// inserted it. A concurrent loser observes the winner's row.
    async fn get_or_create(
        &self,
        id: Uuid,
        user_id: Uuid,
        title: &str,
    ) -> ChatStoreResult<(Conversation, bool)>;

    /// Appends messages in order; `created_at` is stamped at persistence.
    async fn append_messages(&self, messages: &[NewMessage]) -> ChatStoreResult<()>;

    /// Deletes a conversation and its dependent messages and votes.
    async fn delete(&self, id: Uuid) -> ChatStoreResult<()>;

    async fn get_votes(&self, chat_id: Uuid) -> ChatStoreResult<Vec<Vote>>;

    /// Insert-or-update keyed by `(chat_id, message_id)`; latest value wins.
    async fn upsert_vote(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        vote: VoteType,
    ) -> ChatStoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    user_id: Uuid,
    title: String,
    created_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            created_at: Timestamp(row.created_at),
        }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    #[instrument(name = "store.get_by_id", skip(self), err)]
    async fn get_by_id(&self, id: Uuid) -> ChatStoreResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, user_id, title, created_at FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Conversation::from))
    }

    #[instrument(name = "store.get_or_create", skip(self, title), err)]
    async fn get_or_create(
        &self,
        id: Uuid,
        user_id: Uuid,
        title: &str,
    ) -> ChatStoreResult<(Conversation, bool)> {
        let inserted = sqlx::query(
            "INSERT INTO conversations (id, user_id, title, created_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(user_id)
        .bind(title)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, user_id, title, created_at FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ChatStoreError::NotFound(format!("conversation {id}")))?;

        Ok((Conversation::from(row), inserted == 1))
    }

    #[instrument(name = "store.append_messages", skip(self, messages), err)]
    async fn append_messages(&self, messages: &[NewMessage]) -> ChatStoreResult<()> {
        let mut tx = self.pool.begin().await?;

        for message in messages {
            sqlx::query(
                "INSERT INTO messages (id, chat_id, role, parts, created_at)
                 VALUES ($1, $2, $3, $4, now())",
            )
            .bind(message.id)
            .bind(message.chat_id)
            .bind(message.role.as_str())
            .bind(Json(&message.parts))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(name = "store.delete", skip(self), err)]
    async fn delete(&self, id: Uuid) -> ChatStoreResult<()> {
        let affected = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if affected == 0 {
            return Err(ChatStoreError::NotFound(format!("conversation {id}")));
        }
        Ok(())
    }

    #[instrument(name = "store.get_votes", skip(self), err)]
    async fn get_votes(&self, chat_id: Uuid) -> ChatStoreResult<Vec<Vote>> {
        #[derive(sqlx::FromRow)]
        struct VoteRow {
            chat_id: Uuid,
            message_id: Uuid,
            vote: String,
        }

        let rows = sqlx::query_as::<_, VoteRow>(
            "SELECT chat_id, message_id, vote FROM votes WHERE chat_id = $1",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Vote {
                chat_id: row.chat_id,
                message_id: row.message_id,
                vote: VoteType::try_from(row.vote.as_str()).unwrap_or(VoteType::Up),
            })
            .collect())
    }

    #[instrument(name = "store.upsert_vote", skip(self), err)]
    async fn upsert_vote(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        vote: VoteType,
    ) -> ChatStoreResult<()> {
        sqlx::query(
            "INSERT INTO votes (chat_id, message_id, vote)
             VALUES ($1, $2, $3)
             ON CONFLICT (chat_id, message_id) DO UPDATE SET vote = EXCLUDED.vote",
        )
        .bind(chat_id)
        .bind(message_id)
        .bind(vote.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
