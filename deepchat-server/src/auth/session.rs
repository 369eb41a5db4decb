use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors produced while resolving a session token.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Authenticated user identity attached to the request context. Ephemeral;
/// never persisted by this service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: Uuid,
}

/// Resolves an opaque session token into a user identity, or reports its
/// absence. The identity provider itself is an external collaborator.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// # Errors
    /// Returns an error only on resolver-infrastructure failure; an unknown
    /// or expired token is `Ok(None)`.
    async fn resolve(&self, token: &str) -> Result<Option<SessionUser>, SessionError>;
}

/// Database-backed resolver over the `sessions` table written by the
/// identity provider. Tokens are stored as SHA-256 hashes.
#[derive(Debug, Clone)]
pub struct PgSessionResolver {
    pool: PgPool,
}

impl PgSessionResolver {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn hash_for_token(token: &str) -> Vec<u8> {
        Sha256::digest(token.as_bytes()).to_vec()
    }
}

#[async_trait]
impl SessionResolver for PgSessionResolver {
    async fn resolve(&self, token: &str) -> Result<Option<SessionUser>, SessionError> {
        if token.trim().is_empty() {
            return Ok(None);
        }

        #[derive(sqlx::FromRow)]
        struct SessionRow {
            user_id: Uuid,
            expires_at: DateTime<Utc>,
        }

        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT user_id, expires_at
             FROM sessions
             WHERE token_hash = $1",
        )
        .bind(Self::hash_for_token(token))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        if row.expires_at <= Utc::now() {
            debug!(user_id = %row.user_id, "session token expired");
            return Ok(None);
        }

        Ok(Some(SessionUser { id: row.user_id }))
    }
}
