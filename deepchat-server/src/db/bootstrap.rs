//! Database bootstrap: schema creation and startup health checks.

use sqlx::PgPool;
use tracing::info;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS conversations (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        title TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id UUID PRIMARY KEY,
        chat_id UUID NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
        role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system', 'tool')),
        parts JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS messages_chat_id_created_at_idx
        ON messages (chat_id, created_at)",
    "CREATE TABLE IF NOT EXISTS votes (
        chat_id UUID NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
        message_id UUID NOT NULL,
        vote TEXT NOT NULL CHECK (vote IN ('up', 'down')),
        PRIMARY KEY (chat_id, message_id)
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        token_hash BYTEA PRIMARY KEY,
        user_id UUID NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )",
];

/// Simple liveness check used during startup.
///
/// # Errors
/// Returns the underlying database error if the probe query fails.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// Creates the schema when missing. Statements are idempotent so restarts
/// and concurrent instances are safe.
///
/// # Errors
/// Returns the underlying database error if any statement fails.
pub async fn run(pool: &PgPool) -> Result<(), sqlx::Error> {
    info!("running database bootstrap");
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
