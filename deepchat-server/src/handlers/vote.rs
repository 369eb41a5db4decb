//! Vote handler: record or fetch the binary preference signal for a
//! (conversation, message) pair, gated by ownership.

use axum::{
    Json, Router,
    extract::{Extension, Query, State},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use shared::models::{Vote, VoteRequest, VoteType};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    http::error::{ApiError, AppResult},
    middleware::request_context::RequestContext,
};

pub fn routes() -> Router<AppState> {
    Router::new().route("/vote", get(get_votes).patch(patch_vote))
}

#[derive(Debug, Deserialize)]
struct VoteQuery {
    #[serde(rename = "chatId")]
    chat_id: Option<String>,
}

#[instrument(skip(state, context, query), fields(request_id = %context.request_id))]
async fn get_votes(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Query(query): Query<VoteQuery>,
) -> AppResult<Json<Vec<Vote>>> {
    let chat_id = parse_required_uuid(query.chat_id.as_deref(), "chatId is required")?;

    let user_id = context.user_id().ok_or_else(ApiError::unauthenticated)?;

    // A deleted or never-voted conversation is an empty result, not an
    // error; the PATCH side treats absence as not-found instead.
    let Some(conversation) = state.store.get_by_id(chat_id).await? else {
        return Ok(Json(Vec::new()));
    };

    if conversation.user_id != user_id {
        return Err(ApiError::unauthorized());
    }

    let votes = state.store.get_votes(chat_id).await?;
    Ok(Json(votes))
}

#[instrument(skip(state, context, payload), fields(request_id = %context.request_id))]
async fn patch_vote(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Json(payload): Json<VoteRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let chat_id = parse_required_uuid(payload.chat_id.as_deref(), "chatId is required")?;
    let message_id = parse_required_uuid(payload.message_id.as_deref(), "messageId is required")?;
    let vote = payload
        .vote_type
        .as_deref()
        .and_then(|value| VoteType::try_from(value).ok())
        .ok_or_else(|| ApiError::invalid_input("type must be either \"up\" or \"down\""))?;

    let user_id = context.user_id().ok_or_else(ApiError::unauthenticated)?;

    let conversation = state
        .store
        .get_by_id(chat_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Chat not found"))?;

    if conversation.user_id != user_id {
        return Err(ApiError::unauthorized());
    }

    state.store.upsert_vote(chat_id, message_id, vote).await?;
    metrics::counter!("votes_recorded_total", "vote" => vote.as_str()).increment(1);

    Ok(Json(json!({ "message": "Message voted successfully" })))
}

fn parse_required_uuid(value: Option<&str>, missing_message: &str) -> AppResult<Uuid> {
    let raw = value
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::invalid_input(missing_message))?;
    Uuid::parse_str(raw).map_err(|_| ApiError::invalid_input(missing_message))
}
