//! Conversation store endpoints.
//!
//! The client is the source of truth: after a turn completes it PUTs the
//! whole conversation keyed by id. Reads serve that authoritative snapshot,
//! which also supersedes any rows the streaming proxy appended mid-turn.

use axum::{
    Json,
    extract::{Path, State},
};
use tracing::instrument;

use muse_protocol::{ConversationPayload, ConversationSummary};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::CurrentUser;

/// PUT /api/conversations/{id}
#[instrument(skip(state, user, conversation))]
pub async fn upsert_conversation(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(conversation): Json<ConversationPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    if conversation.id != id {
        return Err(ApiError::bad_request(format!(
            "conversation id mismatch: body says {}, path says {id}",
            conversation.id
        )));
    }

    let store = state.require_store()?;
    store
        .upsert_conversation(Some(user.id()), &conversation)
        .await?;

    Ok(Json(serde_json::json!({ "ok": true })))
}

/// GET /api/conversations/{id}
#[instrument(skip(state, _user))]
pub async fn get_conversation(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<ConversationPayload>> {
    let store = state.require_store()?;
    let conversation = store
        .get_conversation(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("conversation: {id}")))?;

    Ok(Json(conversation))
}

/// GET /api/conversations
#[instrument(skip(state, user))]
pub async fn list_conversations(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    let store = state.require_store()?;
    Ok(Json(store.list_conversations(user.id()).await?))
}
