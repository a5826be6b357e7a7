use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use parley_types::api::Claims;
use parley_types::models::MessagePayload;

use crate::auth::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination — pass the `created_at` timestamp of the
    /// oldest message from the previous page to fetch older messages.
    pub before: Option<String>,
}

fn default_limit() -> u32 {
    50
}

/// Message history for a conversation, newest first. Participants only —
/// the conversation is the authorization boundary, same as on the gateway.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let limit = query.limit.min(200);
    let before = query.before;

    let rows = {
        let db = state.db.clone();
        let cid = conversation_id.to_string();
        let caller = claims.sub.to_string();
        tokio::task::spawn_blocking(move || {
            let convo = db
                .get_conversation(&cid)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
                .ok_or(StatusCode::NOT_FOUND)?;
            if !convo.is_participant(&caller) {
                return Err(StatusCode::FORBIDDEN);
            }
            db.get_messages(&cid, limit, before.as_deref())
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
        })
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??
    };

    let messages: Vec<MessagePayload> = rows
        .into_iter()
        .filter_map(|row| {
            let id = match row.id.parse::<Uuid>() {
                Ok(id) => id,
                Err(e) => {
                    warn!("corrupt message id '{}': {}", row.id, e);
                    return None;
                }
            };
            let sender_id = match row.sender_id.parse::<Uuid>() {
                Ok(id) => id,
                Err(e) => {
                    warn!("corrupt sender id '{}' on message '{}': {}", row.sender_id, row.id, e);
                    return None;
                }
            };
            let created_at = match parley_db::parse_timestamp(&row.created_at) {
                Ok(ts) => ts,
                Err(e) => {
                    warn!("message '{}': {}", row.id, e);
                    return None;
                }
            };

            Some(MessagePayload {
                id,
                conversation_id,
                sender_id,
                sender_name: row.sender_name,
                content: row.content,
                created_at,
            })
        })
        .collect();

    Ok(Json(messages))
}
