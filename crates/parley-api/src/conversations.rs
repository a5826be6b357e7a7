use axum::{extract::State, http::StatusCode, response::IntoResponse, Extension, Json};
use tracing::warn;
use uuid::Uuid;

use parley_types::api::{Claims, StartConversationRequest, StartConversationResponse};
use parley_types::models::{ConversationSummary, UserPublic};

use crate::auth::AppState;

/// Find or create the conversation for the caller and a target user. The
/// unordered pair is unique, so repeated starts return the same id. The
/// realtime core never creates conversations — only this endpoint does.
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.target_user_id == claims.sub {
        return Err(StatusCode::BAD_REQUEST);
    }

    let target_exists = {
        let db = state.db.clone();
        let target = req.target_user_id.to_string();
        tokio::task::spawn_blocking(move || db.get_user_by_id(&target))
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .is_some()
    };
    if !target_exists {
        return Err(StatusCode::NOT_FOUND);
    }

    let row = {
        let db = state.db.clone();
        let caller = claims.sub.to_string();
        let target = req.target_user_id.to_string();
        tokio::task::spawn_blocking(move || db.find_or_create_conversation(&caller, &target))
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    };

    let conversation_id: Uuid = row
        .id
        .parse()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(StartConversationResponse { conversation_id }))
}

/// The caller's conversation list, newest activity first, with the other
/// participant, a last-message preview and both read cursors.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let rows = {
        let db = state.db.clone();
        let caller = claims.sub.to_string();
        tokio::task::spawn_blocking(move || db.list_conversations_for_user(&caller))
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    };

    let caller = claims.sub.to_string();
    let summaries: Vec<ConversationSummary> = rows
        .into_iter()
        .filter_map(|row| {
            let convo = &row.conversation;
            let id = match convo.id.parse::<Uuid>() {
                Ok(id) => id,
                Err(e) => {
                    warn!("corrupt conversation id '{}': {}", convo.id, e);
                    return None;
                }
            };
            let other_id = match row.other_user_id.parse::<Uuid>() {
                Ok(id) => id,
                Err(e) => {
                    warn!("corrupt user id '{}' on conversation '{}': {}", row.other_user_id, convo.id, e);
                    return None;
                }
            };

            let (mine, theirs) = if convo.user_a_id == caller {
                (&convo.last_read_at_a, &convo.last_read_at_b)
            } else {
                (&convo.last_read_at_b, &convo.last_read_at_a)
            };

            // Last message timestamp if any, conversation creation otherwise
            let activity_raw = row.last_message_at.as_deref().unwrap_or(&convo.created_at);
            let last_activity_at = match parley_db::parse_timestamp(activity_raw) {
                Ok(ts) => ts,
                Err(e) => {
                    warn!("conversation '{}': {}", convo.id, e);
                    return None;
                }
            };

            Some(ConversationSummary {
                id,
                other_user: UserPublic {
                    id: other_id,
                    email: row.other_user_email,
                    name: row.other_user_name,
                },
                last_message: row.last_message,
                last_activity_at,
                my_last_read_at: mine
                    .as_deref()
                    .and_then(|raw| parley_db::parse_timestamp(raw).ok()),
                their_last_read_at: theirs
                    .as_deref()
                    .and_then(|raw| parley_db::parse_timestamp(raw).ok()),
            })
        })
        .collect();

    Ok(Json(summaries))
}
