use axum::{extract::State, http::StatusCode, response::IntoResponse, Extension, Json};
use tracing::warn;
use uuid::Uuid;

use parley_types::api::Claims;
use parley_types::models::UserPublic;

use crate::auth::AppState;

/// Directory of other users, for starting chats. Excludes the caller.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let rows = {
        let db = state.db.clone();
        let caller = claims.sub.to_string();
        tokio::task::spawn_blocking(move || db.list_users_except(&caller))
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    };

    let users: Vec<UserPublic> = rows
        .into_iter()
        .filter_map(|row| match row.id.parse::<Uuid>() {
            Ok(id) => Some(UserPublic {
                id,
                email: row.email,
                name: row.name,
            }),
            Err(e) => {
                warn!("corrupt user id '{}': {}", row.id, e);
                None
            }
        })
        .collect();

    Ok(Json(users))
}
