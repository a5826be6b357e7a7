use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Public view of a user — never carries the password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPublic {
    pub id: Uuid,
    pub email: String,
    pub name: String,
}

/// A persisted message as it travels over the gateway and the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One entry in a user's conversation list: the other participant, the most
/// recent message (if any), and both read cursors so the client can compute
/// unread state and delivery ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub other_user: UserPublic,
    pub last_message: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub my_last_read_at: Option<DateTime<Utc>>,
    pub their_last_read_at: Option<DateTime<Utc>>,
}
