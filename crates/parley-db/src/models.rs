//! Database row types — these map directly to SQLite rows.
//! Distinct from parley-types wire models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub name: String,
    pub password: String,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub user_a_id: String,
    pub user_b_id: String,
    pub last_read_at_a: Option<String>,
    pub last_read_at_b: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ConversationRow {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.user_a_id == user_id || self.user_b_id == user_id
    }

    /// The participant that is not `user_id`. None if `user_id` is a stranger.
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        if self.user_a_id == user_id {
            Some(&self.user_b_id)
        } else if self.user_b_id == user_id {
            Some(&self.user_a_id)
        } else {
            None
        }
    }
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub created_at: String,
}

/// One row of a user's conversation list: the conversation joined with the
/// other participant and its most recent message.
pub struct ConversationListRow {
    pub conversation: ConversationRow,
    pub other_user_id: String,
    pub other_user_email: String,
    pub other_user_name: String,
    pub last_message: Option<String>,
    pub last_message_at: Option<String>,
}
