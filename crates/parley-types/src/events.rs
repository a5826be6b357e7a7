use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MessagePayload;

/// Events sent FROM client TO server over the gateway WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientEvent {
    /// Join a conversation room. Rooms are optional bookkeeping — message
    /// delivery never depends on them (see `MessageReceived`).
    Join { conversation_id: Uuid },

    /// Leave a previously joined conversation room.
    Leave { conversation_id: Uuid },

    /// Send a message. `correlation_token` is a client-chosen opaque value
    /// echoed back with the persisted message so the client can reconcile
    /// its optimistic local bubble. The server never inspects or stores it.
    Send {
        conversation_id: Uuid,
        content: String,
        correlation_token: String,
    },

    /// Mark the conversation read up to now for the acting user.
    MarkRead { conversation_id: Uuid },

    /// Typing indicator on/off.
    Typing {
        conversation_id: Uuid,
        is_typing: bool,
    },
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Full set of online users, sent exactly once at admission so a new
    /// client can initialize its presence view without racing deltas.
    PresenceSnapshot { online_user_ids: Vec<Uuid> },

    /// A user's first connection opened (0 -> 1 transition only).
    UserOnline { user_id: Uuid },

    /// A user's last connection closed (1 -> 0 transition only).
    UserOffline { user_id: Uuid },

    /// A persisted message, delivered to every open connection of both
    /// participants — including the sender's own connections, which use the
    /// echoed token to replace the optimistic bubble.
    MessageReceived {
        message: MessagePayload,
        correlation_token: Option<String>,
    },

    /// A send failed. Emitted to the originating connection only, carrying
    /// the token so the client can mark that one optimistic message failed.
    MessageError {
        correlation_token: String,
        reason: DeliveryFailure,
    },

    /// A participant's read cursor moved. `reader_id` lets recipients
    /// distinguish "I read it elsewhere" from "the other side read it".
    ReadStateChanged {
        conversation_id: Uuid,
        reader_id: Uuid,
        read_at: DateTime<Utc>,
    },

    /// The other participant's typing state changed.
    TypingChanged {
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },
}

/// Why a send was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFailure {
    /// Unknown conversation id.
    NotFound,
    /// The sender is not a participant of the conversation.
    Forbidden,
    /// The store rejected the write.
    StoreFailed,
}
