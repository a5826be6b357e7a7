//! Per-event dispatch for the gateway: message delivery, read receipts,
//! typing relay. Every stateful conversation event passes through membership
//! resolution before any fan-out — this is the sole authorization boundary
//! of the realtime core.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_db::models::ConversationRow;
use parley_db::Database;
use parley_types::events::{ClientEvent, DeliveryFailure, ServerEvent};
use parley_types::models::MessagePayload;

use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("conversation not found")]
    NotFound,
    #[error("acting user is not a participant")]
    Forbidden,
    #[error("store failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl EventError {
    fn failure(&self) -> DeliveryFailure {
        match self {
            Self::NotFound => DeliveryFailure::NotFound,
            Self::Forbidden => DeliveryFailure::Forbidden,
            Self::Store(_) => DeliveryFailure::StoreFailed,
        }
    }
}

/// Dispatch one inbound event from a connection. Never returns an error:
/// failures either surface as a `MessageError` scoped to the originating
/// connection (sends) or are logged and dropped (read/typing, best-effort).
pub async fn handle_event(
    registry: &Registry,
    db: &Arc<Database>,
    user_id: Uuid,
    conn_id: Uuid,
    rooms: &mut HashSet<Uuid>,
    event: ClientEvent,
) {
    match event {
        ClientEvent::Join { conversation_id } => {
            rooms.insert(conversation_id);
            debug!(%user_id, %conversation_id, "joined room");
        }

        ClientEvent::Leave { conversation_id } => {
            rooms.remove(&conversation_id);
            debug!(%user_id, %conversation_id, "left room");
        }

        ClientEvent::Send {
            conversation_id,
            content,
            correlation_token,
        } => {
            if let Err(e) =
                deliver_message(registry, db, user_id, conversation_id, content, &correlation_token)
                    .await
            {
                warn!(%user_id, %conversation_id, "send rejected: {}", e);
                registry.send_to_conn(
                    user_id,
                    conn_id,
                    ServerEvent::MessageError {
                        correlation_token,
                        reason: e.failure(),
                    },
                );
            }
        }

        ClientEvent::MarkRead { conversation_id } => {
            if let Err(e) = mark_read(registry, db, user_id, conn_id, conversation_id).await {
                debug!(%user_id, %conversation_id, "mark-read dropped: {}", e);
            }
        }

        ClientEvent::Typing {
            conversation_id,
            is_typing,
        } => {
            if let Err(e) = relay_typing(registry, db, user_id, conversation_id, is_typing).await {
                debug!(%user_id, %conversation_id, "typing dropped: {}", e);
            }
        }
    }
}

/// Resolve a conversation and verify the acting user is one of its two
/// participants. The registry lock is never held here — this is plain
/// blocking store I/O hopped off the runtime.
async fn resolve_membership(
    db: &Arc<Database>,
    conversation_id: Uuid,
    acting: Uuid,
) -> Result<ConversationRow, EventError> {
    let db = db.clone();
    let cid = conversation_id.to_string();
    let row = tokio::task::spawn_blocking(move || db.get_conversation(&cid))
        .await
        .map_err(|e| EventError::Store(anyhow!("db task failed: {}", e)))??
        .ok_or(EventError::NotFound)?;

    if !row.is_participant(&acting.to_string()) {
        return Err(EventError::Forbidden);
    }
    Ok(row)
}

fn participants_of(row: &ConversationRow) -> Result<(Uuid, Uuid), EventError> {
    let a = row
        .user_a_id
        .parse()
        .map_err(|e| EventError::Store(anyhow!("corrupt participant id: {}", e)))?;
    let b = row
        .user_b_id
        .parse()
        .map_err(|e| EventError::Store(anyhow!("corrupt participant id: {}", e)))?;
    Ok((a, b))
}

/// Received -> Authorized -> Persisted -> Delivered.
///
/// Delivery goes to every open connection of BOTH participants, not just
/// connections that joined the conversation room. A tab that has not joined
/// yet would otherwise miss messages and break unread counts.
async fn deliver_message(
    registry: &Registry,
    db: &Arc<Database>,
    sender: Uuid,
    conversation_id: Uuid,
    content: String,
    correlation_token: &str,
) -> Result<(), EventError> {
    let convo = resolve_membership(db, conversation_id, sender).await?;
    let (user_a, user_b) = participants_of(&convo)?;

    // Persisted: one transaction inserts the row, bumps the conversation's
    // ordering timestamp and moves the sender's own read cursor.
    let message_id = Uuid::new_v4();
    let row = {
        let db = db.clone();
        let mid = message_id.to_string();
        let cid = conversation_id.to_string();
        let sid = sender.to_string();
        tokio::task::spawn_blocking(move || db.create_message(&mid, &cid, &sid, &content))
            .await
            .map_err(|e| EventError::Store(anyhow!("db task failed: {}", e)))??
    };

    let message = MessagePayload {
        id: message_id,
        conversation_id,
        sender_id: sender,
        sender_name: row.sender_name,
        content: row.content,
        created_at: parley_db::parse_timestamp(&row.created_at)?,
    };

    let event = ServerEvent::MessageReceived {
        message,
        correlation_token: Some(correlation_token.to_string()),
    };
    registry.send_to_user(user_a, event.clone());
    registry.send_to_user(user_b, event);

    // Sending implies the sender stopped typing.
    let other = if user_a == sender { user_b } else { user_a };
    registry.send_to_user(
        other,
        ServerEvent::TypingChanged {
            conversation_id,
            user_id: sender,
            is_typing: false,
        },
    );

    Ok(())
}

/// Move the acting user's read cursor and tell (a) their other tabs, for
/// cross-device consistency, and (b) the other participant, for delivery
/// ticks. The origin connection already knows — it is skipped.
async fn mark_read(
    registry: &Registry,
    db: &Arc<Database>,
    reader: Uuid,
    conn_id: Uuid,
    conversation_id: Uuid,
) -> Result<(), EventError> {
    let convo = resolve_membership(db, conversation_id, reader).await?;
    let (user_a, user_b) = participants_of(&convo)?;

    let read_at = Utc::now();
    {
        let db = db.clone();
        let cid = conversation_id.to_string();
        let uid = reader.to_string();
        let at = read_at.to_rfc3339();
        tokio::task::spawn_blocking(move || db.update_last_read(&cid, &uid, &at))
            .await
            .map_err(|e| EventError::Store(anyhow!("db task failed: {}", e)))??;
    }

    let event = ServerEvent::ReadStateChanged {
        conversation_id,
        reader_id: reader,
        read_at,
    };
    registry.send_to_user_except(reader, conn_id, event.clone());
    let other = if user_a == reader { user_b } else { user_a };
    registry.send_to_user(other, event);

    Ok(())
}

/// Relay a typing indicator to the other participant's connections only.
/// Never echoed back to the sender's own tabs; nothing is persisted.
async fn relay_typing(
    registry: &Registry,
    db: &Arc<Database>,
    user_id: Uuid,
    conversation_id: Uuid,
    is_typing: bool,
) -> Result<(), EventError> {
    let convo = resolve_membership(db, conversation_id, user_id).await?;
    let (user_a, user_b) = participants_of(&convo)?;

    let other = if user_a == user_id { user_b } else { user_a };
    registry.send_to_user(
        other,
        ServerEvent::TypingChanged {
            conversation_id,
            user_id,
            is_typing,
        },
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        registry: Registry,
        db: Arc<Database>,
        alice: Uuid,
        bob: Uuid,
        conversation_id: Uuid,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        db.create_user(&alice.to_string(), "alice@example.com", "Alice", "hash")
            .unwrap();
        db.create_user(&bob.to_string(), "bob@example.com", "Bob", "hash")
            .unwrap();
        let convo = db
            .find_or_create_conversation(&alice.to_string(), &bob.to_string())
            .unwrap();

        Fixture {
            registry: Registry::new(),
            db,
            alice,
            bob,
            conversation_id: convo.id.parse().unwrap(),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    async fn dispatch(fx: &Fixture, user: Uuid, conn: Uuid, event: ClientEvent) {
        let mut rooms = HashSet::new();
        handle_event(&fx.registry, &fx.db, user, conn, &mut rooms, event).await;
    }

    #[tokio::test]
    async fn send_reaches_every_connection_of_both_participants() {
        let fx = fixture();
        // Alice has two tabs, Bob one; nobody ever joined a room.
        let mut alice_tab1 = fx.registry.admit(fx.alice);
        let mut alice_tab2 = fx.registry.admit(fx.alice);
        let mut bob_tab = fx.registry.admit(fx.bob);

        dispatch(
            &fx,
            fx.alice,
            alice_tab1.conn_id,
            ClientEvent::Send {
                conversation_id: fx.conversation_id,
                content: "hi".to_string(),
                correlation_token: "t1".to_string(),
            },
        )
        .await;

        for (who, rx) in [
            ("alice tab1", &mut alice_tab1.events),
            ("alice tab2", &mut alice_tab2.events),
        ] {
            let events = drain(rx);
            assert!(
                events.iter().any(|ev| matches!(
                    ev,
                    ServerEvent::MessageReceived { message, correlation_token }
                        if message.content == "hi"
                            && correlation_token.as_deref() == Some("t1")
                )),
                "{} missed the message",
                who
            );
            assert!(
                !events.iter().any(|ev| matches!(ev, ServerEvent::MessageError { .. })),
                "{} saw a spurious error",
                who
            );
        }

        let bob_events = drain(&mut bob_tab.events);
        assert!(bob_events.iter().any(|ev| matches!(
            ev,
            ServerEvent::MessageReceived { message, correlation_token }
                if message.sender_name == "Alice" && correlation_token.as_deref() == Some("t1")
        )));
        // Implicit typing-stop rides along to the other participant
        assert!(bob_events.iter().any(|ev| matches!(
            ev,
            ServerEvent::TypingChanged { user_id, is_typing: false, .. }
                if *user_id == fx.alice
        )));
    }

    #[tokio::test]
    async fn non_participant_send_never_persists_nor_fans_out() {
        let fx = fixture();
        let mallory = Uuid::new_v4();
        fx.db
            .create_user(&mallory.to_string(), "m@example.com", "Mallory", "hash")
            .unwrap();

        let mut mallory_tab = fx.registry.admit(mallory);
        let mut alice_tab = fx.registry.admit(fx.alice);
        let mut bob_tab = fx.registry.admit(fx.bob);

        dispatch(
            &fx,
            mallory,
            mallory_tab.conn_id,
            ClientEvent::Send {
                conversation_id: fx.conversation_id,
                content: "let me in".to_string(),
                correlation_token: "t9".to_string(),
            },
        )
        .await;

        let events = drain(&mut mallory_tab.events);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::MessageError { correlation_token, reason: DeliveryFailure::Forbidden }]
                if correlation_token.as_str() == "t9"
        ));
        assert!(drain(&mut alice_tab.events).is_empty());
        assert!(drain(&mut bob_tab.events).is_empty());
        assert!(fx
            .db
            .get_messages(&fx.conversation_id.to_string(), 10, None)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn send_to_unknown_conversation_errors_to_sender_only() {
        let fx = fixture();
        let mut alice_tab = fx.registry.admit(fx.alice);
        let mut bob_tab = fx.registry.admit(fx.bob);

        dispatch(
            &fx,
            fx.alice,
            alice_tab.conn_id,
            ClientEvent::Send {
                conversation_id: Uuid::new_v4(),
                content: "into the void".to_string(),
                correlation_token: "t2".to_string(),
            },
        )
        .await;

        let events = drain(&mut alice_tab.events);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::MessageError { correlation_token, reason: DeliveryFailure::NotFound }]
                if correlation_token.as_str() == "t2"
        ));
        assert!(drain(&mut bob_tab.events).is_empty());
    }

    #[tokio::test]
    async fn mark_read_updates_own_cursor_and_fans_out_directionally() {
        let fx = fixture();
        let mut alice_tab1 = fx.registry.admit(fx.alice);
        let mut alice_tab2 = fx.registry.admit(fx.alice);
        let mut bob_tab = fx.registry.admit(fx.bob);

        dispatch(
            &fx,
            fx.alice,
            alice_tab1.conn_id,
            ClientEvent::MarkRead {
                conversation_id: fx.conversation_id,
            },
        )
        .await;

        // Origin tab is skipped; the other tab and Bob both hear about it.
        assert!(drain(&mut alice_tab1.events).is_empty());
        for rx in [&mut alice_tab2.events, &mut bob_tab.events] {
            let events = drain(rx);
            assert!(matches!(
                events.as_slice(),
                [ServerEvent::ReadStateChanged { reader_id, .. }] if *reader_id == fx.alice
            ));
        }

        // Only Alice's stored cursor moved.
        let convo = fx
            .db
            .get_conversation(&fx.conversation_id.to_string())
            .unwrap()
            .unwrap();
        let (alice_cursor, bob_cursor) = if convo.user_a_id == fx.alice.to_string() {
            (convo.last_read_at_a, convo.last_read_at_b)
        } else {
            (convo.last_read_at_b, convo.last_read_at_a)
        };
        assert!(alice_cursor.is_some());
        assert!(bob_cursor.is_none());
    }

    #[tokio::test]
    async fn typing_relays_to_other_participant_never_echoes() {
        let fx = fixture();
        let mut alice_tab1 = fx.registry.admit(fx.alice);
        let mut alice_tab2 = fx.registry.admit(fx.alice);
        let mut bob_tab = fx.registry.admit(fx.bob);

        dispatch(
            &fx,
            fx.alice,
            alice_tab1.conn_id,
            ClientEvent::Typing {
                conversation_id: fx.conversation_id,
                is_typing: true,
            },
        )
        .await;

        assert!(drain(&mut alice_tab1.events).is_empty());
        assert!(drain(&mut alice_tab2.events).is_empty());
        let events = drain(&mut bob_tab.events);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::TypingChanged { user_id, is_typing: true, .. }]
                if *user_id == fx.alice
        ));
    }

    #[tokio::test]
    async fn read_and_typing_failures_are_swallowed() {
        let fx = fixture();
        let mut alice_tab = fx.registry.admit(fx.alice);

        // Unknown conversation: both flows drop the event silently.
        dispatch(
            &fx,
            fx.alice,
            alice_tab.conn_id,
            ClientEvent::MarkRead {
                conversation_id: Uuid::new_v4(),
            },
        )
        .await;
        dispatch(
            &fx,
            fx.alice,
            alice_tab.conn_id,
            ClientEvent::Typing {
                conversation_id: Uuid::new_v4(),
                is_typing: true,
            },
        )
        .await;

        assert!(drain(&mut alice_tab.events).is_empty());
    }

    #[tokio::test]
    async fn join_and_leave_only_touch_the_room_set() {
        let fx = fixture();
        let mut rooms = HashSet::new();
        let conn = Uuid::new_v4();

        handle_event(
            &fx.registry,
            &fx.db,
            fx.alice,
            conn,
            &mut rooms,
            ClientEvent::Join {
                conversation_id: fx.conversation_id,
            },
        )
        .await;
        assert!(rooms.contains(&fx.conversation_id));

        handle_event(
            &fx.registry,
            &fx.db,
            fx.alice,
            conn,
            &mut rooms,
            ClientEvent::Leave {
                conversation_id: fx.conversation_id,
            },
        )
        .await;
        assert!(rooms.is_empty());
    }
}
