use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::{ClientEvent, ServerEvent};

use crate::handlers;
use crate::registry::Registry;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle one pre-authenticated WebSocket connection. The JWT was already
/// validated at the HTTP upgrade layer, so this goes straight to admission:
/// register with the registry, push the presence snapshot, then run the
/// send/receive task pair until the transport closes or the heartbeat fails.
pub async fn handle_connection(
    socket: WebSocket,
    registry: Registry,
    db: Arc<Database>,
    user_id: Uuid,
    name: String,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", name, user_id);

    // Subscribe to global events before admitting so no presence transition
    // slips between the snapshot and the subscription. A delta that is also
    // reflected in the snapshot is harmless — clients apply both as set ops.
    let mut broadcast_rx = registry.subscribe();
    let admission = registry.admit(user_id);
    let conn_id = admission.conn_id;
    let mut user_rx = admission.events;

    // The snapshot goes out first, exactly once, so the client can seed its
    // presence view before any incremental event arrives.
    let snapshot = ServerEvent::PresenceSnapshot {
        online_user_ids: admission.snapshot,
    };
    if sender
        .send(Message::Text(serde_json::to_string(&snapshot).unwrap().into()))
        .await
        .is_err()
    {
        registry.remove(user_id, conn_id);
        return;
    }

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read events from the client. Each connection's events are processed
    // strictly in arrival order by this single task.
    let registry_recv = registry.clone();
    let name_recv = name.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut rooms: HashSet<Uuid> = HashSet::new();

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        handlers::handle_event(
                            &registry_recv,
                            &db,
                            user_id,
                            conn_id,
                            &mut rooms,
                            event,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad event: {} -- raw: {}",
                            name_recv,
                            user_id,
                            e,
                            truncate_utf8(&text, 200)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Single removal point: both the explicit close path and the heartbeat
    // path converge here, and remove is idempotent besides.
    registry.remove(user_id, conn_id);
    info!("{} ({}) disconnected from gateway", name, user_id);
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character —
/// inbound frames are attacker-controlled, so a naive byte slice could panic
/// the receive task on a multi-byte boundary.
fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_never_splits_a_multibyte_char() {
        // 100 three-byte chars: 300 bytes total, 200 is mid-char
        let garbage = "€".repeat(100);
        let truncated = truncate_utf8(&garbage, 200);
        assert_eq!(truncated.len(), 198);
        assert!(truncated.chars().all(|c| c == '€'));
    }

    #[test]
    fn truncation_leaves_short_input_alone() {
        assert_eq!(truncate_utf8("hello", 200), "hello");
        assert_eq!(truncate_utf8("", 200), "");
        // Exact ASCII boundary is untouched
        let ascii = "x".repeat(200);
        assert_eq!(truncate_utf8(&ascii, 200).len(), 200);
    }
}
