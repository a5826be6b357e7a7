use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use parley_types::events::ServerEvent;

/// What a freshly admitted connection gets back: its handle id, the channel
/// targeted events arrive on, and a full snapshot of who is online (so the
/// client can initialize its presence view without racing deltas).
pub struct Admission {
    pub conn_id: Uuid,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
    pub snapshot: Vec<Uuid>,
}

/// Tracks every open connection per user and fans events out to them.
///
/// A user is online iff they have at least one registered connection; empty
/// per-user maps are never retained. Presence broadcasts fire only on the
/// 0->1 and 1->0 transitions, under the same lock as the mutation, so
/// concurrent admits/removes for one user can never double-fire them.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// Broadcast channel for global events (presence transitions) — every
    /// connection's forwarder subscribes to it.
    broadcast_tx: broadcast::Sender<ServerEvent>,

    /// user_id -> conn_id -> targeted sender.
    /// std Mutex: every critical section is short and never crosses an await.
    connections: Mutex<HashMap<Uuid, HashMap<Uuid, mpsc::UnboundedSender<ServerEvent>>>>,
}

impl Registry {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RegistryInner {
                broadcast_tx,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to global events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connections.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a new connection for a user. Broadcasts `UserOnline` only if
    /// this is the user's first connection.
    pub fn admit(&self, user_id: Uuid) -> Admission {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut connections = self.inner.connections.lock().expect("registry lock poisoned");
        let conns = connections.entry(user_id).or_default();
        let was_online = !conns.is_empty();
        conns.insert(conn_id, tx);

        let snapshot: Vec<Uuid> = connections.keys().copied().collect();

        // Transition check and broadcast stay inside the lock so two
        // concurrent admits for the same user fire exactly one UserOnline.
        if !was_online {
            let _ = self.inner.broadcast_tx.send(ServerEvent::UserOnline { user_id });
        }

        Admission {
            conn_id,
            events: rx,
            snapshot,
        }
    }

    /// Deregister a connection. Broadcasts `UserOffline` only on the 1->0
    /// transition. Safe to call more than once for the same connection.
    pub fn remove(&self, user_id: Uuid, conn_id: Uuid) {
        let mut connections = self.inner.connections.lock().expect("registry lock poisoned");
        if let Some(conns) = connections.get_mut(&user_id) {
            if conns.remove(&conn_id).is_some() && conns.is_empty() {
                connections.remove(&user_id);
                let _ = self.inner.broadcast_tx.send(ServerEvent::UserOffline { user_id });
            }
        }
    }

    /// Send a targeted event to every open connection of a user. A user with
    /// no connections is not an error — the event simply goes nowhere.
    pub fn send_to_user(&self, user_id: Uuid, event: ServerEvent) {
        let connections = self.inner.connections.lock().expect("registry lock poisoned");
        if let Some(conns) = connections.get(&user_id) {
            for tx in conns.values() {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Like [`send_to_user`](Self::send_to_user), but skips one connection —
    /// used to reach a user's *other* tabs without echoing to the origin.
    pub fn send_to_user_except(&self, user_id: Uuid, except: Uuid, event: ServerEvent) {
        let connections = self.inner.connections.lock().expect("registry lock poisoned");
        if let Some(conns) = connections.get(&user_id) {
            for (conn_id, tx) in conns.iter() {
                if *conn_id != except {
                    let _ = tx.send(event.clone());
                }
            }
        }
    }

    /// Send an event to exactly one connection (e.g. a send error scoped to
    /// the originating tab).
    pub fn send_to_conn(&self, user_id: Uuid, conn_id: Uuid, event: ServerEvent) {
        let connections = self.inner.connections.lock().expect("registry lock poisoned");
        if let Some(tx) = connections.get(&user_id).and_then(|conns| conns.get(&conn_id)) {
            let _ = tx.send(event);
        }
    }

    /// Current set of online users.
    pub fn online_users(&self) -> Vec<Uuid> {
        self.inner
            .connections
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .copied()
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn drain_broadcast(rx: &mut broadcast::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(ev) => events.push(ev),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        events
    }

    #[test]
    fn online_fires_only_on_first_connection() {
        let registry = Registry::new();
        let mut rx = registry.subscribe();
        let user = Uuid::new_v4();

        let first = registry.admit(user);
        let second = registry.admit(user);

        let online: Vec<_> = drain_broadcast(&mut rx)
            .into_iter()
            .filter(|ev| matches!(ev, ServerEvent::UserOnline { user_id } if *user_id == user))
            .collect();
        assert_eq!(online.len(), 1, "second tab must not re-broadcast online");
        assert_ne!(first.conn_id, second.conn_id);
    }

    #[test]
    fn offline_fires_only_when_last_connection_leaves() {
        let registry = Registry::new();
        let user = Uuid::new_v4();
        let first = registry.admit(user);
        let second = registry.admit(user);

        let mut rx = registry.subscribe();
        registry.remove(user, first.conn_id);
        assert!(drain_broadcast(&mut rx).is_empty(), "still online via second tab");

        registry.remove(user, second.conn_id);
        let events = drain_broadcast(&mut rx);
        assert!(
            matches!(events.as_slice(), [ServerEvent::UserOffline { user_id }] if *user_id == user)
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        let user = Uuid::new_v4();
        let admission = registry.admit(user);

        let mut rx = registry.subscribe();
        registry.remove(user, admission.conn_id);
        registry.remove(user, admission.conn_id);

        let offline_count = drain_broadcast(&mut rx)
            .iter()
            .filter(|ev| matches!(ev, ServerEvent::UserOffline { .. }))
            .count();
        assert_eq!(offline_count, 1);
        assert!(registry.online_users().is_empty());
    }

    #[test]
    fn snapshot_contains_everyone_online_including_self() {
        let registry = Registry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let _a = registry.admit(alice);
        let admission = registry.admit(bob);

        let mut snapshot = admission.snapshot;
        snapshot.sort();
        let mut expected = vec![alice, bob];
        expected.sort();
        assert_eq!(snapshot, expected);
    }

    #[tokio::test]
    async fn targeted_send_skips_the_excluded_connection() {
        let registry = Registry::new();
        let user = Uuid::new_v4();
        let mut first = registry.admit(user);
        let mut second = registry.admit(user);

        let event = ServerEvent::TypingChanged {
            conversation_id: Uuid::new_v4(),
            user_id: user,
            is_typing: true,
        };
        registry.send_to_user_except(user, first.conn_id, event);

        assert!(first.events.try_recv().is_err());
        assert!(second.events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_to_offline_user_is_a_no_op() {
        let registry = Registry::new();
        // Must not panic or error
        registry.send_to_user(
            Uuid::new_v4(),
            ServerEvent::UserOnline { user_id: Uuid::new_v4() },
        );
    }
}
