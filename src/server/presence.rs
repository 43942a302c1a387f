use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::common::protocol::{Envelope, PresenceStatus, UserId};

pub type ClientId = String;

pub struct ConnectionHandle {
    pub client_id: ClientId,
    pub sender: mpsc::UnboundedSender<Message>,
}

fn to_frame(envelope: &Envelope) -> Option<Message> {
    match envelope.encode() {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            warn!("[PRESENCE] Could not encode {}: {}", envelope.kind(), e);
            None
        }
    }
}

// Map user_id -> connessione attiva (l'ultima vince)
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<HashMap<UserId, ConnectionHandle>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the connection as the user's only one. A previous connection
    /// is told to close; everyone else hears `online` only for a newcomer.
    pub async fn register(&self, user_id: &str, handle: ConnectionHandle) {
        let mut map = self.inner.lock().await;
        let client_id = handle.client_id.clone();
        match map.insert(user_id.to_string(), handle) {
            Some(previous) => {
                info!(
                    "[PRESENCE] User {} reconnected ({} replaces {}), closing the old connection",
                    user_id, client_id, previous.client_id
                );
                let _ = previous.sender.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "replaced by a newer connection".into(),
                })));
            }
            None => {
                info!("[PRESENCE] User {} online (total={})", user_id, map.len());
                if let Some(frame) = to_frame(&Envelope::user_status(user_id, PresenceStatus::Online)) {
                    for (other, conn) in map.iter() {
                        if other != user_id {
                            let _ = conn.sender.send(frame.clone());
                        }
                    }
                }
            }
        }
    }

    /// Removes the entry only if it still belongs to `client_id`.
    pub async fn unregister(&self, user_id: &str, client_id: &str) -> bool {
        let mut map = self.inner.lock().await;
        let owned = map.get(user_id).map(|c| c.client_id == client_id).unwrap_or(false);
        if !owned {
            debug!("[PRESENCE] Stale handler {} for {} ignored", client_id, user_id);
            return false;
        }
        map.remove(user_id);
        info!("[PRESENCE] User {} offline (total={})", user_id, map.len());
        if let Some(frame) = to_frame(&Envelope::user_status(user_id, PresenceStatus::Offline)) {
            for conn in map.values() {
                let _ = conn.sender.send(frame.clone());
            }
        }
        true
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.inner.lock().await.contains_key(user_id)
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        let map = self.inner.lock().await;
        let mut users: Vec<UserId> = map.keys().cloned().collect();
        users.sort();
        users
    }

    /// Returns false when the user has no live connection.
    pub async fn send_to(&self, user_id: &str, envelope: &Envelope) -> bool {
        let Some(frame) = to_frame(envelope) else {
            return false;
        };
        let map = self.inner.lock().await;
        match map.get(user_id) {
            Some(conn) => conn.sender.send(frame).is_ok(),
            None => false,
        }
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle { client_id: id.to_string(), sender: tx }, rx)
    }

    fn status_of(msg: Message) -> (String, PresenceStatus) {
        match Envelope::decode(msg.to_text().unwrap()).unwrap() {
            Envelope::UserStatus { content } => (content.user_id, content.status),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn newcomers_are_announced_to_the_others() {
        let registry = PresenceRegistry::new();
        let (alice, mut alice_rx) = handle("c1");
        let (bob, mut bob_rx) = handle("c2");
        registry.register("alice", alice).await;
        registry.register("bob", bob).await;

        assert_eq!(status_of(alice_rx.try_recv().unwrap()), ("bob".into(), PresenceStatus::Online));
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(registry.online_users().await, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn a_second_connection_replaces_the_first_silently() {
        let registry = PresenceRegistry::new();
        let (watcher, mut watcher_rx) = handle("w");
        registry.register("carol", watcher).await;
        let (old, mut old_rx) = handle("old");
        let (new, _new_rx) = handle("new");
        registry.register("alice", old).await;
        let _ = watcher_rx.try_recv();
        registry.register("alice", new).await;

        assert!(matches!(old_rx.try_recv().unwrap(), Message::Close(_)));
        assert!(watcher_rx.try_recv().is_err());
        assert_eq!(registry.count().await, 2);

        // the old handler exits later and must not evict the new connection
        assert!(!registry.unregister("alice", "old").await);
        assert!(registry.is_online("alice").await);
        assert!(watcher_rx.try_recv().is_err());

        assert!(registry.unregister("alice", "new").await);
        assert_eq!(status_of(watcher_rx.try_recv().unwrap()), ("alice".into(), PresenceStatus::Offline));
    }

    #[tokio::test]
    async fn send_to_reports_missing_users() {
        let registry = PresenceRegistry::new();
        let (bob, mut bob_rx) = handle("c2");
        registry.register("bob", bob).await;
        assert!(registry.send_to("bob", &Envelope::Pong).await);
        assert!(!registry.send_to("ghost", &Envelope::Pong).await);
        assert_eq!(bob_rx.try_recv().unwrap().to_text().unwrap(), r#"{"type":"pong"}"#);
    }
}
