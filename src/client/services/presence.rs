use std::collections::HashSet;

use log::debug;
use tokio::sync::watch;

use crate::common::protocol::{PresenceStatus, UserId};

/// An accepted presence change. No-op deltas never produce one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Resynced { online: Vec<UserId> },
    Delta { user_id: UserId, online: bool },
}

/// Client-side view of who is online: rebuilt by a full sync, then patched by
/// deltas. All mutation goes through [`PresenceView::replace_all`] and
/// [`PresenceView::apply_delta`], which publish the new set to watchers.
#[derive(Debug)]
pub struct PresenceView {
    online: HashSet<UserId>,
    tx: watch::Sender<HashSet<UserId>>,
}

impl PresenceView {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HashSet::new());
        Self { online: HashSet::new(), tx }
    }

    /// Full resync: the reply replaces the set, it is never merged.
    pub fn replace_all(&mut self, users: Vec<UserId>) -> PresenceChange {
        self.online = users.into_iter().collect();
        debug!("[PRESENCE] Full sync: {} users online", self.online.len());
        self.publish();
        let mut online: Vec<UserId> = self.online.iter().cloned().collect();
        online.sort();
        PresenceChange::Resynced { online }
    }

    pub fn apply_delta(&mut self, user_id: &str, status: PresenceStatus) -> Option<PresenceChange> {
        let changed = match status {
            PresenceStatus::Online => self.online.insert(user_id.to_string()),
            PresenceStatus::Offline => self.online.remove(user_id),
        };
        if !changed {
            return None;
        }
        self.publish();
        Some(PresenceChange::Delta {
            user_id: user_id.to_string(),
            online: status == PresenceStatus::Online,
        })
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn subscribe(&self) -> watch::Receiver<HashSet<UserId>> {
        self.tx.subscribe()
    }

    fn publish(&self) {
        self.tx.send_replace(self.online.clone());
    }
}

impl Default for PresenceView {
    fn default() -> Self {
        Self::new()
    }
}
