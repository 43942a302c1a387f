// Stato condiviso lato client: record dei messaggi e conversazione attiva
use std::fmt;
use tokio::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::common::protocol::{ConversationId, MessageId, UserId, WireMessage};

/// Identifies a local conversation log. A conversation that the server has not
/// persisted yet is keyed by the other participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Id(ConversationId),
    Draft(UserId),
}

impl ConversationKey {
    pub fn id(&self) -> Option<ConversationId> {
        match self {
            ConversationKey::Id(id) => Some(*id),
            ConversationKey::Draft(_) => None,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Id(id) => write!(f, "#{}", id),
            ConversationKey::Draft(user) => write!(f, "draft:{}", user),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sent,
    Read,
    Error,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Stable client-side handle, survives promotion from pending to sent.
    pub local_id: Uuid,
    pub id: Option<MessageId>,
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    pub recipient_id: Option<UserId>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub is_read: bool,
    pub delivery: DeliveryState,
    /// Monotonic submit time, only set on optimistic records.
    pub submitted_at: Option<Instant>,
}

impl ChatMessage {
    pub fn pending(
        conversation_id: Option<ConversationId>,
        sender_id: &str,
        recipient_id: &str,
        content: &str,
        sent_at: DateTime<Utc>,
        now: Instant,
    ) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            id: None,
            conversation_id,
            sender_id: sender_id.to_string(),
            recipient_id: Some(recipient_id.to_string()),
            content: content.to_string(),
            sent_at,
            is_read: false,
            delivery: DeliveryState::Pending,
            submitted_at: Some(now),
        }
    }

    pub fn confirmed(wire: &WireMessage, current_user: &str) -> Self {
        let delivery = if wire.is_read && wire.sender_id == current_user {
            DeliveryState::Read
        } else {
            DeliveryState::Sent
        };
        Self {
            local_id: Uuid::new_v4(),
            id: wire.id.clone(),
            conversation_id: Some(wire.conversation_id),
            sender_id: wire.sender_id.clone(),
            recipient_id: wire.recipient_id.clone(),
            content: wire.content.clone(),
            sent_at: wire.sent_at,
            is_read: wire.is_read,
            delivery,
            submitted_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == DeliveryState::Pending
    }
}

/// What the user currently has open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTarget {
    pub key: ConversationKey,
    pub recipient_id: UserId,
}

/// The active-conversation pointer. Every change goes through [`ActiveConversation::set`]
/// so that watchers (compose enablement, notification suppression, unread
/// counters) observe the same value.
#[derive(Debug)]
pub struct ActiveConversation {
    tx: watch::Sender<Option<ActiveTarget>>,
}

impl ActiveConversation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn get(&self) -> Option<ActiveTarget> {
        self.tx.borrow().clone()
    }

    pub fn is_active(&self, key: &ConversationKey) -> bool {
        self.tx.borrow().as_ref().map_or(false, |t| &t.key == key)
    }

    /// Returns false when the value did not change (no notification fired).
    pub fn set(&self, target: Option<ActiveTarget>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == target {
                false
            } else {
                *current = target;
                true
            }
        })
    }

    /// Re-key the active conversation when a draft gets its server id.
    pub fn graft(&self, from: &ConversationKey, to: ConversationKey) -> bool {
        self.tx.send_if_modified(|current| match current {
            Some(t) if &t.key == from => {
                t.key = to;
                true
            }
            _ => false,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ActiveTarget>> {
        self.tx.subscribe()
    }
}

impl Default for ActiveConversation {
    fn default() -> Self {
        Self::new()
    }
}
