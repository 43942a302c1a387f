use std::collections::HashMap;
use tokio::time::Instant;

use chrono::{DateTime, Utc};

use crate::client::models::app_state::{ChatMessage, ConversationKey};
use crate::common::protocol::{ConversationSummary, UserId};

/// Local, time-ordered window over one conversation plus its pagination cursor.
#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    messages: Vec<ChatMessage>,
    /// Number of persisted messages already fetched (newest-first offset).
    pub offset: u32,
    pub initial_loaded: bool,
    pub loading: bool,
    pub fully_backfilled: bool,
    pub last_backfill_request: Option<Instant>,
}

impl ConversationLog {
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> &mut [ChatMessage] {
        &mut self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Insert keeping `sent_at` non-decreasing. Walks back from the tail since
    /// live arrivals are almost always the newest. Equal timestamps keep
    /// arrival order. Returns the index used.
    pub fn insert_ordered(&mut self, message: ChatMessage) -> usize {
        let mut idx = self.messages.len();
        while idx > 0 && self.messages[idx - 1].sent_at > message.sent_at {
            idx -= 1;
        }
        self.messages.insert(idx, message);
        idx
    }

    /// Move the record at `idx` to its ordered slot after its timestamp changed.
    pub fn reposition(&mut self, idx: usize) -> usize {
        let message = self.messages.remove(idx);
        self.insert_ordered(message)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id.as_deref() == Some(id))
    }

    pub fn position_by_local_id(&self, local_id: &uuid::Uuid) -> Option<usize> {
        self.messages.iter().position(|m| &m.local_id == local_id)
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Absorb another log (draft grafting). Pagination state of `self` wins.
    pub fn absorb(&mut self, other: ConversationLog) {
        for message in other.messages {
            self.insert_ordered(message);
        }
    }
}

/// Sidebar entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub key: ConversationKey,
    pub other_user_id: UserId,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread: u32,
    pub online: bool,
}

/// Conversation list ordered by last activity, newest first.
#[derive(Debug, Clone, Default)]
pub struct ConversationList {
    entries: HashMap<ConversationKey, ConversationEntry>,
}

impl ConversationList {
    /// Server list wins; local drafts survive.
    pub fn replace_all(&mut self, summaries: &[ConversationSummary], is_online: impl Fn(&str) -> bool) {
        self.entries.retain(|key, _| matches!(key, ConversationKey::Draft(_)));
        for s in summaries {
            let key = ConversationKey::Id(s.conversation_id);
            self.entries.insert(
                key.clone(),
                ConversationEntry {
                    key,
                    other_user_id: s.other_user_id.clone(),
                    last_message: s.last_message.clone(),
                    last_message_at: s.last_message_at,
                    unread: s.unread,
                    online: is_online(&s.other_user_id),
                },
            );
        }
    }

    pub fn touch(
        &mut self,
        key: &ConversationKey,
        other_user_id: &str,
        preview: &str,
        at: DateTime<Utc>,
        online: bool,
    ) {
        let entry = self.entries.entry(key.clone()).or_insert_with(|| ConversationEntry {
            key: key.clone(),
            other_user_id: other_user_id.to_string(),
            last_message: None,
            last_message_at: None,
            unread: 0,
            online,
        });
        if entry.last_message_at.map_or(true, |prev| prev <= at) {
            entry.last_message = Some(preview.to_string());
            entry.last_message_at = Some(at);
        }
    }

    pub fn ensure(&mut self, key: &ConversationKey, other_user_id: &str, online: bool) {
        self.entries.entry(key.clone()).or_insert_with(|| ConversationEntry {
            key: key.clone(),
            other_user_id: other_user_id.to_string(),
            last_message: None,
            last_message_at: None,
            unread: 0,
            online,
        });
    }

    pub fn set_unread(&mut self, key: &ConversationKey, unread: u32) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.unread = unread;
        }
    }

    /// Returns true when at least one badge flipped.
    pub fn set_online(&mut self, user_id: &str, online: bool) -> bool {
        let mut changed = false;
        for entry in self.entries.values_mut() {
            if entry.other_user_id == user_id && entry.online != online {
                entry.online = online;
                changed = true;
            }
        }
        changed
    }

    pub fn refresh_badges(&mut self, is_online: impl Fn(&str) -> bool) {
        for entry in self.entries.values_mut() {
            entry.online = is_online(&entry.other_user_id);
        }
    }

    pub fn graft(&mut self, from: &ConversationKey, to: ConversationKey) {
        if let Some(mut entry) = self.entries.remove(from) {
            entry.key = to.clone();
            match self.entries.get_mut(&to) {
                Some(existing) => {
                    if existing.last_message_at < entry.last_message_at {
                        existing.last_message = entry.last_message;
                        existing.last_message_at = entry.last_message_at;
                    }
                }
                None => {
                    self.entries.insert(to, entry);
                }
            }
        }
    }

    pub fn get(&self, key: &ConversationKey) -> Option<&ConversationEntry> {
        self.entries.get(key)
    }

    pub fn find_by_user(&self, user_id: &str) -> Option<&ConversationEntry> {
        self.entries.values().find(|e| e.other_user_id == user_id)
    }

    pub fn snapshot(&self) -> Vec<ConversationEntry> {
        let mut list: Vec<ConversationEntry> = self.entries.values().cloned().collect();
        list.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        list
    }
}
