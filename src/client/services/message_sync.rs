// Sincronizzazione messaggi: invio ottimistico, riconciliazione, deduplicazione, paginazione
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::client::models::app_state::{ChatMessage, ConversationKey, DeliveryState};
use crate::client::models::conversation::ConversationLog;
use crate::common::protocol::{ConversationId, Envelope, UserId, WireMessage};

pub const PAGE_SIZE: u32 = 20;
pub const SCROLL_THRESHOLD_PX: f32 = 100.0;
pub const BACKFILL_THROTTLE: Duration = Duration::from_millis(500);
pub const MATCH_WINDOW: Duration = Duration::from_secs(5);
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEDUP_TTL: Duration = Duration::from_secs(30);
const DEDUP_PREFIX_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("message is empty")]
    EmptyContent,
    #[error("an identical message is already being sent")]
    DuplicatePending,
    #[error("recipient {0} is offline")]
    RecipientOffline(UserId),
    #[error("not connected")]
    NotConnected,
    #[error("no conversation is open")]
    NoActiveConversation,
    #[error("message not found or not retryable")]
    NotRetryable,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    id: Option<String>,
    sender_id: UserId,
    conversation_id: ConversationId,
    prefix: String,
}

impl DedupKey {
    fn of(msg: &WireMessage) -> Self {
        Self {
            id: msg.id.clone(),
            sender_id: msg.sender_id.clone(),
            conversation_id: msg.conversation_id,
            prefix: msg.content.chars().take(DEDUP_PREFIX_CHARS).collect(),
        }
    }
}

/// Short-lived memory of delivered frames, so the same frame seen twice
/// (for instance across a reconnect replay) is processed once.
#[derive(Debug, Default)]
pub struct DedupCache {
    seen: HashMap<DedupKey, Instant>,
}

impl DedupCache {
    /// True the first time a frame is seen within the TTL.
    pub fn first_sighting(&mut self, msg: &WireMessage, now: Instant) -> bool {
        let key = DedupKey::of(msg);
        match self.seen.get(&key) {
            Some(seen_at) if now.saturating_duration_since(*seen_at) < DEDUP_TTL => false,
            _ => {
                self.seen.insert(key, now);
                true
            }
        }
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, seen_at| now.saturating_duration_since(*seen_at) < DEDUP_TTL);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Initial,
    Older,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub key: ConversationKey,
    pub conversation_id: ConversationId,
    pub limit: u32,
    pub offset: u32,
    pub kind: HistoryKind,
}

impl HistoryRequest {
    pub fn to_envelope(&self, request_id: &str) -> Envelope {
        Envelope::GetHistory {
            request_id: request_id.to_string(),
            conversation_id: self.conversation_id,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { added: usize },
    /// Empty older page: nothing left to fetch.
    Exhausted,
}

/// A draft log that was re-keyed onto its server id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graft {
    pub from: ConversationKey,
    pub to: ConversationKey,
}

#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    Duplicate,
    AlreadyKnown { key: ConversationKey },
    Promoted { key: ConversationKey, local_id: Uuid, recipient_id: Option<UserId>, graft: Option<Graft> },
    Inserted { key: ConversationKey, message: ChatMessage, graft: Option<Graft> },
    /// Own echo with no pending record left to promote.
    Stale { key: ConversationKey },
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub key: ConversationKey,
    pub local_id: Uuid,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    pub marked_read: usize,
    pub cleared_unread: bool,
}

fn within_window(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_milliseconds().unsigned_abs() <= MATCH_WINDOW.as_millis() as u64
}

/// Index of a pending record that `wire` confirms.
fn pending_match(log: &ConversationLog, wire: &WireMessage) -> Option<usize> {
    log.messages().iter().position(|m| {
        m.is_pending()
            && m.sender_id == wire.sender_id
            && m.content == wire.content
            && within_window(m.sent_at, wire.sent_at)
    })
}

/// Replace the optimistic record in place with the server's view of it.
/// Returns the record's local id and recipient.
fn promote(log: &mut ConversationLog, idx: usize, wire: &WireMessage) -> (Uuid, Option<UserId>) {
    let record = &mut log.messages_mut()[idx];
    record.id = wire.id.clone();
    record.conversation_id = Some(wire.conversation_id);
    record.sent_at = wire.sent_at;
    record.delivery = if wire.is_read { DeliveryState::Read } else { DeliveryState::Sent };
    record.is_read = wire.is_read;
    record.submitted_at = None;
    if record.recipient_id.is_none() {
        record.recipient_id = wire.recipient_id.clone();
    }
    let confirmed = (record.local_id, record.recipient_id.clone());
    log.reposition(idx);
    confirmed
}

/// Owns every conversation log of the signed-in user and is the only place
/// where records are created, promoted or failed.
#[derive(Debug)]
pub struct MessageSynchronizer {
    current_user: UserId,
    logs: HashMap<ConversationKey, ConversationLog>,
    unread: HashMap<ConversationKey, u32>,
    dedup: DedupCache,
}

impl MessageSynchronizer {
    pub fn new(current_user: impl Into<UserId>) -> Self {
        Self {
            current_user: current_user.into(),
            logs: HashMap::new(),
            unread: HashMap::new(),
            dedup: DedupCache::default(),
        }
    }

    pub fn current_user(&self) -> &str {
        &self.current_user
    }

    pub fn log(&self, key: &ConversationKey) -> Option<&ConversationLog> {
        self.logs.get(key)
    }

    pub fn messages(&self, key: &ConversationKey) -> Vec<ChatMessage> {
        self.logs.get(key).map(|log| log.messages().to_vec()).unwrap_or_default()
    }

    pub fn unread(&self, key: &ConversationKey) -> u32 {
        self.unread.get(key).copied().unwrap_or(0)
    }

    pub fn bump_unread(&mut self, key: &ConversationKey) -> u32 {
        let count = self.unread.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn set_unread(&mut self, key: &ConversationKey, count: u32) {
        if count == 0 {
            self.unread.remove(key);
        } else {
            self.unread.insert(key.clone(), count);
        }
    }

    /// Move a draft log under its server id. Returns the re-key when one happened.
    pub fn graft(&mut self, other_user: &str, conversation_id: ConversationId) -> Option<Graft> {
        let from = ConversationKey::Draft(other_user.to_string());
        let mut draft = self.logs.remove(&from)?;
        for message in draft.messages_mut() {
            message.conversation_id = Some(conversation_id);
        }
        let to = ConversationKey::Id(conversation_id);
        self.logs.entry(to.clone()).or_default().absorb(draft);
        if let Some(count) = self.unread.remove(&from) {
            *self.unread.entry(to.clone()).or_insert(0) += count;
        }
        info!("[SYNC] Grafted {} onto {}", from, to);
        Some(Graft { from, to })
    }

    pub fn submit(
        &mut self,
        key: ConversationKey,
        recipient_id: &str,
        content: &str,
        sent_at: DateTime<Utc>,
        now: Instant,
    ) -> Result<Submission, SubmitError> {
        if content.trim().is_empty() {
            return Err(SubmitError::EmptyContent);
        }
        let log = self.logs.entry(key.clone()).or_default();
        let duplicate = log.messages().iter().any(|m| {
            m.is_pending() && m.sender_id == self.current_user && m.content == content && within_window(m.sent_at, sent_at)
        });
        if duplicate {
            return Err(SubmitError::DuplicatePending);
        }
        let record = ChatMessage::pending(key.id(), &self.current_user, recipient_id, content, sent_at, now);
        let local_id = record.local_id;
        log.insert_ordered(record);
        debug!("[SYNC] Pending {} in {}", local_id, key);
        Ok(Submission {
            envelope: Envelope::Private {
                recipient_id: recipient_id.to_string(),
                content: content.to_string(),
                conversation_id: key.id(),
                is_new_conversation: key.id().is_none(),
            },
            key,
            local_id,
        })
    }

    /// Manual resend of a failed record. Never triggered automatically.
    pub fn retry(
        &mut self,
        key: &ConversationKey,
        local_id: Uuid,
        sent_at: DateTime<Utc>,
        now: Instant,
    ) -> Result<Submission, SubmitError> {
        let log = self.logs.get_mut(key).ok_or(SubmitError::NotRetryable)?;
        let idx = log.position_by_local_id(&local_id).ok_or(SubmitError::NotRetryable)?;
        let (content, recipient_id) = {
            let record = &log.messages()[idx];
            if record.delivery != DeliveryState::Error {
                return Err(SubmitError::NotRetryable);
            }
            (record.content.clone(), record.recipient_id.clone().ok_or(SubmitError::NotRetryable)?)
        };
        let duplicate = log.messages().iter().any(|m| {
            m.is_pending() && m.sender_id == self.current_user && m.content == content && within_window(m.sent_at, sent_at)
        });
        if duplicate {
            return Err(SubmitError::DuplicatePending);
        }
        let record = &mut log.messages_mut()[idx];
        record.delivery = DeliveryState::Pending;
        record.sent_at = sent_at;
        record.submitted_at = Some(now);
        log.reposition(idx);
        info!("[SYNC] Retrying {} in {}", local_id, key);
        Ok(Submission {
            envelope: Envelope::Private {
                recipient_id,
                content,
                conversation_id: key.id(),
                is_new_conversation: key.id().is_none(),
            },
            key: key.clone(),
            local_id,
        })
    }

    /// Draft whose pending record an own echo confirms, for echoes that carry
    /// no recipient. None when the id-keyed log already holds the match.
    fn draft_confirmed_by(&self, wire: &WireMessage) -> Option<UserId> {
        let keyed = ConversationKey::Id(wire.conversation_id);
        if self.logs.get(&keyed).map_or(false, |log| pending_match(log, wire).is_some()) {
            return None;
        }
        self.logs.iter().find_map(|(key, log)| match key {
            ConversationKey::Draft(user) if pending_match(log, wire).is_some() => Some(user.clone()),
            _ => None,
        })
    }

    pub fn reconcile(&mut self, wire: &WireMessage, now: Instant) -> ReconcileOutcome {
        if !self.dedup.first_sighting(wire, now) {
            debug!("[SYNC] Duplicate frame for conversation {}", wire.conversation_id);
            return ReconcileOutcome::Duplicate;
        }
        let own = wire.sender_id == self.current_user;
        let other = if own {
            wire.recipient_id.clone().or_else(|| self.draft_confirmed_by(wire))
        } else {
            Some(wire.sender_id.clone())
        };
        let graft = other.as_deref().and_then(|o| self.graft(o, wire.conversation_id));

        let key = ConversationKey::Id(wire.conversation_id);
        let log = self.logs.entry(key.clone()).or_default();

        if let Some(id) = &wire.id {
            if log.contains_id(id) {
                return ReconcileOutcome::AlreadyKnown { key };
            }
        }

        if let Some(idx) = pending_match(log, wire) {
            let (local_id, recipient_id) = promote(log, idx, wire);
            if log.initial_loaded {
                log.offset += 1;
            }
            debug!("[SYNC] Confirmed {} in {}", local_id, key);
            return ReconcileOutcome::Promoted { key, local_id, recipient_id, graft };
        }

        // Persisted either way, so the newest-first cursor shifts.
        if log.initial_loaded {
            log.offset += 1;
        }
        if own {
            warn!("[SYNC] Dropping stale confirmation in {}", key);
            return ReconcileOutcome::Stale { key };
        }
        let message = ChatMessage::confirmed(wire, &self.current_user);
        log.insert_ordered(message.clone());
        ReconcileOutcome::Inserted { key, message, graft }
    }

    /// Flip overdue pending records to error.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<(ConversationKey, Uuid)> {
        let mut failed = Vec::new();
        for (key, log) in self.logs.iter_mut() {
            for record in log.messages_mut() {
                let overdue = record
                    .submitted_at
                    .map_or(false, |at| now.saturating_duration_since(at) >= CONFIRM_TIMEOUT);
                if record.is_pending() && overdue {
                    record.delivery = DeliveryState::Error;
                    record.submitted_at = None;
                    warn!("[SYNC] No confirmation for {} in {}", record.local_id, key);
                    failed.push((key.clone(), record.local_id));
                }
            }
        }
        failed
    }

    pub fn begin_initial_load(&mut self, key: &ConversationKey) -> Option<HistoryRequest> {
        let conversation_id = key.id()?;
        let log = self.logs.entry(key.clone()).or_default();
        if log.loading || log.initial_loaded {
            return None;
        }
        log.loading = true;
        Some(HistoryRequest {
            key: key.clone(),
            conversation_id,
            limit: PAGE_SIZE,
            offset: 0,
            kind: HistoryKind::Initial,
        })
    }

    pub fn begin_older_page(&mut self, key: &ConversationKey, scroll_top_px: f32, now: Instant) -> Option<HistoryRequest> {
        if scroll_top_px > SCROLL_THRESHOLD_PX {
            return None;
        }
        let conversation_id = key.id()?;
        let log = self.logs.get_mut(key)?;
        if !log.initial_loaded || log.loading || log.fully_backfilled {
            return None;
        }
        if let Some(last) = log.last_backfill_request {
            if now.saturating_duration_since(last) < BACKFILL_THROTTLE {
                return None;
            }
        }
        log.loading = true;
        log.last_backfill_request = Some(now);
        Some(HistoryRequest {
            key: key.clone(),
            conversation_id,
            limit: PAGE_SIZE,
            offset: log.offset,
            kind: HistoryKind::Older,
        })
    }

    /// Merge a newest-first page. Known ids are skipped; an own message that
    /// is still pending locally is promoted instead of duplicated.
    pub fn complete_load(&mut self, request: &HistoryRequest, page: Vec<WireMessage>) -> LoadOutcome {
        let log = self.logs.entry(request.key.clone()).or_default();
        log.loading = false;
        let fetched = page.len() as u32;
        match request.kind {
            HistoryKind::Initial => {
                log.initial_loaded = true;
                log.offset = fetched;
                if page.is_empty() {
                    log.fully_backfilled = true;
                }
            }
            HistoryKind::Older => {
                if page.is_empty() {
                    log.fully_backfilled = true;
                    info!("[SYNC] {} fully backfilled", request.key);
                    return LoadOutcome::Exhausted;
                }
                log.offset += fetched;
            }
        }

        let mut added = 0;
        for wire in page.iter().rev() {
            if wire.id.as_deref().map_or(false, |id| log.contains_id(id)) {
                continue;
            }
            if let Some(idx) = pending_match(log, wire) {
                promote(log, idx, wire);
                continue;
            }
            log.insert_ordered(ChatMessage::confirmed(wire, &self.current_user));
            added += 1;
        }
        LoadOutcome::Loaded { added }
    }

    /// A history request died (error reply, disconnect). The next trigger retries.
    pub fn fail_load(&mut self, request: &HistoryRequest) {
        if let Some(log) = self.logs.get_mut(&request.key) {
            log.loading = false;
        }
    }

    pub fn abort_loads(&mut self) {
        for log in self.logs.values_mut() {
            log.loading = false;
        }
    }

    pub fn apply_read_status(&mut self, conversation_id: ConversationId, reader_id: &str) -> ReadOutcome {
        let key = ConversationKey::Id(conversation_id);
        let mut outcome = ReadOutcome::default();
        if let Some(log) = self.logs.get_mut(&key) {
            for record in log.messages_mut() {
                if reader_id != self.current_user {
                    if record.sender_id == self.current_user && record.delivery == DeliveryState::Sent {
                        record.delivery = DeliveryState::Read;
                        record.is_read = true;
                        outcome.marked_read += 1;
                    }
                } else if record.sender_id != self.current_user && !record.is_read {
                    record.is_read = true;
                    outcome.marked_read += 1;
                }
            }
        }
        if reader_id == self.current_user {
            outcome.cleared_unread = self.unread.remove(&key).is_some();
        }
        outcome
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        self.dedup.sweep(now)
    }
}
