// Indicatori di digitazione: segnali in uscita con timeout di inattività, indicatori remoti con scadenza
use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::client::models::app_state::ConversationKey;
use crate::common::protocol::{Envelope, TypingAction, UserId};

pub const TYPING_IDLE: Duration = Duration::from_secs(2);
pub const INDICATOR_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndicatorChange {
    Shown { key: ConversationKey, user_id: UserId },
    Cleared { key: ConversationKey, user_id: UserId },
}

#[derive(Debug, Clone)]
struct OutboundTyping {
    key: ConversationKey,
    recipient_id: UserId,
    last_keystroke: Instant,
}

/// Tracks our own "is typing" signal and the indicators shown for peers.
#[derive(Debug)]
pub struct TypingCoordinator {
    current_user: UserId,
    outbound: Option<OutboundTyping>,
    indicators: HashMap<(ConversationKey, UserId), Instant>,
}

impl TypingCoordinator {
    pub fn new(current_user: impl Into<UserId>) -> Self {
        Self {
            current_user: current_user.into(),
            outbound: None,
            indicators: HashMap::new(),
        }
    }

    fn envelope(&self, key: &ConversationKey, recipient_id: &str, action: TypingAction) -> Envelope {
        Envelope::Typing {
            sender_id: self.current_user.clone(),
            recipient_id: Some(recipient_id.to_string()),
            conversation_id: key.id(),
            action,
        }
    }

    /// Compose buffer changed. Returns the signals to send, in order.
    pub fn on_compose_changed(
        &mut self,
        key: &ConversationKey,
        recipient_id: &str,
        text: &str,
        now: Instant,
    ) -> Vec<Envelope> {
        let mut out = Vec::new();
        if text.is_empty() {
            out.extend(self.stop());
            return out;
        }
        if let Some(current) = self.outbound.as_mut() {
            if &current.key == key {
                current.last_keystroke = now;
                return out;
            }
        }
        out.extend(self.stop());
        self.outbound = Some(OutboundTyping {
            key: key.clone(),
            recipient_id: recipient_id.to_string(),
            last_keystroke: now,
        });
        out.push(self.envelope(key, recipient_id, TypingAction::Start));
        out
    }

    /// Send, blur, clear or conversation switch.
    pub fn stop(&mut self) -> Option<Envelope> {
        let current = self.outbound.take()?;
        Some(self.envelope(&current.key, &current.recipient_id, TypingAction::Stop))
    }

    pub fn poll_idle(&mut self, now: Instant) -> Option<Envelope> {
        let idle = self
            .outbound
            .as_ref()
            .map_or(false, |o| now.saturating_duration_since(o.last_keystroke) >= TYPING_IDLE);
        if idle {
            debug!("[TYPING] Idle, sending stop");
            self.stop()
        } else {
            None
        }
    }

    /// Remote start/stop. Callers drop starts from users they consider offline.
    pub fn on_remote(
        &mut self,
        key: ConversationKey,
        user_id: &str,
        action: TypingAction,
        now: Instant,
    ) -> Option<IndicatorChange> {
        let slot = (key.clone(), user_id.to_string());
        match action {
            TypingAction::Start => {
                let fresh = self.indicators.insert(slot, now + INDICATOR_TTL).is_none();
                fresh.then(|| IndicatorChange::Shown { key, user_id: user_id.to_string() })
            }
            TypingAction::Stop => self
                .indicators
                .remove(&slot)
                .map(|_| IndicatorChange::Cleared { key, user_id: user_id.to_string() }),
        }
    }

    pub fn expire(&mut self, now: Instant) -> Vec<IndicatorChange> {
        let expired: Vec<(ConversationKey, UserId)> = self
            .indicators
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(slot, _)| slot.clone())
            .collect();
        expired
            .into_iter()
            .map(|slot| {
                self.indicators.remove(&slot);
                IndicatorChange::Cleared { key: slot.0, user_id: slot.1 }
            })
            .collect()
    }

    pub fn clear_user(&mut self, user_id: &str) -> Vec<IndicatorChange> {
        self.clear_where(|u| u == user_id)
    }

    /// After a presence resync: drop indicators of users no longer online.
    pub fn clear_offline(&mut self, is_online: impl Fn(&str) -> bool) -> Vec<IndicatorChange> {
        self.clear_where(|u| !is_online(u))
    }

    fn clear_where(&mut self, matches: impl Fn(&str) -> bool) -> Vec<IndicatorChange> {
        let slots: Vec<(ConversationKey, UserId)> =
            self.indicators.keys().filter(|(_, u)| matches(u)).cloned().collect();
        slots
            .into_iter()
            .map(|slot| {
                self.indicators.remove(&slot);
                IndicatorChange::Cleared { key: slot.0, user_id: slot.1 }
            })
            .collect()
    }

    /// Drop everything, e.g. after a reconnect.
    pub fn reset(&mut self) -> Vec<IndicatorChange> {
        self.outbound = None;
        self.indicators
            .drain()
            .map(|((key, user_id), _)| IndicatorChange::Cleared { key, user_id })
            .collect()
    }

    pub fn graft(&mut self, from: &ConversationKey, to: &ConversationKey) {
        if let Some(current) = self.outbound.as_mut() {
            if &current.key == from {
                current.key = to.clone();
            }
        }
        let moved: Vec<(UserId, Instant)> = self
            .indicators
            .iter()
            .filter(|((k, _), _)| k == from)
            .map(|((_, u), d)| (u.clone(), *d))
            .collect();
        for (user, deadline) in moved {
            self.indicators.remove(&(from.clone(), user.clone()));
            self.indicators.insert((to.clone(), user), deadline);
        }
    }

    pub fn typists(&self, key: &ConversationKey) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .indicators
            .keys()
            .filter(|(k, _)| k == key)
            .map(|(_, u)| u.clone())
            .collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConversationKey {
        ConversationKey::Id(3)
    }

    fn action(env: &Envelope) -> TypingAction {
        match env {
            Envelope::Typing { action, .. } => *action,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn start_once_then_stop_after_idle() {
        let now = Instant::now();
        let mut typing = TypingCoordinator::new("alice");
        let first = typing.on_compose_changed(&key(), "bob", "h", now);
        assert_eq!(first.len(), 1);
        assert_eq!(action(&first[0]), TypingAction::Start);
        assert!(typing.on_compose_changed(&key(), "bob", "he", now + Duration::from_millis(500)).is_empty());

        assert!(typing.poll_idle(now + Duration::from_millis(2000)).is_none());
        let stop = typing.poll_idle(now + Duration::from_millis(2500)).unwrap();
        assert_eq!(action(&stop), TypingAction::Stop);
        assert!(typing.poll_idle(now + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn clearing_buffer_sends_stop() {
        let now = Instant::now();
        let mut typing = TypingCoordinator::new("alice");
        typing.on_compose_changed(&key(), "bob", "x", now);
        let out = typing.on_compose_changed(&key(), "bob", "", now);
        assert_eq!(out.len(), 1);
        assert_eq!(action(&out[0]), TypingAction::Stop);
        assert!(typing.on_compose_changed(&key(), "bob", "", now).is_empty());
    }

    #[test]
    fn switching_conversation_stops_previous() {
        let now = Instant::now();
        let mut typing = TypingCoordinator::new("alice");
        typing.on_compose_changed(&key(), "bob", "x", now);
        let out = typing.on_compose_changed(&ConversationKey::Id(4), "carol", "y", now);
        assert_eq!(out.iter().map(action).collect::<Vec<_>>(), vec![TypingAction::Stop, TypingAction::Start]);
    }

    #[test]
    fn remote_indicator_expires() {
        let now = Instant::now();
        let mut typing = TypingCoordinator::new("alice");
        assert!(typing.on_remote(key(), "bob", TypingAction::Start, now).is_some());
        assert!(typing.on_remote(key(), "bob", TypingAction::Start, now).is_none());
        assert!(typing.expire(now + Duration::from_secs(4)).is_empty());
        assert_eq!(typing.expire(now + Duration::from_secs(5)).len(), 1);
        assert!(typing.typists(&key()).is_empty());
    }

    #[test]
    fn offline_user_indicators_cleared() {
        let now = Instant::now();
        let mut typing = TypingCoordinator::new("alice");
        typing.on_remote(key(), "bob", TypingAction::Start, now);
        typing.on_remote(ConversationKey::Id(9), "carol", TypingAction::Start, now);
        assert_eq!(
            typing.clear_user("bob"),
            vec![IndicatorChange::Cleared { key: key(), user_id: "bob".into() }]
        );
        assert_eq!(typing.reset().len(), 1);
    }
}
