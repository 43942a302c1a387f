// Notifiche: toast in-app (max 3), notifiche desktop con permesso, suono con rate limit
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::time::Instant;

use crate::client::config::DEFAULT_SOUND_ASSET;
use crate::client::models::app_state::ActiveTarget;
use crate::common::protocol::UserId;

pub const MAX_VISIBLE: usize = 3;
pub const SOUND_MIN_INTERVAL: Duration = Duration::from_secs(1);
const FALLBACK_TONE_HZ: u32 = 880;
const FALLBACK_TONE_LEN: Duration = Duration::from_millis(150);
const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("audio asset unavailable: {0}")]
    AssetUnavailable(String),
    #[error("playback failed: {0}")]
    Playback(String),
    #[error("desktop notification failed: {0}")]
    Desktop(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    NotAsked,
    Granted,
    Denied,
}

pub trait DesktopNotifier: Send {
    fn request_permission(&mut self) -> Permission;
    fn show(&mut self, title: &str, body: &str) -> Result<(), NotifyError>;
}

pub trait SoundPlayer: Send {
    fn play_asset(&mut self, asset: &str) -> Result<(), NotifyError>;
    fn play_tone(&mut self, frequency_hz: u32, length: Duration) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Message,
    NewConversation,
    Error,
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub target: Option<ActiveTarget>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundOutcome {
    Asset,
    Tone,
    Throttled,
    Failed,
}

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

/// Fans an event out to the in-app stack, the desktop and the speaker.
pub struct NotificationDispatcher {
    current_user: UserId,
    visible: VecDeque<Notification>,
    persistent: Option<Notification>,
    next_id: u64,
    permission: Permission,
    desktop: Box<dyn DesktopNotifier>,
    sound: Box<dyn SoundPlayer>,
    sound_asset: String,
    last_sound: Option<Instant>,
}

impl NotificationDispatcher {
    pub fn new(
        current_user: impl Into<UserId>,
        desktop: Box<dyn DesktopNotifier>,
        sound: Box<dyn SoundPlayer>,
    ) -> Self {
        Self {
            current_user: current_user.into(),
            visible: VecDeque::new(),
            persistent: None,
            next_id: 1,
            permission: Permission::NotAsked,
            desktop,
            sound,
            sound_asset: DEFAULT_SOUND_ASSET.to_string(),
            last_sound: None,
        }
    }

    pub fn set_current_user(&mut self, user_id: &str) {
        self.current_user = user_id.to_string();
    }

    pub fn with_sound_asset(mut self, asset: impl Into<String>) -> Self {
        self.sound_asset = asset.into();
        self
    }

    fn push(&mut self, kind: NotificationKind, title: String, body: String, target: Option<ActiveTarget>) -> Notification {
        let notification = Notification {
            id: self.next_id,
            kind,
            title,
            body,
            target,
            created_at: Utc::now(),
        };
        self.next_id += 1;
        self.visible.push_back(notification.clone());
        while self.visible.len() > MAX_VISIBLE {
            if let Some(evicted) = self.visible.pop_front() {
                debug!("[NOTIFY] Evicted #{}", evicted.id);
            }
        }
        notification
    }

    fn desktop(&mut self, title: &str, body: &str) {
        if self.permission == Permission::NotAsked {
            self.permission = self.desktop.request_permission();
            info!("[NOTIFY] Desktop permission: {:?}", self.permission);
            // a dismissed prompt counts as an answer, never ask twice
            if self.permission == Permission::NotAsked {
                self.permission = Permission::Denied;
            }
        }
        if self.permission == Permission::Granted {
            if let Err(e) = self.desktop.show(title, body) {
                warn!("[NOTIFY] {}", e);
            }
        }
    }

    fn chime(&mut self, now: Instant) -> SoundOutcome {
        if let Some(last) = self.last_sound {
            if now.saturating_duration_since(last) < SOUND_MIN_INTERVAL {
                return SoundOutcome::Throttled;
            }
        }
        self.last_sound = Some(now);
        match self.sound.play_asset(&self.sound_asset) {
            Ok(()) => SoundOutcome::Asset,
            Err(e) => {
                debug!("[NOTIFY] {}, falling back to tone", e);
                match self.sound.play_tone(FALLBACK_TONE_HZ, FALLBACK_TONE_LEN) {
                    Ok(()) => SoundOutcome::Tone,
                    Err(e) => {
                        warn!("[NOTIFY] {}", e);
                        SoundOutcome::Failed
                    }
                }
            }
        }
    }

    /// `in_view` is true when the message belongs to the open conversation and
    /// the page is visible.
    pub fn notify_message(
        &mut self,
        sender_id: &str,
        content: &str,
        target: ActiveTarget,
        in_view: bool,
        now: Instant,
    ) -> Option<Notification> {
        if sender_id == self.current_user || in_view {
            return None;
        }
        let title = format!("Nuovo messaggio da {}", sender_id);
        let body = preview(content);
        let notification = self.push(NotificationKind::Message, title.clone(), body.clone(), Some(target));
        self.desktop(&title, &body);
        self.chime(now);
        Some(notification)
    }

    pub fn notify_new_conversation(&mut self, sender_id: &str, target: ActiveTarget, now: Instant) -> Option<Notification> {
        if sender_id == self.current_user {
            return None;
        }
        let title = format!("{} ha iniziato una conversazione", sender_id);
        let notification = self.push(NotificationKind::NewConversation, title.clone(), String::new(), Some(target));
        self.desktop(&title, "");
        self.chime(now);
        Some(notification)
    }

    pub fn notify_error(&mut self, code: u16, content: &str) -> Notification {
        self.push(NotificationKind::Error, format!("Errore {}", code), preview(content), None)
    }

    /// Stays up until the connection is restored or the user dismisses it.
    pub fn notify_connection_failed(&mut self, attempts: u32) -> Notification {
        let notification = Notification {
            id: self.next_id,
            kind: NotificationKind::ConnectionLost,
            title: "Connessione persa".to_string(),
            body: format!("Impossibile riconnettersi dopo {} tentativi", attempts),
            target: None,
            created_at: Utc::now(),
        };
        self.next_id += 1;
        self.persistent = Some(notification.clone());
        notification
    }

    pub fn clear_persistent(&mut self) -> bool {
        self.persistent.take().is_some()
    }

    pub fn persistent(&self) -> Option<&Notification> {
        self.persistent.as_ref()
    }

    /// User clicked a notification: it goes away and its target is returned
    /// so the caller can open it through the normal conversation path.
    pub fn activate(&mut self, id: u64) -> Option<ActiveTarget> {
        let pos = self.visible.iter().position(|n| n.id == id)?;
        self.visible.remove(pos).and_then(|n| n.target)
    }

    pub fn dismiss(&mut self, id: u64) -> bool {
        if self.persistent.as_ref().map_or(false, |n| n.id == id) {
            self.persistent = None;
            return true;
        }
        match self.visible.iter().position(|n| n.id == id) {
            Some(pos) => self.visible.remove(pos).is_some(),
            None => false,
        }
    }

    pub fn visible(&self) -> Vec<Notification> {
        self.visible.iter().cloned().collect()
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }
}

/// Terminal stand-in for desktop notifications: prints through the logger.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl DesktopNotifier for LogNotifier {
    fn request_permission(&mut self) -> Permission {
        Permission::Granted
    }

    fn show(&mut self, title: &str, body: &str) -> Result<(), NotifyError> {
        info!("[NOTIFY] {} {}", title, body);
        Ok(())
    }
}

/// Plays nothing but checks the asset exists; the tone is the terminal bell.
#[derive(Debug, Default)]
pub struct TerminalBell {
    pub asset_dir: PathBuf,
}

impl SoundPlayer for TerminalBell {
    fn play_asset(&mut self, asset: &str) -> Result<(), NotifyError> {
        let path = self.asset_dir.join(asset);
        if !path.exists() {
            return Err(NotifyError::AssetUnavailable(path.display().to_string()));
        }
        self.play_tone(FALLBACK_TONE_HZ, FALLBACK_TONE_LEN)
    }

    fn play_tone(&mut self, _frequency_hz: u32, _length: Duration) -> Result<(), NotifyError> {
        let mut out = std::io::stdout();
        out.write_all(b"\x07")
            .and_then(|_| out.flush())
            .map_err(|e| NotifyError::Playback(e.to_string()))
    }
}
