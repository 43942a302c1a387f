use std::time::Duration;

use uuid::Uuid;

use crate::client::models::app_state::{ChatMessage, ConversationKey};
use crate::client::models::conversation::ConversationEntry;
use crate::client::services::connection_manager::{ConnectionState, RetryKind};
use crate::client::services::message_sync::SubmitError;
use crate::client::services::notifications::Notification;
use crate::client::services::presence::PresenceChange;
use crate::common::protocol::{ConversationId, UserId};

/// Azioni dell'utente verso il motore della chat
#[derive(Debug, Clone)]
pub enum Command {
    Connect { token: String },
    Disconnect,
    OpenConversation {
        recipient_id: UserId,
        conversation_id: Option<ConversationId>,
    },
    CloseConversation,
    ComposeChanged(String),
    ComposeBlurred,
    Submit { content: String },
    RetryMessage { local_id: Uuid },
    Scrolled { scroll_top_px: f32 },
    VisibilityChanged { visible: bool },
    ActivateNotification { id: u64 },
    DismissNotification { id: u64 },
    RefreshConversations,
    Shutdown,
}

/// Eventi dal motore verso la UI
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    Authenticated { user_id: UserId },
    ReconnectScheduled { attempt: u32, delay: Duration, kind: RetryKind },
    ConnectionFailed { attempts: u32 },
    PresenceChanged(PresenceChange),
    ConversationOpened { key: ConversationKey, recipient_id: UserId },
    ConversationClosed,
    ConversationGrafted { from: ConversationKey, to: ConversationKey },
    ComposeEnabled { enabled: bool },
    MessagesChanged { key: ConversationKey, messages: Vec<ChatMessage> },
    HistoryExhausted { key: ConversationKey },
    SubmitRejected(SubmitError),
    DeliveryFailed { key: ConversationKey, local_id: Uuid },
    TypingIndicator { key: ConversationKey, user_id: UserId, typing: bool },
    UnreadChanged { key: ConversationKey, unread: u32 },
    ConversationsChanged(Vec<ConversationEntry>),
    Notified(Notification),
    NotificationsChanged(Vec<Notification>),
    ServerError { code: u16, content: String },
}
