// Wire protocol condiviso tra client e server: envelope JSON con discriminatore `type`
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type UserId = String;
pub type ConversationId = i64;
pub type MessageId = String;

/// Error codes carried by `error` envelopes.
pub mod codes {
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const RECIPIENT_OFFLINE: u16 = 409;
    pub const TOO_LONG: u16 = 413;
    pub const STORAGE: u16 = 500;
}

/// WebSocket close codes that mean "the peer left on purpose".
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("missing `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownKind(String),
    #[error("malformed `{kind}` message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUsersContent {
    pub users: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatusContent {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub status: PresenceStatus,
}

/// A persisted chat message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    pub content: String,
    pub conversation_id: ConversationId,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub other_user_id: UserId,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Auth {
        token: String,
    },
    AuthResponse {
        success: bool,
        #[serde(default)]
        user_id: Option<UserId>,
        #[serde(default)]
        error: Option<String>,
    },
    GetOnlineUsers,
    OnlineUsers {
        content: OnlineUsersContent,
    },
    UserStatus {
        content: UserStatusContent,
    },
    Private {
        recipient_id: UserId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        #[serde(default)]
        is_new_conversation: bool,
    },
    Message(WireMessage),
    Typing {
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        action: TypingAction,
    },
    MarkRead {
        conversation_id: ConversationId,
    },
    ReadStatus {
        conversation_id: ConversationId,
        reader_id: UserId,
    },
    NewConversation {
        conversation_id: ConversationId,
        sender_id: UserId,
    },
    GetHistory {
        request_id: String,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    },
    History {
        request_id: String,
        conversation_id: ConversationId,
        offset: u32,
        messages: Vec<WireMessage>,
    },
    GetConversations,
    Conversations {
        conversations: Vec<ConversationSummary>,
    },
    Ping,
    Pong,
    Error {
        content: String,
        code: u16,
        /// Set when the error answers a `get_history` request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

const KNOWN_KINDS: &[&str] = &[
    "auth",
    "auth_response",
    "get_online_users",
    "online_users",
    "user_status",
    "private",
    "message",
    "typing",
    "mark_read",
    "read_status",
    "new_conversation",
    "get_history",
    "history",
    "get_conversations",
    "conversations",
    "ping",
    "pong",
    "error",
];

impl Envelope {
    /// Parse a text frame, telling apart unknown kinds from malformed known ones.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        let kind = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or(ProtocolError::MissingType)?
            .to_string();
        if !KNOWN_KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownKind(kind));
        }
        serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Auth { .. } => "auth",
            Envelope::AuthResponse { .. } => "auth_response",
            Envelope::GetOnlineUsers => "get_online_users",
            Envelope::OnlineUsers { .. } => "online_users",
            Envelope::UserStatus { .. } => "user_status",
            Envelope::Private { .. } => "private",
            Envelope::Message(_) => "message",
            Envelope::Typing { .. } => "typing",
            Envelope::MarkRead { .. } => "mark_read",
            Envelope::ReadStatus { .. } => "read_status",
            Envelope::NewConversation { .. } => "new_conversation",
            Envelope::GetHistory { .. } => "get_history",
            Envelope::History { .. } => "history",
            Envelope::GetConversations => "get_conversations",
            Envelope::Conversations { .. } => "conversations",
            Envelope::Ping => "ping",
            Envelope::Pong => "pong",
            Envelope::Error { .. } => "error",
        }
    }

    pub fn user_status(user_id: &str, status: PresenceStatus) -> Self {
        Envelope::UserStatus {
            content: UserStatusContent {
                user_id: user_id.to_string(),
                status,
            },
        }
    }

    pub fn error(code: u16, content: impl Into<String>) -> Self {
        Envelope::Error {
            content: content.into(),
            code,
            request_id: None,
        }
    }

    pub fn request_error(request_id: &str, code: u16, content: impl Into<String>) -> Self {
        Envelope::Error {
            content: content.into(),
            code,
            request_id: Some(request_id.to_string()),
        }
    }
}
