// Persistenza di conversazioni e messaggi privati (SQLite)
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::common::protocol::{ConversationId, ConversationSummary, UserId, WireMessage};
use crate::server::database::Database;

/// Largest page `history_page` will ever return.
pub const MAX_HISTORY_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub is_read: bool,
}

impl StoredMessage {
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            id: Some(self.id.to_string()),
            sender_id: self.sender_id.clone(),
            recipient_id: Some(self.recipient_id.clone()),
            content: self.content.clone(),
            conversation_id: self.conversation_id,
            sent_at: self.sent_at,
            is_read: self.is_read,
        }
    }

    fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            sender_id: row.get("sender_id"),
            recipient_id: row.get("recipient_id"),
            content: row.get("content"),
            sent_at: from_millis(row.get("sent_at")),
            is_read: row.get::<i64, _>("is_read") != 0,
        }
    }
}

/// Who may see a conversation, from the point of view of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationAccess {
    Participant { other: UserId },
    NotParticipant,
    NotFound,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Returns the conversation between the two users, creating it if needed.
/// The flag is true when this call created it.
pub async fn find_or_create_conversation(
    db: Arc<Database>,
    user: &str,
    other: &str,
) -> Result<(ConversationId, bool), sqlx::Error> {
    let (user_a, user_b) = ordered_pair(user, other);
    let now = Utc::now().timestamp_millis();
    let inserted = sqlx::query("INSERT OR IGNORE INTO conversations (user_a, user_b, created_at) VALUES (?, ?, ?)")
        .bind(user_a)
        .bind(user_b)
        .bind(now)
        .execute(&db.pool)
        .await?
        .rows_affected()
        == 1;
    let row = sqlx::query("SELECT id FROM conversations WHERE user_a = ? AND user_b = ?")
        .bind(user_a)
        .bind(user_b)
        .fetch_one(&db.pool)
        .await?;
    let id: i64 = row.get("id");
    if inserted {
        debug!("[DB] Created conversation {} between {} and {}", id, user_a, user_b);
    }
    Ok((id, inserted))
}

pub async fn conversation_access(
    db: Arc<Database>,
    conversation_id: ConversationId,
    user: &str,
) -> Result<ConversationAccess, sqlx::Error> {
    let row = sqlx::query("SELECT user_a, user_b FROM conversations WHERE id = ?")
        .bind(conversation_id)
        .fetch_optional(&db.pool)
        .await?;
    let Some(row) = row else {
        return Ok(ConversationAccess::NotFound);
    };
    let user_a: String = row.get("user_a");
    let user_b: String = row.get("user_b");
    Ok(if user_a == user {
        ConversationAccess::Participant { other: user_b }
    } else if user_b == user {
        ConversationAccess::Participant { other: user_a }
    } else {
        ConversationAccess::NotParticipant
    })
}

pub async fn store_message(
    db: Arc<Database>,
    conversation_id: ConversationId,
    sender_id: &str,
    recipient_id: &str,
    content: &str,
) -> Result<StoredMessage, sqlx::Error> {
    let sent_at = Utc::now();
    let millis = sent_at.timestamp_millis();
    let mut tx = db.pool.begin().await?;
    let id = sqlx::query("INSERT INTO messages (conversation_id, sender_id, content, sent_at, is_read) VALUES (?, ?, ?, ?, 0)")
        .bind(conversation_id)
        .bind(sender_id)
        .bind(content)
        .bind(millis)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
    sqlx::query("UPDATE conversations SET last_message_at = ? WHERE id = ?")
        .bind(millis)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(StoredMessage {
        id,
        conversation_id,
        sender_id: sender_id.to_string(),
        recipient_id: recipient_id.to_string(),
        content: content.to_string(),
        sent_at: from_millis(millis),
        is_read: false,
    })
}

/// Newest first. `limit` is clamped to `1..=MAX_HISTORY_LIMIT`.
pub async fn history_page(
    db: Arc<Database>,
    conversation_id: ConversationId,
    limit: u32,
    offset: u32,
) -> Result<Vec<StoredMessage>, sqlx::Error> {
    let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
    let rows = sqlx::query(
        r#"
        SELECT m.id, m.conversation_id, m.sender_id, m.content, m.sent_at, m.is_read,
               CASE WHEN m.sender_id = c.user_a THEN c.user_b ELSE c.user_a END AS recipient_id
        FROM messages m
        JOIN conversations c ON c.id = m.conversation_id
        WHERE m.conversation_id = ?
        ORDER BY m.sent_at DESC, m.id DESC
        LIMIT ? OFFSET ?
    "#,
    )
    .bind(conversation_id)
    .bind(i64::from(limit))
    .bind(i64::from(offset))
    .fetch_all(&db.pool)
    .await?;
    Ok(rows.iter().map(StoredMessage::from_row).collect())
}

/// Marks as read what the other participant sent to `reader_id`.
pub async fn mark_read(db: Arc<Database>, conversation_id: ConversationId, reader_id: &str) -> Result<u64, sqlx::Error> {
    let res = sqlx::query("UPDATE messages SET is_read = 1 WHERE conversation_id = ? AND sender_id != ? AND is_read = 0")
        .bind(conversation_id)
        .bind(reader_id)
        .execute(&db.pool)
        .await?;
    Ok(res.rows_affected())
}

/// Conversations of `user_id`, most recently active first.
pub async fn list_conversations(db: Arc<Database>, user_id: &str) -> Result<Vec<ConversationSummary>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT c.id,
               CASE WHEN c.user_a = ?1 THEN c.user_b ELSE c.user_a END AS other_user_id,
               c.last_message_at,
               (SELECT content FROM messages m WHERE m.conversation_id = c.id
                 ORDER BY m.sent_at DESC, m.id DESC LIMIT 1) AS last_message,
               (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id
                 AND m.sender_id != ?1 AND m.is_read = 0) AS unread
        FROM conversations c
        WHERE c.user_a = ?1 OR c.user_b = ?1
        ORDER BY COALESCE(c.last_message_at, c.created_at) DESC, c.id DESC
    "#,
    )
    .bind(user_id)
    .fetch_all(&db.pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ConversationSummary {
            conversation_id: row.get("id"),
            other_user_id: row.get("other_user_id"),
            last_message: row.get("last_message"),
            last_message_at: row.get::<Option<i64>, _>("last_message_at").map(from_millis),
            unread: u32::try_from(row.get::<i64, _>("unread")).unwrap_or(u32::MAX),
        })
        .collect())
}
