// Validazione delle sessioni emesse dal forum: qui le sessioni si leggono soltanto
use std::sync::Arc;

use log::{debug, info, warn};
use sqlx::Row;

use crate::server::database::Database;

/// Only the first characters of a token ever reach the logs.
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}…", prefix)
}

pub async fn validate_session(db: Arc<Database>, session_token: &str) -> Option<String> {
    if session_token.trim().is_empty() {
        return None;
    }
    let now = chrono::Utc::now().timestamp();
    let row = match sqlx::query("SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?")
        .bind(session_token)
        .bind(now)
        .fetch_optional(&db.pool)
        .await
    {
        Ok(row) => row,
        Err(e) => {
            warn!("[WS:AUTH] Database error validating session: {}", e);
            return None;
        }
    };

    match row {
        Some(row) => {
            let user_id: String = row.get("user_id");
            debug!("[WS:AUTH] Token {} valid for user {}", mask_token(session_token), user_id);
            Some(user_id)
        }
        None => {
            info!("[WS:AUTH] Token {} is invalid or expired", mask_token(session_token));
            None
        }
    }
}

/// Rimuove le sessioni scadute dal DB. Idempotente e sicuro da eseguire periodicamente.
pub async fn cleanup_expired_sessions(db: Arc<Database>) -> u64 {
    let now = chrono::Utc::now().timestamp();
    match sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now)
        .execute(&db.pool)
        .await
    {
        Ok(res) => {
            if res.rows_affected() > 0 {
                info!("[AUTH] Cleaned up {} expired sessions", res.rows_affected());
            }
            res.rows_affected()
        }
        Err(e) => {
            warn!("[AUTH] Failed to cleanup sessions: {}", e);
            0
        }
    }
}
