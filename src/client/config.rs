use std::env;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::client::services::connection_manager::ConnectionTimings;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub websocket_url: String,
    pub session_token: Option<String>,
    pub auth_timeout: Duration,
    pub housekeeping_interval: Duration,
    /// Audio file played for new messages, relative to the working directory.
    pub sound_asset: String,
    pub timings: ConnectionTimings,
}

pub const DEFAULT_SOUND_ASSET: &str = "assets/notification.wav";

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default))
}

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default))
}

impl ClientConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = ConnectionTimings::default();
        Self {
            websocket_url: env::var("WEBSOCKET_URL").unwrap_or_else(|_| "ws://127.0.0.1:5001".to_string()),
            session_token: env::var("SESSION_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            auth_timeout: env_secs("AUTH_TIMEOUT_SECS", 10),
            housekeeping_interval: env_millis("HOUSEKEEPING_INTERVAL_MS", 250),
            sound_asset: env::var("NOTIFICATION_SOUND").unwrap_or_else(|_| DEFAULT_SOUND_ASSET.to_string()),
            timings: ConnectionTimings {
                connect_cooldown: env_millis("RECONNECT_COOLDOWN_MS", defaults.connect_cooldown.as_millis() as u64),
                base_retry_delay: env_millis("RECONNECT_BASE_DELAY_MS", defaults.base_retry_delay.as_millis() as u64),
                max_retry_delay: env_secs("RECONNECT_MAX_DELAY_SECS", defaults.max_retry_delay.as_secs()),
                auth_retry_delay: env_secs("RECONNECT_AUTH_DELAY_SECS", defaults.auth_retry_delay.as_secs()),
                max_attempts: env::var("RECONNECT_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.max_attempts),
                ping_interval: env_secs("PING_INTERVAL_SECS", defaults.ping_interval.as_secs()),
                visibility_settle: env_millis("VISIBILITY_SETTLE_MS", defaults.visibility_settle.as_millis() as u64),
            },
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.websocket_url)
            .with_context(|| format!("WEBSOCKET_URL non valido: {}", self.websocket_url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("WEBSOCKET_URL deve usare ws:// o wss://, trovato {}", url.scheme());
        }
        Ok(())
    }

    pub fn new(websocket_url: impl Into<String>) -> Self {
        Self {
            websocket_url: websocket_url.into(),
            session_token: None,
            auth_timeout: Duration::from_secs(10),
            housekeeping_interval: Duration::from_millis(250),
            sound_asset: DEFAULT_SOUND_ASSET.to_string(),
            timings: ConnectionTimings::default(),
        }
    }
}
