// Macchina a stati della connessione: cooldown, retry con backoff, visibilità e keep-alive
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::common::protocol::{CLOSE_GOING_AWAY, CLOSE_NORMAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retry budget exhausted. Only an explicit connect leaves this state.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionTimings {
    pub connect_cooldown: Duration,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub auth_retry_delay: Duration,
    pub max_attempts: u32,
    pub ping_interval: Duration,
    pub visibility_settle: Duration,
}

impl Default for ConnectionTimings {
    fn default() -> Self {
        Self {
            connect_cooldown: Duration::from_secs(2),
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            auth_retry_delay: Duration::from_secs(10),
            max_attempts: 5,
            ping_interval: Duration::from_secs(25),
            visibility_settle: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Already connected or connecting with this identity.
    AlreadySatisfied,
    /// Last attempt is too recent; the request is dropped.
    CoolingDown,
    Start { close_previous: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Retry after an unexpected drop of a live connection: doubled cooldown
    /// first, linear afterwards.
    Abnormal,
    /// Any failure while still connecting; may be an auth rejection.
    Authentication,
}

/// Why a connection attempt never reached the connected state. Only logged:
/// every failure while connecting gets the longer delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Unreachable,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Deliberate close by the peer. No retry.
    Closed,
    Retry { attempt: u32, delay: Duration, kind: RetryKind },
    GaveUp { attempts: u32 },
    /// Nothing was live; the event is stale.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    SendPing,
    /// Nothing heard for two ping periods.
    Stale,
    Idle,
}

/// Pure connection lifecycle. The caller owns the socket and the timers and
/// feeds events in with the current instant.
#[derive(Debug)]
pub struct ConnectionMachine {
    timings: ConnectionTimings,
    state: ConnectionState,
    identity: Option<String>,
    reconnect_attempts: u32,
    last_attempt: Option<Instant>,
    last_activity: Option<Instant>,
    successful_pings: u32,
    page_visible: bool,
}

impl ConnectionMachine {
    pub fn new(timings: ConnectionTimings) -> Self {
        Self {
            timings,
            state: ConnectionState::Disconnected,
            identity: None,
            reconnect_attempts: 0,
            last_attempt: None,
            last_activity: None,
            successful_pings: 0,
            page_visible: true,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn successful_pings(&self) -> u32 {
        self.successful_pings
    }

    pub fn timings(&self) -> &ConnectionTimings {
        &self.timings
    }

    pub fn request_connect(&mut self, identity: &str, now: Instant) -> ConnectDecision {
        let same_identity = self.identity.as_deref() == Some(identity);
        if same_identity && matches!(self.state, ConnectionState::Connected | ConnectionState::Connecting) {
            debug!("[CONN] Connect ignored: already {:?}", self.state);
            return ConnectDecision::AlreadySatisfied;
        }
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) < self.timings.connect_cooldown {
                debug!("[CONN] Connect dropped: cooldown");
                return ConnectDecision::CoolingDown;
            }
        }

        let close_previous = !same_identity
            && self.identity.is_some()
            && matches!(
                self.state,
                ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting
            );
        if !same_identity || matches!(self.state, ConnectionState::Disconnected | ConnectionState::Failed) {
            self.reconnect_attempts = 0;
        }
        self.identity = Some(identity.to_string());
        self.state = ConnectionState::Connecting;
        self.last_attempt = Some(now);
        ConnectDecision::Start { close_previous }
    }

    /// A scheduled retry fired. Returns false when the retry is no longer wanted.
    pub fn begin_retry(&mut self, now: Instant) -> bool {
        if self.state != ConnectionState::Reconnecting {
            return false;
        }
        info!("[CONN] Reconnect attempt {}/{}", self.reconnect_attempts, self.timings.max_attempts);
        self.state = ConnectionState::Connecting;
        self.last_attempt = Some(now);
        true
    }

    pub fn on_open(&mut self, now: Instant) {
        info!("[CONN] Connected");
        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.successful_pings = 0;
        self.last_activity = Some(now);
    }

    pub fn on_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    pub fn on_pong(&mut self, now: Instant) {
        self.successful_pings += 1;
        self.last_activity = Some(now);
    }

    /// The live connection closed with `code` (None when no close frame arrived).
    pub fn on_close(&mut self, code: Option<u16>) -> CloseOutcome {
        match self.state {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => return self.on_connect_failed(ConnectFailure::Rejected),
            _ => return CloseOutcome::Ignored,
        }
        if matches!(code, Some(CLOSE_NORMAL) | Some(CLOSE_GOING_AWAY)) {
            info!("[CONN] Closed by peer with code {:?}", code);
            self.state = ConnectionState::Disconnected;
            return CloseOutcome::Closed;
        }
        warn!("[CONN] Abnormal close (code {:?})", code);
        self.schedule_retry(RetryKind::Abnormal)
    }

    pub fn on_connect_failed(&mut self, failure: ConnectFailure) -> CloseOutcome {
        if self.state != ConnectionState::Connecting {
            return CloseOutcome::Ignored;
        }
        warn!("[CONN] Attempt failed while connecting ({:?}), backing off", failure);
        self.schedule_retry(RetryKind::Authentication)
    }

    fn schedule_retry(&mut self, kind: RetryKind) -> CloseOutcome {
        self.reconnect_attempts += 1;
        let attempt = self.reconnect_attempts;
        if attempt > self.timings.max_attempts {
            warn!("[CONN] Giving up after {} attempts", attempt - 1);
            self.state = ConnectionState::Failed;
            return CloseOutcome::GaveUp { attempts: attempt - 1 };
        }
        let delay = match kind {
            RetryKind::Abnormal if attempt == 1 => self.abnormal_delay(),
            RetryKind::Abnormal => self.linear_delay(attempt),
            RetryKind::Authentication => self.timings.auth_retry_delay.max(self.linear_delay(attempt)),
        };
        self.state = ConnectionState::Reconnecting;
        CloseOutcome::Retry { attempt, delay, kind }
    }

    pub fn abnormal_delay(&self) -> Duration {
        self.timings.connect_cooldown * 2
    }

    pub fn linear_delay(&self, attempt: u32) -> Duration {
        (self.timings.base_retry_delay * attempt).min(self.timings.max_retry_delay)
    }

    /// Deliberate logout: no reconnects until the next explicit connect.
    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.identity = None;
        self.reconnect_attempts = 0;
        self.last_activity = None;
    }

    /// Returns true when a settle timer should be armed.
    pub fn set_page_visible(&mut self, visible: bool) -> bool {
        let became_visible = visible && !self.page_visible;
        self.page_visible = visible;
        became_visible && self.identity.is_some()
    }

    pub fn page_visible(&self) -> bool {
        self.page_visible
    }

    /// Settle timer fired after the page became visible again.
    pub fn visibility_check(&mut self, now: Instant) -> Option<ConnectDecision> {
        if !self.page_visible || self.state != ConnectionState::Disconnected {
            return None;
        }
        let identity = self.identity.clone()?;
        Some(self.request_connect(&identity, now))
    }

    pub fn keepalive_check(&self, now: Instant) -> KeepAlive {
        if self.state != ConnectionState::Connected {
            return KeepAlive::Idle;
        }
        match self.last_activity {
            Some(last) if now.saturating_duration_since(last) > self.timings.ping_interval * 2 => KeepAlive::Stale,
            _ => KeepAlive::SendPing,
        }
    }
}
