// Motore client: un solo task possiede connessione, presenza, messaggi, typing e notifiche.
// Comandi UI, eventi di trasporto e timer arrivano tutti sulla stessa coda.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::client::config::ClientConfig;
use crate::client::models::app_state::{ActiveConversation, ActiveTarget, ConversationKey};
use crate::client::models::conversation::ConversationList;
use crate::client::models::messages::{ClientEvent, Command};
use crate::client::services::connection_manager::{
    CloseOutcome, ConnectDecision, ConnectionMachine, ConnectionState, KeepAlive,
};
use crate::client::services::message_sync::{
    Graft, HistoryRequest, LoadOutcome, MessageSynchronizer, ReconcileOutcome, SubmitError,
};
use crate::client::services::notifications::{DesktopNotifier, NotificationDispatcher, SoundPlayer};
use crate::client::services::presence::PresenceView;
use crate::client::services::typing::{IndicatorChange, TypingCoordinator};
use crate::client::services::websocket_client::{Channel, Connector, Outbound, TransportEvent, WebSocketError};
use crate::common::protocol::{
    ConversationId, ConversationSummary, Envelope, PresenceStatus, TypingAction, UserId, WireMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Retry,
    VisibilitySettle,
    KeepAlive,
}

enum EngineInput {
    Command(Command),
    Opened { epoch: u64, result: Result<Channel, WebSocketError> },
    Transport { epoch: u64, event: TransportEvent },
    Timer { kind: TimerKind, generation: u64 },
}

/// At most one armed timer per slot: scheduling aborts the previous one, and
/// fires from an older generation are ignored.
#[derive(Debug, Default)]
struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
    repeating: bool,
}

impl TimerSlot {
    fn schedule(
        &mut self,
        kind: TimerKind,
        delay: Duration,
        repeating: bool,
        tx: &WeakUnboundedSender<EngineInput>,
    ) {
        self.cancel();
        self.generation += 1;
        self.repeating = repeating;
        let generation = self.generation;
        let tx = tx.clone();
        self.handle = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                let Some(tx) = tx.upgrade() else { return };
                if tx.send(EngineInput::Timer { kind, generation }).is_err() || !repeating {
                    return;
                }
            }
        }));
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    fn accept(&mut self, generation: u64) -> bool {
        if self.handle.is_none() || self.generation != generation {
            return false;
        }
        if !self.repeating {
            self.handle = None;
        }
        true
    }

    fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

/// State bound to one authenticated user.
struct Session {
    user_id: UserId,
    sync: MessageSynchronizer,
    typing: TypingCoordinator,
    conversations: ConversationList,
}

impl Session {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            sync: MessageSynchronizer::new(user_id),
            typing: TypingCoordinator::new(user_id),
            conversations: ConversationList::default(),
        }
    }
}

struct Engine {
    connector: Arc<dyn Connector>,
    housekeeping_interval: Duration,
    machine: ConnectionMachine,
    token: Option<String>,
    epoch: u64,
    outbound: Option<UnboundedSender<Outbound>>,
    self_tx: WeakUnboundedSender<EngineInput>,
    retry_timer: TimerSlot,
    settle_timer: TimerSlot,
    keepalive_timer: TimerSlot,
    presence: PresenceView,
    active: ActiveConversation,
    session: Option<Session>,
    notifications: NotificationDispatcher,
    pending_history: HashMap<String, HistoryRequest>,
    read_receipt_due: bool,
    compose_enabled: Option<bool>,
    events: UnboundedSender<ClientEvent>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Engine {
    async fn run(mut self, mut inputs: UnboundedReceiver<EngineInput>) {
        let mut housekeeping = tokio::time::interval(self.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => {
                        if !self.handle(input) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = housekeeping.tick() => self.housekeeping(Instant::now()),
            }
            self.publish_state();
        }
        self.retry_timer.cancel();
        self.settle_timer.cancel();
        self.drop_channel(true);
        info!("[CLIENT] Engine stopped");
    }

    fn handle(&mut self, input: EngineInput) -> bool {
        let now = Instant::now();
        match input {
            EngineInput::Command(Command::Shutdown) => return false,
            EngineInput::Command(command) => self.on_command(command, now),
            EngineInput::Opened { epoch, result } => self.on_opened(epoch, result, now),
            EngineInput::Transport { epoch, event } => self.on_transport(epoch, event, now),
            EngineInput::Timer { kind, generation } => self.on_timer(kind, generation, now),
        }
        true
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, envelope: Envelope) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(Outbound::Send(envelope)).is_ok(),
            None => false,
        }
    }

    fn current_user(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user_id.as_str())
    }

    // ---- connection lifecycle ----

    fn connect(&mut self, token: String, now: Instant) {
        match self.machine.request_connect(&token, now) {
            ConnectDecision::AlreadySatisfied | ConnectDecision::CoolingDown => {}
            ConnectDecision::Start { close_previous } => {
                if close_previous {
                    info!("[CLIENT] Switching identity, closing previous connection");
                    self.drop_channel(true);
                }
                self.retry_timer.cancel();
                self.token = Some(token);
                self.start_attempt();
            }
        }
    }

    fn start_attempt(&mut self) {
        let Some(token) = self.token.clone() else { return };
        self.epoch += 1;
        let epoch = self.epoch;
        let connector = self.connector.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = connector.open(&token).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(EngineInput::Opened { epoch, result });
            }
        });
    }

    /// Detach from the current channel. Anything it still reports is stale.
    fn drop_channel(&mut self, graceful: bool) {
        self.epoch += 1;
        self.keepalive_timer.cancel();
        if let Some(out) = self.outbound.take() {
            if graceful {
                let _ = out.send(Outbound::Close);
            }
        }
        self.pending_history.clear();
        let cleared = match self.session.as_mut() {
            Some(session) => {
                session.sync.abort_loads();
                session.typing.reset()
            }
            None => Vec::new(),
        };
        self.emit_indicators(cleared);
    }

    fn disconnect(&mut self) {
        info!("[CLIENT] Disconnect requested");
        self.machine.disconnect();
        self.token = None;
        self.retry_timer.cancel();
        self.settle_timer.cancel();
        self.drop_channel(true);
    }

    fn on_opened(&mut self, epoch: u64, result: Result<Channel, WebSocketError>, now: Instant) {
        if epoch != self.epoch {
            if let Ok(channel) = result {
                debug!("[CLIENT] Discarding superseded connection");
                let _ = channel.outgoing.send(Outbound::Close);
            }
            return;
        }
        match result {
            Ok(channel) => self.on_channel(channel, now),
            Err(e) => {
                warn!("[CLIENT] Connection attempt failed: {}", e);
                let outcome = self.machine.on_connect_failed(e.failure());
                self.apply_close_outcome(outcome);
            }
        }
    }

    fn on_channel(&mut self, channel: Channel, now: Instant) {
        let Channel { user_id, outgoing, mut incoming } = channel;
        self.machine.on_open(now);
        self.outbound = Some(outgoing);

        let epoch = self.epoch;
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = incoming.recv().await {
                let Some(tx) = tx.upgrade() else { return };
                if tx.send(EngineInput::Transport { epoch, event }).is_err() {
                    return;
                }
            }
        });

        if self.current_user() != Some(user_id.as_str()) {
            info!("[CLIENT] Session for {}", user_id);
            self.session = Some(Session::new(&user_id));
            self.notifications.set_current_user(&user_id);
            if self.active.set(None) {
                self.emit(ClientEvent::ConversationClosed);
            }
        }
        self.emit(ClientEvent::Authenticated { user_id });

        let ping_interval = self.machine.timings().ping_interval;
        self.keepalive_timer
            .schedule(TimerKind::KeepAlive, ping_interval, true, &self.self_tx);
        if self.notifications.clear_persistent() {
            self.emit_notifications();
        }

        self.send(Envelope::GetOnlineUsers);
        self.send(Envelope::GetConversations);
        if let Some(target) = self.active.get() {
            self.request_initial_load(&target.key);
            self.send_read_receipt(&target.key);
        }
    }

    fn on_transport(&mut self, epoch: u64, event: TransportEvent, now: Instant) {
        if epoch != self.epoch {
            return;
        }
        match event {
            TransportEvent::Frame(envelope) => {
                self.machine.on_activity(now);
                self.dispatch(envelope, now);
            }
            TransportEvent::Invalid(reason) => debug!("[CLIENT] Ignored invalid frame: {}", reason),
            TransportEvent::Closed { code } => self.on_closed(code),
        }
    }

    fn on_closed(&mut self, code: Option<u16>) {
        self.outbound = None;
        self.drop_channel(false);
        let outcome = self.machine.on_close(code);
        self.apply_close_outcome(outcome);
    }

    fn apply_close_outcome(&mut self, outcome: CloseOutcome) {
        match outcome {
            CloseOutcome::Retry { attempt, delay, kind } => {
                info!("[CLIENT] Reconnect {} in {:?} ({:?})", attempt, delay, kind);
                self.retry_timer.schedule(TimerKind::Retry, delay, false, &self.self_tx);
                self.emit(ClientEvent::ReconnectScheduled { attempt, delay, kind });
            }
            CloseOutcome::GaveUp { attempts } => {
                self.retry_timer.cancel();
                let notice = self.notifications.notify_connection_failed(attempts);
                self.emit(ClientEvent::ConnectionFailed { attempts });
                self.emit(ClientEvent::Notified(notice));
            }
            CloseOutcome::Closed => self.retry_timer.cancel(),
            CloseOutcome::Ignored => {}
        }
    }

    fn on_timer(&mut self, kind: TimerKind, generation: u64, now: Instant) {
        match kind {
            TimerKind::Retry => {
                if self.retry_timer.accept(generation) && self.machine.begin_retry(now) {
                    self.start_attempt();
                }
            }
            TimerKind::VisibilitySettle => {
                if !self.settle_timer.accept(generation) {
                    return;
                }
                if let Some(ConnectDecision::Start { .. }) = self.machine.visibility_check(now) {
                    info!("[CLIENT] Page visible again, reconnecting");
                    self.retry_timer.cancel();
                    self.start_attempt();
                }
            }
            TimerKind::KeepAlive => {
                if !self.keepalive_timer.accept(generation) {
                    return;
                }
                match self.machine.keepalive_check(now) {
                    KeepAlive::SendPing => {
                        self.send(Envelope::Ping);
                    }
                    KeepAlive::Stale => {
                        warn!("[CLIENT] No traffic for two ping periods, dropping connection");
                        self.on_closed(None);
                    }
                    KeepAlive::Idle => {}
                }
            }
        }
    }

    fn publish_state(&mut self) {
        let state = self.machine.state();
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.emit(ClientEvent::ConnectionStateChanged(state));
            self.refresh_compose();
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        let Some(session) = self.session.as_mut() else { return };
        let failed = session.sync.expire_pending(now);
        let idle_stop = session.typing.poll_idle(now);
        let expired = session.typing.expire(now);
        session.sync.sweep(now);

        if let Some(stop) = idle_stop {
            self.send(stop);
        }
        self.emit_indicators(expired);
        let mut touched: Vec<ConversationKey> = Vec::new();
        for (key, local_id) in failed {
            self.emit(ClientEvent::DeliveryFailed { key: key.clone(), local_id });
            if !touched.contains(&key) {
                touched.push(key);
            }
        }
        for key in touched {
            self.messages_changed(&key);
        }
    }

    // ---- inbound frames, one handler per kind ----

    fn dispatch(&mut self, envelope: Envelope, now: Instant) {
        match envelope {
            Envelope::OnlineUsers { content } => self.on_online_users(content.users),
            Envelope::UserStatus { content } => self.on_user_status(&content.user_id, content.status),
            Envelope::Message(wire) => self.on_message(wire, now),
            Envelope::Typing { sender_id, conversation_id, action, .. } => {
                self.on_typing(&sender_id, conversation_id, action, now)
            }
            Envelope::ReadStatus { conversation_id, reader_id } => self.on_read_status(conversation_id, &reader_id),
            Envelope::NewConversation { conversation_id, sender_id } => {
                self.on_new_conversation(conversation_id, &sender_id, now)
            }
            Envelope::History { request_id, messages, .. } => self.on_history(&request_id, messages),
            Envelope::Conversations { conversations } => self.on_conversations(conversations),
            Envelope::Ping => {
                self.send(Envelope::Pong);
            }
            Envelope::Pong => self.machine.on_pong(now),
            Envelope::Error { content, code, request_id } => self.on_server_error(code, content, request_id),
            other => debug!("[CLIENT] Ignoring {} from server", other.kind()),
        }
    }

    fn on_online_users(&mut self, users: Vec<UserId>) {
        let change = self.presence.replace_all(users);
        self.emit(ClientEvent::PresenceChanged(change));
        let presence = &self.presence;
        let cleared = match self.session.as_mut() {
            Some(session) => {
                session.conversations.refresh_badges(|u| presence.is_online(u));
                session.typing.clear_offline(|u| presence.is_online(u))
            }
            None => Vec::new(),
        };
        self.emit_indicators(cleared);
        self.emit_conversations();
        self.refresh_compose();
    }

    fn on_user_status(&mut self, user_id: &str, status: PresenceStatus) {
        let Some(change) = self.presence.apply_delta(user_id, status) else {
            return;
        };
        self.emit(ClientEvent::PresenceChanged(change));
        let online = status == PresenceStatus::Online;
        let (badges_changed, cleared) = match self.session.as_mut() {
            Some(session) => {
                let badges = session.conversations.set_online(user_id, online);
                let cleared = if online { Vec::new() } else { session.typing.clear_user(user_id) };
                (badges, cleared)
            }
            None => (false, Vec::new()),
        };
        self.emit_indicators(cleared);
        if badges_changed {
            self.emit_conversations();
        }
        self.refresh_compose();
    }

    fn on_message(&mut self, wire: WireMessage, now: Instant) {
        let outcome = match self.session.as_mut() {
            Some(session) => session.sync.reconcile(&wire, now),
            None => return,
        };
        match outcome {
            ReconcileOutcome::Duplicate | ReconcileOutcome::AlreadyKnown { .. } | ReconcileOutcome::Stale { .. } => {}
            ReconcileOutcome::Promoted { key, recipient_id, graft, .. } => {
                self.apply_graft(graft);
                let other = recipient_id.or_else(|| wire.recipient_id.clone()).unwrap_or_default();
                self.touch_conversation(&key, &other, &wire);
                self.messages_changed(&key);
                self.emit_conversations();
            }
            ReconcileOutcome::Inserted { key, message, graft } => {
                self.apply_graft(graft);
                let sender = message.sender_id.clone();
                self.touch_conversation(&key, &sender, &wire);
                let stopped = self
                    .session
                    .as_mut()
                    .and_then(|s| s.typing.on_remote(key.clone(), &sender, TypingAction::Stop, now));
                self.emit_indicators(stopped.into_iter().collect());

                let active = self.active.is_active(&key);
                if active {
                    self.send_read_receipt(&key);
                } else {
                    self.bump_unread(&key);
                }

                let target = ActiveTarget { key: key.clone(), recipient_id: sender.clone() };
                let in_view = active && self.machine.page_visible();
                if let Some(n) = self.notifications.notify_message(&sender, &message.content, target, in_view, now) {
                    self.emit(ClientEvent::Notified(n));
                    self.emit_notifications();
                }
                self.messages_changed(&key);
                self.emit_conversations();
            }
        }
    }

    fn on_typing(&mut self, sender_id: &str, conversation_id: Option<ConversationId>, action: TypingAction, now: Instant) {
        if self.current_user() == Some(sender_id) {
            return;
        }
        if action == TypingAction::Start && !self.presence.is_online(sender_id) {
            debug!("[CLIENT] Typing from offline user {} ignored", sender_id);
            return;
        }
        let change = match self.session.as_mut() {
            Some(session) => {
                let key = conversation_id
                    .map(ConversationKey::Id)
                    .or_else(|| session.conversations.find_by_user(sender_id).map(|e| e.key.clone()))
                    .unwrap_or_else(|| ConversationKey::Draft(sender_id.to_string()));
                session.typing.on_remote(key, sender_id, action, now)
            }
            None => None,
        };
        self.emit_indicators(change.into_iter().collect());
    }

    fn on_read_status(&mut self, conversation_id: ConversationId, reader_id: &str) {
        let key = ConversationKey::Id(conversation_id);
        let (outcome, by_me) = match self.session.as_mut() {
            Some(session) => {
                let by_me = session.user_id == reader_id;
                let outcome = session.sync.apply_read_status(conversation_id, reader_id);
                if by_me {
                    session.conversations.set_unread(&key, 0);
                }
                (outcome, by_me)
            }
            None => return,
        };
        if by_me && outcome.cleared_unread {
            self.emit(ClientEvent::UnreadChanged { key: key.clone(), unread: 0 });
            self.emit_conversations();
        }
        if outcome.marked_read > 0 {
            self.messages_changed(&key);
        }
    }

    fn on_new_conversation(&mut self, conversation_id: ConversationId, sender_id: &str, now: Instant) {
        if self.current_user() == Some(sender_id) {
            return;
        }
        let key = ConversationKey::Id(conversation_id);
        let online = self.presence.is_online(sender_id);
        let graft = match self.session.as_mut() {
            Some(session) => {
                let graft = session.sync.graft(sender_id, conversation_id);
                session.conversations.ensure(&key, sender_id, online);
                graft
            }
            None => return,
        };
        self.apply_graft(graft);
        let in_view = self.active.is_active(&key) && self.machine.page_visible();
        if !in_view {
            let target = ActiveTarget { key, recipient_id: sender_id.to_string() };
            if let Some(n) = self.notifications.notify_new_conversation(sender_id, target, now) {
                self.emit(ClientEvent::Notified(n));
                self.emit_notifications();
            }
        }
        self.emit_conversations();
    }

    fn on_history(&mut self, request_id: &str, messages: Vec<WireMessage>) {
        let Some(request) = self.pending_history.remove(request_id) else {
            debug!("[CLIENT] History reply {} has no pending request", request_id);
            return;
        };
        let still_active = self.active.is_active(&request.key);
        let outcome = match self.session.as_mut() {
            Some(session) if still_active => session.sync.complete_load(&request, messages),
            Some(session) => {
                debug!("[CLIENT] Discarding history for inactive {}", request.key);
                session.sync.fail_load(&request);
                return;
            }
            None => return,
        };
        match outcome {
            LoadOutcome::Exhausted => self.emit(ClientEvent::HistoryExhausted { key: request.key }),
            LoadOutcome::Loaded { .. } => self.messages_changed(&request.key),
        }
    }

    fn on_conversations(&mut self, summaries: Vec<ConversationSummary>) {
        let presence = &self.presence;
        if let Some(session) = self.session.as_mut() {
            session.conversations.replace_all(&summaries, |u| presence.is_online(u));
            for summary in &summaries {
                let key = ConversationKey::Id(summary.conversation_id);
                session.sync.set_unread(&key, summary.unread);
                session.conversations.set_unread(&key, summary.unread);
            }
        }
        self.emit_conversations();
    }

    fn on_server_error(&mut self, code: u16, content: String, request_id: Option<String>) {
        warn!("[CLIENT] Server error {}: {}", code, content);
        if let Some(request) = request_id.and_then(|id| self.pending_history.remove(&id)) {
            if let Some(session) = self.session.as_mut() {
                session.sync.fail_load(&request);
            }
        }
        let notice = self.notifications.notify_error(code, &content);
        self.emit(ClientEvent::ServerError { code, content });
        self.emit(ClientEvent::Notified(notice));
        self.emit_notifications();
    }

    // ---- user commands ----

    fn on_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Connect { token } => self.connect(token, now),
            Command::Disconnect => self.disconnect(),
            Command::OpenConversation { recipient_id, conversation_id } => {
                let key = self.resolve_key(&recipient_id, conversation_id);
                self.open_conversation(ActiveTarget { key, recipient_id });
            }
            Command::CloseConversation => self.close_conversation(),
            Command::ComposeChanged(text) => self.compose_changed(&text, now),
            Command::ComposeBlurred => self.stop_typing(),
            Command::Submit { content } => {
                if let Err(e) = self.submit(&content, now) {
                    warn!("[CLIENT] Message not sent: {}", e);
                    self.emit(ClientEvent::SubmitRejected(e));
                }
            }
            Command::RetryMessage { local_id } => {
                if let Err(e) = self.retry(local_id, now) {
                    warn!("[CLIENT] Retry refused: {}", e);
                    self.emit(ClientEvent::SubmitRejected(e));
                }
            }
            Command::Scrolled { scroll_top_px } => self.scrolled(scroll_top_px, now),
            Command::VisibilityChanged { visible } => self.visibility_changed(visible),
            Command::ActivateNotification { id } => {
                if let Some(target) = self.notifications.activate(id) {
                    self.emit_notifications();
                    let key = match target.key {
                        ConversationKey::Draft(_) => self.resolve_key(&target.recipient_id, None),
                        key => key,
                    };
                    self.open_conversation(ActiveTarget { key, recipient_id: target.recipient_id });
                }
            }
            Command::DismissNotification { id } => {
                if self.notifications.dismiss(id) {
                    self.emit_notifications();
                }
            }
            Command::RefreshConversations => {
                self.send(Envelope::GetConversations);
            }
            Command::Shutdown => {}
        }
    }

    fn resolve_key(&self, recipient_id: &str, conversation_id: Option<ConversationId>) -> ConversationKey {
        if let Some(id) = conversation_id {
            return ConversationKey::Id(id);
        }
        self.session
            .as_ref()
            .and_then(|s| s.conversations.find_by_user(recipient_id))
            .map(|e| e.key.clone())
            .unwrap_or_else(|| ConversationKey::Draft(recipient_id.to_string()))
    }

    /// The only way a conversation becomes active, from the UI or a notification.
    fn open_conversation(&mut self, target: ActiveTarget) {
        if self.active.get().as_ref() != Some(&target) {
            self.stop_typing();
        }
        if self.active.set(Some(target.clone())) {
            info!("[CLIENT] Opened {} with {}", target.key, target.recipient_id);
            self.emit(ClientEvent::ConversationOpened {
                key: target.key.clone(),
                recipient_id: target.recipient_id.clone(),
            });
        }
        self.refresh_compose();
        self.request_initial_load(&target.key);
        // il contatore si azzera solo col read_status del server
        self.send_read_receipt(&target.key);
        self.messages_changed(&target.key);
    }

    fn close_conversation(&mut self) {
        self.stop_typing();
        if self.active.set(None) {
            self.emit(ClientEvent::ConversationClosed);
        }
        self.refresh_compose();
    }

    fn compose_changed(&mut self, text: &str, now: Instant) {
        let Some(target) = self.active.get() else { return };
        if !self.compose_allowed(&target) {
            return;
        }
        let signals = match self.session.as_mut() {
            Some(session) => session.typing.on_compose_changed(&target.key, &target.recipient_id, text, now),
            None => return,
        };
        for signal in signals {
            self.send(signal);
        }
    }

    fn stop_typing(&mut self) {
        if let Some(stop) = self.session.as_mut().and_then(|s| s.typing.stop()) {
            self.send(stop);
        }
    }

    fn submit(&mut self, content: &str, now: Instant) -> Result<(), SubmitError> {
        let target = self.active.get().ok_or(SubmitError::NoActiveConversation)?;
        self.check_can_send(&target)?;
        let session = self.session.as_mut().ok_or(SubmitError::NotConnected)?;
        let sent_at = Utc::now();
        let submission = session
            .sync
            .submit(target.key.clone(), &target.recipient_id, content, sent_at, now)?;
        session
            .conversations
            .touch(&target.key, &target.recipient_id, content, sent_at, true);
        let stop = session.typing.stop();
        self.send(submission.envelope);
        if let Some(stop) = stop {
            self.send(stop);
        }
        self.messages_changed(&submission.key);
        self.emit_conversations();
        Ok(())
    }

    fn retry(&mut self, local_id: Uuid, now: Instant) -> Result<(), SubmitError> {
        let target = self.active.get().ok_or(SubmitError::NoActiveConversation)?;
        self.check_can_send(&target)?;
        let session = self.session.as_mut().ok_or(SubmitError::NotConnected)?;
        let submission = session.sync.retry(&target.key, local_id, Utc::now(), now)?;
        self.send(submission.envelope);
        self.messages_changed(&submission.key);
        Ok(())
    }

    fn check_can_send(&self, target: &ActiveTarget) -> Result<(), SubmitError> {
        if !self.machine.state().is_connected() {
            return Err(SubmitError::NotConnected);
        }
        if !self.presence.is_online(&target.recipient_id) {
            return Err(SubmitError::RecipientOffline(target.recipient_id.clone()));
        }
        Ok(())
    }

    fn scrolled(&mut self, scroll_top_px: f32, now: Instant) {
        let Some(target) = self.active.get() else { return };
        let request = self
            .session
            .as_mut()
            .and_then(|s| s.sync.begin_older_page(&target.key, scroll_top_px, now));
        if let Some(request) = request {
            debug!("[CLIENT] Loading older page of {} at offset {}", request.key, request.offset);
            self.send_history_request(request);
        }
    }

    fn visibility_changed(&mut self, visible: bool) {
        if self.machine.set_page_visible(visible) {
            let settle = self.machine.timings().visibility_settle;
            self.settle_timer
                .schedule(TimerKind::VisibilitySettle, settle, false, &self.self_tx);
        }
        if visible && self.read_receipt_due {
            if let Some(target) = self.active.get() {
                self.send_read_receipt(&target.key);
            }
        }
    }

    // ---- helpers ----

    fn request_initial_load(&mut self, key: &ConversationKey) {
        let request = self.session.as_mut().and_then(|s| s.sync.begin_initial_load(key));
        if let Some(request) = request {
            self.send_history_request(request);
        }
    }

    fn send_history_request(&mut self, request: HistoryRequest) {
        let request_id = Uuid::new_v4().to_string();
        if self.send(request.to_envelope(&request_id)) {
            self.pending_history.insert(request_id, request);
        } else if let Some(session) = self.session.as_mut() {
            session.sync.fail_load(&request);
        }
    }

    /// Read receipts only go out while the page is visible.
    fn send_read_receipt(&mut self, key: &ConversationKey) {
        let Some(conversation_id) = key.id() else { return };
        if !self.machine.page_visible() {
            self.read_receipt_due = true;
            return;
        }
        if self.send(Envelope::MarkRead { conversation_id }) {
            self.read_receipt_due = false;
        }
    }

    fn bump_unread(&mut self, key: &ConversationKey) {
        if let Some(session) = self.session.as_mut() {
            let unread = session.sync.bump_unread(key);
            session.conversations.set_unread(key, unread);
            self.emit(ClientEvent::UnreadChanged { key: key.clone(), unread });
        }
    }

    fn touch_conversation(&mut self, key: &ConversationKey, other_user: &str, wire: &WireMessage) {
        let online = self.presence.is_online(other_user);
        if let Some(session) = self.session.as_mut() {
            session.conversations.touch(key, other_user, &wire.content, wire.sent_at, online);
        }
    }

    fn apply_graft(&mut self, graft: Option<Graft>) {
        let Some(Graft { from, to }) = graft else { return };
        self.active.graft(&from, to.clone());
        if let Some(session) = self.session.as_mut() {
            session.conversations.graft(&from, to.clone());
            session.typing.graft(&from, &to);
        }
        self.emit(ClientEvent::ConversationGrafted { from, to: to.clone() });
        if self.active.is_active(&to) {
            self.request_initial_load(&to);
        }
    }

    fn compose_allowed(&self, target: &ActiveTarget) -> bool {
        self.machine.state().is_connected() && self.presence.is_online(&target.recipient_id)
    }

    fn refresh_compose(&mut self) {
        let enabled = self.active.get().map_or(false, |t| self.compose_allowed(&t));
        if self.compose_enabled != Some(enabled) {
            self.compose_enabled = Some(enabled);
            self.emit(ClientEvent::ComposeEnabled { enabled });
        }
    }

    fn messages_changed(&self, key: &ConversationKey) {
        if let Some(session) = &self.session {
            self.emit(ClientEvent::MessagesChanged {
                key: key.clone(),
                messages: session.sync.messages(key),
            });
        }
    }

    fn emit_conversations(&self) {
        if let Some(session) = &self.session {
            self.emit(ClientEvent::ConversationsChanged(session.conversations.snapshot()));
        }
    }

    fn emit_notifications(&self) {
        self.emit(ClientEvent::NotificationsChanged(self.notifications.visible()));
    }

    fn emit_indicators(&self, changes: Vec<IndicatorChange>) {
        for change in changes {
            let (key, user_id, typing) = match change {
                IndicatorChange::Shown { key, user_id } => (key, user_id, true),
                IndicatorChange::Cleared { key, user_id } => (key, user_id, false),
            };
            self.emit(ClientEvent::TypingIndicator { key, user_id, typing });
        }
    }
}

/// Handle to the engine task. Dropping it stops the engine.
pub struct ChatService {
    tx: UnboundedSender<EngineInput>,
    events: Option<UnboundedReceiver<ClientEvent>>,
    state: watch::Receiver<ConnectionState>,
    active: watch::Receiver<Option<ActiveTarget>>,
    presence: watch::Receiver<HashSet<UserId>>,
    task: JoinHandle<()>,
}

impl ChatService {
    pub fn spawn(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        desktop: Box<dyn DesktopNotifier>,
        sound: Box<dyn SoundPlayer>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let presence = PresenceView::new();
        let active = ActiveConversation::new();
        let presence_rx = presence.subscribe();
        let active_rx = active.subscribe();

        let engine = Engine {
            connector,
            housekeeping_interval: config.housekeeping_interval,
            machine: ConnectionMachine::new(config.timings.clone()),
            token: None,
            epoch: 0,
            outbound: None,
            self_tx: tx.downgrade(),
            retry_timer: TimerSlot::default(),
            settle_timer: TimerSlot::default(),
            keepalive_timer: TimerSlot::default(),
            presence,
            active,
            session: None,
            notifications: NotificationDispatcher::new("", desktop, sound).with_sound_asset(config.sound_asset.clone()),
            pending_history: HashMap::new(),
            read_receipt_due: false,
            compose_enabled: None,
            events: events_tx,
            state_tx,
        };
        let task = tokio::spawn(engine.run(rx));

        Self {
            tx,
            events: Some(events_rx),
            state: state_rx,
            active: active_rx,
            presence: presence_rx,
            task,
        }
    }

    pub fn send(&self, command: Command) -> bool {
        self.tx.send(EngineInput::Command(command)).is_ok()
    }

    /// Event stream for the UI. Can be taken once.
    pub fn take_event_rx(&mut self) -> Option<UnboundedReceiver<ClientEvent>> {
        self.events.take()
    }

    pub fn connect(&self, token: impl Into<String>) -> bool {
        self.send(Command::Connect { token: token.into() })
    }

    pub fn disconnect(&self) -> bool {
        self.send(Command::Disconnect)
    }

    pub fn open_conversation(&self, recipient_id: impl Into<UserId>, conversation_id: Option<ConversationId>) -> bool {
        self.send(Command::OpenConversation {
            recipient_id: recipient_id.into(),
            conversation_id,
        })
    }

    pub fn compose(&self, text: impl Into<String>) -> bool {
        self.send(Command::ComposeChanged(text.into()))
    }

    pub fn submit(&self, content: impl Into<String>) -> bool {
        self.send(Command::Submit { content: content.into() })
    }

    pub fn retry(&self, local_id: Uuid) -> bool {
        self.send(Command::RetryMessage { local_id })
    }

    pub fn scrolled(&self, scroll_top_px: f32) -> bool {
        self.send(Command::Scrolled { scroll_top_px })
    }

    pub fn set_visible(&self, visible: bool) -> bool {
        self.send(Command::VisibilityChanged { visible })
    }

    pub fn activate_notification(&self, id: u64) -> bool {
        self.send(Command::ActivateNotification { id })
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn active_conversation(&self) -> Option<ActiveTarget> {
        self.active.borrow().clone()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.borrow().contains(user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.presence.borrow().iter().cloned().collect();
        users.sort();
        users
    }

    pub async fn shutdown(self) {
        let _ = self.tx.send(EngineInput::Command(Command::Shutdown));
        let _ = self.task.await;
    }
}
