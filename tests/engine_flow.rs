// Motore client contro un server reale e contro un connettore scriptato (tempo in pausa)
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use forum_chat::client::config::ClientConfig;
use forum_chat::client::models::app_state::{ActiveTarget, ConversationKey, DeliveryState};
use forum_chat::client::models::messages::ClientEvent;
use forum_chat::client::services::chat_service::ChatService;
use forum_chat::client::services::connection_manager::{ConnectionState, RetryKind};
use forum_chat::client::services::notifications::{
    DesktopNotifier, NotificationKind, NotifyError, Permission, SoundPlayer,
};
use forum_chat::client::services::websocket_client::{
    Channel, Connector, Outbound, TransportEvent, WebSocketConnector, WebSocketError,
};
use forum_chat::client::services::message_sync::SubmitError;
use forum_chat::common::protocol::{Envelope, OnlineUsersContent, PresenceStatus, TypingAction, WireMessage};
use forum_chat::server::config::ServerConfig;
use forum_chat::server::database::Database;
use forum_chat::server::websocket::{serve, ChatWebSocketManager};

struct Quiet;

impl DesktopNotifier for Quiet {
    fn request_permission(&mut self) -> Permission {
        Permission::Granted
    }

    fn show(&mut self, _title: &str, _body: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

impl SoundPlayer for Quiet {
    fn play_asset(&mut self, _asset: &str) -> Result<(), NotifyError> {
        Ok(())
    }

    fn play_tone(&mut self, _frequency_hz: u32, _length: Duration) -> Result<(), NotifyError> {
        Ok(())
    }
}

fn spawn_service(config: &ClientConfig, connector: Arc<dyn Connector>) -> (ChatService, mpsc::UnboundedReceiver<ClientEvent>) {
    let mut service = ChatService::spawn(config, connector, Box::new(Quiet), Box::new(Quiet));
    let events = service.take_event_rx().unwrap();
    (service, events)
}

async fn wait_for<T>(events: &mut mpsc::UnboundedReceiver<ClientEvent>, mut pick: impl FnMut(&ClientEvent) -> Option<T>) -> T {
    let search = async {
        loop {
            let event = events.recv().await.expect("engine stopped");
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), search)
        .await
        .expect("event never arrived")
}

/// Everything emitted up to and including the first event matching `stop`.
async fn collect_until(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    mut stop: impl FnMut(&ClientEvent) -> bool,
) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    wait_for(events, |e| {
        seen.push(e.clone());
        stop(e).then_some(())
    })
    .await;
    seen
}

// ---- against the real server ----

async fn start_server() -> String {
    let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
    db.migrate().await.unwrap();
    let now = chrono::Utc::now().timestamp();
    for user in ["alice", "bob"] {
        sqlx::query("INSERT INTO sessions (user_id, session_token, created_at, expires_at) VALUES (?, ?, ?, ?)")
            .bind(user)
            .bind(format!("tok-{}", user))
            .bind(now)
            .bind(now + 3600)
            .execute(&db.pool)
            .await
            .unwrap();
    }
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, Arc::new(ChatWebSocketManager::new(db, ServerConfig::default()))));
    format!("ws://{}", addr)
}

#[tokio::test]
async fn optimistic_send_is_confirmed_by_the_echo() {
    let url = start_server().await;
    let config = ClientConfig::new(url.clone());
    let connector: Arc<dyn Connector> = Arc::new(WebSocketConnector::new(url, Duration::from_secs(2)));

    let (bob, mut bob_events) = spawn_service(&config, connector.clone());
    bob.connect("tok-bob");
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::Authenticated { .. }).then_some(())).await;

    let (alice, mut alice_events) = spawn_service(&config, connector);
    alice.connect("tok-alice");
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Authenticated { .. }).then_some(())).await;
    while !alice.is_online("bob") {
        alice_events.recv().await.expect("engine stopped");
    }

    alice.open_conversation("bob", None);
    alice.submit("ciao bob");

    // pending first, in the draft conversation
    let pending = wait_for(&mut alice_events, |e| match e {
        ClientEvent::MessagesChanged { key: ConversationKey::Draft(_), messages } if !messages.is_empty() => {
            Some(messages.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].delivery, DeliveryState::Pending);

    let (key, confirmed) = wait_for(&mut alice_events, |e| match e {
        ClientEvent::MessagesChanged { key: key @ ConversationKey::Id(_), messages }
            if messages.iter().any(|m| m.delivery == DeliveryState::Sent) =>
        {
            Some((key.clone(), messages.clone()))
        }
        _ => None,
    })
    .await;
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].local_id, pending[0].local_id);
    assert!(confirmed[0].id.is_some());
    assert_eq!(alice.active_conversation().map(|t| t.key), Some(key.clone()));

    let received = wait_for(&mut bob_events, |e| match e {
        ClientEvent::MessagesChanged { key: k, messages } if *k == key && !messages.is_empty() => Some(messages.clone()),
        _ => None,
    })
    .await;
    assert_eq!(received[0].content, "ciao bob");
    assert_eq!(received[0].sender_id, "alice");

    alice.shutdown().await;
    bob.shutdown().await;
}

// ---- against a scripted connector ----

struct FakeLink {
    from_client: mpsc::UnboundedReceiver<Outbound>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl FakeLink {
    fn push(&self, envelope: Envelope) {
        self.to_client.send(TransportEvent::Frame(envelope)).unwrap();
    }

    async fn next_sent(&mut self, mut pick: impl FnMut(&Envelope) -> bool) -> Envelope {
        loop {
            match self.from_client.recv().await.expect("client hung up") {
                Outbound::Send(envelope) if pick(&envelope) => return envelope,
                _ => continue,
            }
        }
    }
}

/// The token doubles as the user id. Fails the next `failures` attempts.
struct FakeConnector {
    links: mpsc::UnboundedSender<FakeLink>,
    failures: Mutex<u32>,
    attempts: AtomicU32,
}

impl FakeConnector {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeLink>) {
        let (links, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            links,
            failures: Mutex::new(0),
            attempts: AtomicU32::new(0),
        });
        (connector, rx)
    }

    fn fail_next(&self, n: u32) {
        *self.failures.lock().unwrap() = n;
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, token: &str) -> Result<Channel, WebSocketError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(WebSocketError::ConnectionFailed("connection refused".into()));
            }
        }
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let (to_client, incoming) = mpsc::unbounded_channel();
        let _ = self.links.send(FakeLink { from_client, to_client });
        Ok(Channel {
            user_id: token.to_string(),
            outgoing,
            incoming,
        })
    }
}

async fn connected(
    config: &ClientConfig,
) -> (ChatService, mpsc::UnboundedReceiver<ClientEvent>, Arc<FakeConnector>, mpsc::UnboundedReceiver<FakeLink>) {
    let (connector, links) = FakeConnector::new();
    let (service, mut events) = spawn_service(config, connector.clone());
    service.connect("alice");
    wait_for(&mut events, |e| matches!(e, ClientEvent::Authenticated { .. }).then_some(())).await;
    (service, events, connector, links)
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_reconnects_after_the_extended_delay() {
    let config = ClientConfig::new("ws://fake");
    let (service, mut events, connector, mut links) = connected(&config).await;
    let first = links.recv().await.unwrap();

    first.to_client.send(TransportEvent::Closed { code: None }).unwrap();
    let (attempt, delay, kind) = wait_for(&mut events, |e| match e {
        ClientEvent::ReconnectScheduled { attempt, delay, kind } => Some((*attempt, *delay, *kind)),
        _ => None,
    })
    .await;
    assert_eq!((attempt, delay, kind), (1, Duration::from_secs(4), RetryKind::Abnormal));
    assert_eq!(service.connection_state(), ConnectionState::Reconnecting);

    let started = tokio::time::Instant::now();
    let _second = links.recv().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(4));
    wait_for(&mut events, |e| matches!(e, ClientEvent::Authenticated { .. }).then_some(())).await;
    assert_eq!(service.connection_state(), ConnectionState::Connected);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retries_stop_after_five_attempts() {
    let config = ClientConfig::new("ws://fake");
    let (service, mut events, connector, mut links) = connected(&config).await;
    let first = links.recv().await.unwrap();

    connector.fail_next(100);
    first.to_client.send(TransportEvent::Closed { code: Some(1006) }).unwrap();

    let attempts = wait_for(&mut events, |e| match e {
        ClientEvent::ConnectionFailed { attempts } => Some(*attempts),
        _ => None,
    })
    .await;
    assert_eq!(attempts, 5);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 6);
    let notice = wait_for(&mut events, |e| match e {
        ClientEvent::Notified(n) => Some(n.clone()),
        _ => None,
    })
    .await;
    assert_eq!(notice.kind, NotificationKind::ConnectionLost);
    assert!(notice.body.contains('5'));

    // nothing else is attempted on its own
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 6);
    assert_eq!(service.connection_state(), ConnectionState::Failed);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn normal_close_does_not_reconnect() {
    let config = ClientConfig::new("ws://fake");
    let (service, mut events, connector, mut links) = connected(&config).await;
    let first = links.recv().await.unwrap();

    first.to_client.send(TransportEvent::Closed { code: Some(1000) }).unwrap();
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected)).then_some(())
    })
    .await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_message_fails_and_can_be_retried() {
    let config = ClientConfig::new("ws://fake");
    let (service, mut events, _connector, mut links) = connected(&config).await;
    let mut link = links.recv().await.unwrap();
    link.push(Envelope::OnlineUsers {
        content: OnlineUsersContent {
            users: vec!["alice".into(), "bob".into()],
        },
    });
    wait_for(&mut events, |e| matches!(e, ClientEvent::PresenceChanged(_)).then_some(())).await;

    service.open_conversation("bob", Some(7));
    service.submit("ci sei?");
    link.next_sent(|e| matches!(e, Envelope::Private { .. })).await;

    let (key, local_id) = wait_for(&mut events, |e| match e {
        ClientEvent::DeliveryFailed { key, local_id } => Some((key.clone(), *local_id)),
        _ => None,
    })
    .await;
    assert_eq!(key, ConversationKey::Id(7));

    service.retry(local_id);
    match link.next_sent(|e| matches!(e, Envelope::Private { .. })).await {
        Envelope::Private { recipient_id, content, conversation_id, .. } => {
            assert_eq!(recipient_id, "bob");
            assert_eq!(content, "ci sei?");
            assert_eq!(conversation_id, Some(7));
        }
        _ => unreachable!(),
    }

    link.push(Envelope::Message(WireMessage {
        id: Some("41".into()),
        sender_id: "alice".into(),
        recipient_id: Some("bob".into()),
        content: "ci sei?".into(),
        conversation_id: 7,
        sent_at: chrono::Utc::now(),
        is_read: false,
    }));
    let messages = wait_for(&mut events, |e| match e {
        ClientEvent::MessagesChanged { key, messages }
            if *key == ConversationKey::Id(7) && messages.iter().any(|m| m.delivery == DeliveryState::Sent) =>
        {
            Some(messages.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].local_id, local_id);

    service.shutdown().await;
}

fn from_bob(id: &str, conversation_id: i64, content: &str) -> WireMessage {
    WireMessage {
        id: Some(id.into()),
        sender_id: "bob".into(),
        recipient_id: Some("alice".into()),
        content: content.into(),
        conversation_id,
        sent_at: chrono::Utc::now(),
        is_read: false,
    }
}

async fn announce_online(link: &FakeLink, events: &mut mpsc::UnboundedReceiver<ClientEvent>, users: &[&str]) {
    link.push(Envelope::OnlineUsers {
        content: OnlineUsersContent {
            users: users.iter().map(|u| u.to_string()).collect(),
        },
    });
    wait_for(events, |e| matches!(e, ClientEvent::PresenceChanged(_)).then_some(())).await;
}

fn zeroes_unread(event: &ClientEvent, key: &ConversationKey) -> bool {
    matches!(event, ClientEvent::UnreadChanged { key: k, unread: 0 } if k == key)
}

#[tokio::test(start_paused = true)]
async fn unread_clears_only_after_the_read_receipt_round_trip() {
    let config = ClientConfig::new("ws://fake");
    let (service, mut events, _connector, mut links) = connected(&config).await;
    let mut link = links.recv().await.unwrap();
    announce_online(&link, &mut events, &["alice", "bob"]).await;
    let key = ConversationKey::Id(7);

    service.set_visible(false);
    link.push(Envelope::Message(from_bob("70", 7, "ci sei?")));
    let unread = wait_for(&mut events, |e| match e {
        ClientEvent::UnreadChanged { key: k, unread } if *k == key => Some(*unread),
        _ => None,
    })
    .await;
    assert_eq!(unread, 1);

    // aperta con la pagina nascosta: nessuna ricevuta, contatore invariato
    service.open_conversation("bob", Some(7));
    let mut seen = collect_until(&mut events, |e| matches!(e, ClientEvent::ConversationOpened { .. })).await;
    seen.extend(
        collect_until(&mut events, |e| matches!(e, ClientEvent::MessagesChanged { key: k, .. } if *k == key)).await,
    );
    assert!(!seen.iter().any(|e| zeroes_unread(e, &key)));
    while let Ok(out) = link.from_client.try_recv() {
        assert!(!matches!(out, Outbound::Send(Envelope::MarkRead { .. })));
    }

    service.set_visible(true);
    match link.next_sent(|e| matches!(e, Envelope::MarkRead { .. })).await {
        Envelope::MarkRead { conversation_id } => assert_eq!(conversation_id, 7),
        _ => unreachable!(),
    }

    link.push(Envelope::ReadStatus { conversation_id: 7, reader_id: "alice".into() });
    wait_for(&mut events, |e| zeroes_unread(e, &key).then_some(())).await;

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn peer_going_offline_disables_compose_and_clears_typing() {
    let config = ClientConfig::new("ws://fake");
    let (service, mut events, _connector, mut links) = connected(&config).await;
    let link = links.recv().await.unwrap();
    announce_online(&link, &mut events, &["alice", "bob"]).await;
    let key = ConversationKey::Id(7);

    service.open_conversation("bob", Some(7));
    wait_for(&mut events, |e| matches!(e, ClientEvent::ComposeEnabled { enabled: true }).then_some(())).await;

    let typing_from_bob = || Envelope::Typing {
        sender_id: "bob".into(),
        recipient_id: Some("alice".into()),
        conversation_id: Some(7),
        action: TypingAction::Start,
    };
    link.push(typing_from_bob());
    let (shown_key, user) = wait_for(&mut events, |e| match e {
        ClientEvent::TypingIndicator { key, user_id, typing: true } => Some((key.clone(), user_id.clone())),
        _ => None,
    })
    .await;
    assert_eq!((shown_key, user.as_str()), (key.clone(), "bob"));

    link.push(Envelope::user_status("bob", PresenceStatus::Offline));
    let seen = collect_until(&mut events, |e| matches!(e, ClientEvent::ComposeEnabled { enabled: false })).await;
    assert!(seen.iter().any(|e| matches!(
        e,
        ClientEvent::TypingIndicator { key: k, user_id, typing: false } if *k == key && user_id == "bob"
    )));
    assert!(!service.is_online("bob"));

    // a start from someone offline is ignored
    link.push(typing_from_bob());
    link.push(Envelope::user_status("carol", PresenceStatus::Online));
    let seen = collect_until(&mut events, |e| matches!(e, ClientEvent::PresenceChanged(_))).await;
    assert!(!seen.iter().any(|e| matches!(e, ClientEvent::TypingIndicator { .. })));

    service.submit("sei ancora lì?");
    let rejected = wait_for(&mut events, |e| match e {
        ClientEvent::SubmitRejected(err) => Some(err.clone()),
        _ => None,
    })
    .await;
    assert_eq!(rejected, SubmitError::RecipientOffline("bob".into()));

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn activating_a_notification_opens_the_conversation_like_the_sidebar() {
    let config = ClientConfig::new("ws://fake");
    let (service, mut events, _connector, mut links) = connected(&config).await;
    let mut link = links.recv().await.unwrap();
    announce_online(&link, &mut events, &["alice", "bob"]).await;
    let key = ConversationKey::Id(9);

    link.push(Envelope::Message(from_bob("90", 9, "guarda qui")));
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::UnreadChanged { key: k, unread: 1 } if *k == key).then_some(())
    })
    .await;
    let notification = wait_for(&mut events, |e| match e {
        ClientEvent::Notified(n) if n.kind == NotificationKind::Message => Some(n.clone()),
        _ => None,
    })
    .await;

    service.activate_notification(notification.id);
    match link.next_sent(|e| matches!(e, Envelope::MarkRead { .. })).await {
        Envelope::MarkRead { conversation_id } => assert_eq!(conversation_id, 9),
        _ => unreachable!(),
    }
    assert_eq!(
        service.active_conversation(),
        Some(ActiveTarget { key: key.clone(), recipient_id: "bob".into() })
    );
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::ConversationOpened { key: k, .. } if *k == key).then_some(())
    })
    .await;

    link.push(Envelope::ReadStatus { conversation_id: 9, reader_id: "alice".into() });
    wait_for(&mut events, |e| zeroes_unread(e, &key).then_some(())).await;

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn history_for_a_conversation_left_behind_is_discarded() {
    let config = ClientConfig::new("ws://fake");
    let (service, mut events, _connector, mut links) = connected(&config).await;
    let mut link = links.recv().await.unwrap();
    announce_online(&link, &mut events, &["alice", "bob", "carol"]).await;

    let history_for = |conversation: i64| {
        move |e: &Envelope| matches!(e, Envelope::GetHistory { conversation_id, .. } if *conversation_id == conversation)
    };
    let request_id = |e: Envelope| match e {
        Envelope::GetHistory { request_id, .. } => request_id,
        _ => unreachable!(),
    };

    service.open_conversation("bob", Some(7));
    let first = request_id(link.next_sent(history_for(7)).await);
    service.open_conversation("carol", Some(8));
    link.next_sent(history_for(8)).await;

    link.push(Envelope::History {
        request_id: first.clone(),
        conversation_id: 7,
        offset: 0,
        messages: vec![from_bob("1", 7, "vecchio")],
    });
    link.push(Envelope::Ping);
    link.next_sent(|e| matches!(e, Envelope::Pong)).await;

    // scartata e non più in caricamento: riaprendo si richiede di nuovo
    service.open_conversation("bob", Some(7));
    let second = request_id(link.next_sent(history_for(7)).await);
    assert_ne!(second, first);

    link.push(Envelope::History {
        request_id: second,
        conversation_id: 7,
        offset: 0,
        messages: vec![from_bob("1", 7, "vecchio")],
    });
    let messages = wait_for(&mut events, |e| match e {
        ClientEvent::MessagesChanged { key: ConversationKey::Id(7), messages } if !messages.is_empty() => {
            Some(messages.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_deref(), Some("1"));

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn visible_page_reconnects_after_the_settle_delay() {
    let config = ClientConfig::new("ws://fake");
    let (service, mut events, connector, mut links) = connected(&config).await;
    let first = links.recv().await.unwrap();

    service.set_visible(false);
    first.to_client.send(TransportEvent::Closed { code: Some(1000) }).unwrap();
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected)).then_some(())
    })
    .await;
    // fuori dalla finestra di cooldown
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

    let shown = tokio::time::Instant::now();
    service.set_visible(true);
    tokio::time::sleep(Duration::from_millis(500)).await;
    // un nuovo passaggio a visibile riprogramma il controllo
    service.set_visible(false);
    service.set_visible(true);

    let _second = links.recv().await.unwrap();
    assert!(shown.elapsed() >= Duration::from_millis(1500));
    wait_for(&mut events, |e| matches!(e, ClientEvent::Authenticated { .. }).then_some(())).await;
    assert_eq!(service.connection_state(), ConnectionState::Connected);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

    service.shutdown().await;
}
