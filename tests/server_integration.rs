// Server reale su porta libera, SQLite in memoria, client WebSocket grezzi
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use forum_chat::common::protocol::{codes, Envelope, PresenceStatus, TypingAction, WireMessage};
use forum_chat::server::config::ServerConfig;
use forum_chat::server::database::Database;
use forum_chat::server::websocket::{serve, ChatWebSocketManager};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

async fn start_server() -> (String, Arc<Database>) {
    let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
    db.migrate().await.unwrap();
    let now = chrono::Utc::now().timestamp();
    for user in ["alice", "bob", "carol"] {
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
    let config = ServerConfig {
        max_message_length: 32,
        auth_timeout: Duration::from_millis(500),
        ..ServerConfig::default()
    };
    let manager = Arc::new(ChatWebSocketManager::new(db.clone(), config));
    tokio::spawn(serve(listener, manager));
    (format!("ws://{}", addr), db)
}

async fn send(ws: &mut Ws, envelope: Envelope) {
    ws.send(Message::Text(envelope.encode().unwrap())).await.unwrap();
}

/// Next text frame, or None when the socket closes.
async fn recv(ws: &mut Ws) -> Option<Envelope> {
    loop {
        match tokio::time::timeout(WAIT, ws.next()).await.expect("timed out waiting for a frame") {
            Some(Ok(Message::Text(text))) => return Some(Envelope::decode(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Skips frames until one matches.
async fn recv_until(ws: &mut Ws, mut pred: impl FnMut(&Envelope) -> bool) -> Envelope {
    loop {
        let envelope = recv(ws).await.expect("connection closed");
        if pred(&envelope) {
            return envelope;
        }
    }
}

async fn login(url: &str, user: &str) -> Ws {
    let (mut ws, _) = connect_async(url).await.unwrap();
    send(&mut ws, Envelope::Auth { token: format!("tok-{}", user) }).await;
    match recv(&mut ws).await {
        Some(Envelope::AuthResponse { success: true, user_id, .. }) => assert_eq!(user_id.as_deref(), Some(user)),
        other => panic!("login failed: {other:?}"),
    }
    // the reply proves the connection is registered
    let users = online_users(&mut ws).await;
    assert!(users.iter().any(|u| u == user));
    ws
}

async fn online_users(ws: &mut Ws) -> Vec<String> {
    send(ws, Envelope::GetOnlineUsers).await;
    match recv_until(ws, |e| matches!(e, Envelope::OnlineUsers { .. })).await {
        Envelope::OnlineUsers { content } => content.users,
        _ => unreachable!(),
    }
}

fn private(to: &str, content: &str, conversation_id: Option<i64>) -> Envelope {
    Envelope::Private {
        recipient_id: to.to_string(),
        content: content.to_string(),
        conversation_id,
        is_new_conversation: conversation_id.is_none(),
    }
}

async fn next_message(ws: &mut Ws) -> WireMessage {
    match recv_until(ws, |e| matches!(e, Envelope::Message(_))).await {
        Envelope::Message(m) => m,
        _ => unreachable!(),
    }
}

async fn next_error(ws: &mut Ws) -> (u16, Option<String>) {
    match recv_until(ws, |e| matches!(e, Envelope::Error { .. })).await {
        Envelope::Error { code, request_id, .. } => (code, request_id),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn invalid_token_is_rejected_and_closed() {
    let (url, _db) = start_server().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    send(&mut ws, Envelope::Auth { token: "nope".into() }).await;
    match recv(&mut ws).await {
        Some(Envelope::AuthResponse { success, user_id, error }) => {
            assert!(!success);
            assert_eq!(user_id, None);
            assert!(error.is_some());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(recv(&mut ws).await, None);
}

#[tokio::test]
async fn silent_clients_time_out() {
    let (url, _db) = start_server().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    match recv(&mut ws).await {
        Some(Envelope::AuthResponse { success: false, error: Some(e), .. }) => assert!(e.contains("timeout")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn presence_is_broadcast_on_join_and_leave() {
    let (url, _db) = start_server().await;
    let mut alice = login(&url, "alice").await;
    let mut bob = login(&url, "bob").await;

    match recv_until(&mut alice, |e| matches!(e, Envelope::UserStatus { .. })).await {
        Envelope::UserStatus { content } => {
            assert_eq!(content.user_id, "bob");
            assert_eq!(content.status, PresenceStatus::Online);
        }
        _ => unreachable!(),
    }
    assert_eq!(online_users(&mut bob).await, vec!["alice".to_string(), "bob".to_string()]);

    bob.close(None).await.unwrap();
    match recv_until(&mut alice, |e| matches!(e, Envelope::UserStatus { .. })).await {
        Envelope::UserStatus { content } => {
            assert_eq!(content.user_id, "bob");
            assert_eq!(content.status, PresenceStatus::Offline);
        }
        _ => unreachable!(),
    }
    assert_eq!(online_users(&mut alice).await, vec!["alice".to_string()]);
}

#[tokio::test]
async fn private_message_reaches_recipient_and_echoes_to_sender() {
    let (url, _db) = start_server().await;
    let mut alice = login(&url, "alice").await;
    let mut bob = login(&url, "bob").await;

    send(&mut alice, private("bob", "ciao bob", None)).await;

    let conversation_id = match recv_until(&mut bob, |e| matches!(e, Envelope::NewConversation { .. })).await {
        Envelope::NewConversation { conversation_id, sender_id } => {
            assert_eq!(sender_id, "alice");
            conversation_id
        }
        _ => unreachable!(),
    };
    let delivered = next_message(&mut bob).await;
    let echoed = next_message(&mut alice).await;
    assert_eq!(delivered, echoed);
    assert_eq!(delivered.conversation_id, conversation_id);
    assert_eq!(delivered.sender_id, "alice");
    assert_eq!(delivered.recipient_id.as_deref(), Some("bob"));
    assert!(delivered.id.is_some());

    // existing conversation: no second new_conversation
    send(&mut bob, private("alice", "ciao alice", Some(conversation_id))).await;
    let reply = next_message(&mut alice).await;
    assert_eq!(reply.conversation_id, conversation_id);
    match recv(&mut bob).await {
        Some(Envelope::Message(echo)) => assert_eq!(echo.content, "ciao alice"),
        other => panic!("expected the echo, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_sends_get_error_codes() {
    let (url, _db) = start_server().await;
    let mut alice = login(&url, "alice").await;

    send(&mut alice, private("bob", "sei online?", None)).await;
    assert_eq!(next_error(&mut alice).await.0, codes::RECIPIENT_OFFLINE);

    let _bob = login(&url, "bob").await;
    send(&mut alice, private("bob", &"x".repeat(33), None)).await;
    assert_eq!(next_error(&mut alice).await.0, codes::TOO_LONG);

    send(&mut alice, private("bob", "   ", None)).await;
    assert_eq!(next_error(&mut alice).await.0, codes::BAD_REQUEST);

    send(&mut alice, private("alice", "me", None)).await;
    assert_eq!(next_error(&mut alice).await.0, codes::BAD_REQUEST);

    alice.send(Message::Text(r#"{"type":"shout"}"#.into())).await.unwrap();
    assert_eq!(next_error(&mut alice).await.0, codes::BAD_REQUEST);

    send(&mut alice, private("bob", "fake", Some(999))).await;
    assert_eq!(next_error(&mut alice).await.0, codes::NOT_FOUND);
}

#[tokio::test]
async fn history_is_paged_newest_first_for_participants_only() {
    let (url, _db) = start_server().await;
    let mut alice = login(&url, "alice").await;
    let mut bob = login(&url, "bob").await;
    let mut carol = login(&url, "carol").await;

    let mut conversation_id = None;
    for i in 0..3 {
        send(&mut alice, private("bob", &format!("m{}", i), conversation_id)).await;
        conversation_id = Some(next_message(&mut alice).await.conversation_id);
    }
    let conversation_id = conversation_id.unwrap();

    send(
        &mut bob,
        Envelope::GetHistory {
            request_id: "r1".into(),
            conversation_id,
            limit: 2,
            offset: 0,
        },
    )
    .await;
    match recv_until(&mut bob, |e| matches!(e, Envelope::History { .. })).await {
        Envelope::History { request_id, messages, offset, .. } => {
            assert_eq!(request_id, "r1");
            assert_eq!(offset, 0);
            let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
            assert_eq!(contents, vec!["m2", "m1"]);
        }
        _ => unreachable!(),
    }

    send(
        &mut bob,
        Envelope::GetHistory {
            request_id: "r2".into(),
            conversation_id,
            limit: 2,
            offset: 2,
        },
    )
    .await;
    match recv_until(&mut bob, |e| matches!(e, Envelope::History { .. })).await {
        Envelope::History { messages, .. } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].content, "m0");
        }
        _ => unreachable!(),
    }

    send(
        &mut carol,
        Envelope::GetHistory {
            request_id: "r3".into(),
            conversation_id,
            limit: 20,
            offset: 0,
        },
    )
    .await;
    assert_eq!(next_error(&mut carol).await, (codes::FORBIDDEN, Some("r3".to_string())));

    send(
        &mut carol,
        Envelope::GetHistory {
            request_id: "r4".into(),
            conversation_id: conversation_id + 100,
            limit: 20,
            offset: 0,
        },
    )
    .await;
    assert_eq!(next_error(&mut carol).await, (codes::NOT_FOUND, Some("r4".to_string())));
}

#[tokio::test]
async fn mark_read_notifies_both_participants_and_clears_unread() {
    let (url, _db) = start_server().await;
    let mut alice = login(&url, "alice").await;
    let mut bob = login(&url, "bob").await;

    send(&mut alice, private("bob", "leggimi", None)).await;
    let conversation_id = next_message(&mut bob).await.conversation_id;

    send(&mut bob, Envelope::GetConversations).await;
    match recv_until(&mut bob, |e| matches!(e, Envelope::Conversations { .. })).await {
        Envelope::Conversations { conversations } => {
            assert_eq!(conversations.len(), 1);
            assert_eq!(conversations[0].other_user_id, "alice");
            assert_eq!(conversations[0].unread, 1);
        }
        _ => unreachable!(),
    }

    send(&mut bob, Envelope::MarkRead { conversation_id }).await;
    let expected = Envelope::ReadStatus {
        conversation_id,
        reader_id: "bob".into(),
    };
    assert_eq!(recv_until(&mut alice, |e| matches!(e, Envelope::ReadStatus { .. })).await, expected);
    assert_eq!(recv_until(&mut bob, |e| matches!(e, Envelope::ReadStatus { .. })).await, expected);

    send(&mut bob, Envelope::GetConversations).await;
    match recv_until(&mut bob, |e| matches!(e, Envelope::Conversations { .. })).await {
        Envelope::Conversations { conversations } => assert_eq!(conversations[0].unread, 0),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn typing_is_forwarded_with_the_real_sender() {
    let (url, _db) = start_server().await;
    let mut alice = login(&url, "alice").await;
    let mut bob = login(&url, "bob").await;

    send(
        &mut alice,
        Envelope::Typing {
            sender_id: "mallory".into(),
            recipient_id: Some("bob".into()),
            conversation_id: None,
            action: TypingAction::Start,
        },
    )
    .await;
    match recv_until(&mut bob, |e| matches!(e, Envelope::Typing { .. })).await {
        Envelope::Typing { sender_id, action, .. } => {
            assert_eq!(sender_id, "alice");
            assert_eq!(action, TypingAction::Start);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn newer_login_replaces_the_old_connection() {
    let (url, _db) = start_server().await;
    let mut carol = login(&url, "carol").await;
    let mut first = login(&url, "alice").await;
    recv_until(&mut carol, |e| matches!(e, Envelope::UserStatus { .. })).await;

    let mut second = login(&url, "alice").await;
    assert_eq!(recv(&mut first).await, None);

    // no offline/online flap for the replaced connection
    send(&mut carol, Envelope::Ping).await;
    assert_eq!(recv(&mut carol).await, Some(Envelope::Pong));
    assert_eq!(online_users(&mut second).await, vec!["alice".to_string(), "carol".to_string()]);
}
