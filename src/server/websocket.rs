use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::common::protocol::{codes, ConversationId, Envelope, OnlineUsersContent, TypingAction, UserId};
use crate::server::auth::{mask_token, validate_session};
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::messages::{self, ConversationAccess};
use crate::server::presence::{ClientId, ConnectionHandle, PresenceRegistry};

type Outgoing = mpsc::UnboundedSender<Message>;

fn reply(tx: &Outgoing, envelope: &Envelope) {
    match envelope.encode() {
        Ok(text) => {
            let _ = tx.send(Message::Text(text));
        }
        Err(e) => warn!("[WS:SEND] Could not encode {}: {}", envelope.kind(), e),
    }
}

fn auth_failure(error: impl Into<String>) -> Envelope {
    Envelope::AuthResponse {
        success: false,
        user_id: None,
        error: Some(error.into()),
    }
}

/// Maps an access check onto the error a request should get, if any.
fn access_error(access: &ConversationAccess) -> Option<(u16, &'static str)> {
    match access {
        ConversationAccess::Participant { .. } => None,
        ConversationAccess::NotParticipant => Some((codes::FORBIDDEN, "Not a participant of this conversation")),
        ConversationAccess::NotFound => Some((codes::NOT_FOUND, "Conversation not found")),
    }
}

pub struct ChatWebSocketManager {
    presence: PresenceRegistry,
    db: Arc<Database>,
    config: ServerConfig,
}

impl ChatWebSocketManager {
    pub fn new(db: Arc<Database>, config: ServerConfig) -> Self {
        Self {
            presence: PresenceRegistry::new(),
            db,
            config,
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        debug!("[WS:CONN] Handshake completed with {}", peer);
        self.handle_authenticated_connection(ws_stream).await
    }

    /// First frame must be `auth`; anything else (or silence) ends the connection.
    pub async fn handle_authenticated_connection(&self, ws_stream: WebSocketStream<TcpStream>) -> anyhow::Result<()> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        debug!("[WS:AUTH] Waiting for authentication from client...");
        let first = tokio::time::timeout(self.config.auth_timeout, ws_receiver.next()).await;

        let outcome: Result<UserId, String> = match first {
            Ok(Some(Ok(Message::Text(text)))) => match Envelope::decode(&text) {
                Ok(Envelope::Auth { token }) => match validate_session(self.db.clone(), &token).await {
                    Some(user_id) => Ok(user_id),
                    None => {
                        info!("[WS:AUTH] Authentication failed for token: {}", mask_token(&token));
                        Err("Invalid or expired session token".to_string())
                    }
                },
                Ok(other) => Err(format!("Expected 'auth', got '{}'", other.kind())),
                Err(e) => Err(format!("Invalid auth message: {}", e)),
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                debug!("[WS:AUTH] Client closed connection during auth");
                return Ok(());
            }
            Ok(Some(Ok(_))) => Err("Expected text message for authentication".to_string()),
            Ok(Some(Err(e))) => {
                warn!("[WS:AUTH] WebSocket error during auth: {}", e);
                return Ok(());
            }
            Err(_) => {
                info!("[WS:AUTH] Authentication timeout");
                Err("Authentication timeout".to_string())
            }
        };

        let user_id = match outcome {
            Ok(user_id) => user_id,
            Err(reason) => {
                if let Ok(text) = auth_failure(reason.clone()).encode() {
                    let _ = ws_sender.send(Message::Text(text)).await;
                }
                let _ = ws_sender
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: "authentication failed".into(),
                    })))
                    .await;
                anyhow::bail!("authentication failed: {}", reason);
            }
        };

        let success = Envelope::AuthResponse {
            success: true,
            user_id: Some(user_id.clone()),
            error: None,
        };
        ws_sender.send(Message::Text(success.encode()?)).await?;
        info!("[WS:AUTH] Authentication successful for user: {}", user_id);

        let client_id: ClientId = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.presence
            .register(
                &user_id,
                ConnectionHandle {
                    client_id: client_id.clone(),
                    sender: tx.clone(),
                },
            )
            .await;

        // Task per inviare messaggi al client
        let mut send_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_sender.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        // Ricezione inline: finisce alla chiusura del client
        let receive = async {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => match Envelope::decode(&text) {
                        Ok(envelope) => self.dispatch(&user_id, &tx, envelope).await,
                        Err(e) => {
                            debug!("[WS:RECV] Bad frame from {}: {}", user_id, e);
                            reply(&tx, &Envelope::error(codes::BAD_REQUEST, e.to_string()));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("[WS:RECV] Receive error for {}: {}", user_id, e);
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = &mut send_task => debug!("[WS:CLIENT] Send side of {} ended", client_id),
            _ = receive => debug!("[WS:CLIENT] Receive side of {} ended", client_id),
        }
        send_task.abort();

        self.presence.unregister(&user_id, &client_id).await;
        info!("[WS:CLIENT] Connection {} for {} closed", client_id, user_id);
        Ok(())
    }

    async fn dispatch(&self, user_id: &str, tx: &Outgoing, envelope: Envelope) {
        match envelope {
            Envelope::Private {
                recipient_id,
                content,
                conversation_id,
                ..
            } => self.handle_private(user_id, tx, recipient_id, content, conversation_id).await,
            Envelope::Typing {
                recipient_id,
                conversation_id,
                action,
                ..
            } => self.handle_typing(user_id, tx, recipient_id, conversation_id, action).await,
            Envelope::MarkRead { conversation_id } => self.handle_mark_read(user_id, tx, conversation_id).await,
            Envelope::GetHistory {
                request_id,
                conversation_id,
                limit,
                offset,
            } => self.handle_history(user_id, tx, request_id, conversation_id, limit, offset).await,
            Envelope::GetConversations => match messages::list_conversations(self.db.clone(), user_id).await {
                Ok(conversations) => reply(tx, &Envelope::Conversations { conversations }),
                Err(e) => {
                    error!("[WS:DB] Listing conversations for {} failed: {}", user_id, e);
                    reply(tx, &Envelope::error(codes::STORAGE, "Could not load conversations"));
                }
            },
            Envelope::GetOnlineUsers => {
                let users = self.presence.online_users().await;
                reply(tx, &Envelope::OnlineUsers {
                    content: OnlineUsersContent { users },
                });
            }
            Envelope::Ping => reply(tx, &Envelope::Pong),
            Envelope::Pong => {}
            Envelope::Auth { .. } => reply(tx, &Envelope::error(codes::BAD_REQUEST, "Already authenticated")),
            other => reply(
                tx,
                &Envelope::error(codes::BAD_REQUEST, format!("Unsupported message type '{}'", other.kind())),
            ),
        }
    }

    async fn handle_private(
        &self,
        sender_id: &str,
        tx: &Outgoing,
        recipient_id: UserId,
        content: String,
        conversation_id: Option<ConversationId>,
    ) {
        if content.trim().is_empty() {
            return reply(tx, &Envelope::error(codes::BAD_REQUEST, "Message content is empty"));
        }
        if recipient_id.is_empty() || recipient_id == sender_id {
            return reply(tx, &Envelope::error(codes::BAD_REQUEST, "Invalid recipient"));
        }
        if content.chars().count() > self.config.max_message_length {
            return reply(
                tx,
                &Envelope::error(
                    codes::TOO_LONG,
                    format!("Message exceeds {} characters", self.config.max_message_length),
                ),
            );
        }
        if !self.presence.is_online(&recipient_id).await {
            debug!("[WS:RECV] {} tried to message offline user {}", sender_id, recipient_id);
            return reply(tx, &Envelope::error(codes::RECIPIENT_OFFLINE, "Recipient is offline"));
        }

        let resolved = match conversation_id {
            Some(id) => match messages::conversation_access(self.db.clone(), id, sender_id).await {
                Ok(ConversationAccess::Participant { other }) if other == recipient_id => Ok((id, false)),
                Ok(ConversationAccess::Participant { .. }) => {
                    return reply(
                        tx,
                        &Envelope::error(codes::FORBIDDEN, "Recipient is not part of this conversation"),
                    )
                }
                Ok(access) => {
                    if let Some((code, text)) = access_error(&access) {
                        reply(tx, &Envelope::error(code, text));
                    }
                    return;
                }
                Err(e) => Err(e),
            },
            None => messages::find_or_create_conversation(self.db.clone(), sender_id, &recipient_id).await,
        };

        let (conversation_id, created) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("[WS:DB] Resolving conversation {} -> {} failed: {}", sender_id, recipient_id, e);
                return reply(tx, &Envelope::error(codes::STORAGE, "Could not store message"));
            }
        };

        let stored = match messages::store_message(self.db.clone(), conversation_id, sender_id, &recipient_id, &content).await {
            Ok(stored) => stored,
            Err(e) => {
                error!("[WS:DB] Storing message in conversation {} failed: {}", conversation_id, e);
                return reply(tx, &Envelope::error(codes::STORAGE, "Could not store message"));
            }
        };
        debug!("[WS:DB] Stored message {} in conversation {}", stored.id, conversation_id);

        if created {
            self.presence
                .send_to(
                    &recipient_id,
                    &Envelope::NewConversation {
                        conversation_id,
                        sender_id: sender_id.to_string(),
                    },
                )
                .await;
        }

        let delivery = Envelope::Message(stored.to_wire());
        if !self.presence.send_to(&recipient_id, &delivery).await {
            info!("[WS:SEND] {} went offline before delivery of message {}", recipient_id, stored.id);
        }
        // echo al mittente: conferma l'invio ottimistico
        reply(tx, &delivery);
    }

    async fn handle_typing(
        &self,
        sender_id: &str,
        tx: &Outgoing,
        recipient_id: Option<UserId>,
        conversation_id: Option<ConversationId>,
        action: TypingAction,
    ) {
        let target = match (recipient_id, conversation_id) {
            (Some(recipient), _) => recipient,
            (None, Some(id)) => match messages::conversation_access(self.db.clone(), id, sender_id).await {
                Ok(ConversationAccess::Participant { other }) => other,
                Ok(access) => {
                    if let Some((code, text)) = access_error(&access) {
                        reply(tx, &Envelope::error(code, text));
                    }
                    return;
                }
                Err(e) => {
                    warn!("[TYPING] Lookup of conversation {} failed: {}", id, e);
                    return;
                }
            },
            (None, None) => {
                return reply(tx, &Envelope::error(codes::BAD_REQUEST, "Typing needs a recipient or a conversation"))
            }
        };
        if target == sender_id {
            return;
        }
        let forwarded = Envelope::Typing {
            sender_id: sender_id.to_string(),
            recipient_id: Some(target.clone()),
            conversation_id,
            action,
        };
        self.presence.send_to(&target, &forwarded).await;
    }

    async fn handle_mark_read(&self, reader_id: &str, tx: &Outgoing, conversation_id: ConversationId) {
        let other = match messages::conversation_access(self.db.clone(), conversation_id, reader_id).await {
            Ok(ConversationAccess::Participant { other }) => other,
            Ok(access) => {
                if let Some((code, text)) = access_error(&access) {
                    reply(tx, &Envelope::error(code, text));
                }
                return;
            }
            Err(e) => {
                error!("[WS:DB] Access check for conversation {} failed: {}", conversation_id, e);
                return reply(tx, &Envelope::error(codes::STORAGE, "Could not mark conversation as read"));
            }
        };
        match messages::mark_read(self.db.clone(), conversation_id, reader_id).await {
            Ok(updated) => {
                debug!("[WS:DB] {} read {} messages in {}", reader_id, updated, conversation_id);
                let status = Envelope::ReadStatus {
                    conversation_id,
                    reader_id: reader_id.to_string(),
                };
                self.presence.send_to(&other, &status).await;
                reply(tx, &status);
            }
            Err(e) => {
                error!("[WS:DB] mark_read on {} failed: {}", conversation_id, e);
                reply(tx, &Envelope::error(codes::STORAGE, "Could not mark conversation as read"));
            }
        }
    }

    async fn handle_history(
        &self,
        user_id: &str,
        tx: &Outgoing,
        request_id: String,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    ) {
        match messages::conversation_access(self.db.clone(), conversation_id, user_id).await {
            Ok(access) => {
                if let Some((code, text)) = access_error(&access) {
                    return reply(tx, &Envelope::request_error(&request_id, code, text));
                }
            }
            Err(e) => {
                error!("[WS:DB] Access check for conversation {} failed: {}", conversation_id, e);
                return reply(tx, &Envelope::request_error(&request_id, codes::STORAGE, "Could not load history"));
            }
        }
        match messages::history_page(self.db.clone(), conversation_id, limit, offset).await {
            Ok(page) => reply(
                tx,
                &Envelope::History {
                    request_id,
                    conversation_id,
                    offset,
                    messages: page.iter().map(|m| m.to_wire()).collect(),
                },
            ),
            Err(e) => {
                error!("[WS:DB] History of {} failed: {}", conversation_id, e);
                reply(tx, &Envelope::request_error(&request_id, codes::STORAGE, "Could not load history"));
            }
        }
    }
}

/// Accept loop: one task per connection.
pub async fn serve(listener: TcpListener, manager: Arc<ChatWebSocketManager>) -> anyhow::Result<()> {
    info!("WebSocket server listening on {}", listener.local_addr()?);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("[WS:CONN] New connection from {}", peer);
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.handle_connection(stream, peer).await {
                        info!("[WS:CONN] Connection from {} ended with error: {}", peer, e);
                    }
                });
            }
            Err(e) => warn!("[WS:CONN] Accept failed: {}", e),
        }
    }
}
