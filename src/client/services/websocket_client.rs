// Trasporto WebSocket: un tentativo di connessione autenticata per chiamata, il retry lo decide il ConnectionMachine
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;

use crate::client::services::connection_manager::ConnectFailure;
use crate::common::protocol::{Envelope, UserId};

#[derive(Debug, Clone, Error)]
pub enum WebSocketError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Message send failed: {0}")]
    MessageSendFailed(String),
    #[error("Disconnected by server")]
    Disconnected,
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Operation timed out")]
    Timeout,
}

impl WebSocketError {
    /// Only a refused/unroutable socket is known not to be an auth problem.
    pub fn failure(&self) -> ConnectFailure {
        match self {
            WebSocketError::ConnectionFailed(_) => ConnectFailure::Unreachable,
            _ => ConnectFailure::Rejected,
        }
    }
}

/// What the engine pushes down a live channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Send(Envelope),
    Close,
}

/// What a live channel reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(Envelope),
    /// Undecodable frame, dropped after logging.
    Invalid(String),
    /// Terminal. `code` is None when the socket died without a close frame.
    Closed { code: Option<u16> },
}

/// An authenticated connection.
#[derive(Debug)]
pub struct Channel {
    pub user_id: UserId,
    pub outgoing: mpsc::UnboundedSender<Outbound>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, token: &str) -> Result<Channel, WebSocketError>;
}

pub struct WebSocketConnector {
    url: String,
    auth_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, auth_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            auth_timeout,
        }
    }
}

fn classify(e: tungstenite::Error) -> WebSocketError {
    match e {
        tungstenite::Error::Io(io) => WebSocketError::ConnectionFailed(io.to_string()),
        tungstenite::Error::Url(url) => WebSocketError::ConnectionFailed(url.to_string()),
        other => WebSocketError::Handshake(other.to_string()),
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, token: &str) -> Result<Channel, WebSocketError> {
        info!("[WS:CLIENT] Connecting to {}", self.url);
        let (ws_stream, _) = connect_async(self.url.as_str()).await.map_err(|e| {
            warn!("[WS:CLIENT] Connection failed: {}", e);
            classify(e)
        })?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let auth = Envelope::Auth { token: token.to_string() }
            .encode()
            .map_err(|e| WebSocketError::AuthenticationFailed(e.to_string()))?;
        ws_sender
            .send(Message::Text(auth))
            .await
            .map_err(|e| WebSocketError::MessageSendFailed(format!("Failed to send auth message: {}", e)))?;

        debug!("[WS:CLIENT] Waiting for authentication response");
        let reply = match tokio::time::timeout(self.auth_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => Envelope::decode(&text)
                .map_err(|e| WebSocketError::InvalidMessage(format!("Invalid auth response: {}", e)))?,
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Err(WebSocketError::Disconnected),
            Ok(Some(Ok(_))) => {
                return Err(WebSocketError::InvalidMessage(
                    "Unexpected message type during auth".to_string(),
                ))
            }
            Ok(Some(Err(e))) => {
                return Err(WebSocketError::AuthenticationFailed(format!("WebSocket error during auth: {}", e)))
            }
            Err(_) => return Err(WebSocketError::Timeout),
        };

        let user_id = match reply {
            Envelope::AuthResponse { success: true, user_id: Some(user_id), .. } => user_id,
            Envelope::AuthResponse { error, .. } => {
                let reason = error.unwrap_or_else(|| "Unknown authentication error".to_string());
                warn!("[WS:CLIENT] Authentication failed: {}", reason);
                return Err(WebSocketError::AuthenticationFailed(reason));
            }
            other => {
                return Err(WebSocketError::InvalidMessage(format!(
                    "Expected auth_response, got {}",
                    other.kind()
                )))
            }
        };
        info!("[WS:CLIENT] Authenticated as {}", user_id);

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Outbound>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            while let Some(outbound) = outgoing_rx.recv().await {
                match outbound {
                    Outbound::Send(envelope) => match envelope.encode() {
                        Ok(json) => {
                            if let Err(e) = ws_sender.send(Message::Text(json)).await {
                                warn!("[WS:CLIENT] Failed to send {}: {}", envelope.kind(), e);
                                break;
                            }
                        }
                        Err(e) => warn!("[WS:CLIENT] {}", e),
                    },
                    Outbound::Close => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client closing".into(),
                        };
                        let _ = ws_sender.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
            let _ = ws_sender.close().await;
            debug!("[WS:CLIENT] Outgoing handler ended");
        });

        tokio::spawn(async move {
            let mut code = None;
            while let Some(frame) = ws_receiver.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => match Envelope::decode(&text) {
                        Ok(envelope) => TransportEvent::Frame(envelope),
                        Err(e) => {
                            warn!("[WS:CLIENT] Dropping frame: {}", e);
                            TransportEvent::Invalid(e.to_string())
                        }
                    },
                    Ok(Message::Close(close)) => {
                        code = close.map(|f| u16::from(f.code));
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("[WS:CLIENT] Receive error: {}", e);
                        break;
                    }
                };
                if incoming_tx.send(event).is_err() {
                    return;
                }
            }
            info!("[WS:CLIENT] Connection closed (code {:?})", code);
            let _ = incoming_tx.send(TransportEvent::Closed { code });
        });

        Ok(Channel {
            user_id,
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_socket_errors_count_as_unreachable() {
        assert_eq!(WebSocketError::ConnectionFailed("refused".into()).failure(), ConnectFailure::Unreachable);
        assert_eq!(WebSocketError::AuthenticationFailed("bad token".into()).failure(), ConnectFailure::Rejected);
        assert_eq!(WebSocketError::Disconnected.failure(), ConnectFailure::Rejected);
        assert_eq!(WebSocketError::Timeout.failure(), ConnectFailure::Rejected);
    }

    #[tokio::test]
    async fn refused_port_is_a_connection_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = WebSocketConnector::new(format!("ws://127.0.0.1:{}", port), Duration::from_secs(1));
        let err = connector.open("token").await.unwrap_err();
        assert!(matches!(err, WebSocketError::ConnectionFailed(_)), "got {err:?}");
    }
}
