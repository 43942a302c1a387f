use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use log::info;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::client::config::ClientConfig;
use crate::client::models::app_state::DeliveryState;
use crate::client::models::messages::{ClientEvent, Command};
use crate::client::services::chat_service::ChatService;
use crate::client::services::notifications::{LogNotifier, TerminalBell};
use crate::client::services::websocket_client::WebSocketConnector;

const HELP: &str = "Comandi: /open <utente> [id_conversazione], /send <testo> (o testo semplice), \
/older, /retry <local_id>, /online, /view <id_notifica>, /conversations, /hide, /show, /quit";

fn render(event: &ClientEvent) -> Option<String> {
    let line = match event {
        ClientEvent::ConnectionStateChanged(state) => format!("[CLIENT] Stato connessione: {:?}", state),
        ClientEvent::Authenticated { user_id } => format!("[CLIENT] Autenticato come {}", user_id),
        ClientEvent::ReconnectScheduled { attempt, delay, .. } => {
            format!("[CLIENT] Riconnessione #{} tra {:?}", attempt, delay)
        }
        ClientEvent::ConnectionFailed { attempts } => {
            format!("[CLIENT] Connessione persa dopo {} tentativi. Usa /reconnect", attempts)
        }
        ClientEvent::ConversationOpened { key, recipient_id } => {
            format!("[CLIENT] Conversazione {} con {}", key, recipient_id)
        }
        ClientEvent::ComposeEnabled { enabled: false } => "[CLIENT] Destinatario offline, invio disabilitato".to_string(),
        ClientEvent::MessagesChanged { key, messages } => {
            let mut out = format!("--- {} ---", key);
            for m in messages {
                let mark = match m.delivery {
                    DeliveryState::Pending => "…",
                    DeliveryState::Sent => "✓",
                    DeliveryState::Read => "✓✓",
                    DeliveryState::Error => "✗",
                };
                out.push_str(&format!(
                    "\n[{}] {}: {} {} ({})",
                    m.sent_at.format("%H:%M:%S"),
                    m.sender_id,
                    m.content,
                    mark,
                    m.local_id
                ));
            }
            out
        }
        ClientEvent::HistoryExhausted { key } => format!("[CLIENT] Inizio della conversazione {}", key),
        ClientEvent::SubmitRejected(e) => format!("[CLIENT] Messaggio non inviato: {}", e),
        ClientEvent::DeliveryFailed { local_id, .. } => {
            format!("[CLIENT] Consegna non confermata, /retry {}", local_id)
        }
        ClientEvent::TypingIndicator { user_id, typing: true, .. } => format!("[CLIENT] {} sta scrivendo...", user_id),
        ClientEvent::UnreadChanged { key, unread } if *unread > 0 => format!("[CLIENT] {} non letti in {}", unread, key),
        ClientEvent::Notified(n) => format!("[NOTIFICA #{}] {} {}", n.id, n.title, n.body),
        ClientEvent::ServerError { code, content } => format!("[SERVER][ERROR] {} {}", code, content),
        _ => return None,
    };
    Some(line)
}

pub async fn run(config: ClientConfig) -> anyhow::Result<()> {
    config.validate()?;
    let token = match std::env::args().nth(1) {
        Some(token) => token,
        None => config
            .session_token
            .clone()
            .context("nessun token di sessione: passalo come argomento o in SESSION_TOKEN")?,
    };

    let connector = Arc::new(WebSocketConnector::new(config.websocket_url.clone(), config.auth_timeout));
    let sound = TerminalBell { asset_dir: PathBuf::from(".") };
    let mut service = ChatService::spawn(&config, connector, Box::new(LogNotifier), Box::new(sound));
    let mut events = service.take_event_rx().context("event stream already taken")?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = render(&event) {
                println!("{}", line);
            }
        }
    });

    println!("[CLIENT] Benvenuto! {}", HELP);
    service.connect(token.clone());

    let mut input = BufReader::new(stdin()).lines();
    while let Some(line) = input.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ' ');
        let command = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();
        match command {
            "/quit" => break,
            "/help" => println!("{}", HELP),
            "/open" => {
                let mut args = rest.split_whitespace();
                match args.next() {
                    Some(user) => {
                        let conversation_id = args.next().and_then(|id| id.parse().ok());
                        service.open_conversation(user, conversation_id);
                    }
                    None => println!("[CLIENT] Uso: /open <utente> [id_conversazione]"),
                }
            }
            "/send" => {
                service.compose(rest);
                service.submit(rest);
            }
            "/older" => {
                service.scrolled(0.0);
            }
            "/retry" => match Uuid::parse_str(rest) {
                Ok(local_id) => {
                    service.retry(local_id);
                }
                Err(_) => println!("[CLIENT] Id messaggio non valido"),
            },
            "/online" => println!("[CLIENT] Online: {}", service.online_users().join(", ")),
            "/view" => match rest.parse() {
                Ok(id) => {
                    service.activate_notification(id);
                }
                Err(_) => println!("[CLIENT] Uso: /view <id_notifica>"),
            },
            "/conversations" => {
                service.send(Command::RefreshConversations);
            }
            "/hide" => {
                service.set_visible(false);
            }
            "/show" => {
                service.set_visible(true);
            }
            "/reconnect" => {
                service.connect(token.clone());
            }
            _ if command.starts_with('/') => println!("[CLIENT] Comando sconosciuto. {}", HELP),
            _ => {
                service.compose(line);
                service.submit(line);
            }
        }
    }

    info!("[CLIENT] Disconnessione e uscita");
    service.disconnect();
    service.shutdown().await;
    Ok(())
}
