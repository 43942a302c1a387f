pub mod chat_service;
pub mod connection_manager;
pub mod message_sync;
pub mod notifications;
pub mod presence;
pub mod typing;
pub mod websocket_client;
