pub mod auth;
pub mod config;
pub mod database;
pub mod messages;
pub mod presence;
pub mod websocket;
