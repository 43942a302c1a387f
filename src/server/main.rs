// src/server/main.rs
// Entry point per il server forum_chat
use std::sync::Arc;
use std::time::Duration;

use forum_chat::server::websocket::{serve, ChatWebSocketManager};
use forum_chat::server::{auth, config::ServerConfig, database::Database};
use log::{error, info};
use tokio::net::TcpListener;

const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Configura logging
    std::env::set_var("RUST_LOG", &config.log_level); //setto env var per usare log::info
    env_logger::init();

    let database = Arc::new(Database::connect(&config.database_url).await?);

    // Run database migrations to create tables if they don't exist
    info!("🗄️ Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;
    info!("✅ Database migrations completed successfully");

    let cleanup_db = database.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            auth::cleanup_expired_sessions(cleanup_db.clone()).await;
        }
    });

    let listener = TcpListener::bind(config.bind_addr()).await?;
    let manager = Arc::new(ChatWebSocketManager::new(database, config));

    tokio::select! {
        result = serve(listener, manager) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
