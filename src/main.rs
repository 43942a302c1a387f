use forum_chat::client::{cli_client, config::ClientConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // load environment from .env (optional)
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    cli_client::run(ClientConfig::from_env()).await
}
