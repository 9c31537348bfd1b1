mod auth;
mod config;
mod context;
mod llm;
mod normalize;
mod prompt;
mod server;
mod tools;

use anyhow::Result;
use config::Config;
use llm::CompletionClient;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Load configuration; the logger comes up first so a bad file is reported
    let config = Config::load("config.toml");
    let level = config
        .as_ref()
        .map(|c| c.logging.level.as_str())
        .unwrap_or("info");

    // RUST_LOG wins over the configured level
    if std::env::var_os("RUST_LOG").is_some() {
        pretty_env_logger::init();
    } else {
        pretty_env_logger::formatted_builder()
            .parse_filters(level)
            .init();
    }
    let config = config.inspect_err(|e| log::error!("Failed to load configuration: {:#}", e))?;
    log::info!("Starting Studently API...");

    let client = CompletionClient::from_config(&config.ai_model);
    log::info!(
        "Completion backend: {:?} {} at {}",
        client.provider,
        client.model,
        client.endpoint
    );
    if config.auth.uses_default_secret() {
        log::warn!("Using the built-in JWT secret; set JWT_SECRET before exposing this server");
    }
    if config.ai_model.api_key.is_none() {
        log::warn!("No API key configured; requests to hosted providers will be rejected");
    }

    server::run_http_server(config, Arc::new(client)).await
}
