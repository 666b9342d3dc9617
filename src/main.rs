//! voice_player - Discord voice playback bot
//!
//! Keeps one player per guild and streams queued media into voice channels.

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_player::{bot, Config};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,voice_player=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("voice_player starting...");

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Please ensure DISCORD_TOKEN is set in .env file");
            std::process::exit(1);
        }
    };

    info!("Configuration loaded successfully");
    info!(
        "Pipeline: grace {:?}, chunk {} bytes, connect poll {:?}",
        config.media.grace_period, config.media.chunk_size, config.media.connect_poll
    );

    // Run the bot
    if let Err(e) = bot::run(config).await {
        error!("Bot error: {}", e);
        std::process::exit(1);
    }
}
