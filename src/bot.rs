//! Discord client runtime and voice state handling

use crate::config::Config;
use crate::events::PlayerEvent;
use crate::session::PlaybackSupervisor;
use crate::voice;
use serenity::all::{ChannelId, Client, Context, EventHandler, GatewayIntents, GuildId, Ready, VoiceState};
use serenity::async_trait;
use songbird::SerenityInit;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Bot state shared across handlers
pub struct BotState {
    pub config: Arc<Config>,
    pub supervisor: Arc<PlaybackSupervisor>,
}

/// Main event handler for the bot
pub struct Handler {
    pub state: Arc<BotState>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("Logged in as {}", ready.user.name);
    }

    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        if new.user_id != ctx.cache.current_user().id || new.channel_id.is_some() {
            return;
        }

        // We were disconnected from voice (kicked or channel deleted)
        if let Some(guild_id) = new.guild_id {
            if self.state.supervisor.leave(guild_id).await {
                info!("[{}] Player removed after voice disconnect", guild_id);
            }
        }
    }
}

/// Join `channel_id` through songbird and attach it to the guild's player
pub async fn join_voice(
    ctx: &Context,
    supervisor: &PlaybackSupervisor,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> bool {
    let Some(manager) = songbird::get(ctx).await else {
        error!("Songbird not registered");
        return false;
    };

    supervisor
        .join(guild_id, channel_id, |channel_id| {
            voice::connect_voice(manager, guild_id, channel_id)
        })
        .await
}

/// Log every player notification
fn spawn_event_logger(mut rx: broadcast::Receiver<PlayerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(PlayerEvent::TrackStarted { guild_id, track }) => {
                    info!("[{}] Now playing: {}", guild_id, track.title)
                }
                Ok(PlayerEvent::TrackEnded { guild_id, track }) => {
                    info!("[{}] Finished: {}", guild_id, track.title)
                }
                Ok(PlayerEvent::QueueEmpty { guild_id }) => info!("[{}] Queue empty", guild_id),
                Ok(PlayerEvent::PlaybackError { guild_id, error }) => {
                    warn!("[{}] Playback error: {}", guild_id, error)
                }
                Ok(PlayerEvent::Disconnected { guild_id }) => {
                    info!("[{}] Disconnected", guild_id)
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event logger lagged, skipped {} events", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Create and run the Discord bot
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(config);

    // Create playback supervisor
    let supervisor = Arc::new(PlaybackSupervisor::new(config.media.clone()));
    let logger = spawn_event_logger(supervisor.subscribe());

    // Create bot state
    let state = Arc::new(BotState {
        config: config.clone(),
        supervisor: supervisor.clone(),
    });

    // Create handler
    let handler = Handler {
        state: state.clone(),
    };

    // Create client with voice support
    let intents = GatewayIntents::non_privileged() | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird()
        .await?;

    // Store state in client data
    {
        let mut data = client.data.write().await;
        data.insert::<BotStateKey>(state);
    }

    // Start the client
    info!("Starting bot...");
    let result = tokio::select! {
        result = client.start() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    client.shard_manager.shutdown_all().await;
    supervisor.shutdown().await;
    logger.abort();

    result?;
    Ok(())
}

/// Type key for storing BotState in client data
pub struct BotStateKey;

impl serenity::prelude::TypeMapKey for BotStateKey {
    type Value = Arc<BotState>;
}
