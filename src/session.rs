//! Session management for guild playback
//!
//! Keeps one [`PlaybackActor`] per guild and routes every operation to it

use crate::audio::AudioSourceResolver;
use crate::config::MediaConfig;
use crate::connection::ConnectionAdapter;
use crate::error::PlayerError;
use crate::events::{EventBus, PlayerEvent};
use crate::player::PlaybackActor;
use crate::track::{QueueSnapshot, Track};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Registry of live players keyed by guild
pub struct PlaybackSupervisor {
    /// Active players
    players: DashMap<GuildId, Arc<PlaybackActor>>,
    /// Shared source resolver
    resolver: Arc<AudioSourceResolver>,
    /// Notification hub for every player
    events: EventBus,
}

impl PlaybackSupervisor {
    /// Create an empty supervisor
    pub fn new(media: MediaConfig) -> Self {
        Self {
            players: DashMap::new(),
            resolver: Arc::new(AudioSourceResolver::new(media)),
            events: EventBus::new(),
        }
    }

    pub fn resolver(&self) -> &Arc<AudioSourceResolver> {
        &self.resolver
    }

    /// Receive notifications from every guild
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn contains(&self, guild_id: GuildId) -> bool {
        self.players.contains_key(&guild_id)
    }

    /// Guilds with a live player
    pub fn sessions(&self) -> Vec<GuildId> {
        self.players.iter().map(|r| *r.key()).collect()
    }

    /// Connect a guild's player to `channel_id`.
    ///
    /// The first join creates the player. `connect` produces the voice connection;
    /// returns whether the player ended up attached to a live connection. A failed
    /// first join discards the player unless another join reached it meanwhile.
    pub async fn join<F, Fut>(&self, guild_id: GuildId, channel_id: ChannelId, connect: F) -> bool
    where
        F: FnOnce(ChannelId) -> Fut,
        Fut: Future<Output = Result<Arc<dyn ConnectionAdapter>, PlayerError>>,
    {
        let (player, created) = match self.players.entry(guild_id) {
            Entry::Occupied(entry) => {
                entry.get().mark_shared();
                (entry.get().clone(), false)
            }
            Entry::Vacant(entry) => {
                let player = Arc::new(PlaybackActor::spawn(
                    guild_id,
                    self.resolver.clone(),
                    self.events.for_guild(guild_id),
                ));
                entry.insert(player.clone());
                (player, true)
            }
        };

        let attached = match connect(channel_id).await {
            Ok(connection) => match player.attach(connection).await {
                Ok(connected) => connected,
                Err(e) => {
                    warn!("[{}] Failed to attach connection: {}", guild_id, e);
                    false
                }
            },
            Err(e) => {
                warn!("[{}] Failed to connect to {}: {}", guild_id, channel_id, e);
                false
            }
        };

        if attached {
            info!("[{}] Joined channel {}", guild_id, channel_id);
        } else if created {
            // Marking and removal both hold the entry's shard lock
            let discarded = self
                .players
                .remove_if(&guild_id, |_, p| Arc::ptr_eq(p, &player) && !p.is_shared())
                .is_some();
            if discarded {
                player.shutdown().await;
                debug!("[{}] Discarded player after failed join", guild_id);
            } else {
                debug!("[{}] Failed join left the player to a concurrent join", guild_id);
            }
        }

        attached
    }

    /// Dispose a guild's player; false if there was none
    pub async fn leave(&self, guild_id: GuildId) -> bool {
        let Some((_, player)) = self.players.remove(&guild_id) else {
            return false;
        };

        player.shutdown().await;
        self.events.for_guild(guild_id).disconnected();
        info!("[{}] Left voice", guild_id);
        true
    }

    /// Dispose every player
    pub async fn shutdown(&self) {
        let guilds = self.sessions();
        info!("Shutting down {} player(s)", guilds.len());
        for guild_id in guilds {
            self.leave(guild_id).await;
        }
    }

    fn player(&self, guild_id: GuildId) -> Result<Arc<PlaybackActor>, PlayerError> {
        self.players
            .get(&guild_id)
            .map(|r| r.value().clone())
            .ok_or(PlayerError::NotConnected)
    }

    pub async fn enqueue(&self, guild_id: GuildId, track: Track) -> Result<(), PlayerError> {
        self.player(guild_id)?.enqueue(track).await
    }

    pub async fn play_now(&self, guild_id: GuildId, track: Track) -> Result<bool, PlayerError> {
        self.player(guild_id)?.play_now(track).await
    }

    pub async fn skip(&self, guild_id: GuildId) -> Result<bool, PlayerError> {
        self.player(guild_id)?.skip().await
    }

    pub async fn stop(&self, guild_id: GuildId) -> Result<bool, PlayerError> {
        self.player(guild_id)?.stop().await
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<bool, PlayerError> {
        self.player(guild_id)?.pause().await
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<bool, PlayerError> {
        self.player(guild_id)?.resume().await
    }

    pub async fn seek(&self, guild_id: GuildId, position: Duration) -> Result<bool, PlayerError> {
        self.player(guild_id)?.seek(position).await
    }

    pub async fn set_volume(&self, guild_id: GuildId, volume: f64) -> Result<bool, PlayerError> {
        self.player(guild_id)?.set_volume(volume).await
    }

    pub async fn position(&self, guild_id: GuildId) -> Result<Option<Duration>, PlayerError> {
        self.player(guild_id)?.position().await
    }

    /// Queue view; guilds without a player get the disconnected default
    pub async fn snapshot(&self, guild_id: GuildId) -> QueueSnapshot {
        let Ok(player) = self.player(guild_id) else {
            return QueueSnapshot::disconnected();
        };

        match player.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!("[{}] Snapshot unavailable: {}", guild_id, e);
                QueueSnapshot::disconnected()
            }
        }
    }
}
