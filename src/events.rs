//! Player notifications
//!
//! Every player publishes into one broadcast channel owned by the supervisor. Sending
//! never blocks playback; a lagging subscriber only loses its own backlog.

use crate::error::PlayerError;
use crate::track::Track;
use serenity::model::id::GuildId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum PlayerEvent {
    TrackStarted { guild_id: GuildId, track: Track },
    TrackEnded { guild_id: GuildId, track: Track },
    QueueEmpty { guild_id: GuildId },
    PlaybackError { guild_id: GuildId, error: Arc<PlayerError> },
    Disconnected { guild_id: GuildId },
}

impl PlayerEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            PlayerEvent::TrackStarted { guild_id, .. }
            | PlayerEvent::TrackEnded { guild_id, .. }
            | PlayerEvent::QueueEmpty { guild_id }
            | PlayerEvent::PlaybackError { guild_id, .. }
            | PlayerEvent::Disconnected { guild_id } => *guild_id,
        }
    }
}

/// Broadcast hub shared by all players
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PlayerEvent) {
        // No subscribers is not an error
        if self.tx.send(event).is_err() {
            trace!("Dropped player event without subscribers");
        }
    }

    /// Emitter bound to one guild
    pub fn for_guild(&self, guild_id: GuildId) -> GuildEvents {
        GuildEvents {
            guild_id,
            bus: self.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct GuildEvents {
    guild_id: GuildId,
    bus: EventBus,
}

impl GuildEvents {
    pub fn track_started(&self, track: &Track) {
        self.bus.emit(PlayerEvent::TrackStarted {
            guild_id: self.guild_id,
            track: track.clone(),
        });
    }

    pub fn track_ended(&self, track: Track) {
        self.bus.emit(PlayerEvent::TrackEnded {
            guild_id: self.guild_id,
            track,
        });
    }

    pub fn queue_empty(&self) {
        self.bus.emit(PlayerEvent::QueueEmpty {
            guild_id: self.guild_id,
        });
    }

    pub fn playback_error(&self, error: PlayerError) {
        self.bus.emit(PlayerEvent::PlaybackError {
            guild_id: self.guild_id,
            error: Arc::new(error),
        });
    }

    pub fn disconnected(&self) {
        self.bus.emit(PlayerEvent::Disconnected {
            guild_id: self.guild_id,
        });
    }
}
