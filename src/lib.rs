//! Per-guild Discord voice playback
//!
//! A [`PlaybackSupervisor`] owns one actor per guild. Each actor streams queued tracks
//! through a yt-dlp/ffmpeg pipeline into the guild's voice connection.

pub mod audio;
pub mod bot;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod player;
pub mod session;
pub mod track;
pub mod voice;

#[cfg(test)]
mod testing;

pub use config::{Config, MediaConfig};
pub use connection::{ConnectionAdapter, PcmSink};
pub use error::{ConnectionError, PlayerError, SourceError};
pub use events::{EventBus, PlayerEvent};
pub use player::PlaybackActor;
pub use session::PlaybackSupervisor;
pub use track::{QueueSnapshot, Track, TrackSource};
