//! Track and queue snapshot types
//!
//! A [`Track`] is built by the caller, handed to the player once and consumed by the
//! copy loop. [`QueueSnapshot`] is the read-only view the control loop hands back.

use crate::audio::PcmStream;
use crate::error::SourceError;
use serenity::model::id::UserId;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Future returned by a [`StreamFactory`]
pub type PcmFuture = Pin<Box<dyn Future<Output = Result<PcmStream, SourceError>> + Send>>;

/// Lazily invoked producer of a PCM stream; receives the track's cancellation scope
pub type StreamFactory = Arc<dyn Fn(CancellationToken) -> PcmFuture + Send + Sync>;

/// Where a track's audio comes from
#[derive(Clone)]
pub enum TrackSource {
    /// Page URL resolved through the fetch stage (yt-dlp) before transcoding
    Url(String),
    /// Media URL ffmpeg can open directly
    DirectUrl(String),
    /// Local file
    File(PathBuf),
    /// Caller-provided PCM producer
    Factory(StreamFactory),
}

impl TrackSource {
    pub fn kind(&self) -> &'static str {
        match self {
            TrackSource::Url(_) => "url",
            TrackSource::DirectUrl(_) => "direct_url",
            TrackSource::File(_) => "file",
            TrackSource::Factory(_) => "factory",
        }
    }
}

impl fmt::Debug for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            TrackSource::DirectUrl(url) => f.debug_tuple("DirectUrl").field(url).finish(),
            TrackSource::File(path) => f.debug_tuple("File").field(path).finish(),
            TrackSource::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

/// One playable unit of queued work
#[derive(Debug, Clone)]
pub struct Track {
    pub title: String,
    pub source: TrackSource,
    pub duration: Option<Duration>,
    pub thumbnail_url: Option<String>,
    pub requested_by: Option<UserId>,
}

impl Track {
    pub fn new(title: impl Into<String>, source: TrackSource) -> Self {
        Self {
            title: title.into(),
            source,
            duration: None,
            thumbnail_url: None,
            requested_by: None,
        }
    }

    /// Track played through yt-dlp | ffmpeg
    pub fn url(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(title, TrackSource::Url(url.into()))
    }

    pub fn direct_url(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(title, TrackSource::DirectUrl(url.into()))
    }

    pub fn file(title: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(title, TrackSource::File(path.into()))
    }

    pub fn from_factory<F>(title: impl Into<String>, factory: F) -> Self
    where
        F: Fn(CancellationToken) -> PcmFuture + Send + Sync + 'static,
    {
        Self::new(title, TrackSource::Factory(Arc::new(factory)))
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_thumbnail(mut self, url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }

    pub fn requested_by(mut self, user: UserId) -> Self {
        self.requested_by = Some(user);
        self
    }
}

/// Read-only view of a guild's player
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub current: Option<Track>,
    /// Pending tracks in play order, current excluded
    pub upcoming: Vec<Track>,
    pub is_paused: bool,
    /// Linear gain in [0.0, 1.0]
    pub volume: f64,
    pub is_connected: bool,
    pub can_skip: bool,
}

impl QueueSnapshot {
    /// Snapshot reported for a guild without a player
    pub fn disconnected() -> Self {
        Self {
            current: None,
            upcoming: Vec::new(),
            is_paused: false,
            volume: 1.0,
            is_connected: false,
            can_skip: false,
        }
    }

    pub fn upcoming_titles(&self) -> Vec<&str> {
        self.upcoming.iter().map(|t| t.title.as_str()).collect()
    }
}
