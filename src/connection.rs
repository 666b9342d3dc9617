//! Voice connection contract consumed by the player
//!
//! The player writes raw PCM (s16le, 48kHz, stereo) and toggles the speaking state
//! around each track. Wire encoding is entirely the adapter's business.

use crate::error::ConnectionError;
use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// Writable PCM endpoint.
///
/// Shut down when a track plays to its end, so buffered audio still drains; dropped
/// without shutdown when the track is interrupted.
pub type PcmSink = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait ConnectionAdapter: Send + Sync {
    /// Open a PCM target for the next track
    async fn open_sink(&self, cancel: CancellationToken) -> Result<PcmSink, ConnectionError>;

    /// Announce that audio starts or stops flowing
    async fn signal_speaking(&self, active: bool) -> Result<(), ConnectionError>;

    /// True while the underlying voice connection is alive
    fn is_connected(&self) -> bool;

    /// Leave the destination and release the connection
    async fn disconnect(&self, cancel: CancellationToken) -> Result<(), ConnectionError>;
}
