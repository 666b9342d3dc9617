//! Test doubles shared by the player and supervisor tests

use crate::audio::PcmStream;
use crate::connection::{ConnectionAdapter, PcmSink};
use crate::error::{ConnectionError, SourceError};
use crate::events::PlayerEvent;
use crate::track::Track;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::broadcast;
use tokio::time::{timeout, Interval};
use tokio_util::sync::CancellationToken;

/// 20 ms of 48 kHz stereo s16le
pub const FRAME_BYTES: usize = 3840;
pub const FRAME_PERIOD: Duration = Duration::from_millis(20);

/// In-memory connection recording everything the player does to it
#[derive(Default)]
pub struct MockConnection {
    connected: AtomicBool,
    pub written: Arc<Mutex<Vec<u8>>>,
    pub speaking: Mutex<Vec<bool>>,
    pub sinks_opened: AtomicUsize,
    /// Sinks that were shut down rather than dropped
    pub sinks_flushed: Arc<AtomicUsize>,
    pub disconnects: AtomicUsize,
}

impl MockConnection {
    pub fn connected() -> Arc<Self> {
        let conn = Self::default();
        conn.connected.store(true, Ordering::SeqCst);
        Arc::new(conn)
    }

    pub fn disconnected() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn bytes_written(&self) -> usize {
        self.written.lock().len()
    }
}

#[async_trait]
impl ConnectionAdapter for MockConnection {
    async fn open_sink(&self, _cancel: CancellationToken) -> Result<PcmSink, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }
        self.sinks_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingSink {
            written: self.written.clone(),
            flushed: self.sinks_flushed.clone(),
        }))
    }

    async fn signal_speaking(&self, active: bool) -> Result<(), ConnectionError> {
        self.speaking.lock().push(active);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self, _cancel: CancellationToken) -> Result<(), ConnectionError> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct RecordingSink {
    written: Arc<Mutex<Vec<u8>>>,
    flushed: Arc<AtomicUsize>,
}

impl AsyncWrite for RecordingSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.written.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.flushed.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Paced PCM source: one chunk per tick, optionally ending after `total` bytes
pub struct TrickleSource {
    interval: Interval,
    chunk: usize,
    fill: u8,
    remaining: Option<usize>,
}

impl TrickleSource {
    pub fn new(chunk: usize, period: Duration, fill: u8, total: Option<usize>) -> Self {
        Self {
            interval: tokio::time::interval(period),
            chunk,
            fill,
            remaining: total,
        }
    }
}

impl AsyncRead for TrickleSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == Some(0) {
            return Poll::Ready(Ok(()));
        }
        ready!(self.interval.poll_tick(cx));

        let mut n = self.chunk.min(buf.remaining());
        if let Some(remaining) = self.remaining {
            n = n.min(remaining);
            self.remaining = Some(remaining - n);
        }
        let fill = self.fill;
        buf.put_slice(&vec![fill; n]);
        Poll::Ready(Ok(()))
    }
}

/// Endless 20 ms-paced track
pub fn endless_track(title: &str) -> Track {
    trickle_track(title, 0x10, None)
}

/// Track that ends after `total` bytes
pub fn finite_track(title: &str, total: usize) -> Track {
    trickle_track(title, 0x10, Some(total))
}

pub fn trickle_track(title: &str, fill: u8, total: Option<usize>) -> Track {
    Track::from_factory(title, move |_cancel| {
        Box::pin(async move {
            Ok::<_, SourceError>(PcmStream::from_reader(TrickleSource::new(
                FRAME_BYTES,
                FRAME_PERIOD,
                fill,
                total,
            )))
        })
    })
}

/// Track whose source can never be opened
pub fn failing_track(title: &str) -> Track {
    Track::from_factory(title, |_cancel| {
        Box::pin(async { Err::<PcmStream, _>(SourceError::Factory("no such media".to_string())) })
    })
}

/// Wait for the next event matching `pred`, skipping others
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<PlayerEvent>, mut pred: F) -> PlayerEvent
where
    F: FnMut(&PlayerEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for player event")
}

/// Collect events until `pred` matches (inclusive)
pub async fn collect_until<F>(
    rx: &mut broadcast::Receiver<PlayerEvent>,
    mut pred: F,
) -> Vec<PlayerEvent>
where
    F: FnMut(&PlayerEvent) -> bool,
{
    let mut events = Vec::new();
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = pred(&event);
                    events.push(event);
                    if done {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out collecting player events");
    events
}

/// Compact label for asserting event order
pub fn label(event: &PlayerEvent) -> String {
    match event {
        PlayerEvent::TrackStarted { track, .. } => format!("started:{}", track.title),
        PlayerEvent::TrackEnded { track, .. } => format!("ended:{}", track.title),
        PlayerEvent::QueueEmpty { .. } => "empty".to_string(),
        PlayerEvent::PlaybackError { .. } => "error".to_string(),
        PlayerEvent::Disconnected { .. } => "disconnected".to_string(),
    }
}
