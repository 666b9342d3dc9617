//! Songbird-backed voice connection
//!
//! Each track gets a fresh in-memory pipe: the player writes s16le into the sink half,
//! songbird pulls f32le from the reader half through a live [`RawAdapter`] input.
//! A track that played out drains its buffered chunks before its input ends; an
//! interrupted one ends at the next mixer read.

use crate::config::pcm;
use crate::connection::{ConnectionAdapter, PcmSink};
use crate::error::{ConnectionError, PlayerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::events::{Event, EventContext, EventHandler as VoiceEventHandler};
use songbird::input::core::io::MediaSource;
use songbird::input::{Input, RawAdapter};
use songbird::tracks::TrackHandle;
use songbird::{Call, CoreEvent, Songbird};
use std::io::{self, Read, Seek, SeekFrom};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, info, warn};

/// Chunks buffered between the player and the mixer
const PIPE_CAPACITY: usize = 8;
/// One stereo s16 frame
const FRAME: usize = 4;
/// One stereo f32 frame
const MIXER_FRAME: usize = 8;

/// [`ConnectionAdapter`] over a songbird [`Call`]
pub struct SongbirdConnection {
    manager: Arc<Songbird>,
    guild_id: GuildId,
    call: Arc<tokio::sync::Mutex<Call>>,
    connected: Arc<AtomicBool>,
    /// Input created by `open_sink`, started on the next speaking signal
    pending: Mutex<Option<Input>>,
    track: Mutex<Option<TrackHandle>>,
}

impl SongbirdConnection {
    pub async fn new(
        manager: Arc<Songbird>,
        guild_id: GuildId,
        call: Arc<tokio::sync::Mutex<Call>>,
    ) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        {
            let mut handler = call.lock().await;
            connected.store(handler.current_connection().is_some(), Ordering::SeqCst);
            for event in [
                CoreEvent::DriverConnect,
                CoreEvent::DriverReconnect,
                CoreEvent::DriverDisconnect,
            ] {
                handler.add_global_event(
                    event.into(),
                    ConnectionWatch {
                        guild_id,
                        connected: connected.clone(),
                    },
                );
            }
        }

        Self {
            manager,
            guild_id,
            call,
            connected,
            pending: Mutex::new(None),
            track: Mutex::new(None),
        }
    }

    fn stop_track(&self) {
        let handle = self.track.lock().take();
        if let Some(handle) = handle {
            // Already finished tracks report an error here
            if let Err(e) = handle.stop() {
                debug!("[{}] Voice track stop: {}", self.guild_id, e);
            }
        }
    }
}

#[async_trait]
impl ConnectionAdapter for SongbirdConnection {
    async fn open_sink(&self, _cancel: CancellationToken) -> Result<PcmSink, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }

        let (writer, reader) = pcm_pipe();
        let input: Input = RawAdapter::new(reader, pcm::SAMPLE_RATE, pcm::CHANNELS).into();

        // A sink that was never started is simply replaced
        *self.pending.lock() = Some(input);

        Ok(Box::new(writer))
    }

    async fn signal_speaking(&self, active: bool) -> Result<(), ConnectionError> {
        // The voice track ends by itself once its pipe is shut down or dropped
        if !active {
            return Ok(());
        }

        let Some(input) = self.pending.lock().take() else {
            return Ok(());
        };

        let handle = self.call.lock().await.play_input(input);
        *self.track.lock() = Some(handle);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self, cancel: CancellationToken) -> Result<(), ConnectionError> {
        self.stop_track();
        self.pending.lock().take();
        self.connected.store(false, Ordering::SeqCst);

        let left = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectionError::Closed),
            left = self.manager.remove(self.guild_id) => left,
        };

        match left {
            Ok(()) => {
                info!("[{}] Left voice channel", self.guild_id);
                Ok(())
            }
            Err(e) => Err(ConnectionError::Driver(e.to_string())),
        }
    }
}

/// Join `channel_id` and wrap the call for the player
pub async fn connect_voice(
    manager: Arc<Songbird>,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> Result<Arc<dyn ConnectionAdapter>, PlayerError> {
    let call = manager
        .join(guild_id, channel_id)
        .await
        .map_err(|e| ConnectionError::Driver(e.to_string()))?;

    info!("[{}] Joined voice channel {}", guild_id, channel_id);
    Ok(Arc::new(SongbirdConnection::new(manager, guild_id, call).await))
}

/// Tracks the driver's connection state
struct ConnectionWatch {
    guild_id: GuildId,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl VoiceEventHandler for ConnectionWatch {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::DriverConnect(_) | EventContext::DriverReconnect(_) => {
                self.connected.store(true, Ordering::SeqCst);
                debug!("[{}] Voice driver connected", self.guild_id);
            }
            EventContext::DriverDisconnect(_) => {
                self.connected.store(false, Ordering::SeqCst);
                warn!("[{}] Voice driver disconnected", self.guild_id);
            }
            _ => {}
        }

        None
    }
}

fn pcm_pipe() -> (PcmPipeWriter, PcmPipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    let abandoned = Arc::new(AtomicBool::new(false));
    (
        PcmPipeWriter {
            tx: PollSender::new(tx),
            carry: Vec::with_capacity(FRAME),
            finished: false,
            abandoned: abandoned.clone(),
        },
        PcmPipeReader {
            rx: Mutex::new(rx),
            abandoned,
            pending: Vec::new(),
            pos: 0,
        },
    )
}

/// Player side of the pipe: s16le in, f32le chunks out
struct PcmPipeWriter {
    tx: PollSender<Vec<u8>>,
    /// Bytes of an incomplete frame from the previous write
    carry: Vec<u8>,
    finished: bool,
    /// Raised when the writer goes away without a shutdown
    abandoned: Arc<AtomicBool>,
}

impl AsyncWrite for PcmPipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(self.tx.poll_reserve(cx)).map_err(|_| broken_pipe())?;

        let this = &mut *self;
        let mut frames = std::mem::take(&mut this.carry);
        frames.extend_from_slice(buf);
        let whole = frames.len() / FRAME * FRAME;
        this.carry = frames.split_off(whole);

        if frames.is_empty() {
            this.tx.abort_send();
            return Poll::Ready(Ok(buf.len()));
        }

        this.tx
            .send_item(s16le_to_f32le(&frames))
            .map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.finished = true;
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PcmPipeWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "voice track closed")
}

fn s16le_to_f32le(pcm: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm.len() * 2);
    for sample in pcm.chunks_exact(2) {
        let value = i16::from_le_bytes([sample[0], sample[1]]) as f32 / 32768.0;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Mixer side of the pipe.
///
/// Never blocks: yields silence while the player has nothing buffered (paused or
/// still opening), and end of stream once the writer is gone.
struct PcmPipeReader {
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    abandoned: Arc<AtomicBool>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for PcmPipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.abandoned.load(Ordering::SeqCst) {
            return Ok(0);
        }

        if self.pos >= self.pending.len() {
            match self.rx.get_mut().try_recv() {
                Ok(chunk) => self.pending = chunk,
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(0),
                Err(mpsc::error::TryRecvError::Empty) => {
                    let silence = buf.len() / MIXER_FRAME * MIXER_FRAME;
                    if silence > 0 {
                        buf[..silence].fill(0);
                        return Ok(silence);
                    }
                    // Too small for a frame: hand one out piecewise to stay aligned
                    self.pending = vec![0; MIXER_FRAME];
                }
            }
            self.pos = 0;
        }

        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Seek for PcmPipeReader {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "live PCM cannot seek",
        ))
    }
}

impl MediaSource for PcmPipeReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
