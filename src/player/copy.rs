//! Copy loop: moves PCM from the current source into the connection's sink
//!
//! Runs only while there is work. It owns no player state: each track is handed out
//! by the control loop and the outcome is reported back through the mailbox.

use super::message::{Advance, Assignment, Message, PlaybackControls};
use crate::audio::gain::{apply_gain, is_unity};
use crate::audio::{AudioSourceResolver, PcmStream};
use crate::config::pcm;
use crate::connection::{ConnectionAdapter, PcmSink};
use crate::error::PlayerError;
use crate::events::GuildEvents;
use crate::track::Track;
use serenity::model::id::GuildId;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub(crate) struct CopyLoop {
    pub guild_id: GuildId,
    pub tx: mpsc::UnboundedSender<Message>,
    pub controls: Arc<PlaybackControls>,
    pub resolver: Arc<AudioSourceResolver>,
    pub events: GuildEvents,
    pub lifetime: CancellationToken,
    pub chunk_size: usize,
    pub connect_poll: Duration,
}

/// Why the byte copy for a track stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyEnd {
    Eof,
    Cancelled,
    SinkClosed,
}

impl CopyLoop {
    pub async fn run(self) {
        debug!("[{}] Copy loop started", self.guild_id);

        loop {
            let Some(advance) = self.request_advance().await else {
                break;
            };

            match advance {
                Advance::Idle => break,
                Advance::WaitForConnection => {
                    tokio::select! {
                        _ = self.lifetime.cancelled() => break,
                        _ = tokio::time::sleep(self.connect_poll) => {}
                    }
                }
                Advance::Play(assignment) => self.play(assignment).await,
            }
        }

        debug!("[{}] Copy loop exited", self.guild_id);
    }

    async fn request_advance(&self) -> Option<Advance> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Message::Advance { reply }).ok()?;

        tokio::select! {
            biased;
            _ = self.lifetime.cancelled() => None,
            advance = rx => advance.ok(),
        }
    }

    async fn play(&self, assignment: Assignment) {
        let Assignment {
            op,
            track,
            cancel,
            connection,
        } = assignment;
        let started_at = Instant::now();

        info!(
            "[{}] Opening track {} ({}, op {})",
            self.guild_id,
            track.title,
            track.source.kind(),
            op
        );

        let opened = self
            .open(&track, &cancel, connection.as_ref(), started_at)
            .await;

        let (mut sink, mut source) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                if cancel.is_cancelled() {
                    debug!("[{}] Track cancelled while opening (op {})", self.guild_id, op);
                } else {
                    error!("[{}] Failed to open {}: {}", self.guild_id, track.title, e);
                    self.events.playback_error(e);
                }
                self.report(Message::TrackFinished { op });
                return;
            }
        };

        debug!("[{}] Source opened in {}ms", self.guild_id, started_at.elapsed().as_millis());
        self.report(Message::SourceOpened { op });
        self.events.track_started(&track);

        if let Err(e) = connection.signal_speaking(true).await {
            warn!("[{}] Failed to signal speaking: {}", self.guild_id, e);
        }

        let end = self
            .copy(op, &mut source, &mut sink, &cancel, started_at)
            .await;

        // Only a finished stream is flushed; an interrupted one is dropped unflushed
        if end == CopyEnd::Eof {
            if let Err(e) = sink.shutdown().await {
                debug!("[{}] Sink shutdown failed: {}", self.guild_id, e);
            }
        }
        if let Err(e) = connection.signal_speaking(false).await {
            warn!("[{}] Failed to clear speaking: {}", self.guild_id, e);
        }
        drop(sink);
        source.close().await;

        self.report(Message::TrackFinished { op });
        info!(
            "[{}] Track finished ({:?}, op {}) after {}ms",
            self.guild_id,
            end,
            op,
            started_at.elapsed().as_millis()
        );
        self.events.track_ended(track);
    }

    async fn open(
        &self,
        track: &Track,
        cancel: &CancellationToken,
        connection: &dyn ConnectionAdapter,
        started_at: Instant,
    ) -> Result<(PcmSink, PcmStream), PlayerError> {
        let mut sink = connection.open_sink(cancel.clone()).await?;
        debug!("[{}] Sink opened in {}ms", self.guild_id, started_at.elapsed().as_millis());

        match self.resolver.open(track, cancel).await {
            Ok(source) => Ok((sink, source)),
            Err(e) => {
                if let Err(shutdown) = sink.shutdown().await {
                    debug!("[{}] Sink shutdown failed: {}", self.guild_id, shutdown);
                }
                Err(e.into())
            }
        }
    }

    /// Stream until end of input, a sink failure or cancellation
    async fn copy(
        &self,
        op: u64,
        source: &mut PcmStream,
        sink: &mut PcmSink,
        cancel: &CancellationToken,
        started_at: Instant,
    ) -> CopyEnd {
        let mut buf = vec![0u8; self.chunk_size.max(2)];
        // A read may split a sample; the odd byte waits at the front of the buffer
        let mut carry = 0usize;
        let mut total = 0usize;

        let end = loop {
            if self.controls.is_paused() {
                let gate = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break CopyEnd::Cancelled,
                    permit = self.controls.gate.acquire() => permit,
                };
                match gate {
                    Ok(permit) => drop(permit),
                    Err(_) => break CopyEnd::Cancelled,
                }
            }

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break CopyEnd::Cancelled,
                read = source.read(&mut buf[carry..]) => read,
            };

            let n = match read {
                Ok(0) => break CopyEnd::Eof,
                Ok(n) => n,
                Err(e) => {
                    info!("[{}] Source read failed, treating as end of stream: {}", self.guild_id, e);
                    break CopyEnd::Eof;
                }
            };

            let filled = carry + n;
            let whole = filled & !1;

            let volume = self.controls.volume();
            if !is_unity(volume) {
                apply_gain(&mut buf[..whole], volume);
            }

            if whole > 0 {
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break CopyEnd::Cancelled,
                    written = sink.write_all(&buf[..whole]) => written,
                };
                if let Err(e) = written {
                    warn!("[{}] Sink write failed: {}", self.guild_id, e);
                    break CopyEnd::SinkClosed;
                }

                if total == 0 {
                    debug!("[{}] First PCM written after {}ms", self.guild_id, started_at.elapsed().as_millis());
                }
                total += whole;
            }

            carry = filled - whole;
            if carry == 1 {
                buf[0] = buf[whole];
            }
        };

        info!(
            "[{}] Stream ended ({:?}, op {}): {} bytes, {}ms of audio",
            self.guild_id,
            end,
            op,
            total,
            total * 1000 / pcm::BYTES_PER_SECOND
        );
        end
    }

    fn report(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("[{}] Control loop is gone, dropping report", self.guild_id);
        }
    }
}
