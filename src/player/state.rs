//! State owned by a player's control loop
//!
//! Nothing here is shared: the control task is the only reader and writer, and the copy
//! loop learns about changes through its assignment and the playback controls.

use crate::track::{QueueSnapshot, Track};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The track the copy loop is working on
pub(crate) struct CurrentTrack {
    pub op: u64,
    pub track: Track,
    pub cancel: CancellationToken,
    /// Source and sink are open and audio is flowing (or paused)
    pub opened: bool,
}

/// Elapsed-time accounting: frozen offset plus an optional running timer
#[derive(Debug, Default)]
pub(crate) struct PositionClock {
    offset: Duration,
    started: Option<Instant>,
}

impl PositionClock {
    pub fn reset(&mut self) {
        self.offset = Duration::ZERO;
        self.started = None;
    }

    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    /// Fold the running time into the offset and stop the timer
    pub fn freeze(&mut self) {
        if let Some(started) = self.started.take() {
            self.offset += started.elapsed();
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.offset + self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

pub(crate) struct PlayerState {
    pub queue: VecDeque<Track>,
    pub next_override: Option<Track>,
    pub current: Option<CurrentTrack>,
    pub clock: PositionClock,
    pub volume: f64,
    pub paused: bool,
}

impl PlayerState {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            next_override: None,
            current: None,
            clock: PositionClock::default(),
            volume: 1.0,
            paused: false,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.next_override.is_some() || !self.queue.is_empty()
    }

    /// Next track to play; an override preempts the queue
    pub fn take_next(&mut self) -> Option<Track> {
        self.next_override.take().or_else(|| self.queue.pop_front())
    }

    /// Drop everything that has not started yet
    pub fn clear_pending(&mut self) -> usize {
        let dropped = self.queue.len() + usize::from(self.next_override.is_some());
        self.queue.clear();
        self.next_override = None;
        dropped
    }

    pub fn can_skip(&self) -> bool {
        self.current.is_some() && self.has_pending()
    }

    pub fn position(&self) -> Option<Duration> {
        self.current.as_ref().map(|_| self.clock.elapsed())
    }

    /// Cancel the current track's scope, if any
    pub fn cancel_current(&self) -> bool {
        match &self.current {
            Some(current) => {
                current.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, is_connected: bool) -> QueueSnapshot {
        QueueSnapshot {
            current: self.current.as_ref().map(|c| c.track.clone()),
            upcoming: self.queue.iter().cloned().collect(),
            is_paused: self.paused,
            volume: self.volume,
            is_connected,
            can_skip: self.can_skip(),
        }
    }
}

/// Clamp a requested gain into [0.0, 1.0]
pub(crate) fn clamp_volume(volume: f64) -> f64 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}
