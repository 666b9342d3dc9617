//! Mailbox protocol between callers, the control loop and the copy loop

use crate::connection::ConnectionAdapter;
use crate::error::PlayerError;
use crate::track::{QueueSnapshot, Track};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, PlayerError>>;

/// Everything the control loop reacts to
pub(crate) enum Message {
    Attach {
        connection: Arc<dyn ConnectionAdapter>,
        reply: Reply<bool>,
    },
    Enqueue {
        track: Track,
        reply: Reply<()>,
    },
    PlayNow {
        track: Track,
        reply: Reply<bool>,
    },
    Skip {
        reply: Reply<bool>,
    },
    Stop {
        reply: Reply<bool>,
    },
    Pause {
        reply: Reply<bool>,
    },
    Resume {
        reply: Reply<bool>,
    },
    Seek {
        position: Duration,
        reply: Reply<bool>,
    },
    SetVolume {
        volume: f64,
        reply: Reply<bool>,
    },
    GetPosition {
        reply: Reply<Option<Duration>>,
    },
    GetSnapshot {
        reply: Reply<QueueSnapshot>,
    },

    // Reports from the copy loop
    Advance {
        reply: oneshot::Sender<Advance>,
    },
    SourceOpened {
        op: u64,
    },
    TrackFinished {
        op: u64,
    },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Attach { .. } => "attach",
            Message::Enqueue { .. } => "enqueue",
            Message::PlayNow { .. } => "play_now",
            Message::Skip { .. } => "skip",
            Message::Stop { .. } => "stop",
            Message::Pause { .. } => "pause",
            Message::Resume { .. } => "resume",
            Message::Seek { .. } => "seek",
            Message::SetVolume { .. } => "set_volume",
            Message::GetPosition { .. } => "get_position",
            Message::GetSnapshot { .. } => "get_snapshot",
            Message::Advance { .. } => "advance",
            Message::SourceOpened { .. } => "source_opened",
            Message::TrackFinished { .. } => "track_finished",
        }
    }
}

/// Answer to the copy loop asking for work
pub(crate) enum Advance {
    Play(Assignment),
    /// Work is pending but the connection is not usable yet
    WaitForConnection,
    /// Nothing left; the copy loop exits
    Idle,
}

pub(crate) struct Assignment {
    pub op: u64,
    pub track: Track,
    pub cancel: CancellationToken,
    pub connection: Arc<dyn ConnectionAdapter>,
}

/// Values the control loop writes and the copy loop reads while streaming
pub(crate) struct PlaybackControls {
    volume_bits: AtomicU64,
    paused: AtomicBool,
    /// Single permit, held by the control loop while paused
    pub gate: Arc<Semaphore>,
}

impl PlaybackControls {
    pub fn new() -> Self {
        Self {
            volume_bits: AtomicU64::new(1.0f64.to_bits()),
            paused: AtomicBool::new(false),
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn volume(&self) -> f64 {
        f64::from_bits(self.volume_bits.load(Ordering::Acquire))
    }

    pub fn set_volume(&self, volume: f64) {
        self.volume_bits.store(volume.to_bits(), Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }
}
