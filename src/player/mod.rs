//! Per-guild playback actor
//!
//! [`PlaybackActor`] is the handle callers hold. Behind it a control task owns all
//! player state and a copy task streams the current track into the voice connection.

mod control;
mod copy;
mod message;
mod state;

use crate::audio::AudioSourceResolver;
use crate::connection::ConnectionAdapter;
use crate::error::PlayerError;
use crate::events::GuildEvents;
use crate::track::{QueueSnapshot, Track};
use control::ControlLoop;
use copy::CopyLoop;
use message::{Message, PlaybackControls, Reply};
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Handle to one guild's player
pub struct PlaybackActor {
    guild_id: GuildId,
    tx: mpsc::UnboundedSender<Message>,
    lifetime: CancellationToken,
    control: Mutex<Option<JoinHandle<()>>>,
    /// Set once a join other than the creating one reached this player
    shared: AtomicBool,
}

impl PlaybackActor {
    /// Start the control task for `guild_id`
    pub fn spawn(
        guild_id: GuildId,
        resolver: Arc<AudioSourceResolver>,
        events: GuildEvents,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let lifetime = CancellationToken::new();
        let controls = Arc::new(PlaybackControls::new());

        let copy = CopyLoop {
            guild_id,
            tx: tx.clone(),
            controls: controls.clone(),
            chunk_size: resolver.config().chunk_size,
            connect_poll: resolver.config().connect_poll,
            resolver,
            events: events.clone(),
            lifetime: lifetime.clone(),
        };

        let control = ControlLoop::new(guild_id, rx, controls, copy, lifetime.clone(), events);
        let handle = tokio::spawn(control.run());

        info!("[{}] Player created", guild_id);

        Self {
            guild_id,
            tx,
            lifetime,
            control: Mutex::new(Some(handle)),
            shared: AtomicBool::new(false),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub(crate) fn mark_shared(&self) {
        self.shared.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    /// True once the control task stopped taking messages
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.lifetime.is_cancelled()
    }

    async fn ask<T>(&self, build: impl FnOnce(Reply<T>) -> Message) -> Result<T, PlayerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| PlayerError::ActorClosed)?;
        rx.await.map_err(|_| PlayerError::ActorClosed)?
    }

    /// Store the voice connection; returns whether it reports connected
    pub async fn attach(&self, connection: Arc<dyn ConnectionAdapter>) -> Result<bool, PlayerError> {
        self.ask(|reply| Message::Attach { connection, reply }).await
    }

    pub async fn enqueue(&self, track: Track) -> Result<(), PlayerError> {
        self.ask(|reply| Message::Enqueue { track, reply }).await
    }

    /// Play `track` next, interrupting the current one. The queue is left alone.
    pub async fn play_now(&self, track: Track) -> Result<bool, PlayerError> {
        self.ask(|reply| Message::PlayNow { track, reply }).await
    }

    /// End the current track; false when nothing is playing
    pub async fn skip(&self) -> Result<bool, PlayerError> {
        self.ask(|reply| Message::Skip { reply }).await
    }

    pub async fn stop(&self) -> Result<bool, PlayerError> {
        self.ask(|reply| Message::Stop { reply }).await
    }

    pub async fn pause(&self) -> Result<bool, PlayerError> {
        self.ask(|reply| Message::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<bool, PlayerError> {
        self.ask(|reply| Message::Resume { reply }).await
    }

    /// Streamed sources cannot seek; always false
    pub async fn seek(&self, position: Duration) -> Result<bool, PlayerError> {
        self.ask(|reply| Message::Seek { position, reply }).await
    }

    pub async fn set_volume(&self, volume: f64) -> Result<bool, PlayerError> {
        self.ask(|reply| Message::SetVolume { volume, reply }).await
    }

    pub async fn position(&self) -> Result<Option<Duration>, PlayerError> {
        self.ask(|reply| Message::GetPosition { reply }).await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, PlayerError> {
        self.ask(|reply| Message::GetSnapshot { reply }).await
    }

    /// Cancel everything, release the connection and wait for the tasks to finish
    pub async fn shutdown(&self) {
        self.lifetime.cancel();

        let handle = self.control.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("[{}] Player control task failed: {}", self.guild_id, e);
            }
        }
    }
}

impl Drop for PlaybackActor {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use crate::events::{EventBus, PlayerEvent};
    use crate::testing::*;
    use tokio::time::sleep;

    fn spawn_actor(bus: &EventBus) -> PlaybackActor {
        let guild_id = GuildId::new(1);
        let resolver = Arc::new(AudioSourceResolver::new(MediaConfig {
            connect_poll: Duration::from_millis(20),
            ..MediaConfig::default()
        }));
        PlaybackActor::spawn(guild_id, resolver, bus.for_guild(guild_id))
    }

    async fn connected_actor(bus: &EventBus) -> (PlaybackActor, Arc<MockConnection>) {
        let actor = spawn_actor(bus);
        let conn = MockConnection::connected();
        assert!(actor.attach(conn.clone()).await.unwrap());
        (actor, conn)
    }

    fn started(title: &'static str) -> impl Fn(&PlayerEvent) -> bool {
        move |e| matches!(e, PlayerEvent::TrackStarted { track, .. } if track.title == title)
    }

    fn is_empty(e: &PlayerEvent) -> bool {
        matches!(e, PlayerEvent::QueueEmpty { .. })
    }

    fn labels(events: &[PlayerEvent]) -> Vec<String> {
        events.iter().map(label).collect()
    }

    #[tokio::test]
    async fn test_idle_player() {
        let bus = EventBus::new();
        let (actor, _conn) = connected_actor(&bus).await;

        assert!(!actor.skip().await.unwrap());
        assert_eq!(actor.position().await.unwrap(), None);
        assert!(!actor.seek(Duration::from_secs(10)).await.unwrap());

        let snap = actor.snapshot().await.unwrap();
        assert!(snap.current.is_none());
        assert!(snap.is_connected);
        assert!(!snap.can_skip);
        assert_eq!(snap.volume, 1.0);
    }

    #[tokio::test]
    async fn test_volume_is_clamped() {
        let bus = EventBus::new();
        let actor = spawn_actor(&bus);

        assert!(actor.set_volume(1.7).await.unwrap());
        assert_eq!(actor.snapshot().await.unwrap().volume, 1.0);

        assert!(actor.set_volume(-0.3).await.unwrap());
        assert_eq!(actor.snapshot().await.unwrap().volume, 0.0);

        assert!(actor.set_volume(f64::NAN).await.unwrap());
        assert_eq!(actor.snapshot().await.unwrap().volume, 0.0);

        assert!(actor.set_volume(0.25).await.unwrap());
        assert_eq!(actor.snapshot().await.unwrap().volume, 0.25);
    }

    #[tokio::test]
    async fn test_enqueue_waits_for_connection() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let actor = spawn_actor(&bus);
        let conn = MockConnection::disconnected();

        assert!(!actor.attach(conn.clone()).await.unwrap());
        actor.enqueue(endless_track("A")).await.unwrap();
        actor.enqueue(endless_track("B")).await.unwrap();

        sleep(Duration::from_millis(100)).await;
        let snap = actor.snapshot().await.unwrap();
        assert!(snap.current.is_none());
        assert_eq!(snap.upcoming_titles(), vec!["A", "B"]);
        assert!(!snap.is_connected);

        conn.set_connected(true);
        wait_for(&mut rx, started("A")).await;

        let snap = actor.snapshot().await.unwrap();
        assert_eq!(snap.current.clone().map(|t| t.title), Some("A".to_string()));
        assert_eq!(snap.upcoming_titles(), vec!["B"]);
        assert!(snap.can_skip);
    }

    #[tokio::test]
    async fn test_skip_advances_to_next_track() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (actor, _conn) = connected_actor(&bus).await;

        actor.enqueue(endless_track("A")).await.unwrap();
        wait_for(&mut rx, started("A")).await;
        assert!(!actor.snapshot().await.unwrap().can_skip);

        actor.enqueue(endless_track("B")).await.unwrap();
        let snap = actor.snapshot().await.unwrap();
        assert_eq!(snap.upcoming_titles(), vec!["B"]);
        assert!(snap.can_skip);

        assert!(actor.skip().await.unwrap());
        let events = collect_until(&mut rx, started("B")).await;
        assert_eq!(labels(&events), vec!["ended:A", "started:B"]);

        let snap = actor.snapshot().await.unwrap();
        assert_eq!(snap.current.map(|t| t.title), Some("B".to_string()));
        assert!(snap.upcoming.is_empty());
        assert!(!snap.can_skip);
    }

    #[tokio::test]
    async fn test_play_now_preempts_current_and_keeps_queue() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (actor, _conn) = connected_actor(&bus).await;

        actor.enqueue(endless_track("A")).await.unwrap();
        wait_for(&mut rx, started("A")).await;
        actor.enqueue(endless_track("B")).await.unwrap();

        assert!(actor.play_now(endless_track("C")).await.unwrap());
        let events = collect_until(&mut rx, started("C")).await;
        assert_eq!(labels(&events), vec!["ended:A", "started:C"]);

        let snap = actor.snapshot().await.unwrap();
        assert_eq!(snap.current.clone().map(|t| t.title), Some("C".to_string()));
        assert_eq!(snap.upcoming_titles(), vec!["B"]);
    }

    #[tokio::test]
    async fn test_stop_clears_queue_and_ends_current() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (actor, conn) = connected_actor(&bus).await;

        actor.enqueue(endless_track("A")).await.unwrap();
        actor.enqueue(endless_track("B")).await.unwrap();
        wait_for(&mut rx, started("A")).await;

        assert!(actor.stop().await.unwrap());
        let snap = actor.snapshot().await.unwrap();
        assert!(snap.upcoming.is_empty());
        assert!(!snap.can_skip);

        let events = collect_until(&mut rx, is_empty).await;
        assert_eq!(labels(&events), vec!["ended:A", "empty"]);
        // An interrupted track is dropped, never flushed
        assert_eq!(conn.sinks_flushed.load(Ordering::SeqCst), 0);
        assert_eq!(*conn.speaking.lock(), vec![true, false]);

        let snap = actor.snapshot().await.unwrap();
        assert!(snap.current.is_none());
        assert_eq!(actor.position().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_finite_track_plays_to_the_end() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (actor, conn) = connected_actor(&bus).await;

        actor.enqueue(finite_track("A", FRAME_BYTES * 3)).await.unwrap();
        let events = collect_until(&mut rx, is_empty).await;
        assert_eq!(labels(&events), vec!["started:A", "ended:A", "empty"]);

        assert_eq!(conn.bytes_written(), FRAME_BYTES * 3);
        assert_eq!(*conn.speaking.lock(), vec![true, false]);
        assert_eq!(conn.sinks_opened.load(Ordering::SeqCst), 1);
        assert_eq!(conn.sinks_flushed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_volume_scales_samples() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (actor, conn) = connected_actor(&bus).await;

        actor.set_volume(0.5).await.unwrap();
        // 0x1010 = 4112, halved to 2056 = 0x0808
        actor
            .enqueue(trickle_track("A", 0x10, Some(FRAME_BYTES)))
            .await
            .unwrap();
        wait_for(&mut rx, is_empty).await;

        let written = conn.written.lock();
        assert_eq!(written.len(), FRAME_BYTES);
        assert!(written.iter().all(|&b| b == 0x08));
    }

    #[tokio::test]
    async fn test_failed_open_reports_error_and_advances() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (actor, _conn) = connected_actor(&bus).await;

        actor.enqueue(failing_track("X")).await.unwrap();
        actor.enqueue(endless_track("A")).await.unwrap();

        let events = collect_until(&mut rx, started("A")).await;
        let labels = labels(&events);
        assert!(labels.contains(&"error".to_string()));
        assert!(!labels.contains(&"started:X".to_string()));
        assert!(!labels.contains(&"ended:X".to_string()));

        let error = events
            .iter()
            .find_map(|e| match e {
                PlayerEvent::PlaybackError { error, .. } => Some(error.clone()),
                _ => None,
            })
            .unwrap();
        assert!(matches!(*error, PlayerError::Source(_)));
    }

    #[tokio::test]
    async fn test_pause_freezes_position_and_output() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (actor, conn) = connected_actor(&bus).await;

        actor.enqueue(endless_track("A")).await.unwrap();
        wait_for(&mut rx, started("A")).await;
        sleep(Duration::from_millis(150)).await;

        assert!(actor.pause().await.unwrap());
        assert!(actor.pause().await.unwrap());
        assert!(actor.snapshot().await.unwrap().is_paused);

        let paused_at = actor.position().await.unwrap().unwrap();
        assert!(paused_at >= Duration::from_millis(100), "{paused_at:?}");
        // A read already in flight may still land
        sleep(Duration::from_millis(50)).await;
        let written = conn.bytes_written();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(actor.position().await.unwrap(), Some(paused_at));
        assert_eq!(conn.bytes_written(), written);

        assert!(actor.resume().await.unwrap());
        assert!(actor.resume().await.unwrap());
        assert!(!actor.snapshot().await.unwrap().is_paused);

        sleep(Duration::from_millis(150)).await;
        let resumed = actor.position().await.unwrap().unwrap();
        assert!(resumed >= paused_at + Duration::from_millis(100), "{resumed:?}");
        assert!(resumed <= paused_at + Duration::from_millis(400), "{resumed:?}");
        assert!(conn.bytes_written() > written);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_snapshots_stay_consistent() {
        let bus = EventBus::new();
        let (actor, _conn) = connected_actor(&bus).await;
        let actor = Arc::new(actor);

        for i in 0..4 {
            actor.enqueue(endless_track(&format!("T{i}"))).await.unwrap();
        }

        let mut tasks = Vec::new();
        for worker in 0..4 {
            let actor = actor.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    match (worker + i) % 3 {
                        0 => {
                            actor.skip().await.unwrap();
                        }
                        1 => actor
                            .enqueue(endless_track(&format!("W{worker}-{i}")))
                            .await
                            .unwrap(),
                        _ => {}
                    }
                    let snap = actor.snapshot().await.unwrap();
                    assert_eq!(
                        snap.can_skip,
                        snap.current.is_some() && !snap.upcoming.is_empty()
                    );
                    tokio::task::yield_now().await;
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_shutdown_releases_connection() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (actor, conn) = connected_actor(&bus).await;

        actor.enqueue(endless_track("A")).await.unwrap();
        wait_for(&mut rx, started("A")).await;

        actor.shutdown().await;
        actor.shutdown().await;

        wait_for(&mut rx, |e| matches!(e, PlayerEvent::TrackEnded { .. })).await;
        assert!(actor.is_closed());
        assert!(matches!(actor.skip().await, Err(PlayerError::ActorClosed)));
        assert_eq!(conn.disconnects.load(Ordering::SeqCst), 1);
        assert!(!conn.is_connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_killed_transcoder_ends_track_quietly() {
        use crate::audio::ProcessPipeline;
        use tokio::process::Command;

        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (actor, conn) = connected_actor(&bus).await;

        let track = Track::from_factory("dies", |cancel| {
            Box::pin(async move {
                let mut cmd = Command::new("sh");
                cmd.args(["-c", "head -c 9600 /dev/zero; kill -9 $$"]);
                ProcessPipeline::spawn(None, cmd, Duration::from_millis(100), &cancel)
            })
        });
        actor.enqueue(track).await.unwrap();

        let events = collect_until(&mut rx, is_empty).await;
        assert_eq!(labels(&events), vec!["started:dies", "ended:dies", "empty"]);
        assert!(conn.bytes_written() <= 9600);
    }
}
