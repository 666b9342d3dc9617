//! Control loop: the single owner of a guild's player state
//!
//! Every public operation and every copy-loop report arrives through one unbounded
//! mailbox and is applied in order. The loop never waits on the copy loop; it only
//! cancels track scopes and flips the playback controls.

use super::copy::CopyLoop;
use super::message::{Advance, Assignment, Message, PlaybackControls, Reply};
use super::state::{clamp_volume, CurrentTrack, PlayerState};
use crate::connection::ConnectionAdapter;
use crate::error::PlayerError;
use crate::events::GuildEvents;
use serenity::model::id::GuildId;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) struct ControlLoop {
    guild_id: GuildId,
    state: PlayerState,
    connection: Option<Arc<dyn ConnectionAdapter>>,
    controls: Arc<PlaybackControls>,
    pause_permit: Option<OwnedSemaphorePermit>,
    mailbox: mpsc::UnboundedReceiver<Message>,
    copy: CopyLoop,
    copy_task: Option<JoinHandle<()>>,
    copy_running: bool,
    next_op: u64,
    lifetime: CancellationToken,
    events: GuildEvents,
}

impl ControlLoop {
    pub fn new(
        guild_id: GuildId,
        mailbox: mpsc::UnboundedReceiver<Message>,
        controls: Arc<PlaybackControls>,
        copy: CopyLoop,
        lifetime: CancellationToken,
        events: GuildEvents,
    ) -> Self {
        Self {
            guild_id,
            state: PlayerState::new(),
            connection: None,
            controls,
            pause_permit: None,
            mailbox,
            copy,
            copy_task: None,
            copy_running: false,
            next_op: 1,
            lifetime,
            events,
        }
    }

    pub async fn run(mut self) {
        debug!("[{}] Player control loop started", self.guild_id);

        loop {
            let message = tokio::select! {
                biased;
                _ = self.lifetime.cancelled() => break,
                message = self.mailbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.handle(message).await;
        }

        self.teardown().await;
    }

    async fn handle(&mut self, message: Message) {
        let name = message.name();
        match message {
            Message::Attach { connection, reply } => {
                let connected = connection.is_connected();
                self.connection = Some(connection);
                info!("[{}] Connection attached (connected: {})", self.guild_id, connected);
                self.respond(name, reply, Ok(connected));
            }
            Message::Enqueue { track, reply } => {
                debug!("[{}] Enqueued: {}", self.guild_id, track.title);
                self.state.queue.push_back(track);
                self.ensure_copy_loop();
                self.respond(name, reply, Ok(()));
            }
            Message::PlayNow { track, reply } => {
                info!("[{}] Play now requested: {}", self.guild_id, track.title);
                self.state.next_override = Some(track);
                self.state.cancel_current();
                self.ensure_copy_loop();
                self.respond(name, reply, Ok(true));
            }
            Message::Skip { reply } => {
                let skipped = match &self.state.current {
                    Some(current) => {
                        info!("[{}] Skip requested (op {})", self.guild_id, current.op);
                        current.cancel.cancel();
                        true
                    }
                    None => false,
                };
                self.respond(name, reply, Ok(skipped));
            }
            Message::Stop { reply } => {
                let dropped = self.state.clear_pending();
                self.state.cancel_current();
                info!("[{}] Stop requested, dropped {} queued", self.guild_id, dropped);
                self.respond(name, reply, Ok(true));
            }
            Message::Pause { reply } => {
                let result = self.pause().await;
                self.respond(name, reply, result);
            }
            Message::Resume { reply } => {
                self.resume();
                self.respond(name, reply, Ok(true));
            }
            Message::Seek { position, reply } => {
                debug!("[{}] Seek to {:?} is not supported on streamed sources", self.guild_id, position);
                self.respond(name, reply, Ok(false));
            }
            Message::SetVolume { volume, reply } => {
                let volume = clamp_volume(volume);
                self.state.volume = volume;
                self.controls.set_volume(volume);
                debug!("[{}] Volume set to {}", self.guild_id, volume);
                self.respond(name, reply, Ok(true));
            }
            Message::GetPosition { reply } => {
                self.respond(name, reply, Ok(self.state.position()));
            }
            Message::GetSnapshot { reply } => {
                let snapshot = self.state.snapshot(self.is_connected());
                self.respond(name, reply, Ok(snapshot));
            }
            Message::Advance { reply } => {
                let advance = self.advance();
                if reply.send(advance).is_err() {
                    debug!("[{}] Copy loop went away before its assignment", self.guild_id);
                }
            }
            Message::SourceOpened { op } => {
                if let Some(current) = self.state.current.as_mut().filter(|c| c.op == op) {
                    current.opened = true;
                    self.state.clock.reset();
                    if !self.state.paused {
                        self.state.clock.start();
                    }
                }
            }
            Message::TrackFinished { op } => {
                if self.state.current.as_ref().is_some_and(|c| c.op == op) {
                    self.state.current = None;
                    self.state.clock.reset();
                }
            }
        }
    }

    fn respond<T>(&self, name: &str, reply: Reply<T>, result: Result<T, PlayerError>) {
        if let Err(e) = &result {
            error!("[{}] {} failed: {}", self.guild_id, name, e);
        }
        // Caller may have stopped waiting
        let _ = reply.send(result);
    }

    async fn pause(&mut self) -> Result<bool, PlayerError> {
        if self.state.paused {
            return Ok(true);
        }

        let permit = self
            .controls
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PlayerError::Internal("pause gate closed".to_string()))?;

        self.pause_permit = Some(permit);
        self.state.paused = true;
        self.controls.set_paused(true);
        self.state.clock.freeze();
        info!("[{}] Paused", self.guild_id);
        Ok(true)
    }

    fn resume(&mut self) {
        if !self.state.paused {
            return;
        }

        self.state.paused = false;
        self.controls.set_paused(false);
        if self.state.current.as_ref().is_some_and(|c| c.opened) {
            self.state.clock.start();
        }
        self.pause_permit = None;
        info!("[{}] Resumed", self.guild_id);
    }

    fn advance(&mut self) -> Advance {
        if !self.state.has_pending() {
            self.copy_running = false;
            debug!("[{}] Queue drained, copy loop stopping", self.guild_id);
            self.events.queue_empty();
            return Advance::Idle;
        }

        let connection = match &self.connection {
            Some(connection) if connection.is_connected() => connection.clone(),
            _ => return Advance::WaitForConnection,
        };

        let Some(track) = self.state.take_next() else {
            return Advance::Idle;
        };

        let op = self.next_op;
        self.next_op += 1;
        let cancel = self.lifetime.child_token();

        self.state.current = Some(CurrentTrack {
            op,
            track: track.clone(),
            cancel: cancel.clone(),
            opened: false,
        });
        self.state.clock.reset();

        Advance::Play(Assignment {
            op,
            track,
            cancel,
            connection,
        })
    }

    fn ensure_copy_loop(&mut self) {
        if self.copy_running {
            return;
        }
        self.copy_running = true;
        self.copy_task = Some(tokio::spawn(self.copy.clone().run()));
    }

    fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.is_connected())
    }

    async fn teardown(&mut self) {
        info!("[{}] Player shutting down", self.guild_id);
        self.lifetime.cancel();
        self.state.cancel_current();

        // Pending callers observe a closed actor
        self.mailbox.close();
        while self.mailbox.try_recv().is_ok() {}

        self.pause_permit = None;
        self.controls.gate.close();

        if let Some(task) = self.copy_task.take() {
            if let Err(e) = task.await {
                warn!("[{}] Copy loop task failed: {}", self.guild_id, e);
            }
        }

        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.disconnect(CancellationToken::new()).await {
                warn!("[{}] Disconnect failed: {}", self.guild_id, e);
            }
        }

        info!("[{}] Player disposed", self.guild_id);
    }
}
