//! Per-room actor: a single tokio task that owns one [`SessionState`] and
//! applies commands from a bounded inbox strictly in receipt order.
//!
//! All mutation of a room's state happens inside the room task. Everything
//! outside the task talks to it through a cloneable [`RoomHandle`].

use std::collections::HashMap;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::intent::{Intent, IntentError, IntentHandler};
use crate::lifecycle::{JoinOptions, Lifecycle, WorldSettings};
use crate::registry::Directory;
use crate::replication::{Delivery, Replicator, Welcome};
use crate::state::{SessionId, SessionState};

/// Sending half of a participant's bounded delivery queue.
pub type Outbox = mpsc::Sender<Delivery>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Room sizing and timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoomSettings {
    /// Maximum participants per room.
    pub capacity: usize,
    /// Maximum number of live rooms.
    pub max_rooms: usize,
    /// Bound of each room's command inbox.
    pub inbox_capacity: usize,
    /// Bound of each participant's delivery queue.
    pub outbox_capacity: usize,
    /// How long an empty room survives before it is disposed.
    pub dispose_grace_ms: u64,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            capacity: 4,
            max_rooms: 64,
            inbox_capacity: 256,
            outbox_capacity: 256,
            dispose_grace_ms: 5_000,
        }
    }
}

impl RoomSettings {
    /// Grace period as a [`Duration`].
    pub fn dispose_grace(&self) -> Duration {
        Duration::from_millis(self.dispose_grace_ms)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by [`RoomHandle`] operations.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RoomError {
    /// The room has been disposed.
    #[error("room {0} is closed")]
    Closed(String),
    /// The intent failed boundary validation and never reached the room.
    #[error("intent rejected: {0}")]
    Rejected(#[from] IntentError),
}

// ---------------------------------------------------------------------------
// Commands & handle
// ---------------------------------------------------------------------------

pub(crate) enum RoomCommand {
    Join {
        session_id: SessionId,
        options: JoinOptions,
        outbox: Outbox,
        reply: oneshot::Sender<()>,
    },
    Intent {
        session_id: SessionId,
        intent: Intent,
    },
    Leave {
        session_id: SessionId,
    },
    Inspect {
        reply: oneshot::Sender<SessionState>,
    },
    Dispose,
}

/// Cloneable address of a running room.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    id: String,
    selector: String,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Room id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Selector (room type name) the room was created under.
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Returns `true` once the room's task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Validates `intent` and queues it for `session_id`. Waits for inbox
    /// space when the room is busy.
    pub async fn send_intent(&self, session_id: &str, intent: Intent) -> Result<(), RoomError> {
        if let Err(err) = IntentHandler::validate(&intent) {
            warn!("Rejected {} from {session_id}: {err}", intent.name());
            return Err(err.into());
        }
        self.send(RoomCommand::Intent {
            session_id: session_id.to_string(),
            intent,
        })
        .await
    }

    /// Copy of the room's canonical state.
    pub async fn state(&self) -> Result<SessionState, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Inspect { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    pub(crate) async fn join(
        &self,
        session_id: &str,
        options: JoinOptions,
        outbox: Outbox,
    ) -> Result<(), RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Join {
            session_id: session_id.to_string(),
            options,
            outbox,
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.closed())
    }

    pub(crate) async fn leave(&self, session_id: &str) -> Result<(), RoomError> {
        self.send(RoomCommand::Leave {
            session_id: session_id.to_string(),
        })
        .await
    }

    pub(crate) async fn dispose(&self) -> Result<(), RoomError> {
        self.send(RoomCommand::Dispose).await
    }

    async fn send(&self, command: RoomCommand) -> Result<(), RoomError> {
        self.tx.send(command).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> RoomError {
        RoomError::Closed(self.id.clone())
    }
}

// ---------------------------------------------------------------------------
// Room actor
// ---------------------------------------------------------------------------

pub(crate) struct Room {
    id: String,
    state: SessionState,
    lifecycle: Lifecycle,
    replicator: Replicator,
    outboxes: HashMap<SessionId, Outbox>,
    evicted: Vec<SessionId>,
    grace: Duration,
    directory: Arc<Directory>,
}

impl Room {
    /// Spawns the room task and returns its handle.
    pub(crate) fn spawn(
        id: String,
        selector: String,
        settings: &RoomSettings,
        world: WorldSettings,
        directory: Arc<Directory>,
    ) -> RoomHandle {
        let (tx, rx) = mpsc::channel(settings.inbox_capacity.max(1));
        let room = Room {
            id: id.clone(),
            state: SessionState::new(),
            lifecycle: Lifecycle::new(world),
            replicator: Replicator::new(),
            outboxes: HashMap::new(),
            evicted: Vec::new(),
            grace: settings.dispose_grace(),
            directory,
        };
        info!("Room {id} created ({selector})");
        tokio::spawn(room.run(rx));
        RoomHandle { id, selector, tx }
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<RoomCommand>) {
        // A freshly created room counts as vacant until its first join lands.
        let mut vacant_since = Some(Instant::now());

        loop {
            let deadline = vacant_since.map(|since| since + self.grace);
            let expiry = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                command = inbox.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle(command).await {
                        break;
                    }
                    vacant_since = match (self.state.players.is_empty(), vacant_since) {
                        (false, _) => None,
                        (true, Some(since)) => Some(since),
                        (true, None) => Some(Instant::now()),
                    };
                }
                () = expiry => {
                    if self.directory.remove_if_vacant(&self.id).await {
                        break;
                    }
                    // A seat was reserved meanwhile; its join is in flight.
                    vacant_since = Some(Instant::now());
                }
            }
        }

        info!(
            "Room {} disposed ({} players dropped)",
            self.id,
            self.state.player_count()
        );
    }

    /// Applies one command. Returns `false` when the room must stop.
    async fn handle(&mut self, command: RoomCommand) -> bool {
        match command {
            RoomCommand::Join {
                session_id,
                options,
                outbox,
                reply,
            } => {
                self.join(session_id, &options, outbox);
                let _ = reply.send(());
            }
            RoomCommand::Intent { session_id, intent } => self.apply_intent(&session_id, &intent),
            RoomCommand::Leave { session_id } => self.leave(&session_id),
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.state.clone());
            }
            RoomCommand::Dispose => return false,
        }
        self.drain_evictions().await;
        true
    }

    fn join(&mut self, session_id: SessionId, options: &JoinOptions, outbox: Outbox) {
        let event = self
            .lifecycle
            .join(&mut self.state, &session_id, options);
        self.publish_patch();

        let welcome = Welcome {
            room_id: self.id.clone(),
            session_id: session_id.clone(),
            state: self.replicator.shadow().clone(),
        };
        self.outboxes.insert(session_id.clone(), outbox);
        self.deliver(&session_id, Delivery::Welcome(welcome));
        self.broadcast(Delivery::Event(event));
        info!(
            "Room {}: {session_id} joined ({} players)",
            self.id,
            self.state.player_count()
        );
    }

    fn apply_intent(&mut self, session_id: &str, intent: &Intent) {
        if !self.outboxes.contains_key(session_id) {
            debug!(
                "Room {}: dropping {} from non-member {session_id}",
                self.id,
                intent.name()
            );
            return;
        }
        let event = IntentHandler::apply(&mut self.state, session_id, intent);
        self.publish_patch();
        if let Some(event) = event {
            self.broadcast(Delivery::Event(event));
        }
    }

    fn leave(&mut self, session_id: &str) {
        self.outboxes.remove(session_id);
        let Some(event) = self.lifecycle.leave(&mut self.state, session_id) else {
            return;
        };
        self.publish_patch();
        self.broadcast(Delivery::Event(event));
        info!(
            "Room {}: {session_id} left ({} players)",
            self.id,
            self.state.player_count()
        );
    }

    /// Evicts participants whose outbox overflowed or closed. Each eviction
    /// broadcasts and may overflow further outboxes, hence the loop.
    async fn drain_evictions(&mut self) {
        while let Some(session_id) = self.evicted.pop() {
            if !self.outboxes.contains_key(&session_id) {
                continue;
            }
            warn!("Room {}: evicting {session_id}", self.id);
            self.directory.release_seat(&self.id, &session_id).await;
            self.leave(&session_id);
        }
    }

    fn publish_patch(&mut self) {
        let changes = self.replicator.collect(&self.state);
        if !changes.is_empty() {
            self.broadcast(Delivery::Patch(changes));
        }
    }

    fn broadcast(&mut self, delivery: Delivery) {
        for (session_id, outbox) in &self.outboxes {
            if outbox.try_send(delivery.clone()).is_err() {
                self.evicted.push(session_id.clone());
            }
        }
    }

    fn deliver(&mut self, session_id: &str, delivery: Delivery) {
        if let Some(outbox) = self.outboxes.get(session_id)
            && outbox.try_send(delivery).is_err()
        {
            self.evicted.push(session_id.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
