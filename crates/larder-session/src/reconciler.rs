//! Client-side reconciliation: keeps a read-only mirror of a room's state
//! and notifies registered callbacks as deliveries are applied.
//!
//! The reconciler is transport-agnostic. Feed it every [`Delivery`] received
//! from the room, in order, starting with the `Welcome` snapshot.
//!
//! Callback timing:
//! - `on_add` fires after the entity is inserted into the mirror.
//! - `on_change` fires after the fields are applied, with the changed fields.
//! - `on_remove` fires before the entity leaves the mirror, so the callback
//!   still sees its last values.

use std::collections::HashMap;

use crate::event::BroadcastEvent;
use crate::replication::{
    ApplyError, Collection, Delivery, FieldChange, StateChange, apply_change,
};
use crate::state::{FoodItem, Player, PowerUp, Score, SessionId, SessionState};

/// Borrowed view of one mirrored entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityRef<'a> {
    /// A player and its session id.
    Player {
        /// Session id.
        id: &'a str,
        /// Player fields.
        player: &'a Player,
    },
    /// A food item.
    FoodItem(&'a FoodItem),
    /// A power-up.
    PowerUp(&'a PowerUp),
    /// A score board entry.
    Score(&'a Score),
}

impl EntityRef<'_> {
    /// Key within the collection.
    pub fn id(&self) -> &str {
        match self {
            Self::Player { id, .. } => id,
            Self::FoodItem(item) => &item.id,
            Self::PowerUp(power_up) => &power_up.id,
            Self::Score(score) => &score.player_id,
        }
    }

    /// Collection of the entity.
    pub fn collection(&self) -> Collection {
        match self {
            Self::Player { .. } => Collection::Players,
            Self::FoodItem(_) => Collection::FoodItems,
            Self::PowerUp(_) => Collection::PowerUps,
            Self::Score(_) => Collection::ScoreBoard,
        }
    }
}

/// Errors from [`Reconciler::apply`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ReconcileError {
    /// A patch or event arrived before the welcome snapshot.
    #[error("delivery received before the welcome snapshot")]
    NotJoined,
    /// A change could not be applied to the mirror.
    #[error("mirror out of sync: {0}")]
    Apply(#[from] ApplyError),
}

type EntityCallback = Box<dyn FnMut(EntityRef<'_>) + Send>;
type ChangeCallback = Box<dyn FnMut(EntityRef<'_>, &[FieldChange]) + Send>;
type MessageCallback = Box<dyn FnMut(&BroadcastEvent) + Send>;

/// Local mirror of one room plus change callbacks.
#[derive(Default)]
pub struct Reconciler {
    mirror: SessionState,
    room_id: Option<String>,
    session_id: Option<SessionId>,
    on_add: HashMap<Collection, Vec<EntityCallback>>,
    on_remove: HashMap<Collection, Vec<EntityCallback>>,
    on_change: HashMap<Collection, Vec<ChangeCallback>>,
    on_message: HashMap<String, Vec<MessageCallback>>,
}

impl Reconciler {
    /// Creates an unjoined reconciler with an empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrored state.
    pub fn state(&self) -> &SessionState {
        &self.mirror
    }

    /// Own session id, once welcomed.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Joined room id, once welcomed.
    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    /// Registers a callback for entities added to `collection`.
    pub fn on_add(
        &mut self,
        collection: Collection,
        callback: impl FnMut(EntityRef<'_>) + Send + 'static,
    ) {
        self.on_add
            .entry(collection)
            .or_default()
            .push(Box::new(callback));
    }

    /// Registers a callback for entities removed from `collection`.
    pub fn on_remove(
        &mut self,
        collection: Collection,
        callback: impl FnMut(EntityRef<'_>) + Send + 'static,
    ) {
        self.on_remove
            .entry(collection)
            .or_default()
            .push(Box::new(callback));
    }

    /// Registers a callback for field changes in `collection`.
    pub fn on_change(
        &mut self,
        collection: Collection,
        callback: impl FnMut(EntityRef<'_>, &[FieldChange]) + Send + 'static,
    ) {
        self.on_change
            .entry(collection)
            .or_default()
            .push(Box::new(callback));
    }

    /// Registers a callback for broadcast events named `name`
    /// (e.g. `"itemPickedUp"`).
    pub fn on_message(
        &mut self,
        name: &str,
        callback: impl FnMut(&BroadcastEvent) + Send + 'static,
    ) {
        self.on_message
            .entry(name.to_string())
            .or_default()
            .push(Box::new(callback));
    }

    /// Applies one delivery to the mirror and fires callbacks.
    pub fn apply(&mut self, delivery: &Delivery) -> Result<(), ReconcileError> {
        match delivery {
            Delivery::Welcome(welcome) => {
                self.room_id = Some(welcome.room_id.clone());
                self.session_id = Some(welcome.session_id.clone());
                self.mirror = welcome.state.clone();
                for (collection, id) in entity_keys(&self.mirror) {
                    fire(&mut self.on_add, &self.mirror, collection, &id);
                }
                Ok(())
            }
            Delivery::Patch(changes) => {
                self.ensure_joined()?;
                for change in changes {
                    self.apply_state_change(change)?;
                }
                Ok(())
            }
            Delivery::Event(event) => {
                self.ensure_joined()?;
                if let Some(callbacks) = self.on_message.get_mut(event.name()) {
                    for callback in callbacks {
                        callback(event);
                    }
                }
                Ok(())
            }
        }
    }

    fn ensure_joined(&self) -> Result<(), ReconcileError> {
        if self.session_id.is_some() {
            Ok(())
        } else {
            Err(ReconcileError::NotJoined)
        }
    }

    fn apply_state_change(&mut self, change: &StateChange) -> Result<(), ReconcileError> {
        match change {
            StateChange::Added(record) => {
                apply_change(&mut self.mirror, change)?;
                fire(&mut self.on_add, &self.mirror, record.collection(), record.id());
            }
            StateChange::Removed { collection, id } => {
                fire(&mut self.on_remove, &self.mirror, *collection, id);
                apply_change(&mut self.mirror, change)?;
            }
            StateChange::Changed {
                collection,
                id,
                fields,
            } => {
                apply_change(&mut self.mirror, change)?;
                if let (Some(callbacks), Some(entity)) = (
                    self.on_change.get_mut(collection),
                    lookup(&self.mirror, *collection, id),
                ) {
                    for callback in callbacks {
                        callback(entity, fields);
                    }
                }
            }
        }
        Ok(())
    }
}

fn fire(
    callbacks: &mut HashMap<Collection, Vec<EntityCallback>>,
    state: &SessionState,
    collection: Collection,
    id: &str,
) {
    if let (Some(callbacks), Some(entity)) =
        (callbacks.get_mut(&collection), lookup(state, collection, id))
    {
        for callback in callbacks {
            callback(entity);
        }
    }
}

fn lookup<'a>(state: &'a SessionState, collection: Collection, id: &str) -> Option<EntityRef<'a>> {
    match collection {
        Collection::Players => state
            .players
            .get_key_value(id)
            .map(|(id, player)| EntityRef::Player { id, player }),
        Collection::FoodItems => state.food_items.get(id).map(EntityRef::FoodItem),
        Collection::PowerUps => state.power_ups.get(id).map(EntityRef::PowerUp),
        Collection::ScoreBoard => state.score_board.get(id).map(EntityRef::Score),
    }
}

fn entity_keys(state: &SessionState) -> Vec<(Collection, String)> {
    let players = state.players.keys().map(|id| (Collection::Players, id));
    let items = state.food_items.keys().map(|id| (Collection::FoodItems, id));
    let power_ups = state.power_ups.keys().map(|id| (Collection::PowerUps, id));
    let scores = state.score_board.keys().map(|id| (Collection::ScoreBoard, id));
    players
        .chain(items)
        .chain(power_ups)
        .chain(scores)
        .map(|(collection, id)| (collection, id.clone()))
        .collect()
}
