//! Field-level state replication from a room to its participants.
//!
//! The room keeps a shadow copy of the state as last replicated. After every
//! mutation the [`Replicator`] diffs the canonical state against the shadow
//! and emits the minimal list of [`StateChange`]s: explicit add/remove events
//! for entity insertions and deletions, and per-field changes for everything
//! else. Applying those changes, in order, to a copy of the shadow yields the
//! canonical state again; clients rely on exactly that property.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::event::BroadcastEvent;
use crate::state::{FoodItem, Player, PowerUp, Score, SessionId, SessionState};

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

/// Replicated collection an entity lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    /// [`SessionState::players`].
    Players,
    /// [`SessionState::food_items`].
    FoodItems,
    /// [`SessionState::power_ups`].
    PowerUps,
    /// [`SessionState::score_board`].
    ScoreBoard,
}

/// A new value for one replicated field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldChange {
    /// `x` coordinate.
    X(f32),
    /// `y` coordinate.
    Y(f32),
    /// Player heading.
    Rotation(f32),
    /// Display or ingredient name.
    Name(String),
    /// Whole player inventory.
    Inventory(Vec<String>),
    /// Player completion time in seconds.
    PlayDuration(u32),
    /// Food item texture.
    Texture(String),
    /// Food item static flag.
    Static(bool),
    /// Food item picked-up flag.
    PickedUp(bool),
    /// Score board display name.
    PlayerName(String),
    /// Score board value.
    Score(u32),
}

impl FieldChange {
    /// Schema field name this change targets.
    pub fn field(&self) -> &'static str {
        match self {
            Self::X(_) => "x",
            Self::Y(_) => "y",
            Self::Rotation(_) => "rotation",
            Self::Name(_) => "name",
            Self::Inventory(_) => "inventory",
            Self::PlayDuration(_) => "playDuration",
            Self::Texture(_) => "texture",
            Self::Static(_) => "static",
            Self::PickedUp(_) => "isPickedUp",
            Self::PlayerName(_) => "playerName",
            Self::Score(_) => "score",
        }
    }
}

/// A complete entity, as carried by an add event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EntityRecord {
    /// A player keyed by its session id.
    Player {
        /// Session id.
        id: SessionId,
        /// Player fields.
        player: Player,
    },
    /// A food item.
    FoodItem(FoodItem),
    /// A power-up.
    PowerUp(PowerUp),
    /// A score board entry.
    Score(Score),
}

impl EntityRecord {
    /// Collection this record belongs to.
    pub fn collection(&self) -> Collection {
        match self {
            Self::Player { .. } => Collection::Players,
            Self::FoodItem(_) => Collection::FoodItems,
            Self::PowerUp(_) => Collection::PowerUps,
            Self::Score(_) => Collection::ScoreBoard,
        }
    }

    /// Key of the record within its collection.
    pub fn id(&self) -> &str {
        match self {
            Self::Player { id, .. } => id,
            Self::FoodItem(item) => &item.id,
            Self::PowerUp(power_up) => &power_up.id,
            Self::Score(score) => &score.player_id,
        }
    }
}

/// One replicated mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StateChange {
    /// An entity was inserted.
    Added(EntityRecord),
    /// An entity was removed.
    Removed {
        /// Collection of the removed entity.
        collection: Collection,
        /// Key of the removed entity.
        id: String,
    },
    /// Fields of an existing entity changed.
    Changed {
        /// Collection of the entity.
        collection: Collection,
        /// Key of the entity.
        id: String,
        /// New field values, in schema order.
        fields: Vec<FieldChange>,
    },
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// A replicated entity type: knows its collection and how to diff and patch
/// itself field by field.
pub trait Schema: Clone + PartialEq {
    /// Collection holding entities of this type.
    const COLLECTION: Collection;

    /// Field changes that turn `self` into `newer`.
    fn diff(&self, newer: &Self) -> Vec<FieldChange>;

    /// Applies one field change. Returns `false` if the field is not part of
    /// this schema.
    fn apply(&mut self, change: &FieldChange) -> bool;

    /// Full record for an add event.
    fn record(&self, id: &str) -> EntityRecord;
}

fn diff_field<T: PartialEq + Clone>(
    out: &mut Vec<FieldChange>,
    old: &T,
    new: &T,
    make: fn(T) -> FieldChange,
) {
    if old != new {
        out.push(make(new.clone()));
    }
}

impl Schema for Player {
    const COLLECTION: Collection = Collection::Players;

    fn diff(&self, newer: &Self) -> Vec<FieldChange> {
        let mut out = Vec::new();
        diff_field(&mut out, &self.x, &newer.x, FieldChange::X);
        diff_field(&mut out, &self.y, &newer.y, FieldChange::Y);
        diff_field(&mut out, &self.rotation, &newer.rotation, FieldChange::Rotation);
        diff_field(&mut out, &self.name, &newer.name, FieldChange::Name);
        diff_field(&mut out, &self.inventory, &newer.inventory, FieldChange::Inventory);
        diff_field(
            &mut out,
            &self.play_duration,
            &newer.play_duration,
            FieldChange::PlayDuration,
        );
        out
    }

    fn apply(&mut self, change: &FieldChange) -> bool {
        match change {
            FieldChange::X(v) => self.x = *v,
            FieldChange::Y(v) => self.y = *v,
            FieldChange::Rotation(v) => self.rotation = *v,
            FieldChange::Name(v) => self.name.clone_from(v),
            FieldChange::Inventory(v) => self.inventory.clone_from(v),
            FieldChange::PlayDuration(v) => self.play_duration = *v,
            _ => return false,
        }
        true
    }

    fn record(&self, id: &str) -> EntityRecord {
        EntityRecord::Player {
            id: id.to_string(),
            player: self.clone(),
        }
    }
}

impl Schema for FoodItem {
    const COLLECTION: Collection = Collection::FoodItems;

    fn diff(&self, newer: &Self) -> Vec<FieldChange> {
        let mut out = Vec::new();
        diff_field(&mut out, &self.x, &newer.x, FieldChange::X);
        diff_field(&mut out, &self.y, &newer.y, FieldChange::Y);
        diff_field(&mut out, &self.name, &newer.name, FieldChange::Name);
        diff_field(&mut out, &self.texture, &newer.texture, FieldChange::Texture);
        diff_field(&mut out, &self.is_static, &newer.is_static, FieldChange::Static);
        diff_field(
            &mut out,
            &self.is_picked_up,
            &newer.is_picked_up,
            FieldChange::PickedUp,
        );
        out
    }

    fn apply(&mut self, change: &FieldChange) -> bool {
        match change {
            FieldChange::X(v) => self.x = *v,
            FieldChange::Y(v) => self.y = *v,
            FieldChange::Name(v) => self.name.clone_from(v),
            FieldChange::Texture(v) => self.texture.clone_from(v),
            FieldChange::Static(v) => self.is_static = *v,
            FieldChange::PickedUp(v) => self.is_picked_up = *v,
            _ => return false,
        }
        true
    }

    fn record(&self, _id: &str) -> EntityRecord {
        EntityRecord::FoodItem(self.clone())
    }
}

impl Schema for PowerUp {
    const COLLECTION: Collection = Collection::PowerUps;

    fn diff(&self, newer: &Self) -> Vec<FieldChange> {
        let mut out = Vec::new();
        diff_field(&mut out, &self.x, &newer.x, FieldChange::X);
        diff_field(&mut out, &self.y, &newer.y, FieldChange::Y);
        diff_field(&mut out, &self.name, &newer.name, FieldChange::Name);
        out
    }

    fn apply(&mut self, change: &FieldChange) -> bool {
        match change {
            FieldChange::X(v) => self.x = *v,
            FieldChange::Y(v) => self.y = *v,
            FieldChange::Name(v) => self.name.clone_from(v),
            _ => return false,
        }
        true
    }

    fn record(&self, _id: &str) -> EntityRecord {
        EntityRecord::PowerUp(self.clone())
    }
}

impl Schema for Score {
    const COLLECTION: Collection = Collection::ScoreBoard;

    fn diff(&self, newer: &Self) -> Vec<FieldChange> {
        let mut out = Vec::new();
        diff_field(
            &mut out,
            &self.player_name,
            &newer.player_name,
            FieldChange::PlayerName,
        );
        diff_field(&mut out, &self.score, &newer.score, FieldChange::Score);
        out
    }

    fn apply(&mut self, change: &FieldChange) -> bool {
        match change {
            FieldChange::PlayerName(v) => self.player_name.clone_from(v),
            FieldChange::Score(v) => self.score = *v,
            _ => return false,
        }
        true
    }

    fn record(&self, _id: &str) -> EntityRecord {
        EntityRecord::Score(self.clone())
    }
}

// ---------------------------------------------------------------------------
// Diff / apply
// ---------------------------------------------------------------------------

fn diff_collection<T: Schema>(
    old: &HashMap<String, T>,
    new: &HashMap<String, T>,
    out: &mut Vec<StateChange>,
) {
    for id in old.keys() {
        if !new.contains_key(id) {
            out.push(StateChange::Removed {
                collection: T::COLLECTION,
                id: id.clone(),
            });
        }
    }

    for (id, current) in new {
        match old.get(id) {
            None => out.push(StateChange::Added(current.record(id))),
            Some(previous) if previous != current => {
                out.push(StateChange::Changed {
                    collection: T::COLLECTION,
                    id: id.clone(),
                    fields: previous.diff(current),
                });
            }
            Some(_) => {}
        }
    }
}

/// Computes the changes that turn `old` into `new`.
pub fn diff_state(old: &SessionState, new: &SessionState) -> Vec<StateChange> {
    let mut out = Vec::new();
    diff_collection(&old.players, &new.players, &mut out);
    diff_collection(&old.food_items, &new.food_items, &mut out);
    diff_collection(&old.power_ups, &new.power_ups, &mut out);
    diff_collection(&old.score_board, &new.score_board, &mut out);
    out
}

/// Errors raised when a change does not fit the state it is applied to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// The addressed entity is not in the collection.
    #[error("unknown {collection:?} entity {id}")]
    UnknownEntity {
        /// Addressed collection.
        collection: Collection,
        /// Addressed key.
        id: String,
    },
    /// The field does not exist on entities of the collection.
    #[error("field {field} does not belong to {collection:?}")]
    ForeignField {
        /// Addressed collection.
        collection: Collection,
        /// Offending field name.
        field: &'static str,
    },
}

fn apply_fields<T: Schema>(
    entity: Option<&mut T>,
    id: &str,
    fields: &[FieldChange],
) -> Result<(), ApplyError> {
    let entity = entity.ok_or_else(|| ApplyError::UnknownEntity {
        collection: T::COLLECTION,
        id: id.to_string(),
    })?;
    for change in fields {
        if !entity.apply(change) {
            return Err(ApplyError::ForeignField {
                collection: T::COLLECTION,
                field: change.field(),
            });
        }
    }
    Ok(())
}

/// Applies one change to `state`.
pub fn apply_change(state: &mut SessionState, change: &StateChange) -> Result<(), ApplyError> {
    match change {
        StateChange::Added(record) => {
            match record.clone() {
                EntityRecord::Player { id, player } => {
                    state.players.insert(id, player);
                }
                EntityRecord::FoodItem(item) => {
                    state.food_items.insert(item.id.clone(), item);
                }
                EntityRecord::PowerUp(power_up) => {
                    state.power_ups.insert(power_up.id.clone(), power_up);
                }
                EntityRecord::Score(score) => {
                    state.score_board.insert(score.player_id.clone(), score);
                }
            }
            Ok(())
        }
        StateChange::Removed { collection, id } => {
            let removed = match collection {
                Collection::Players => state.players.remove(id).is_some(),
                Collection::FoodItems => state.food_items.remove(id).is_some(),
                Collection::PowerUps => state.power_ups.remove(id).is_some(),
                Collection::ScoreBoard => state.score_board.remove(id).is_some(),
            };
            if removed {
                Ok(())
            } else {
                Err(ApplyError::UnknownEntity {
                    collection: *collection,
                    id: id.clone(),
                })
            }
        }
        StateChange::Changed {
            collection,
            id,
            fields,
        } => match collection {
            Collection::Players => apply_fields(state.players.get_mut(id), id, fields),
            Collection::FoodItems => apply_fields(state.food_items.get_mut(id), id, fields),
            Collection::PowerUps => apply_fields(state.power_ups.get_mut(id), id, fields),
            Collection::ScoreBoard => apply_fields(state.score_board.get_mut(id), id, fields),
        },
    }
}

// ---------------------------------------------------------------------------
// Replicator
// ---------------------------------------------------------------------------

/// Server-side replication tracker for one room.
#[derive(Debug, Default)]
pub struct Replicator {
    shadow: SessionState,
}

impl Replicator {
    /// Creates a replicator whose shadow is the empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Diffs `state` against the shadow, advances the shadow, and returns the
    /// changes. Returns an empty list when nothing changed.
    pub fn collect(&mut self, state: &SessionState) -> Vec<StateChange> {
        let changes = diff_state(&self.shadow, state);
        for change in &changes {
            if let Err(err) = apply_change(&mut self.shadow, change) {
                error!("Shadow diverged ({err}), resynchronizing");
                self.shadow = state.clone();
                break;
            }
        }
        changes
    }

    /// State as last replicated. Matches what every joined participant holds.
    pub fn shadow(&self) -> &SessionState {
        &self.shadow
    }
}

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

/// Full snapshot sent to a participant as it joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    /// Joined room.
    pub room_id: String,
    /// Session id assigned to the joiner.
    pub session_id: SessionId,
    /// Replicated state at the moment of joining.
    pub state: SessionState,
}

/// Everything a room sends to a participant, in delivery order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Delivery {
    /// Initial snapshot. Always the first delivery.
    Welcome(Welcome),
    /// Changes produced by one mutation.
    Patch(Vec<StateChange>),
    /// Out-of-band broadcast.
    Event(BroadcastEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_items() -> SessionState {
        let mut state = SessionState::new();
        state
            .players
            .insert("a".to_string(), Player::new("Alice", 1.0, 2.0));
        for (id, name) in [("carrot-1", "Carrot"), ("corn-2", "Corn")] {
            state.food_items.insert(
                id.to_string(),
                FoodItem {
                    id: id.to_string(),
                    name: name.to_string(),
                    is_static: true,
                    ..FoodItem::default()
                },
            );
        }
        state
    }

    #[test]
    fn test_first_collect_adds_everything() {
        let state = state_with_items();
        let mut replicator = Replicator::new();
        let changes = replicator.collect(&state);

        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|c| matches!(c, StateChange::Added(_))));
        assert_eq!(replicator.shadow(), &state);
    }

    #[test]
    fn test_unchanged_state_produces_no_changes() {
        let state = state_with_items();
        let mut replicator = Replicator::new();
        replicator.collect(&state);
        assert!(replicator.collect(&state).is_empty());
    }

    #[test]
    fn test_only_changed_fields_are_sent() {
        let mut state = state_with_items();
        let mut replicator = Replicator::new();
        replicator.collect(&state);

        let player = state.players.get_mut("a").unwrap();
        player.x = 50.0;
        player.inventory.push("carrot-1".to_string());
        state.food_items.get_mut("carrot-1").unwrap().is_picked_up = true;

        let mut changes = replicator.collect(&state);
        changes.sort_by_key(|c| match c {
            StateChange::Changed { collection, .. } => *collection as u8,
            _ => u8::MAX,
        });

        assert_eq!(
            changes,
            vec![
                StateChange::Changed {
                    collection: Collection::Players,
                    id: "a".to_string(),
                    fields: vec![
                        FieldChange::X(50.0),
                        FieldChange::Inventory(vec!["carrot-1".to_string()]),
                    ],
                },
                StateChange::Changed {
                    collection: Collection::FoodItems,
                    id: "carrot-1".to_string(),
                    fields: vec![FieldChange::PickedUp(true)],
                },
            ]
        );
    }

    #[test]
    fn test_removal_is_explicit() {
        let mut state = state_with_items();
        let mut replicator = Replicator::new();
        replicator.collect(&state);

        state.players.remove("a");
        let changes = replicator.collect(&state);
        assert_eq!(
            changes,
            vec![StateChange::Removed {
                collection: Collection::Players,
                id: "a".to_string(),
            }]
        );
    }

    #[test]
    fn test_applying_changes_reconstructs_state() {
        let mut state = state_with_items();
        let mut replicator = Replicator::new();
        replicator.collect(&state);
        let mut mirror = replicator.shadow().clone();

        state.players.get_mut("a").unwrap().rotation = 1.5;
        state.food_items.remove("corn-2");
        state.score_board.insert(
            "a".to_string(),
            Score {
                player_id: "a".to_string(),
                player_name: "Alice".to_string(),
                score: 42,
            },
        );

        for change in replicator.collect(&state) {
            apply_change(&mut mirror, &change).unwrap();
        }
        assert_eq!(mirror, state);
    }

    #[test]
    fn test_apply_to_unknown_entity_fails() {
        let mut state = SessionState::new();
        let change = StateChange::Changed {
            collection: Collection::Players,
            id: "ghost".to_string(),
            fields: vec![FieldChange::X(1.0)],
        };
        assert!(matches!(
            apply_change(&mut state, &change),
            Err(ApplyError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn test_foreign_field_rejected() {
        let mut state = state_with_items();
        let change = StateChange::Changed {
            collection: Collection::FoodItems,
            id: "carrot-1".to_string(),
            fields: vec![FieldChange::Inventory(Vec::new())],
        };
        assert_eq!(
            apply_change(&mut state, &change),
            Err(ApplyError::ForeignField {
                collection: Collection::FoodItems,
                field: "inventory",
            })
        );
    }

    #[test]
    fn test_patch_survives_postcard() {
        let delivery = Delivery::Patch(vec![StateChange::Changed {
            collection: Collection::Players,
            id: "a".to_string(),
            fields: vec![FieldChange::Rotation(3.0), FieldChange::PlayDuration(61)],
        }]);
        let bytes = postcard::to_allocvec(&delivery).unwrap();
        let decoded: Delivery = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, delivery);
    }
}
