//! Replicated session state: players, food items, power-ups and the score
//! board.
//!
//! Every field here is part of the replicated schema. Field-level diffing
//! lives in [`crate::replication`]; this module only defines the data and
//! its defaults.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Session-scoped participant identifier, assigned at join.
pub type SessionId = String;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A connected participant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// World X coordinate.
    pub x: f32,
    /// World Y coordinate.
    pub y: f32,
    /// Heading in radians.
    pub rotation: f32,
    /// Display name, fixed at join.
    pub name: String,
    /// Held item ids. The last entry is the most recently picked up.
    pub inventory: Vec<String>,
    /// Seconds the player took to finish; 0 until completion.
    pub play_duration: u32,
}

impl Player {
    /// Creates a player at the given spawn point with heading zero.
    pub fn new(name: impl Into<String>, x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns `true` if `item_id` is anywhere in the inventory.
    pub fn holds(&self, item_id: &str) -> bool {
        self.inventory.iter().any(|held| held == item_id)
    }
}

/// A pickable ingredient lying in the world.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FoodItem {
    /// Unique item id.
    pub id: String,
    /// World X coordinate.
    pub x: f32,
    /// World Y coordinate.
    pub y: f32,
    /// Ingredient name (e.g. "Carrot").
    pub name: String,
    /// Visual identifier used by the renderer.
    pub texture: String,
    /// Static items never move on their own.
    #[serde(rename = "static")]
    pub is_static: bool,
    /// Set while some player holds the item.
    pub is_picked_up: bool,
}

/// A collectable power-up. Removed from the state once collected.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PowerUp {
    /// Unique power-up id.
    pub id: String,
    /// World X coordinate.
    pub x: f32,
    /// World Y coordinate.
    pub y: f32,
    /// Effect identifier (e.g. "dash").
    pub name: String,
}

/// Score board entry, keyed by the finishing player's session id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    /// Session id of the finishing player.
    pub player_id: SessionId,
    /// Display name captured at completion.
    pub player_name: String,
    /// Score derived from the play duration.
    pub score: u32,
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Root aggregate of a room. Exactly one exists per room and only the room's
/// own task mutates it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Connected players by session id.
    pub players: HashMap<SessionId, Player>,
    /// Food items by item id.
    pub food_items: HashMap<String, FoodItem>,
    /// Uncollected power-ups by power-up id.
    pub power_ups: HashMap<String, PowerUp>,
    /// Completion records by session id.
    pub score_board: HashMap<SessionId, Score>,
}

impl SessionState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connected players.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Returns the player that currently holds `item_id`, if any.
    pub fn holder_of(&self, item_id: &str) -> Option<&str> {
        self.players
            .iter()
            .find(|(_, player)| player.holds(item_id))
            .map(|(id, _)| id.as_str())
    }
}
