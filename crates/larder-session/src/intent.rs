//! Client intents and the authoritative handler that applies them.
//!
//! Clients submit [`Intent`]s describing *what they want to do*. Payloads are
//! checked with [`IntentHandler::validate`] at the room boundary, then applied
//! one at a time inside the owning room's task by [`IntentHandler::apply`].
//! Stale or racing references (unknown player, item already taken, power-up
//! already collected) are silent no-ops, never errors.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event::BroadcastEvent;
use crate::state::{Score, SessionState};

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

/// A participant's request to mutate the room state. The sender is never part
/// of the payload; the room attaches it from the connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Intent {
    /// Overwrite the sender's position and heading.
    PlayerMovement {
        /// World X coordinate.
        x: f32,
        /// World Y coordinate.
        y: f32,
        /// Heading in radians.
        rotation: f32,
    },
    /// Pick up a food item.
    ItemPickup {
        /// Target item id.
        item_id: String,
    },
    /// Drop a held food item at a position.
    ItemDrop {
        /// Item id to drop.
        item_id: String,
        /// Ingredient name as the client knows it. Informational only.
        item_name: String,
        /// Drop X coordinate.
        x: f32,
        /// Drop Y coordinate.
        y: f32,
    },
    /// Collect a power-up.
    PowerUpPicked {
        /// Target power-up id.
        power_up_id: String,
    },
    /// Report completion of the recipe.
    PlayerFinished {
        /// Seconds taken, as measured by the client.
        play_duration: u32,
    },
}

impl Intent {
    /// External message name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlayerMovement { .. } => "playerMovement",
            Self::ItemPickup { .. } => "itemPickup",
            Self::ItemDrop { .. } => "itemDrop",
            Self::PowerUpPicked { .. } => "powerUpPicked",
            Self::PlayerFinished { .. } => "playerFinished",
        }
    }
}

// ---------------------------------------------------------------------------
// IntentError
// ---------------------------------------------------------------------------

/// Reasons a payload is refused before it reaches the room.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntentError {
    /// A coordinate or heading was NaN or infinite.
    #[error("{intent}: field {field} is not finite")]
    NonFinite {
        /// Intent name.
        intent: &'static str,
        /// Offending field.
        field: &'static str,
    },

    /// An identifier field was empty.
    #[error("{intent}: field {field} is empty")]
    EmptyIdentifier {
        /// Intent name.
        intent: &'static str,
        /// Offending field.
        field: &'static str,
    },
}

// ---------------------------------------------------------------------------
// IntentHandler
// ---------------------------------------------------------------------------

/// Validates and applies [`Intent`]s against a room's [`SessionState`].
pub struct IntentHandler;

impl IntentHandler {
    /// Checks payload well-formedness. Does not look at the state.
    pub fn validate(intent: &Intent) -> Result<(), IntentError> {
        let name = intent.name();
        let finite = |field: &'static str, value: f32| {
            if value.is_finite() {
                Ok(())
            } else {
                Err(IntentError::NonFinite {
                    intent: name,
                    field,
                })
            }
        };
        let present = |field: &'static str, value: &str| {
            if value.is_empty() {
                Err(IntentError::EmptyIdentifier {
                    intent: name,
                    field,
                })
            } else {
                Ok(())
            }
        };

        match intent {
            Intent::PlayerMovement { x, y, rotation } => {
                finite("x", *x)?;
                finite("y", *y)?;
                finite("rotation", *rotation)
            }
            Intent::ItemPickup { item_id } => present("itemId", item_id),
            Intent::ItemDrop { item_id, x, y, .. } => {
                present("itemId", item_id)?;
                finite("x", *x)?;
                finite("y", *y)
            }
            Intent::PowerUpPicked { power_up_id } => present("powerUpId", power_up_id),
            Intent::PlayerFinished { .. } => Ok(()),
        }
    }

    /// Applies `intent` on behalf of `sender`. Returns the event to broadcast,
    /// if the intent produced one.
    pub fn apply(
        state: &mut SessionState,
        sender: &str,
        intent: &Intent,
    ) -> Option<BroadcastEvent> {
        match intent {
            Intent::PlayerMovement { x, y, rotation } => {
                Self::move_player(state, sender, *x, *y, *rotation);
                None
            }
            Intent::ItemPickup { item_id } => Self::pick_up_item(state, sender, item_id),
            Intent::ItemDrop {
                item_id,
                item_name,
                x,
                y,
            } => Self::drop_item(state, sender, item_id, item_name, *x, *y),
            Intent::PowerUpPicked { power_up_id } => {
                Self::pick_up_power_up(state, sender, power_up_id)
            }
            Intent::PlayerFinished { play_duration } => {
                Self::finish(state, sender, *play_duration);
                None
            }
        }
    }

    fn move_player(state: &mut SessionState, sender: &str, x: f32, y: f32, rotation: f32) {
        match state.players.get_mut(sender) {
            Some(player) => {
                player.x = x;
                player.y = y;
                player.rotation = rotation;
            }
            None => debug!("Movement from unknown player {sender} dropped"),
        }
    }

    fn pick_up_item(
        state: &mut SessionState,
        sender: &str,
        item_id: &str,
    ) -> Option<BroadcastEvent> {
        let Some(player) = state.players.get_mut(sender) else {
            debug!("Pickup from unknown player {sender} dropped");
            return None;
        };
        let item = match state.food_items.get_mut(item_id) {
            Some(item) if !item.is_picked_up => item,
            Some(_) => {
                debug!("Item {item_id} already picked up, {sender} loses the race");
                return None;
            }
            None => {
                debug!("Pickup of unknown item {item_id} by {sender} dropped");
                return None;
            }
        };

        item.is_picked_up = true;
        player.inventory.push(item_id.to_string());
        Some(BroadcastEvent::ItemPickedUp {
            item_id: item_id.to_string(),
            player_id: sender.to_string(),
        })
    }

    fn drop_item(
        state: &mut SessionState,
        sender: &str,
        item_id: &str,
        item_name: &str,
        x: f32,
        y: f32,
    ) -> Option<BroadcastEvent> {
        let Some(player) = state.players.get_mut(sender) else {
            debug!("Drop from unknown player {sender} dropped");
            return None;
        };
        let Some(index) = player.inventory.iter().rposition(|held| held == item_id) else {
            debug!("{sender} tried to drop {item_name} ({item_id}) without holding it");
            return None;
        };
        player.inventory.remove(index);

        if let Some(item) = state.food_items.get_mut(item_id) {
            item.is_picked_up = false;
            item.x = x;
            item.y = y;
        }

        Some(BroadcastEvent::ItemDropped {
            item_id: item_id.to_string(),
            player_id: sender.to_string(),
            x,
            y,
        })
    }

    fn pick_up_power_up(
        state: &mut SessionState,
        sender: &str,
        power_up_id: &str,
    ) -> Option<BroadcastEvent> {
        if !state.players.contains_key(sender) {
            debug!("Power-up pickup from unknown player {sender} dropped");
            return None;
        }
        if state.power_ups.remove(power_up_id).is_none() {
            debug!("Power-up {power_up_id} already gone, {sender} loses the race");
            return None;
        }
        Some(BroadcastEvent::PowerUpPickedUp {
            power_up_id: power_up_id.to_string(),
            player_id: sender.to_string(),
        })
    }

    fn finish(state: &mut SessionState, sender: &str, play_duration: u32) {
        let Some(player) = state.players.get_mut(sender) else {
            debug!("Completion from unknown player {sender} dropped");
            return;
        };
        player.play_duration = play_duration;
        state.score_board.insert(
            sender.to_string(),
            Score {
                player_id: sender.to_string(),
                player_name: player.name.clone(),
                score: play_duration,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
