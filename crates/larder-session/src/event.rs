//! Out-of-band broadcast events.
//!
//! These notify every participant of something that happened in the room
//! without being tied to a single field mutation. Field mutations travel as
//! [`crate::replication::StateChange`]s instead.

use serde::{Deserialize, Serialize};

use crate::state::{Player, SessionId};

/// Room-to-all notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BroadcastEvent {
    /// A participant joined and was spawned.
    PlayerJoined {
        /// Session id of the joiner.
        session_id: SessionId,
        /// The joiner's public fields at spawn.
        player: Player,
    },
    /// A participant left the room.
    PlayerLeft {
        /// Session id of the leaver.
        session_id: SessionId,
    },
    /// An item was picked up.
    ItemPickedUp {
        /// Picked item id.
        item_id: String,
        /// Session id of the picker.
        player_id: SessionId,
    },
    /// An item was dropped back into the world.
    ItemDropped {
        /// Dropped item id.
        item_id: String,
        /// Session id of the dropper.
        player_id: SessionId,
        /// Drop X coordinate.
        x: f32,
        /// Drop Y coordinate.
        y: f32,
    },
    /// A power-up was collected and removed.
    PowerUpPickedUp {
        /// Collected power-up id.
        power_up_id: String,
        /// Session id of the collector.
        player_id: SessionId,
    },
}

impl BroadcastEvent {
    /// External message name, used by clients to key their handlers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlayerJoined { .. } => "playerJoined",
            Self::PlayerLeft { .. } => "playerLeft",
            Self::ItemPickedUp { .. } => "itemPickedUp",
            Self::ItemDropped { .. } => "itemDropped",
            Self::PowerUpPickedUp { .. } => "powerUpPickedUp",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_matches_serialized_tag() {
        let events = [
            BroadcastEvent::PlayerJoined {
                session_id: "a".to_string(),
                player: Player::new("Alice", 1.0, 2.0),
            },
            BroadcastEvent::PlayerLeft {
                session_id: "a".to_string(),
            },
            BroadcastEvent::ItemPickedUp {
                item_id: "carrot-1".to_string(),
                player_id: "a".to_string(),
            },
            BroadcastEvent::ItemDropped {
                item_id: "carrot-1".to_string(),
                player_id: "a".to_string(),
                x: 10.0,
                y: 10.0,
            },
            BroadcastEvent::PowerUpPickedUp {
                power_up_id: "dash-pickup-1".to_string(),
                player_id: "a".to_string(),
            },
        ];

        for event in &events {
            let json = serde_json::to_value(event).unwrap();
            let tag = json.as_object().unwrap().keys().next().unwrap().clone();
            assert_eq!(tag, event.name());
        }
    }

    #[test]
    fn test_payload_fields_are_camel_case() {
        let event = BroadcastEvent::ItemDropped {
            item_id: "carrot-1".to_string(),
            player_id: "a".to_string(),
            x: 10.0,
            y: 20.0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["itemDropped"]["itemId"], "carrot-1");
        assert_eq!(json["itemDropped"]["playerId"], "a");
        assert_eq!(json["itemDropped"]["y"], 20.0);
    }
}
