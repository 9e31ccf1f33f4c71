//! Wire messages exchanged between a client and the server.
//!
//! Encoded with [`crate::codec`]. The enum discriminant is the type tag.

use larder_session::{BroadcastEvent, Delivery, Intent, JoinOptions, StateChange, Welcome};
use serde::{Deserialize, Serialize};

/// Client-to-server message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClientMessage {
    /// Handshake. Must be the first message on a connection.
    Join {
        /// Room selector (room type name).
        room: String,
        /// Specific room to join; `None` joins or creates under `room`.
        room_id: Option<String>,
        /// Join parameters.
        options: JoinOptions,
    },
    /// Gameplay intent for the joined room.
    Intent(Intent),
    /// Voluntary leave; the server closes the connection afterwards.
    Leave,
    /// Heartbeat probe.
    Ping {
        /// Echoed back in the matching pong.
        sequence: u32,
    },
}

/// Server-to-client message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerMessage {
    /// Join accepted; full snapshot of the room.
    Welcome(Welcome),
    /// Join refused.
    JoinRejected {
        /// Human-readable cause.
        reason: String,
    },
    /// State changes produced by one mutation.
    Patch(Vec<StateChange>),
    /// Out-of-band room broadcast.
    Event(BroadcastEvent),
    /// Heartbeat answer.
    Pong {
        /// Sequence of the answered ping.
        sequence: u32,
    },
}

impl From<Delivery> for ServerMessage {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Welcome(welcome) => Self::Welcome(welcome),
            Delivery::Patch(changes) => Self::Patch(changes),
            Delivery::Event(event) => Self::Event(event),
        }
    }
}

impl ServerMessage {
    /// Converts back into a room delivery. `None` for connection-level
    /// messages (`JoinRejected`, `Pong`).
    pub fn into_delivery(self) -> Option<Delivery> {
        match self {
            Self::Welcome(welcome) => Some(Delivery::Welcome(welcome)),
            Self::Patch(changes) => Some(Delivery::Patch(changes)),
            Self::Event(event) => Some(Delivery::Event(event)),
            Self::JoinRejected { .. } | Self::Pong { .. } => None,
        }
    }
}
