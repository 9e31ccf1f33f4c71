//! Room directory: binds room ids to running room tasks and reserves seats.
//!
//! Seat reservation and disposal are both decided under the directory lock,
//! so a room with a reserved seat is never removed underneath its joiner.
//! The lock guards only the directory; room state lives in each room task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::intent::Intent;
use crate::lifecycle::{JoinOptions, WorldSettings};
use crate::room::{Outbox, Room, RoomError, RoomHandle, RoomSettings};
use crate::state::SessionId;

const ID_LENGTH: usize = 9;

/// Errors returned when joining a room.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    /// Every matching room is full and no more rooms may be created.
    #[error("no seat available in {0}")]
    CapacityExceeded(String),
    /// The requested room does not exist or was disposed.
    #[error("room {0} not found")]
    RoomNotFound(String),
}

/// A participant's seat in a room.
#[derive(Debug, Clone)]
pub struct Membership {
    room: RoomHandle,
    session_id: SessionId,
}

impl Membership {
    /// The room joined.
    pub fn room(&self) -> &RoomHandle {
        &self.room
    }

    /// Id of the room joined.
    pub fn room_id(&self) -> &str {
        self.room.id()
    }

    /// Session id assigned at join.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sends an intent on behalf of this participant.
    pub async fn send(&self, intent: Intent) -> Result<(), RoomError> {
        self.room.send_intent(&self.session_id, intent).await
    }
}

/// Diagnostic view of one live room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomListing {
    /// Room id.
    pub id: String,
    /// Selector the room was created under.
    pub selector: String,
    /// Reserved seats.
    pub occupants: usize,
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

pub(crate) struct Listing {
    selector: String,
    handle: RoomHandle,
    occupants: HashSet<SessionId>,
}

/// Shared between the registry and every room task.
#[derive(Default)]
pub(crate) struct Directory {
    pub(crate) rooms: Mutex<HashMap<String, Listing>>,
}

impl Directory {
    /// Frees `session_id`'s seat. Idempotent.
    pub(crate) async fn release_seat(&self, room_id: &str, session_id: &str) {
        if let Some(listing) = self.rooms.lock().await.get_mut(room_id) {
            listing.occupants.remove(session_id);
        }
    }

    /// Removes the room if no seat is reserved. Returns `true` when the room
    /// is no longer listed and its task should stop.
    pub(crate) async fn remove_if_vacant(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.lock().await;
        match rooms.get(room_id) {
            Some(listing) if !listing.occupants.is_empty() => false,
            Some(_) => {
                rooms.remove(room_id);
                info!("Room {room_id} removed after grace period");
                true
            }
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// Creates rooms on demand and routes participants into them.
pub struct SessionRegistry {
    directory: Arc<Directory>,
    room: RoomSettings,
    world: WorldSettings,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(room: RoomSettings, world: WorldSettings) -> Self {
        Self {
            directory: Arc::new(Directory::default()),
            room,
            world,
        }
    }

    /// Room settings in use.
    pub fn room_settings(&self) -> &RoomSettings {
        &self.room
    }

    /// Joins a room under `selector` with a free seat, creating one when none
    /// has room. Deliveries for the new participant go to `outbox`.
    pub async fn join_or_create(
        &self,
        selector: &str,
        options: JoinOptions,
        outbox: Outbox,
    ) -> Result<Membership, RegistryError> {
        let session_id = random_id();
        let capacity = self.room.capacity.max(1);

        let handle = {
            let mut rooms = self.directory.rooms.lock().await;
            let open = rooms.values_mut().find(|listing| {
                listing.selector == selector
                    && listing.occupants.len() < capacity
                    && !listing.handle.is_closed()
            });
            match open {
                Some(listing) => {
                    listing.occupants.insert(session_id.clone());
                    listing.handle.clone()
                }
                None => {
                    if rooms.len() >= self.room.max_rooms {
                        warn!("Room limit {} reached for {selector}", self.room.max_rooms);
                        return Err(RegistryError::CapacityExceeded(selector.to_string()));
                    }
                    let room_id = loop {
                        let candidate = random_id();
                        if !rooms.contains_key(&candidate) {
                            break candidate;
                        }
                    };
                    let handle = Room::spawn(
                        room_id.clone(),
                        selector.to_string(),
                        &self.room,
                        self.world.clone(),
                        Arc::clone(&self.directory),
                    );
                    rooms.insert(
                        room_id,
                        Listing {
                            selector: selector.to_string(),
                            handle: handle.clone(),
                            occupants: HashSet::from([session_id.clone()]),
                        },
                    );
                    handle
                }
            }
        };

        self.enter(handle, session_id, options, outbox).await
    }

    /// Joins the room with id `room_id`.
    pub async fn join_by_id(
        &self,
        room_id: &str,
        options: JoinOptions,
        outbox: Outbox,
    ) -> Result<Membership, RegistryError> {
        let session_id = random_id();
        let capacity = self.room.capacity.max(1);

        let handle = {
            let mut rooms = self.directory.rooms.lock().await;
            let listing = rooms
                .get_mut(room_id)
                .filter(|listing| !listing.handle.is_closed())
                .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
            if listing.occupants.len() >= capacity {
                return Err(RegistryError::CapacityExceeded(room_id.to_string()));
            }
            listing.occupants.insert(session_id.clone());
            listing.handle.clone()
        };

        self.enter(handle, session_id, options, outbox).await
    }

    async fn enter(
        &self,
        handle: RoomHandle,
        session_id: SessionId,
        options: JoinOptions,
        outbox: Outbox,
    ) -> Result<Membership, RegistryError> {
        if let Err(err) = handle.join(&session_id, options, outbox).await {
            warn!("Join of {session_id} failed: {err}");
            self.directory.release_seat(handle.id(), &session_id).await;
            return Err(RegistryError::RoomNotFound(handle.id().to_string()));
        }
        Ok(Membership {
            room: handle,
            session_id,
        })
    }

    /// Releases the participant's seat and removes its player.
    pub async fn leave(&self, membership: Membership) {
        self.directory
            .release_seat(membership.room_id(), membership.session_id())
            .await;
        // A disposed room has already dropped the player.
        let _ = membership.room.leave(&membership.session_id).await;
    }

    /// Disposes a room immediately. Returns `false` if it was not listed.
    pub async fn dispose(&self, room_id: &str) -> bool {
        let Some(listing) = self.directory.rooms.lock().await.remove(room_id) else {
            return false;
        };
        let _ = listing.handle.dispose().await;
        true
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.directory.rooms.lock().await.len()
    }

    /// Live rooms, sorted by id.
    pub async fn rooms(&self) -> Vec<RoomListing> {
        let rooms = self.directory.rooms.lock().await;
        let mut listings: Vec<RoomListing> = rooms
            .iter()
            .map(|(id, listing)| RoomListing {
                id: id.clone(),
                selector: listing.selector.clone(),
                occupants: listing.occupants.len(),
            })
            .collect();
        listings.sort_by(|a, b| a.id.cmp(&b.id));
        listings
    }
}

fn random_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
