//! Authoritative session-state synchronization: the replicated state model,
//! intent handling, per-room actors, the room registry, and the client-side
//! reconciler that mirrors a room's state.

pub mod event;
pub mod intent;
pub mod lifecycle;
pub mod reconciler;
pub mod registry;
pub mod replication;
pub mod room;
pub mod state;

pub use event::BroadcastEvent;
pub use intent::{Intent, IntentError, IntentHandler};
pub use lifecycle::{Ingredient, JoinOptions, Lifecycle, Recipe, WorldSettings};
pub use reconciler::{EntityRef, ReconcileError, Reconciler};
pub use registry::{Membership, RegistryError, RoomListing, SessionRegistry};
pub use replication::{
    ApplyError, Collection, Delivery, EntityRecord, FieldChange, Replicator, Schema, StateChange,
    Welcome,
};
pub use room::{Outbox, RoomError, RoomHandle, RoomSettings};
pub use state::{FoodItem, Player, PowerUp, Score, SessionId, SessionState};
