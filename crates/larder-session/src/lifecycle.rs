//! Participant join/leave handling and world seeding.
//!
//! Joining spawns a [`Player`] at a random point inside the world bounds and
//! seeds the room's food items and power-ups the first time anyone joins.
//! Seeding is once per room: later joins never add items.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::event::BroadcastEvent;
use crate::state::{FoodItem, Player, PowerUp, SessionState};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// One recipe ingredient and how many of it the world must contain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ingredient {
    /// Ingredient name (e.g. "Carrot").
    pub name: String,
    /// Number of guaranteed instances in the world.
    pub quantity: u32,
    /// Visual identifier for the renderer.
    pub texture: String,
}

impl Ingredient {
    /// Convenience constructor.
    pub fn new(name: &str, quantity: u32, texture: &str) -> Self {
        Self {
            name: name.to_string(),
            quantity,
            texture: texture.to_string(),
        }
    }
}

/// The dish players gather ingredients for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Recipe {
    /// Dish name.
    pub name: String,
    /// Required ingredients.
    pub ingredients: Vec<Ingredient>,
}

impl Default for Recipe {
    fn default() -> Self {
        Self {
            name: "Veg Curry".to_string(),
            ingredients: vec![
                Ingredient::new("Carrot", 2, "vegetable_carrot"),
                Ingredient::new("Corn", 1, "vegetable_corn"),
                Ingredient::new("Potato", 2, "vegetable_potato"),
                Ingredient::new("Garlic", 1, "vegetable_garlic"),
                Ingredient::new("Ginger", 2, "vegetable_ginger"),
                Ingredient::new("Onion", 1, "vegetable_onion"),
            ],
        }
    }
}

/// World bounds and seeding parameters for every room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldSettings {
    /// World width; spawn and item X lie in `[0, width)`.
    pub width: f32,
    /// World height; spawn and item Y lie in `[0, height)`.
    pub height: f32,
    /// Recipe whose ingredients are seeded.
    pub recipe: Recipe,
    /// Additional random recipe ingredients scattered on top of the recipe.
    pub extra_items: usize,
    /// Number of power-ups to scatter.
    pub power_ups: usize,
    /// Effect identifier of seeded power-ups.
    pub power_up_name: String,
    /// Fixed RNG seed. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            width: 800.0,
            height: 500.0,
            recipe: Recipe::default(),
            extra_items: 20,
            power_ups: 3,
            power_up_name: "dash".to_string(),
            seed: None,
        }
    }
}

/// Parameters a client supplies when joining. Only `name` is used; the
/// position and heading are informational.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JoinOptions {
    /// Desired display name.
    pub name: String,
    /// Client-side spawn X.
    pub x: f32,
    /// Client-side spawn Y.
    pub y: f32,
    /// Client-side heading.
    pub rotation: f32,
}

impl JoinOptions {
    /// Options carrying only a display name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Per-room join/leave controller. Owns the room's RNG and id counters.
pub struct Lifecycle {
    settings: WorldSettings,
    rng: StdRng,
    seeded: bool,
    next_entity: u64,
}

impl Lifecycle {
    /// Creates a controller; the RNG is seeded from `settings.seed` if set.
    pub fn new(settings: WorldSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            settings,
            rng,
            seeded: false,
            next_entity: 1,
        }
    }

    /// World settings in use.
    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    /// Returns `true` once the world has been seeded.
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Spawns a player for `session_id`, seeds the world if this room has not
    /// been seeded yet, and returns the `playerJoined` event.
    pub fn join(
        &mut self,
        state: &mut SessionState,
        session_id: &str,
        options: &JoinOptions,
    ) -> BroadcastEvent {
        let (x, y) = self.random_position();
        let player = Player::new(options.name.clone(), x, y);
        state.players.insert(session_id.to_string(), player.clone());
        info!("{session_id} ({}) joined at ({x}, {y})", options.name);

        self.seed_world(state);

        BroadcastEvent::PlayerJoined {
            session_id: session_id.to_string(),
            player,
        }
    }

    /// Removes the player for `session_id`. Returns the `playerLeft` event,
    /// or `None` if no such player existed.
    pub fn leave(&mut self, state: &mut SessionState, session_id: &str) -> Option<BroadcastEvent> {
        state.players.remove(session_id)?;
        info!("{session_id} left");
        Some(BroadcastEvent::PlayerLeft {
            session_id: session_id.to_string(),
        })
    }

    /// Seeds the recipe ingredients, the random extras and the power-ups.
    /// Returns the number of entities created; 0 if already seeded.
    pub fn seed_world(&mut self, state: &mut SessionState) -> usize {
        if self.seeded {
            return 0;
        }
        self.seeded = true;

        let ingredients = self.settings.recipe.ingredients.clone();
        let mut created = 0;

        for ingredient in &ingredients {
            for _ in 0..ingredient.quantity {
                self.place_item(state, ingredient);
                created += 1;
            }
        }

        if !ingredients.is_empty() {
            for _ in 0..self.settings.extra_items {
                let pick = self.rng.random_range(0..ingredients.len());
                self.place_item(state, &ingredients[pick]);
                created += 1;
            }
        }

        for _ in 0..self.settings.power_ups {
            let (x, y) = self.random_position();
            let n = self.next_id();
            let id = format!("{}-pickup-{}", self.settings.power_up_name, n);
            state.power_ups.insert(
                id.clone(),
                PowerUp {
                    id,
                    x,
                    y,
                    name: self.settings.power_up_name.clone(),
                },
            );
            created += 1;
        }

        info!(
            "Seeded {created} entities for recipe {}",
            self.settings.recipe.name
        );
        created
    }

    fn place_item(&mut self, state: &mut SessionState, ingredient: &Ingredient) {
        let (x, y) = self.random_position();
        let id = format!("{}-{}", ingredient.name.to_lowercase(), self.next_id());
        state.food_items.insert(
            id.clone(),
            FoodItem {
                id,
                x,
                y,
                name: ingredient.name.clone(),
                texture: ingredient.texture.clone(),
                is_static: true,
                is_picked_up: false,
            },
        );
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_entity;
        self.next_entity += 1;
        id
    }

    /// Whole-unit position inside `[0, width) × [0, height)`.
    fn random_position(&mut self) -> (f32, f32) {
        let x = coordinate(&mut self.rng, self.settings.width);
        let y = coordinate(&mut self.rng, self.settings.height);
        (x, y)
    }
}

fn coordinate(rng: &mut StdRng, extent: f32) -> f32 {
    if extent > 0.0 {
        rng.random_range(0.0..extent).floor()
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
