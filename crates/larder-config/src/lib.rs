//! Configuration for the Larder server.
//!
//! Settings persist to disk as `config.ron`, load with defaults for anything
//! missing, and accept command-line overrides via clap.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{CONFIG_FILE, Config, DebugConfig, NetworkConfig, default_config_dir};
pub use error::ConfigError;
pub use larder_session::{RoomSettings, WorldSettings};
