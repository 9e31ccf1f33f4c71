//! Larder session server.
//!
//! Loads `config.ron` (creating it on first run), applies command-line
//! overrides, and serves rooms over TCP until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use larder_config::{CliArgs, Config, ConfigError, default_config_dir};
use larder_net::{CodecConfig, FrameConfig, GameServer, ServerConfig, WireConfig};
use larder_session::SessionRegistry;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);

    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_dir.display());
            std::process::exit(1);
        }
    };
    config.apply_cli_overrides(&args);

    larder_log::init_logging(
        Some(config.debug.log_dir.as_path()),
        cfg!(debug_assertions),
        Some(&config),
    );

    let server_config = match server_config(&config) {
        Ok(server_config) => server_config,
        Err(e) => {
            error!("Invalid network config: {e}");
            std::process::exit(1);
        }
    };

    info!(
        capacity = config.room.capacity,
        max_rooms = config.room.max_rooms,
        recipe = %config.world.recipe.name,
        "Starting Larder"
    );

    let registry = Arc::new(SessionRegistry::new(config.room, config.world));
    let server = Arc::new(GameServer::new(server_config, registry));

    let mut accept = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    let result = tokio::select! {
        result = &mut accept => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl-C: {e}");
            }
            info!("Ctrl-C received");
            server.shutdown();
            accept.await
        }
    };

    match result {
        Ok(Ok(())) => info!("Server stopped"),
        Ok(Err(e)) => {
            error!("Server error: {e}");
            std::process::exit(1);
        }
        Err(e) => {
            error!("Server task failed: {e}");
            std::process::exit(1);
        }
    }
}

/// Builds the transport settings from the loaded config.
fn server_config(config: &Config) -> Result<ServerConfig, ConfigError> {
    let network = &config.network;
    Ok(ServerConfig {
        bind_addr: network.socket_addr()?,
        max_connections: network.max_connections,
        idle_timeout: network.idle_timeout(),
        wire: WireConfig {
            frame: FrameConfig {
                max_payload_size: network.max_frame_bytes,
            },
            codec: CodecConfig {
                compression_threshold: network.compression_threshold,
                compression_enabled: true,
            },
        },
    })
}
