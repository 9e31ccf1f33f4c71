//! Command-line argument parsing for the Larder server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Larder server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "larder", about = "Larder session server")]
pub struct CliArgs {
    /// Interface to bind.
    #[arg(long)]
    pub bind: Option<String>,

    /// Listening port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum participants per room.
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Milliseconds an empty room lingers before disposal.
    #[arg(long)]
    pub grace_ms: Option<u64>,

    /// Fixed world seed for reproducible item placement.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.network.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(capacity) = args.capacity {
            self.room.capacity = capacity;
        }
        if let Some(grace) = args.grace_ms {
            self.room.dispose_grace_ms = grace;
        }
        if let Some(seed) = args.seed {
            self.world.seed = Some(seed);
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            port: Some(3000),
            grace_ms: Some(0),
            seed: Some(99),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.port, 3000);
        assert_eq!(config.room.dispose_grace_ms, 0);
        assert_eq!(config.world.seed, Some(99));
        // Non-overridden fields retain defaults
        assert_eq!(config.network.bind_address, "0.0.0.0");
        assert_eq!(config.room.capacity, 4);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_flags() {
        let args = CliArgs::parse_from([
            "larder",
            "--bind",
            "127.0.0.1",
            "--capacity",
            "2",
            "--log-level",
            "debug",
            "--config",
            "/tmp/larder",
        ]);
        assert_eq!(args.bind.as_deref(), Some("127.0.0.1"));
        assert_eq!(args.capacity, Some(2));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.config, Some(PathBuf::from("/tmp/larder")));
        assert!(args.port.is_none());
    }
}
