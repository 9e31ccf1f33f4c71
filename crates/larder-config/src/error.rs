//! Configuration error types.

/// Errors loading, saving, or interpreting configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config: {0}")]
    ReadError(#[source] std::io::Error),

    /// The config file could not be written.
    #[error("failed to write config: {0}")]
    WriteError(#[source] std::io::Error),

    /// The file is not valid RON for [`crate::Config`].
    #[error("failed to parse config: {0}")]
    ParseError(#[source] ron::error::SpannedError),

    /// The config could not be serialized.
    #[error("failed to serialize config: {0}")]
    SerializeError(#[source] ron::Error),

    /// `network.bind_address` and `network.port` do not form a socket address.
    #[error("invalid bind address {0}")]
    InvalidAddress(String),
}
