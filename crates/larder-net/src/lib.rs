//! TCP transport for Larder: message framing, the versioned wire codec, the
//! server that bridges sockets to the session registry, and a client that
//! feeds room deliveries to a reconciler.

pub mod client;
pub mod codec;
pub mod framing;
pub mod messages;
pub mod server;

pub use client::{ClientConfig, ClientError, ConnectionState, ConnectionStateWatch, GameClient};
pub use codec::{
    CodecConfig, CompressionError, MessageError, PROTOCOL_VERSION, WireConfig, WireError,
    decode_message, encode_message, read_message, write_message,
};
pub use framing::{DEFAULT_MAX_FRAME_BYTES, FrameConfig, FrameError, read_frame, write_frame};
pub use messages::{ClientMessage, ServerMessage};
pub use server::{
    ConnectionId, ConnectionLimitReached, ConnectionMap, DEFAULT_PORT, GameServer, IdGenerator,
    ServerConfig,
};
