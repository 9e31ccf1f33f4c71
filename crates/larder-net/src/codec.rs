//! Payload encoding: compression flag, protocol version, postcard body.
//!
//! ```text
//! [flag: u8] [version: u8] [postcard body]          flag = 0x00
//! [flag: u8] [lz4 size-prepended (version + body)]  flag = 0x01
//! ```
//!
//! Payloads at or above the compression threshold are LZ4-compressed; small
//! ones go out as-is. [`write_message`] and [`read_message`] combine this
//! with [`crate::framing`].

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};

/// Wire protocol version, carried in every payload.
pub const PROTOCOL_VERSION: u8 = 1;

/// Payload is uncompressed.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Payload is LZ4-compressed with its size prepended.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// When to compress.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Minimum versioned body size, in bytes, before compression applies.
    pub compression_threshold: usize,
    /// Master switch for compression.
    pub compression_enabled: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 512,
            compression_enabled: true,
        }
    }
}

/// Framing plus codec settings for one connection.
#[derive(Debug, Clone, Default)]
pub struct WireConfig {
    /// Frame limits.
    pub frame: FrameConfig,
    /// Compression policy.
    pub codec: CodecConfig,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors unwrapping the compression layer.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// No flag byte present.
    #[error("empty payload: no compression flag")]
    EmptyPayload,
    /// LZ4 rejected the data.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// Flag byte is neither none nor LZ4.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
}

/// Errors encoding or decoding a message payload.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The compression layer was malformed.
    #[error(transparent)]
    Compression(#[from] CompressionError),

    /// No version byte after decompression.
    #[error("empty payload: no version byte")]
    EmptyPayload,

    /// The peer speaks another protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard (de)serialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Errors sending or receiving a typed message over a stream.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Framing failed.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// Payload could not be encoded or decoded.
    #[error(transparent)]
    Message(#[from] MessageError),
}

// ---------------------------------------------------------------------------
// Compression layer
// ---------------------------------------------------------------------------

fn compress_payload(data: Vec<u8>, config: &CodecConfig) -> Vec<u8> {
    if !config.compression_enabled || data.len() < config.compression_threshold {
        let mut out = Vec::with_capacity(1 + data.len());
        out.push(COMPRESSION_FLAG_NONE);
        out.extend_from_slice(&data);
        out
    } else {
        let compressed = compress_prepend_size(&data);
        let mut out = Vec::with_capacity(1 + compressed.len());
        out.push(COMPRESSION_FLAG_LZ4);
        out.extend_from_slice(&compressed);
        out
    }
}

fn decompress_payload(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let (&flag, rest) = data.split_first().ok_or(CompressionError::EmptyPayload)?;
    match flag {
        COMPRESSION_FLAG_NONE => Ok(rest.to_vec()),
        COMPRESSION_FLAG_LZ4 => decompress_size_prepended(rest)
            .map_err(|e| CompressionError::DecompressFailed(e.to_string())),
        other => Err(CompressionError::UnknownFlag(other)),
    }
}

// ---------------------------------------------------------------------------
// Message layer
// ---------------------------------------------------------------------------

/// Encodes `message` into a frame payload.
pub fn encode_message<M: Serialize>(
    message: &M,
    config: &CodecConfig,
) -> Result<Vec<u8>, MessageError> {
    let body = postcard::to_allocvec(message)?;
    let mut versioned = Vec::with_capacity(1 + body.len());
    versioned.push(PROTOCOL_VERSION);
    versioned.extend_from_slice(&body);
    Ok(compress_payload(versioned, config))
}

/// Decodes a frame payload produced by [`encode_message`].
pub fn decode_message<M: DeserializeOwned>(payload: &[u8]) -> Result<M, MessageError> {
    let versioned = decompress_payload(payload)?;
    let (&version, body) = versioned.split_first().ok_or(MessageError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}

/// Encodes and writes one message as a frame.
pub async fn write_message<W, M>(
    writer: &mut W,
    message: &M,
    config: &WireConfig,
) -> Result<(), WireError>
where
    W: AsyncWriteExt + Unpin,
    M: Serialize,
{
    let payload = encode_message(message, &config.codec)?;
    write_frame(writer, &payload, &config.frame).await?;
    Ok(())
}

/// Reads and decodes one framed message.
pub async fn read_message<R, M>(reader: &mut R, config: &WireConfig) -> Result<M, WireError>
where
    R: AsyncReadExt + Unpin,
    M: DeserializeOwned,
{
    let payload = read_frame(reader, &config.frame).await?;
    Ok(decode_message(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_small_payload_is_flagged_uncompressed() {
        let payload = encode_message(&"tiny", &CodecConfig::default()).unwrap();
        assert_eq!(payload[0], COMPRESSION_FLAG_NONE);
        assert_eq!(payload[1], PROTOCOL_VERSION);
    }

    #[test]
    fn test_large_payload_is_compressed_and_restored() {
        let text = "carrot ".repeat(400);
        let payload = encode_message(&text, &CodecConfig::default()).unwrap();

        assert_eq!(payload[0], COMPRESSION_FLAG_LZ4);
        assert!(payload.len() < text.len());
        let decoded: String = decode_message(&payload).unwrap();
        assert_eq!(decoded, text);
    }

    #[test]
    fn test_disabled_compression_never_compresses() {
        let config = CodecConfig {
            compression_enabled: false,
            ..CodecConfig::default()
        };
        let payload = encode_message(&vec![0u8; 4096], &config).unwrap();
        assert_eq!(payload[0], COMPRESSION_FLAG_NONE);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut payload = encode_message(&42u32, &CodecConfig::default()).unwrap();
        payload[1] = PROTOCOL_VERSION + 1;
        let result = decode_message::<u32>(&payload);
        assert!(matches!(result, Err(MessageError::UnsupportedVersion(2))));
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert!(matches!(
            decode_message::<u32>(&[]),
            Err(MessageError::Compression(CompressionError::EmptyPayload))
        ));
        assert!(matches!(
            decode_message::<u32>(&[COMPRESSION_FLAG_NONE]),
            Err(MessageError::EmptyPayload)
        ));
        assert!(matches!(
            decode_message::<u32>(&[0x7F, PROTOCOL_VERSION]),
            Err(MessageError::Compression(CompressionError::UnknownFlag(0x7F)))
        ));
        assert!(matches!(
            decode_message::<u32>(&[COMPRESSION_FLAG_LZ4, 0xFF]),
            Err(MessageError::Compression(CompressionError::DecompressFailed(_)))
        ));
    }

    #[tokio::test]
    async fn test_typed_messages_over_stream() {
        let (mut client, mut server) = duplex(4096);
        let config = WireConfig::default();

        write_message(&mut client, &(7u32, "corn".to_string()), &config)
            .await
            .unwrap();
        let received: (u32, String) = read_message(&mut server, &config).await.unwrap();
        assert_eq!(received, (7, "corn".to_string()));
    }
}
