//! Length-prefixed framing for TCP streams.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length counts payload bytes only. Frames above the configured maximum
//! are refused on both ends before any payload is read or written.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Default frame payload ceiling: 1 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 1_048_576;

/// Framing limits.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Errors raised while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The declared or actual payload exceeds the limit.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Offending size.
        size: u32,
        /// Configured maximum.
        max: u32,
    },

    /// The peer closed the stream, possibly mid-frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn closed_or_io(err: std::io::Error) -> FrameError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(err)
    }
}

/// Reads one frame and returns its payload.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await.map_err(closed_or_io)?;

    let size = u32::from_le_bytes(prefix);
    if size > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; size as usize];
    if size > 0 {
        reader.read_exact(&mut payload).await.map_err(closed_or_io)?;
    }
    Ok(payload)
}

/// Writes `payload` as one frame and flushes.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if size > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size,
            max: config.max_payload_size,
        });
    }

    writer.write_all(&size.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frames_arrive_in_order_and_unmerged() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        for payload in [&b"join"[..], b"", b"intent"] {
            write_frame(&mut client, payload, &config).await.unwrap();
        }

        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"join");
        assert!(read_frame(&mut server, &config).await.unwrap().is_empty());
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"intent");
    }

    #[tokio::test]
    async fn test_payload_larger_than_pipe_buffer() {
        let (mut client, mut server) = duplex(8);
        let config = FrameConfig::default();
        let payload = vec![7u8; 300];

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &payload, &FrameConfig::default())
                .await
                .unwrap();
        });

        let received = read_frame(&mut server, &config).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_declared_size_over_limit_rejected_before_payload() {
        let (mut client, mut server) = duplex(64);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        client.write_all(&17u32.to_le_bytes()).await.unwrap();

        let result = read_frame(&mut server, &config).await;
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 17, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_write_refused() {
        let (mut client, _server) = duplex(64);
        let config = FrameConfig {
            max_payload_size: 4,
        };
        let result = write_frame(&mut client, b"too long", &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_truncated_frame_reports_closed() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let result = read_frame(&mut server, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_prefix_is_little_endian() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[3, 0, 0, 0]).await.unwrap();
        client.write_all(b"abc").await.unwrap();

        let received = read_frame(&mut server, &FrameConfig::default())
            .await
            .unwrap();
        assert_eq!(received, b"abc");
    }
}
