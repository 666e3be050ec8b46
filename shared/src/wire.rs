//! Framing codec: length-prefixed messages and the fixed batch headers.
//!
//! Layout on the wire:
//! - every message: 2-byte little-endian payload length, then the bincode
//!   payload.
//! - server -> client, once per network tick per client: a 5-byte batch
//!   header, then `message_count` framed messages.
//! - client -> server, per send: a 1-byte client header (the adjustment
//!   iteration the client has applied), then one framed message.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::Message;

pub const LENGTH_PREFIX_SIZE: usize = 2;
pub const SERVER_HEADER_SIZE: usize = 5;
pub const CLIENT_HEADER_SIZE: usize = 1;

/// Largest payload the 2-byte prefix can describe.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Fixed header preceding every server->client batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    /// Signed tick correction the client should apply. Zero means "stay".
    pub adjustment: i8,
    /// Wrapping iteration counter for adjustment confirmation.
    pub iteration: u8,
    /// Framed messages following this header. Zero is a heartbeat.
    pub message_count: u8,
    /// Sim ticks the server has processed since the client's last batch.
    pub confirmed_tick_count: u8,
}

impl BatchHeader {
    pub fn encode(&self) -> [u8; SERVER_HEADER_SIZE] {
        [
            self.adjustment as u8,
            self.iteration,
            0, // reserved
            self.message_count,
            self.confirmed_tick_count,
        ]
    }

    pub fn decode(bytes: &[u8; SERVER_HEADER_SIZE]) -> Self {
        Self {
            adjustment: bytes[0] as i8,
            iteration: bytes[1],
            message_count: bytes[3],
            confirmed_tick_count: bytes[4],
        }
    }
}

/// Serializes and frames one message: `[len_lo, len_hi, payload...]`.
pub fn frame_message(message: &Message) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
        });
    }

    let mut framed = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    framed.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    framed.extend_from_slice(&payload);
    Ok(framed)
}

pub fn decode_message(payload: &[u8]) -> Result<Message, FrameError> {
    Ok(bincode::deserialize(payload)?)
}

/// Reads one framed payload (without decoding it) from the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;
    let len = u16::from_le_bytes(prefix) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Reads and decodes one framed message from the stream.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Message> {
    let payload = read_frame(reader).await?;
    decode_message(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

pub async fn read_batch_header<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<BatchHeader> {
    let mut bytes = [0u8; SERVER_HEADER_SIZE];
    reader.read_exact(&mut bytes).await?;
    Ok(BatchHeader::decode(&bytes))
}

/// Reads the 1-byte client header: the adjustment iteration echo.
pub async fn read_client_header<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u8> {
    let mut byte = [0u8; CLIENT_HEADER_SIZE];
    reader.read_exact(&mut byte).await?;
    Ok(byte[0])
}

/// Writes one client->server send: client header, then the framed message.
pub async fn write_client_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    adjustment_iteration: u8,
    message: &Message,
) -> io::Result<()> {
    let framed = frame_message(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&[adjustment_iteration]).await?;
    writer.write_all(&framed).await?;
    Ok(())
}

#[derive(Debug)]
pub enum FrameError {
    Encoding(bincode::Error),
    TooLarge { size: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Encoding(e) => write!(f, "message encoding failed: {}", e),
            FrameError::TooLarge { size } => {
                write!(f, "message too large: {} bytes, max {}", size, MAX_MESSAGE_SIZE)
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl From<bincode::Error> for FrameError {
    fn from(e: bincode::Error) -> Self {
        FrameError::Encoding(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageContent;

    #[test]
    fn test_batch_header_roundtrip() {
        let header = BatchHeader {
            adjustment: -3,
            iteration: 250,
            message_count: 7,
            confirmed_tick_count: 12,
        };

        let bytes = header.encode();
        assert_eq!(bytes.len(), SERVER_HEADER_SIZE);
        assert_eq!(bytes[2], 0);
        assert_eq!(BatchHeader::decode(&bytes), header);
    }

    #[test]
    fn test_frame_prefix_matches_payload_length() {
        let message = Message {
            tick_timestamp: 1,
            content: MessageContent::EntityUpdate { entities: vec![] },
        };

        let framed = frame_message(&message).unwrap();
        let len = u16::from_le_bytes([framed[0], framed[1]]) as usize;
        assert_eq!(len, framed.len() - LENGTH_PREFIX_SIZE);

        let decoded = decode_message(&framed[LENGTH_PREFIX_SIZE..]).unwrap();
        assert_eq!(decoded.tick_timestamp, 1);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let garbage = vec![0xFFu8; 3];
        assert!(decode_message(&garbage).is_err());
    }

    #[tokio::test]
    async fn test_async_read_frame() {
        let message = Message {
            tick_timestamp: 99,
            content: MessageContent::EntityUpdate { entities: vec![] },
        };
        let framed = frame_message(&message).unwrap();

        let mut reader = std::io::Cursor::new(framed);
        let decoded = read_message(&mut reader).await.unwrap();
        assert_eq!(decoded.tick_timestamp, 99);
    }

    #[tokio::test]
    async fn test_async_truncated_frame_errors() {
        let message = Message {
            tick_timestamp: 5,
            content: MessageContent::EntityUpdate { entities: vec![] },
        };
        let mut framed = frame_message(&message).unwrap();
        framed.truncate(framed.len() - 1);

        let mut reader = std::io::Cursor::new(framed);
        assert!(read_message(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_client_message_roundtrip() {
        let message = Message {
            tick_timestamp: 17,
            content: MessageContent::TileUpdateRequest {
                tile_x: 1,
                tile_y: 2,
                layer_index: 0,
                sprite_id: 9,
            },
        };

        let mut buffer = Vec::new();
        write_client_message(&mut buffer, 4, &message).await.unwrap();

        let mut reader = std::io::Cursor::new(buffer);
        let iteration = read_client_header(&mut reader).await.unwrap();
        assert_eq!(iteration, 4);

        let decoded = read_message(&mut reader).await.unwrap();
        assert_eq!(decoded.tick_timestamp, 17);
    }
}
