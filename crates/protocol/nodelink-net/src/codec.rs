//! Broker link framing.
//!
//! A broker link carries [`BrokerFrame`]s over a byte stream using
//! length-prefixed framing: 4-byte big-endian length + CBOR payload.
//! Client frames carry a correlation id that the broker echoes in its reply.

use std::io;

use nodelink_wire::{decode_payload, encode_payload, Envelope};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetworkError, NetworkResult};

/// One frame on a broker link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerFrame {
    /// Put a message on its destination queue.
    Send { id: u64, message: Envelope },
    /// Take the next live message from a queue, waiting up to `timeout_ms`.
    Receive {
        id: u64,
        queue: String,
        timeout_ms: u64,
    },
    /// Create a temporary queue owned by this link.
    CreateTemporaryQueue { id: u64 },
    /// Delete a queue.
    DeleteQueue { id: u64, queue: String },

    /// Operation completed.
    Ack { id: u64 },
    /// Result of a receive; `None` when the wait timed out.
    Delivered { id: u64, message: Option<Envelope> },
    /// Name of a created temporary queue.
    QueueCreated { id: u64, queue: String },
    /// Operation failed on the broker.
    Error { id: u64, message: String },
}

impl BrokerFrame {
    /// Correlation id.
    pub fn id(&self) -> u64 {
        match self {
            Self::Send { id, .. }
            | Self::Receive { id, .. }
            | Self::CreateTemporaryQueue { id }
            | Self::DeleteQueue { id, .. }
            | Self::Ack { id }
            | Self::Delivered { id, .. }
            | Self::QueueCreated { id, .. }
            | Self::Error { id, .. } => *id,
        }
    }

    /// Whether this frame is a broker reply rather than a client operation.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Self::Ack { .. } | Self::Delivered { .. } | Self::QueueCreated { .. } | Self::Error { .. }
        )
    }
}

/// Read and decode one frame.
pub async fn read_frame<T>(io: &mut T, max_size: usize) -> NetworkResult<BrokerFrame>
where
    T: AsyncRead + Unpin + Send,
{
    let data = read_length_prefixed(io, max_size).await?;
    decode_payload(&data).map_err(NetworkError::from)
}

/// Encode and write one frame.
pub async fn write_frame<T>(io: &mut T, frame: &BrokerFrame, max_size: usize) -> NetworkResult<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let data = encode_payload(frame)?;
    write_length_prefixed(io, &data, max_size).await?;
    Ok(())
}

/// Read a length-prefixed message from the stream.
async fn read_length_prefixed<T>(io: &mut T, max_size: usize) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    // Read 4-byte big-endian length
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} > {}", len, max_size),
        ));
    }

    let mut data = vec![0u8; len];
    io.read_exact(&mut data).await?;

    Ok(data)
}

/// Write a length-prefixed message to the stream.
async fn write_length_prefixed<T>(io: &mut T, data: &[u8], max_size: usize) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    if data.len() > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} > {}", data.len(), max_size),
        ));
    }

    let len_buf = (data.len() as u32).to_be_bytes();
    io.write_all(&len_buf).await?;
    io.write_all(data).await?;
    io.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_types::MAX_FRAME_SIZE;
    use nodelink_wire::MessageType;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_length_prefixed_format() {
        let original = b"hello world";
        let mut buf = Vec::new();

        write_length_prefixed(&mut buf, original, MAX_FRAME_SIZE)
            .await
            .unwrap();

        assert_eq!(&buf[..4], &[0, 0, 0, 11]);
        assert_eq!(&buf[4..], original);

        let mut cursor = Cursor::new(buf);
        let read_back = read_length_prefixed(&mut cursor, MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert_eq!(read_back, original);
    }

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let envelope = Envelope::new(Some(MessageType::Request), "nodelink.requests")
            .with_body(b"ping".to_vec());
        let frames = vec![
            BrokerFrame::Send {
                id: 1,
                message: envelope.clone(),
            },
            BrokerFrame::Delivered {
                id: 2,
                message: Some(envelope),
            },
            BrokerFrame::Error {
                id: 3,
                message: "closed".into(),
            },
        ];

        let mut buf = Vec::new();
        for frame in &frames {
            write_frame(&mut buf, frame, MAX_FRAME_SIZE).await.unwrap();
        }

        let mut cursor = Cursor::new(buf);
        for expected in &frames {
            let frame = read_frame(&mut cursor, MAX_FRAME_SIZE).await.unwrap();
            assert_eq!(&frame, expected);
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        let result = write_length_prefixed(&mut buf, &[0u8; 32], 16).await;
        assert!(result.is_err());
        assert!(buf.is_empty());

        // A prefix announcing more than the limit fails before reading the body.
        let mut cursor = Cursor::new(vec![0, 0, 1, 0]);
        let err = read_length_prefixed(&mut cursor, 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 10, 1, 2]);
        let result = read_frame(&mut cursor, MAX_FRAME_SIZE).await;
        assert!(matches!(result, Err(NetworkError::Io(_))));
    }

    #[test]
    fn test_frame_classification() {
        assert!(!BrokerFrame::CreateTemporaryQueue { id: 4 }.is_reply());
        assert!(BrokerFrame::Ack { id: 4 }.is_reply());
        assert_eq!(
            BrokerFrame::DeleteQueue {
                id: 9,
                queue: "q".into()
            }
            .id(),
            9
        );
    }
}
