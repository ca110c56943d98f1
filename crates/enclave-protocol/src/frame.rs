//! Length-prefixed framing for the control socket.
//!
//! ```text
//! +----------+----------------------+------------------+
//! | msg_type |  length (u32, BE)    |  payload bytes   |
//! |  1 byte  |      4 bytes         |  length bytes    |
//! +----------+----------------------+------------------+
//! ```
//!
//! The length prefix is checked against [`MAX_PAYLOAD_SIZE`] before the
//! payload buffer is allocated, so a compromised runtime cannot make the
//! orchestrator reserve arbitrary memory.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};

/// Maximum payload size in bytes (100 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 100 * 1024 * 1024;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Orchestrator → runtime, exactly once per connection.
    Init = 0x01,
    /// Runtime → orchestrator, zero or more.
    Event = 0x02,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Event => "EVENT",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Init),
            0x02 => Ok(Self::Event),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

/// Encode one frame. Fails if the payload exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode_frame(msg_type: MessageType, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    // Bounded by MAX_PAYLOAD_SIZE, which fits in u32.
    let length = payload.len() as u32;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(msg_type as u8);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode and write one frame, flushing afterwards.
pub async fn write_frame<W>(writer: &mut W, msg_type: MessageType, payload: &[u8]) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg_type, payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one complete frame, suspending until it is fully available.
///
/// When `expected` is set, a frame of any other type is rejected after the
/// header is read and before the payload is consumed.
pub async fn read_frame<R>(reader: &mut R, expected: Option<MessageType>) -> ProtocolResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0_u8; HEADER_LEN];
    read_full(reader, &mut header).await?;

    let msg_type = MessageType::try_from(header[0])?;
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

    if length > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: length,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    if let Some(expected) = expected
        && expected != msg_type
    {
        return Err(ProtocolError::UnexpectedMessageType {
            expected: expected.as_str(),
            actual: msg_type.as_str(),
        });
    }

    let mut payload = vec![0_u8; length];
    read_full(reader, &mut payload).await?;
    Ok(Frame { msg_type, payload })
}

/// Like `read_exact`, but reports how far it got when the peer goes away.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> ProtocolResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            return Err(ProtocolError::Disconnected {
                received: filled,
                expected: buf.len(),
            });
        }
        filled += read;
    }
    Ok(())
}
