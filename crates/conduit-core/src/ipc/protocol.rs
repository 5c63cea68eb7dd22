//! Wire format for the Conduit socket.
//!
//! Every message is a 4-byte big-endian length prefix followed by the payload:
//!
//! ```text
//! [u32 BE: len][payload bytes of len]
//! ```
//!
//! The payload itself is opaque to the server except for two cases: the raw
//! shutdown token `quit`, and the JSON envelope of the first `init` message on a
//! connection, which names the backend to bind.

use crate::config::IpcConfig;
use crate::error::{ConduitError, Result};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// The routing fields of a client message. Everything else is backend-specific.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

impl Envelope {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Backend id if this is a well-formed session-establishing message.
    pub fn init_backend_id(&self) -> Option<&str> {
        match self.method.as_deref() {
            Some(IpcConfig::INIT_METHOD) => self.id.as_deref(),
            _ => None,
        }
    }
}

/// Structured failure written back when error replies are enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub success: bool,
    pub kind: String,
    pub error: String,
}

impl ErrorReply {
    pub fn new(err: &ConduitError) -> Self {
        Self {
            success: false,
            kind: err.kind().to_string(),
            error: err.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Returns true if the payload is the server shutdown command.
pub fn is_quit(payload: &[u8]) -> bool {
    payload == IpcConfig::QUIT_TOKEN
}

/// Prefix a payload with its length.
///
/// The payload must fit the 32-bit header; callers check it against the
/// message size limit first.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u32::MAX as usize, "frame length overflows header");
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Pull the next complete frame out of an accumulation buffer.
///
/// Returns `Ok(None)` while the frame is still incomplete. Bytes belonging to
/// later frames stay in the buffer.
pub fn take_frame(buf: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let mut len_buf = [0u8; HEADER_LEN];
    len_buf.copy_from_slice(&buf[..HEADER_LEN]);
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_len {
        return Err(ConduitError::FrameTooLarge { len, max: max_len });
    }

    if buf.len() < HEADER_LEN + len {
        buf.reserve(HEADER_LEN + len - buf.len());
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; HEADER_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(ConduitError::FrameTooLarge {
            len,
            max: IpcConfig::MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Payloads above [`IpcConfig::MAX_MESSAGE_SIZE`] are refused before anything
/// is written.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(ConduitError::FrameTooLarge {
            len: payload.len(),
            max: IpcConfig::MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}
