//! Message envelope and wire codec.
//!
//! Control records travel as JSON text messages tagged by `type`. Chunk
//! payloads travel as binary messages:
//!
//! ```text
//! [4 bytes: header_len (big-endian)][header_len bytes: JSON {"transferId"}][rest: payload]
//! ```
//!
//! The header only names the transfer; chunks carry no index or offset and
//! belong to the block most recently opened for that transfer.

use serde::{Deserialize, Serialize};

use crate::messages::{Announce, BlockEnd, BlockHeader, Cancel, PullBlock};
use crate::types::TransferId;

/// A structured protocol record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Announce(Announce),
    PullBlock(PullBlock),
    BlockHeader(BlockHeader),
    BlockEnd(BlockEnd),
    Cancel(Cancel),
}

impl ControlMessage {
    /// Transfer the record belongs to.
    pub fn transfer_id(&self) -> &TransferId {
        match self {
            ControlMessage::Announce(m) => &m.transfer_id,
            ControlMessage::PullBlock(m) => &m.transfer_id,
            ControlMessage::BlockHeader(m) => &m.transfer_id,
            ControlMessage::BlockEnd(m) => &m.transfer_id,
            ControlMessage::Cancel(m) => &m.transfer_id,
        }
    }
}

/// Raw chunk bytes for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub transfer_id: TransferId,
    pub data: Vec<u8>,
}

/// Anything that crosses the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlMessage),
    Chunk(ChunkFrame),
}

impl Frame {
    pub fn transfer_id(&self) -> &TransferId {
        match self {
            Frame::Control(c) => c.transfer_id(),
            Frame::Chunk(c) => &c.transfer_id,
        }
    }

    /// Payload bytes carried by the frame (zero for control records).
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Control(_) => 0,
            Frame::Chunk(c) => c.data.len(),
        }
    }

    /// Encodes the frame for a text/binary message transport.
    pub fn encode(&self) -> Result<WireMessage, WireError> {
        match self {
            Frame::Control(c) => Ok(WireMessage::Text(serde_json::to_string(c)?)),
            Frame::Chunk(c) => Ok(WireMessage::Binary(encode_chunk(&c.transfer_id, &c.data)?)),
        }
    }

    /// Decodes a transport message, telling records and chunks apart by
    /// message kind.
    pub fn decode(msg: WireMessage) -> Result<Frame, WireError> {
        match msg {
            WireMessage::Text(text) => Ok(Frame::Control(serde_json::from_str(&text)?)),
            WireMessage::Binary(data) => Ok(Frame::Chunk(parse_chunk(&data)?)),
        }
    }
}

impl From<ControlMessage> for Frame {
    fn from(msg: ControlMessage) -> Self {
        Frame::Control(msg)
    }
}

/// Transport-level message as seen by a text/binary channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    /// Size of the message on the wire.
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(t) => t.len(),
            WireMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkHeader {
    transfer_id: TransferId,
}

/// Encodes a chunk as a binary message.
pub fn encode_chunk(transfer_id: &TransferId, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let header_json = serde_json::to_vec(&ChunkHeader {
        transfer_id: transfer_id.clone(),
    })?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Parses a binary message into a [`ChunkFrame`].
pub fn parse_chunk(data: &[u8]) -> Result<ChunkFrame, WireError> {
    if data.len() < 4 {
        return Err(WireError::TooShort);
    }

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() - 4 < header_len {
        return Err(WireError::HeaderTruncated {
            expected: header_len,
            got: data.len() - 4,
        });
    }

    let header: ChunkHeader = serde_json::from_slice(&data[4..4 + header_len])?;
    Ok(ChunkFrame {
        transfer_id: header.transfer_id,
        data: data[4 + header_len..].to_vec(),
    })
}

/// Errors from encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
