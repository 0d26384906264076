use std::time::Duration;

use blockpull_protocol::constants::{
    BACKPRESSURE_POLL_INTERVAL, DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_HIGH_WATER_MARK,
    DEFAULT_LOW_WATER_MARK, DEFAULT_MAX_BLOCK_RETRIES, DEFAULT_STALL_TIMEOUT, MAX_MESSAGE_SIZE,
};
use serde::{Deserialize, Serialize};

use crate::TransferError;

/// Bytes reserved in every chunk message for the binary framing header.
const CHUNK_FRAMING_RESERVE: usize = 256;

/// Tunables shared by both ends of a transfer.
///
/// `block_size` must match on both sides; the receiver rejects an announce
/// that carries a different value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Size of a verification block in bytes.
    pub block_size: u64,

    /// Maximum chunk payload per message.
    pub chunk_size: usize,

    /// Pause sending when the channel holds more unsent bytes than this.
    pub high_water_mark: usize,

    /// Resume sending once unsent bytes fall below this.
    pub low_water_mark: usize,

    /// Backpressure re-check interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Consecutive digest mismatches tolerated per block.
    pub max_block_retries: u32,

    /// Idle time in milliseconds before a waiting transfer fails.
    pub stall_timeout_ms: u64,

    /// Largest message the transport accepts.
    pub max_message_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            poll_interval_ms: BACKPRESSURE_POLL_INTERVAL.as_millis() as u64,
            max_block_retries: DEFAULT_MAX_BLOCK_RETRIES,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT.as_millis() as u64,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl TransferConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// How often an endpoint checks for stalled transfers.
    pub fn tick_interval(&self) -> Duration {
        (self.stall_timeout() / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.block_size == 0 {
            return Err(TransferError::InvalidConfig(
                "block_size must be > 0".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidConfig(
                "chunk_size must be > 0".into(),
            ));
        }
        if self.chunk_size + CHUNK_FRAMING_RESERVE > self.max_message_size {
            return Err(TransferError::InvalidConfig(format!(
                "chunk_size {} plus {CHUNK_FRAMING_RESERVE} framing exceeds max_message_size {}",
                self.chunk_size, self.max_message_size
            )));
        }
        if self.low_water_mark >= self.high_water_mark {
            return Err(TransferError::InvalidConfig(format!(
                "low_water_mark {} must be below high_water_mark {}",
                self.low_water_mark, self.high_water_mark
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(TransferError::InvalidConfig(
                "poll_interval_ms must be > 0".into(),
            ));
        }
        if self.stall_timeout_ms == 0 {
            return Err(TransferError::InvalidConfig(
                "stall_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Largest chunk payload this side accepts from a peer.
    pub fn max_chunk_payload(&self) -> usize {
        self.max_message_size.saturating_sub(CHUNK_FRAMING_RESERVE)
    }
}
