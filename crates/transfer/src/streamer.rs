use std::time::Duration;

use blockpull_protocol::{BlockEnd, ChunkFrame, ControlMessage, Frame, TransferId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelError};
use crate::config::TransferConfig;

/// Why streaming a block stopped early.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("cancelled")]
    Cancelled,

    #[error("channel closed")]
    Closed,

    #[error(transparent)]
    Channel(ChannelError),
}

impl From<ChannelError> for StreamError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Closed => StreamError::Closed,
            other => StreamError::Channel(other),
        }
    }
}

/// Counters for one streamed block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub chunks: u64,
    pub bytes: u64,
    /// Times the streamer paused for backpressure.
    pub stalls: u64,
}

/// Splits a block into chunks and writes them to a channel, pausing while
/// the channel's outstanding bytes sit above the high-water mark.
///
/// Once paused, sending resumes only after outstanding bytes drop below
/// the low-water mark. The wait yields to the runtime between polls.
#[derive(Debug, Clone)]
pub struct ChunkStreamer {
    chunk_size: usize,
    high_water: usize,
    low_water: usize,
    poll_interval: Duration,
}

impl ChunkStreamer {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            high_water: config.high_water_mark,
            low_water: config.low_water_mark,
            poll_interval: config.poll_interval(),
        }
    }

    /// Streams `data` as block `index`, followed by its end marker.
    ///
    /// An empty block produces only the end marker.
    pub async fn stream_block(
        &self,
        channel: &dyn Channel,
        transfer_id: &TransferId,
        index: u64,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<StreamStats, StreamError> {
        let mut stats = StreamStats::default();

        for chunk in data.chunks(self.chunk_size) {
            self.check_ready(channel, cancel)?;
            if self.wait_for_capacity(channel, cancel).await? {
                stats.stalls += 1;
            }

            channel.send(Frame::Chunk(ChunkFrame {
                transfer_id: transfer_id.clone(),
                data: chunk.to_vec(),
            }))?;
            stats.chunks += 1;
            stats.bytes += chunk.len() as u64;
            trace!(transfer_id = %transfer_id, block = index, bytes = chunk.len(), "chunk sent");
        }

        self.check_ready(channel, cancel)?;
        channel.send(
            ControlMessage::BlockEnd(BlockEnd {
                transfer_id: transfer_id.clone(),
                block_index: index,
            })
            .into(),
        )?;

        debug!(
            transfer_id = %transfer_id,
            block = index,
            chunks = stats.chunks,
            bytes = stats.bytes,
            stalls = stats.stalls,
            "block streamed"
        );
        Ok(stats)
    }

    fn check_ready(
        &self,
        channel: &dyn Channel,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        if !channel.is_open() {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    /// Blocks while the channel is congested. Returns `true` if it paused.
    async fn wait_for_capacity(
        &self,
        channel: &dyn Channel,
        cancel: &CancellationToken,
    ) -> Result<bool, StreamError> {
        if channel.outstanding_bytes() <= self.high_water {
            return Ok(false);
        }

        trace!(
            outstanding = channel.outstanding_bytes(),
            high = self.high_water,
            "backpressure: pausing"
        );
        while channel.outstanding_bytes() >= self.low_water {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            if !channel.is_open() {
                return Err(StreamError::Closed);
            }
        }
        trace!(outstanding = channel.outstanding_bytes(), "backpressure: resuming");
        Ok(true)
    }
}
