//! Pull-based, block-verified file transfer.
//!
//! A file is segmented into large blocks. The receiver pulls one block at
//! a time; the sender answers with a digest header, the block's bytes in
//! small flow-controlled chunks, and an end-of-block marker. The receiver
//! verifies each block before persisting it and re-pulls the same block
//! on mismatch.

mod channel;
mod checksum;
mod config;
mod endpoint;
mod progress;
mod receiver;
mod registry;
mod segment;
mod sender;
mod sink;
mod source;
mod streamer;
mod validation;

pub use channel::{Channel, ChannelError, MemoryChannel, MemoryEnd, memory_pair};
pub use checksum::{calculate_file_checksum, checksum_bytes, digest};
pub use config::TransferConfig;
pub use endpoint::{Endpoint, EndpointHandle, TransferEvent};
pub use progress::SpeedCalculator;
pub use receiver::{Reaction, ReceiverSession, check_announce};
pub use registry::SessionRegistry;
pub use segment::{BlockLayout, BlockRange};
pub use sender::SenderSession;
pub use sink::{
    BlockSink, DirectorySinks, FileSink, MemoryOutput, MemorySink, MemorySinks, SinkProvider,
    SinkStatus,
};
pub use source::{BlockSource, FileSource, MemorySource};
pub use streamer::{ChunkStreamer, StreamError, StreamStats};
pub use validation::validate_file_name;

use blockpull_protocol::TransferId;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("invalid file name: {0}")]
    InvalidPath(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown transfer: {0}")]
    UnknownTransfer(TransferId),

    #[error("no destination for transfer: {0}")]
    SinkUnavailable(String),

    #[error("endpoint is not running")]
    EndpointStopped,
}
