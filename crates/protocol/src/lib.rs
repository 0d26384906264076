pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use envelope::{ChunkFrame, ControlMessage, Frame, WireError, WireMessage};
pub use messages::{Announce, BlockEnd, BlockHeader, Cancel, PullBlock};
pub use types::{
    BlockDigest, FailureKind, TransferId, TransferProgress, TransferRole, TransferState,
};
