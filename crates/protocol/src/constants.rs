use std::time::Duration;

/// Default block size: 10 MiB.
///
/// A block is the unit of integrity verification and retry. Both ends
/// must agree on it; the sender advertises its value in the announce.
pub const DEFAULT_BLOCK_SIZE: u64 = 10 * 1024 * 1024;

/// Default chunk size on the wire: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Outstanding unsent bytes above which the streamer stops sending (1 MiB).
pub const DEFAULT_HIGH_WATER_MARK: usize = 1024 * 1024;

/// Outstanding unsent bytes below which a paused streamer resumes (256 KiB).
pub const DEFAULT_LOW_WATER_MARK: usize = 256 * 1024;

/// How often a paused streamer re-checks the outstanding byte counter.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Consecutive digest mismatches tolerated for one block before the
/// transfer is failed as corrupt.
pub const DEFAULT_MAX_BLOCK_RETRIES: u32 = 5;

/// Idle time after which a receiver waiting on a block gives up.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest message the transport accepts (chunk payload plus framing).
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Finished transfers remembered per endpoint so their ids are never
/// reused or resurrected. The oldest are forgotten beyond this.
pub const MAX_TOMBSTONES: usize = 4096;

/// Length of generated transfer identifiers.
pub const TRANSFER_ID_LEN: usize = 10;

/// Length of a block digest in bytes (SHA-256).
pub const DIGEST_LEN: usize = 32;

/// Interval between WebSocket keepalive pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Time without any inbound frame after which a WebSocket peer is
/// considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Default TCP port for the WebSocket listener.
pub const DEFAULT_PORT: u16 = 9480;
