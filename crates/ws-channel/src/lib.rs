//! WebSocket transport for blockpull transfers.
//!
//! Control records travel as text frames and chunks as binary frames.
//! Outbound messages go through an unbounded queue drained by a write
//! pump; the bytes still queued are reported as the channel's
//! outstanding count so the chunk streamer can throttle on it.

mod connection;
mod pumps;

pub use connection::{WsChannel, WsConnection, WsError, accept, connect, spawn_connection};
