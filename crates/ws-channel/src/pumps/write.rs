//! WebSocket write pump: drains the outbound queue and keeps the
//! connection alive with periodic pings.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use blockpull_protocol::constants::WS_PING_PERIOD;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// A queued message and the bytes it counts against the outstanding total.
pub(crate) struct Outbound {
    pub message: tungstenite::Message,
    pub len: usize,
}

/// Writes queued messages to the WebSocket.
///
/// `outstanding` is decremented once a message has been handed to the
/// socket. A close frame is sent when the pump stops.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::UnboundedReceiver<Outbound>,
    outstanding: Arc<AtomicUsize>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut ping = tokio::time::interval(WS_PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                let Some(Outbound { message, len }) = msg else { break };
                let result = write.send(message).await;
                outstanding.fetch_sub(len, Ordering::SeqCst);
                if let Err(e) = result {
                    error!("WebSocket write error: {e}");
                    break;
                }
            }
            _ = ping.tick() => {
                trace!("sending ping");
                if write.send(tungstenite::Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Anything still queued will never be written.
    write_rx.close();
    while let Ok(Outbound { len, .. }) = write_rx.try_recv() {
        outstanding.fetch_sub(len, Ordering::SeqCst);
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
    let _ = write.close().await;
}
