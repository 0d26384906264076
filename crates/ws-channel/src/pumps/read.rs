//! WebSocket read pump: decodes incoming messages into frames.

use blockpull_protocol::constants::WS_PONG_WAIT;
use blockpull_protocol::{Frame, WireMessage};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::write::Outbound;

/// Reads messages from the WebSocket and forwards decoded frames.
///
/// Any incoming message resets the pong deadline. If nothing arrives
/// within [`WS_PONG_WAIT`] the connection is considered dead. Messages
/// that fail to decode are logged and skipped. `inbound` is dropped on
/// exit so the consumer sees the end of the stream.
pub(crate) async fn read_pump<S>(
    mut read: S,
    inbound: mpsc::UnboundedSender<Frame>,
    write_tx: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout, closing connection");
                break;
            }

            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!("WebSocket read error: {e}");
                        break;
                    }
                    None => break,
                };
                pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                let wire = match msg {
                    tungstenite::Message::Text(text) => WireMessage::Text(text.as_str().to_owned()),
                    tungstenite::Message::Binary(data) => WireMessage::Binary(data.to_vec()),
                    tungstenite::Message::Ping(data) => {
                        trace!("received ping, sending pong");
                        let _ = write_tx.send(Outbound {
                            message: tungstenite::Message::Pong(data),
                            len: 0,
                        });
                        continue;
                    }
                    tungstenite::Message::Pong(_) => {
                        trace!("received pong");
                        continue;
                    }
                    tungstenite::Message::Close(_) => {
                        debug!("received close frame");
                        break;
                    }
                    tungstenite::Message::Frame(_) => continue,
                };

                match Frame::decode(wire) {
                    Ok(frame) => {
                        if inbound.send(frame).is_err() {
                            debug!("inbound receiver dropped");
                            break;
                        }
                    }
                    Err(e) => warn!("dropping undecodable message: {e}"),
                }
            }
        }
    }
}
