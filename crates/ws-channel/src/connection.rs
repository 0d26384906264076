use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use blockpull_protocol::{Frame, WireMessage};
use blockpull_transfer::{Channel, ChannelError};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pumps::read::read_pump;
use crate::pumps::write::{Outbound, write_pump};

/// Errors from establishing a WebSocket connection.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Send half of a WebSocket connection, usable as a transfer [`Channel`].
pub struct WsChannel {
    tx: mpsc::UnboundedSender<Outbound>,
    outstanding: Arc<AtomicUsize>,
    max_message_size: usize,
    cancel: CancellationToken,
}

impl WsChannel {
    /// Closes the connection. Both pumps stop and the peer sees a close
    /// frame.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Channel for WsChannel {
    fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Closed);
        }

        let wire = frame.encode()?;
        let len = wire.len();
        if len > self.max_message_size {
            return Err(ChannelError::TooLarge {
                size: len,
                max: self.max_message_size,
            });
        }
        let message = match wire {
            WireMessage::Text(text) => WsMessage::Text(text.into()),
            WireMessage::Binary(data) => WsMessage::Binary(data.into()),
        };

        self.outstanding.fetch_add(len, Ordering::SeqCst);
        if self.tx.send(Outbound { message, len }).is_err() {
            self.outstanding.fetch_sub(len, Ordering::SeqCst);
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// An established connection: the channel to send on and the stream of
/// decoded inbound frames. The stream ends when the connection closes.
pub struct WsConnection {
    pub channel: Arc<WsChannel>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

fn ws_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

/// Connects to a WebSocket URL.
pub async fn connect(url: &str, max_message_size: usize) -> Result<WsConnection, WsError> {
    let config = ws_config(max_message_size);
    let (ws_stream, _) =
        tokio_tungstenite::connect_async_with_config(url, Some(config), false).await?;
    info!(url = %url, "connected");
    Ok(spawn_connection(ws_stream, max_message_size))
}

/// Completes the server side of the WebSocket handshake on `stream`.
pub async fn accept(stream: TcpStream, max_message_size: usize) -> Result<WsConnection, WsError> {
    let peer = stream.peer_addr()?;
    let ws_stream =
        tokio_tungstenite::accept_async_with_config(stream, Some(ws_config(max_message_size)))
            .await?;
    info!(peer = %peer, "peer connected");
    Ok(spawn_connection(ws_stream, max_message_size))
}

/// Runs the read and write pumps for an upgraded WebSocket stream.
///
/// When the read pump exits the write pump is stopped too, so
/// [`Channel::is_open`] turns false once either direction fails.
pub fn spawn_connection<S>(ws_stream: S, max_message_size: usize) -> WsConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tungstenite::Error>
        + Send
        + 'static,
{
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let outstanding = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();

    let (ws_sink, ws_stream) = ws_stream.split();

    let write_cancel = cancel.clone();
    let write_outstanding = Arc::clone(&outstanding);
    tokio::spawn(async move {
        write_pump(ws_sink, write_rx, write_outstanding, write_cancel.clone()).await;
        write_cancel.cancel();
    });

    let read_cancel = cancel.clone();
    let pong_tx = write_tx.clone();
    tokio::spawn(async move {
        read_pump(ws_stream, inbound_tx, pong_tx, read_cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        read_cancel.cancel();
        debug!("connection closed");
    });

    WsConnection {
        channel: Arc::new(WsChannel {
            tx: write_tx,
            outstanding,
            max_message_size,
            cancel,
        }),
        inbound: inbound_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockpull_protocol::{ChunkFrame, ControlMessage, PullBlock};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn loopback(max: usize) -> (WsConnection, WsConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream, max).await.unwrap()
        });
        let client = connect(&format!("ws://{addr}"), max).await.unwrap();
        (server.await.unwrap(), client)
    }

    fn pull(index: u64) -> Frame {
        ControlMessage::PullBlock(PullBlock {
            transfer_id: "t".into(),
            block_index: index,
        })
        .into()
    }

    #[tokio::test]
    async fn frames_cross_the_connection() {
        let (server, mut client) = loopback(64 * 1024).await;

        server.channel.send(pull(3)).unwrap();
        let chunk = Frame::Chunk(ChunkFrame {
            transfer_id: "t".into(),
            data: vec![9u8; 1000],
        });
        server.channel.send(chunk.clone()).unwrap();

        assert_eq!(client.inbound.recv().await.unwrap(), pull(3));
        assert_eq!(client.inbound.recv().await.unwrap(), chunk);
    }

    #[tokio::test]
    async fn outstanding_drains_after_write() {
        let (server, mut client) = loopback(64 * 1024).await;
        server
            .channel
            .send(Frame::Chunk(ChunkFrame {
                transfer_id: "t".into(),
                data: vec![0u8; 4000],
            }))
            .unwrap();
        client.inbound.recv().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.channel.outstanding_bytes() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn oversized_message_is_refused() {
        let (server, _client) = loopback(1024).await;
        let err = server
            .channel
            .send(Frame::Chunk(ChunkFrame {
                transfer_id: "t".into(),
                data: vec![0u8; 2048],
            }))
            .unwrap_err();
        assert!(matches!(err, ChannelError::TooLarge { max: 1024, .. }));
        assert_eq!(server.channel.outstanding_bytes(), 0);
    }

    #[tokio::test]
    async fn close_ends_peer_inbound() {
        let (server, mut client) = loopback(64 * 1024).await;
        server.channel.close();
        assert!(!server.channel.is_open());
        assert!(matches!(server.channel.send(pull(0)), Err(ChannelError::Closed)));

        let end = tokio::time::timeout(Duration::from_secs(2), client.inbound.recv())
            .await
            .unwrap();
        assert!(end.is_none());
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.channel.is_open() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
