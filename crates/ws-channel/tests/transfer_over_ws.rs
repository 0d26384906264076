//! Whole transfers between two endpoints joined by a loopback WebSocket.

use std::sync::Arc;
use std::time::Duration;

use blockpull_protocol::{TransferRole, TransferState};
use blockpull_transfer::{
    Endpoint, MemorySinks, MemorySource, TransferConfig, TransferEvent, checksum_bytes,
};
use blockpull_ws_channel::{WsConnection, accept, connect};
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn config() -> TransferConfig {
    TransferConfig {
        block_size: 64 * 1024,
        chunk_size: 8 * 1024,
        high_water_mark: 32 * 1024,
        low_water_mark: 8 * 1024,
        poll_interval_ms: 2,
        ..TransferConfig::default()
    }
}

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

async fn finished(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    role: TransferRole,
) -> (Vec<TransferEvent>, TransferState) {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(20), events.recv())
            .await
            .expect("timed out")
            .expect("event stream closed");
        if let TransferEvent::Finished { role: r, state, .. } = &event {
            if *r == role {
                let state = *state;
                seen.push(event);
                return (seen, state);
            }
        }
        seen.push(event);
    }
}

#[tokio::test]
async fn file_crosses_a_websocket() {
    let cfg = config();
    let (server, client) = loopback(cfg.max_message_size).await;

    let mut data = vec![0u8; 300 * 1024 + 17];
    rand::thread_rng().fill_bytes(&mut data);

    let shutdown = CancellationToken::new();

    let mut sender = Endpoint::new(
        server.channel.clone(),
        cfg.clone(),
        Arc::new(MemorySinks::new()),
    )
    .unwrap();
    let mut sender_events = sender.take_events().unwrap();
    let sender_handle = sender.handle();
    let token = shutdown.clone();
    let server_inbound = server.inbound;
    let sender_task = tokio::spawn(async move { sender.run(server_inbound, token).await });

    let sinks = Arc::new(MemorySinks::new());
    let mut receiver = Endpoint::new(client.channel.clone(), cfg.clone(), sinks.clone()).unwrap();
    let mut receiver_events = receiver.take_events().unwrap();
    let token = shutdown.clone();
    let client_inbound = client.inbound;
    let receiver_task = tokio::spawn(async move { receiver.run(client_inbound, token).await });

    let id = sender_handle
        .offer(Arc::new(MemorySource::new("payload.bin", data.clone())))
        .await
        .unwrap();

    let (events, state) = finished(&mut receiver_events, TransferRole::Receiver).await;
    assert_eq!(state, TransferState::Completed);
    let verified = events
        .iter()
        .filter(|e| matches!(e, TransferEvent::BlockVerified { .. }))
        .count();
    assert_eq!(verified, 5);

    let (_, sender_state) = finished(&mut sender_events, TransferRole::Sender).await;
    assert_eq!(sender_state, TransferState::Done);

    let received = sinks.finalized(&id).unwrap();
    assert_eq!(checksum_bytes(&received), checksum_bytes(&data));

    shutdown.cancel();
    sender_task.await.unwrap().unwrap();
    receiver_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn dropped_connection_fails_the_receiver() {
    let cfg = TransferConfig {
        high_water_mark: 16 * 1024,
        low_water_mark: 4 * 1024,
        poll_interval_ms: 20,
        ..config()
    };
    let (server, client) = loopback(cfg.max_message_size).await;

    let mut data = vec![0u8; 16 * 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut data);

    let shutdown = CancellationToken::new();

    let mut sender = Endpoint::new(
        server.channel.clone(),
        cfg.clone(),
        Arc::new(MemorySinks::new()),
    )
    .unwrap();
    let sender_handle = sender.handle();
    let token = shutdown.clone();
    let server_inbound = server.inbound;
    let _sender_task = tokio::spawn(async move { sender.run(server_inbound, token).await });

    let mut receiver = Endpoint::new(
        client.channel.clone(),
        cfg.clone(),
        Arc::new(MemorySinks::new()),
    )
    .unwrap();
    let mut receiver_events = receiver.take_events().unwrap();
    let token = shutdown.clone();
    let client_inbound = client.inbound;
    let receiver_task = tokio::spawn(async move { receiver.run(client_inbound, token).await });

    sender_handle
        .offer(Arc::new(MemorySource::new("big.bin", data)))
        .await
        .unwrap();

    // Wait for the first verified block, then cut the connection.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(20), receiver_events.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, TransferEvent::BlockVerified { .. }) {
            break;
        }
    }
    server.channel.close();

    let (_, state) = finished(&mut receiver_events, TransferRole::Receiver).await;
    assert!(matches!(
        state,
        TransferState::Failed(blockpull_protocol::FailureKind::ChannelClosed)
    ));

    // Inbound closed, so the endpoint loop ends on its own.
    tokio::time::timeout(Duration::from_secs(5), receiver_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
