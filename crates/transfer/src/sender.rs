use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use blockpull_protocol::{
    Announce, BlockDigest, BlockHeader, Cancel, ControlMessage, FailureKind, TransferId,
    TransferProgress, TransferRole, TransferState,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::TransferError;
use crate::channel::Channel;
use crate::checksum::digest;
use crate::config::TransferConfig;
use crate::endpoint::TransferEvent;
use crate::progress::SpeedCalculator;
use crate::segment::BlockLayout;
use crate::source::BlockSource;
use crate::streamer::{ChunkStreamer, StreamError};

#[derive(Debug)]
struct SenderStats {
    /// Every byte put on the channel, repeats included.
    bytes_streamed: u64,
    /// End offset of the furthest block served.
    high_water_offset: u64,
    highest_served: Option<u64>,
    repeats: u64,
    /// A pull is being read and streamed right now.
    serving: bool,
    last_activity: Instant,
    error: String,
}

/// Sending side of one transfer.
///
/// Announces the file on start, then serves pull requests one at a time
/// from a dedicated task. Each pull re-reads its block from the source.
pub struct SenderSession {
    transfer_id: TransferId,
    file_name: String,
    layout: BlockLayout,
    pulls: mpsc::UnboundedSender<u64>,
    state: Arc<watch::Sender<TransferState>>,
    stats: Arc<Mutex<SenderStats>>,
    speed: Arc<SpeedCalculator>,
    cancel: CancellationToken,
}

impl SenderSession {
    /// Sends the announce and spawns the streaming task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        transfer_id: TransferId,
        source: Arc<dyn BlockSource>,
        channel: Arc<dyn Channel>,
        config: &TransferConfig,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<Self, TransferError> {
        let layout = BlockLayout::new(source.size(), config.block_size);
        let file_name = source.name().to_string();
        let (state_tx, _) = watch::channel(TransferState::Idle);
        let state = Arc::new(state_tx);

        channel.send(
            ControlMessage::Announce(Announce {
                transfer_id: transfer_id.clone(),
                file_name: file_name.clone(),
                total_size: layout.total_size(),
                block_size: layout.block_size(),
                chunk_size: config.chunk_size,
            })
            .into(),
        )?;
        info!(
            transfer_id = %transfer_id,
            file = %file_name,
            size = layout.total_size(),
            blocks = layout.total_blocks(),
            "transfer announced"
        );
        set_state(&state, TransferState::Announced);

        let stats = Arc::new(Mutex::new(SenderStats {
            bytes_streamed: 0,
            high_water_offset: 0,
            highest_served: None,
            repeats: 0,
            serving: false,
            last_activity: Instant::now(),
            error: String::new(),
        }));
        let speed = Arc::new(SpeedCalculator::default());
        let cancel = CancellationToken::new();
        let (pulls_tx, pulls_rx) = mpsc::unbounded_channel();

        let mut worker = Worker {
            transfer_id: transfer_id.clone(),
            layout,
            source,
            channel,
            streamer: ChunkStreamer::new(config),
            state: Arc::clone(&state),
            stats: Arc::clone(&stats),
            speed: Arc::clone(&speed),
            cancel: cancel.clone(),
            events,
            done_reported: false,
        };

        if layout.is_empty() {
            worker.mark_done();
        }
        tokio::spawn(worker.run(pulls_rx));

        Ok(Self {
            transfer_id,
            file_name,
            layout,
            pulls: pulls_tx,
            state,
            stats,
            speed,
            cancel,
        })
    }

    pub fn transfer_id(&self) -> &TransferId {
        &self.transfer_id
    }

    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    /// Queues a pull for `index`.
    ///
    /// Returns `false` if the index is out of range or the session has
    /// ended; the request is dropped.
    pub fn pull(&self, index: u64) -> bool {
        if index >= self.layout.total_blocks() {
            warn!(
                transfer_id = %self.transfer_id,
                index,
                total_blocks = self.layout.total_blocks(),
                "pull for out-of-range block dropped"
            );
            return false;
        }
        if self.state().is_terminal() {
            debug!(transfer_id = %self.transfer_id, index, "pull after end dropped");
            return false;
        }
        self.stats.lock().unwrap().last_activity = Instant::now();
        self.pulls.send(index).is_ok()
    }

    /// Stops streaming at the next chunk boundary.
    pub fn cancel(&self) {
        set_state(&self.state, TransferState::Cancelled);
        self.cancel.cancel();
    }

    /// Ends the session with `Failed(kind)` and stops streaming. Returns
    /// `false` if it had already ended.
    pub fn fail(&self, kind: FailureKind, reason: &str) -> bool {
        let changed = set_state(&self.state, TransferState::Failed(kind));
        if changed {
            self.stats.lock().unwrap().error = reason.to_string();
        }
        self.cancel.cancel();
        changed
    }

    /// Returns `true` if the session is waiting for a pull and has seen
    /// none for at least `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        let stats = self.stats.lock().unwrap();
        !stats.serving && now.saturating_duration_since(stats.last_activity) >= timeout
    }

    pub fn progress(&self) -> TransferProgress {
        let state = self.state();
        let stats = self.stats.lock().unwrap();
        let remaining = self.layout.total_size().saturating_sub(stats.high_water_offset);
        TransferProgress {
            transfer_id: self.transfer_id.clone(),
            role: TransferRole::Sender,
            file_name: self.file_name.clone(),
            state,
            label: state.label().to_string(),
            total_size: self.layout.total_size(),
            transferred_bytes: stats.high_water_offset,
            total_blocks: self.layout.total_blocks(),
            retries: stats.repeats,
            current_block: state.block_index(),
            rate_bps: self.speed.bytes_per_second(),
            eta_secs: self.speed.eta(remaining).map(|eta| eta.as_secs()),
            error: stats.error.clone(),
        }
    }
}

impl Drop for SenderSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Moves to `next` unless the session already ended.
fn set_state(state: &watch::Sender<TransferState>, next: TransferState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() || *current == next {
            return false;
        }
        *current = next;
        true
    })
}

#[derive(Debug, thiserror::Error)]
enum ServeError {
    #[error("source read failed: {0}")]
    Read(#[from] io::Error),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

struct Worker {
    transfer_id: TransferId,
    layout: BlockLayout,
    source: Arc<dyn BlockSource>,
    channel: Arc<dyn Channel>,
    streamer: ChunkStreamer,
    state: Arc<watch::Sender<TransferState>>,
    stats: Arc<Mutex<SenderStats>>,
    speed: Arc<SpeedCalculator>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<TransferEvent>,
    done_reported: bool,
}

impl Worker {
    async fn run(mut self, mut pulls: mpsc::UnboundedReceiver<u64>) {
        loop {
            let index = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = pulls.recv() => match next {
                    Some(index) => index,
                    None => break,
                },
            };

            match self.serve(index).await {
                Ok(()) => {}
                Err(ServeError::Stream(StreamError::Cancelled)) => {
                    debug!(transfer_id = %self.transfer_id, index, "streaming cancelled");
                    break;
                }
                Err(ServeError::Stream(StreamError::Closed)) => {
                    debug!(transfer_id = %self.transfer_id, index, "channel closed mid-block");
                    self.fail(FailureKind::ChannelClosed, "channel closed".into());
                    break;
                }
                Err(ServeError::Stream(StreamError::Channel(e))) => {
                    error!(transfer_id = %self.transfer_id, index, error = %e, "send failed");
                    self.notify_peer(&e.to_string());
                    self.fail(FailureKind::Io, e.to_string());
                    break;
                }
                Err(ServeError::Read(e)) => {
                    error!(
                        transfer_id = %self.transfer_id,
                        index,
                        error = %e,
                        "source read failed"
                    );
                    self.notify_peer(&format!("source read failed: {e}"));
                    self.fail(FailureKind::Io, e.to_string());
                    break;
                }
            }
        }
    }

    async fn serve(&mut self, index: u64) -> Result<(), ServeError> {
        let Some(range) = self.layout.block(index) else {
            return Ok(());
        };
        if self.cancel.is_cancelled() {
            return Err(StreamError::Cancelled.into());
        }

        let repeat = {
            let mut stats = self.stats.lock().unwrap();
            let repeat = stats.highest_served.is_some_and(|h| index <= h);
            if repeat {
                stats.repeats += 1;
            }
            stats.serving = true;
            repeat
        };
        set_state(&self.state, TransferState::StreamingBlock(index));

        let source = Arc::clone(&self.source);
        let (data, block_digest) = tokio::task::spawn_blocking(move || {
            let len = usize::try_from(range.len).map_err(io::Error::other)?;
            let data = source.read_range(range.offset, len)?;
            let block_digest = digest(&data);
            Ok::<(Vec<u8>, BlockDigest), io::Error>((data, block_digest))
        })
        .await
        .map_err(io::Error::other)??;

        if self.cancel.is_cancelled() {
            return Err(StreamError::Cancelled.into());
        }
        self.channel
            .send(
                ControlMessage::BlockHeader(BlockHeader {
                    transfer_id: self.transfer_id.clone(),
                    block_index: index,
                    digest: block_digest,
                })
                .into(),
            )
            .map_err(StreamError::from)?;

        let sent = self
            .streamer
            .stream_block(
                self.channel.as_ref(),
                &self.transfer_id,
                index,
                &data,
                &self.cancel,
            )
            .await?;

        {
            let mut stats = self.stats.lock().unwrap();
            stats.bytes_streamed += sent.bytes;
            stats.high_water_offset = stats.high_water_offset.max(range.end());
            stats.highest_served = Some(stats.highest_served.map_or(index, |h| h.max(index)));
            stats.serving = false;
            stats.last_activity = Instant::now();
            debug!(
                transfer_id = %self.transfer_id,
                index,
                repeat,
                streamed = stats.bytes_streamed,
                "block served"
            );
        }
        self.speed.add_sample(sent.bytes);
        let _ = self.events.send(TransferEvent::BlockServed {
            transfer_id: self.transfer_id.clone(),
            index,
            repeat,
        });

        if self.layout.is_last(index) || self.done_reported {
            self.mark_done();
        }
        Ok(())
    }

    fn mark_done(&mut self) {
        set_state(&self.state, TransferState::Done);
        if !self.done_reported {
            self.done_reported = true;
            info!(transfer_id = %self.transfer_id, "all blocks streamed");
            let _ = self.events.send(TransferEvent::Finished {
                transfer_id: self.transfer_id.clone(),
                role: TransferRole::Sender,
                state: TransferState::Done,
            });
        }
    }

    fn fail(&self, kind: FailureKind, reason: String) {
        let state = TransferState::Failed(kind);
        self.stats.lock().unwrap().error = reason;
        if set_state(&self.state, state) {
            let _ = self.events.send(TransferEvent::Finished {
                transfer_id: self.transfer_id.clone(),
                role: TransferRole::Sender,
                state,
            });
        }
    }

    fn notify_peer(&self, reason: &str) {
        let _ = self.channel.send(
            ControlMessage::Cancel(Cancel {
                transfer_id: self.transfer_id.clone(),
                reason: reason.to_string(),
            })
            .into(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryEnd, memory_pair};
    use crate::source::MemorySource;
    use blockpull_protocol::Frame;

    fn config() -> TransferConfig {
        TransferConfig {
            block_size: 8,
            chunk_size: 3,
            poll_interval_ms: 5,
            ..TransferConfig::default()
        }
    }

    fn start(data: &[u8]) -> (SenderSession, MemoryEnd, mpsc::UnboundedReceiver<TransferEvent>) {
        let (a, b) = memory_pair();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = SenderSession::start(
            "t1".into(),
            Arc::new(MemorySource::new("f.bin", data.to_vec())),
            a.channel,
            &config(),
            events_tx,
        )
        .unwrap();
        (session, b, events_rx)
    }

    /// Collects frames up to and including the next end-of-block marker.
    async fn next_block(peer: &mut MemoryEnd) -> (BlockHeader, Vec<u8>) {
        let header = match peer.inbound.recv().await.unwrap() {
            Frame::Control(ControlMessage::BlockHeader(h)) => h,
            other => panic!("expected header, got {other:?}"),
        };
        let mut data = Vec::new();
        loop {
            match peer.inbound.recv().await.unwrap() {
                Frame::Chunk(c) => data.extend(c.data),
                Frame::Control(ControlMessage::BlockEnd(end)) => {
                    assert_eq!(end.block_index, header.block_index);
                    return (header, data);
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn announces_then_waits_for_pull() {
        let (session, mut peer, _events) = start(b"0123456789");
        match peer.inbound.recv().await.unwrap() {
            Frame::Control(ControlMessage::Announce(a)) => {
                assert_eq!(a.total_size, 10);
                assert_eq!(a.block_size, 8);
                assert_eq!(a.file_name, "f.bin");
            }
            other => panic!("expected announce, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(peer.inbound.try_recv().is_err(), "nothing is pre-sent");
        assert_eq!(session.state(), TransferState::Announced);
    }

    #[tokio::test]
    async fn serves_blocks_with_digest() {
        let (session, mut peer, mut events) = start(b"0123456789");
        peer.inbound.recv().await.unwrap();

        assert!(session.pull(0));
        let (header, data) = next_block(&mut peer).await;
        assert_eq!(header.block_index, 0);
        assert_eq!(data, b"01234567");
        assert_eq!(header.digest, digest(b"01234567"));

        assert!(session.pull(1));
        let (header, data) = next_block(&mut peer).await;
        assert_eq!(header.block_index, 1);
        assert_eq!(data, b"89");

        let mut done = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await
        {
            if matches!(event, TransferEvent::Finished { state: TransferState::Done, .. }) {
                done = true;
                break;
            }
        }
        assert!(done);
        assert_eq!(session.state(), TransferState::Done);
        assert_eq!(session.progress().transferred_bytes, 10);
    }

    #[tokio::test]
    async fn unpulled_session_goes_idle() {
        let (session, mut peer, _events) = start(b"0123456789");
        peer.inbound.recv().await.unwrap();
        assert_eq!(session.state(), TransferState::Announced);

        let timeout = Duration::from_secs(30);
        assert!(!session.is_idle(Instant::now(), timeout));
        assert!(session.is_idle(Instant::now() + Duration::from_secs(3600), timeout));

        // A pull counts as activity.
        session.pull(0);
        next_block(&mut peer).await;
        assert_eq!(session.state(), TransferState::StreamingBlock(0));
        assert!(!session.is_idle(Instant::now(), timeout));
    }

    #[tokio::test]
    async fn progress_reports_block_being_served() {
        let (session, mut peer, _events) = start(b"0123456789");
        peer.inbound.recv().await.unwrap();
        assert_eq!(session.progress().current_block, None);

        session.pull(0);
        next_block(&mut peer).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let progress = session.progress();
        assert_eq!(progress.current_block, Some(0));
        assert_eq!(progress.transferred_bytes, 8);
    }

    #[tokio::test]
    async fn repeated_pull_resends_same_bytes() {
        let (session, mut peer, _events) = start(b"0123456789");
        peer.inbound.recv().await.unwrap();

        session.pull(0);
        session.pull(0);
        let first = next_block(&mut peer).await;
        let second = next_block(&mut peer).await;
        assert_eq!(first, second);
        assert_eq!(session.progress().retries, 1);
    }

    #[tokio::test]
    async fn out_of_range_pull_is_dropped() {
        let (session, mut peer, _events) = start(b"0123456789");
        peer.inbound.recv().await.unwrap();
        assert!(!session.pull(2));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(peer.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_source_is_done_immediately() {
        let (session, mut peer, _events) = start(b"");
        match peer.inbound.recv().await.unwrap() {
            Frame::Control(ControlMessage::Announce(a)) => assert_eq!(a.total_size, 0),
            other => panic!("expected announce, got {other:?}"),
        }
        assert_eq!(session.state(), TransferState::Done);
        assert!(!session.pull(0));
    }

    #[tokio::test]
    async fn cancel_stops_streaming() {
        let (a, mut peer) = memory_pair();
        a.channel.set_outstanding(usize::MAX);
        let (events_tx, _events) = mpsc::unbounded_channel();
        let session = SenderSession::start(
            "t1".into(),
            Arc::new(MemorySource::new("f.bin", vec![7u8; 16])),
            a.channel.clone(),
            &config(),
            events_tx,
        )
        .unwrap();
        peer.inbound.recv().await.unwrap();

        session.pull(0);
        // Header goes out, then the streamer blocks on backpressure.
        assert!(matches!(
            peer.inbound.recv().await.unwrap(),
            Frame::Control(ControlMessage::BlockHeader(_))
        ));
        session.cancel();
        a.channel.set_outstanding(0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(peer.inbound.try_recv().is_err(), "no chunk after cancel");
        assert_eq!(session.state(), TransferState::Cancelled);
    }

    #[tokio::test]
    async fn read_error_fails_and_notifies_peer() {
        struct Broken;
        impl BlockSource for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn size(&self) -> u64 {
                4
            }
            fn read_range(&self, _: u64, _: usize) -> io::Result<Vec<u8>> {
                Err(io::Error::other("disk gone"))
            }
        }

        let (a, mut peer) = memory_pair();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let session = SenderSession::start(
            "t1".into(),
            Arc::new(Broken),
            a.channel,
            &config(),
            events_tx,
        )
        .unwrap();
        peer.inbound.recv().await.unwrap();

        session.pull(0);
        match peer.inbound.recv().await.unwrap() {
            Frame::Control(ControlMessage::Cancel(c)) => assert!(c.reason.contains("disk gone")),
            other => panic!("expected cancel, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), TransferState::Failed(FailureKind::Io));
    }
}
