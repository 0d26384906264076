use std::io;
use std::time::{Duration, Instant};

use blockpull_protocol::{
    Announce, BlockDigest, BlockEnd, BlockHeader, FailureKind, TransferId, TransferProgress,
    TransferRole, TransferState,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::checksum::digest;
use crate::config::TransferConfig;
use crate::endpoint::TransferEvent;
use crate::progress::SpeedCalculator;
use crate::segment::BlockLayout;
use crate::sink::BlockSink;
use crate::validation::validate_file_name;

/// What the owner of a [`ReceiverSession`] must do after feeding it a
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Nothing to send.
    Idle,
    /// Send a pull request for this block.
    Pull(u64),
    /// The session reached a terminal state.
    Finished(TransferState),
}

/// Checks an announce against local parameters.
///
/// Returns the rejection reason on failure.
pub fn check_announce(announce: &Announce, config: &TransferConfig) -> Result<(), String> {
    if announce.block_size == 0 {
        return Err("block size must be positive".into());
    }
    if announce.block_size != config.block_size {
        return Err(format!(
            "block size mismatch: announced {}, expected {}",
            announce.block_size, config.block_size
        ));
    }
    if announce.chunk_size > config.max_chunk_payload() {
        return Err(format!(
            "chunk size {} exceeds message limit {}",
            announce.chunk_size,
            config.max_chunk_payload()
        ));
    }
    validate_file_name(&announce.file_name).map_err(|e| e.to_string())
}

/// Block currently being accumulated.
struct OpenBlock {
    index: u64,
    expected: BlockDigest,
    len: u64,
    buf: Vec<u8>,
    overflowed: bool,
}

/// Receiving side of one transfer.
///
/// A synchronous state machine driven by its owner: each inbound message
/// is fed to one of the `on_*` methods, which returns the next
/// [`Reaction`]. Verified blocks are appended to the sink in index order;
/// the sink is finalized after the last block and aborted on any other
/// terminal state.
pub struct ReceiverSession {
    transfer_id: TransferId,
    file_name: String,
    layout: BlockLayout,
    sink: Option<Box<dyn BlockSink>>,
    state: TransferState,
    next_index: u64,
    open: Option<OpenBlock>,
    attempts: u32,
    max_retries: u32,
    retries: u64,
    persisted: u64,
    last_activity: Instant,
    speed: SpeedCalculator,
    events: mpsc::UnboundedSender<TransferEvent>,
    error: String,
}

impl ReceiverSession {
    /// Creates the session for an accepted announce and returns the first
    /// pull. An empty file is finalized at once.
    pub fn start(
        announce: &Announce,
        sink: Box<dyn BlockSink>,
        config: &TransferConfig,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> (Self, Reaction) {
        let layout = BlockLayout::new(announce.total_size, announce.block_size);
        let mut session = Self {
            transfer_id: announce.transfer_id.clone(),
            file_name: announce.file_name.clone(),
            layout,
            sink: Some(sink),
            state: TransferState::Announced,
            next_index: 0,
            open: None,
            attempts: 0,
            max_retries: config.max_block_retries,
            retries: 0,
            persisted: 0,
            last_activity: Instant::now(),
            speed: SpeedCalculator::default(),
            events,
            error: String::new(),
        };

        if layout.is_empty() {
            let finalized = match session.sink.as_mut() {
                Some(sink) => sink.finalize(),
                None => Err(io::Error::other("sink unavailable")),
            };
            let reaction = match finalized {
                Ok(()) => {
                    session.state = TransferState::Completed;
                    info!(transfer_id = %session.transfer_id, "empty transfer completed");
                    Reaction::Finished(TransferState::Completed)
                }
                Err(e) => {
                    Reaction::Finished(session.fail(FailureKind::Io, format!("finalize: {e}")))
                }
            };
            return (session, reaction);
        }

        session.state = TransferState::AwaitingBlock(0);
        (session, Reaction::Pull(0))
    }

    pub fn transfer_id(&self) -> &TransferId {
        &self.transfer_id
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Opens block `header.block_index` for accumulation.
    ///
    /// Only the block being awaited is accepted. A repeated header for the
    /// block already open discards what was buffered and starts over.
    pub fn on_block_header(&mut self, header: &BlockHeader) -> Reaction {
        if self.state.is_terminal() {
            return Reaction::Idle;
        }
        if header.block_index != self.next_index {
            warn!(
                transfer_id = %self.transfer_id,
                index = header.block_index,
                expected = self.next_index,
                "unexpected block header dropped"
            );
            return Reaction::Idle;
        }
        let Some(range) = self.layout.block(header.block_index) else {
            return Reaction::Idle;
        };

        if self.open.is_some() {
            debug!(
                transfer_id = %self.transfer_id,
                index = header.block_index,
                "block restarted"
            );
        }
        self.open = Some(OpenBlock {
            index: header.block_index,
            expected: header.digest,
            len: range.len,
            buf: Vec::with_capacity(usize::try_from(range.len).unwrap_or(0)),
            overflowed: false,
        });
        self.state = TransferState::ReceivingChunks(header.block_index);
        self.touch();
        Reaction::Idle
    }

    /// Buffers one chunk for the open block.
    pub fn on_chunk(&mut self, data: &[u8]) -> Reaction {
        if self.state.is_terminal() {
            return Reaction::Idle;
        }
        let Some(open) = self.open.as_mut() else {
            warn!(
                transfer_id = %self.transfer_id,
                bytes = data.len(),
                "chunk with no open block dropped"
            );
            return Reaction::Idle;
        };

        if open.overflowed || open.buf.len() as u64 + data.len() as u64 > open.len {
            if !open.overflowed {
                warn!(
                    transfer_id = %self.transfer_id,
                    index = open.index,
                    "chunk overflows block length"
                );
            }
            open.overflowed = true;
        } else {
            open.buf.extend_from_slice(data);
        }
        self.touch();
        Reaction::Idle
    }

    /// Verifies the open block and persists it or asks for it again.
    ///
    /// Hashing and the sink write run on the blocking pool.
    pub async fn on_block_end(&mut self, end: &BlockEnd) -> Reaction {
        if self.state.is_terminal() {
            return Reaction::Idle;
        }
        let open = match self.open.take() {
            Some(open) if open.index == end.block_index => open,
            other => {
                self.open = other;
                warn!(
                    transfer_id = %self.transfer_id,
                    index = end.block_index,
                    "end of block with no matching header dropped"
                );
                return Reaction::Idle;
            }
        };

        let index = open.index;
        self.state = TransferState::Verifying(index);
        self.touch();

        let verified = if open.overflowed || open.buf.len() as u64 != open.len {
            Ok(false)
        } else {
            let OpenBlock { buf, expected, .. } = open;
            self.run_on_sink(move |sink| {
                if digest(&buf) != expected {
                    return Ok(false);
                }
                sink.append(&buf)?;
                Ok(true)
            })
            .await
        };

        match verified {
            Ok(true) => self.persisted(index).await,
            Ok(false) => self.mismatch(index),
            Err(e) => Reaction::Finished(self.fail(FailureKind::Io, format!("sink write: {e}"))),
        }
    }

    async fn persisted(&mut self, index: u64) -> Reaction {
        let len = self.layout.block(index).map_or(0, |r| r.len);
        self.persisted += len;
        self.attempts = 0;
        self.state = TransferState::Persisted(index);
        self.speed.add_sample(len);
        let _ = self.events.send(TransferEvent::BlockVerified {
            transfer_id: self.transfer_id.clone(),
            index,
        });
        debug!(transfer_id = %self.transfer_id, index, bytes = len, "block persisted");

        if self.layout.is_last(index) {
            return match self.run_on_sink(|sink| sink.finalize()).await {
                Ok(()) => {
                    self.state = TransferState::Completed;
                    info!(
                        transfer_id = %self.transfer_id,
                        file = %self.file_name,
                        bytes = self.persisted,
                        retries = self.retries,
                        "transfer completed"
                    );
                    Reaction::Finished(TransferState::Completed)
                }
                Err(e) => Reaction::Finished(self.fail(FailureKind::Io, format!("finalize: {e}"))),
            };
        }

        self.next_index = index + 1;
        self.state = TransferState::AwaitingBlock(self.next_index);
        Reaction::Pull(self.next_index)
    }

    fn mismatch(&mut self, index: u64) -> Reaction {
        self.attempts += 1;
        if self.attempts > self.max_retries {
            let reason = format!(
                "block {index} failed verification {} times",
                self.attempts
            );
            return Reaction::Finished(self.fail(FailureKind::Corrupt, reason));
        }

        self.retries += 1;
        self.state = TransferState::Retrying(index);
        warn!(
            transfer_id = %self.transfer_id,
            index,
            attempt = self.attempts,
            "block digest mismatch, pulling again"
        );
        let _ = self.events.send(TransferEvent::BlockRetry {
            transfer_id: self.transfer_id.clone(),
            index,
            attempt: self.attempts,
        });
        Reaction::Pull(index)
    }

    /// Fails the session if nothing arrived for `timeout`.
    pub fn check_stall(&mut self, now: Instant, timeout: Duration) -> Reaction {
        if self.state.is_terminal() {
            return Reaction::Idle;
        }
        let idle = now.saturating_duration_since(self.last_activity);
        if idle < timeout {
            return Reaction::Idle;
        }
        let reason = format!("no activity for {}s", idle.as_secs());
        Reaction::Finished(self.fail(FailureKind::Stalled, reason))
    }

    /// Cancels the transfer and aborts the sink.
    pub fn cancel(&mut self) -> TransferState {
        if self.state.is_terminal() {
            return self.state;
        }
        self.abort_sink();
        self.open = None;
        self.state = TransferState::Cancelled;
        info!(transfer_id = %self.transfer_id, "transfer cancelled");
        self.state
    }

    /// Moves to `Failed(kind)` and aborts the sink.
    pub fn fail(&mut self, kind: FailureKind, reason: String) -> TransferState {
        if self.state.is_terminal() {
            return self.state;
        }
        self.abort_sink();
        self.open = None;
        self.state = TransferState::Failed(kind);
        warn!(
            transfer_id = %self.transfer_id,
            state = self.state.label(),
            reason = %reason,
            "transfer failed"
        );
        self.error = reason;
        self.state
    }

    pub fn progress(&self) -> TransferProgress {
        let remaining = self.layout.total_size().saturating_sub(self.persisted);
        TransferProgress {
            transfer_id: self.transfer_id.clone(),
            role: TransferRole::Receiver,
            file_name: self.file_name.clone(),
            state: self.state,
            label: self.state.label().to_string(),
            total_size: self.layout.total_size(),
            transferred_bytes: self.persisted,
            total_blocks: self.layout.total_blocks(),
            retries: self.retries,
            current_block: self.state.block_index(),
            rate_bps: self.speed.bytes_per_second(),
            eta_secs: self.speed.eta(remaining).map(|eta| eta.as_secs()),
            error: self.error.clone(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn abort_sink(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.abort() {
                warn!(transfer_id = %self.transfer_id, error = %e, "sink abort failed");
            }
        }
    }

    /// Runs `f` against the sink on the blocking pool.
    async fn run_on_sink<R, F>(&mut self, f: F) -> io::Result<R>
    where
        F: FnOnce(&mut dyn BlockSink) -> io::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| io::Error::other("sink unavailable"))?;
        let (sink, result) = tokio::task::spawn_blocking(move || {
            let result = f(sink.as_mut());
            (sink, result)
        })
        .await
        .map_err(io::Error::other)?;
        self.sink = Some(sink);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemoryOutput, MemorySink, SinkStatus};
    use std::sync::{Arc, Mutex};

    const BLOCK: u64 = 4;

    fn config() -> TransferConfig {
        TransferConfig {
            block_size: BLOCK,
            chunk_size: 2,
            max_block_retries: 2,
            ..TransferConfig::default()
        }
    }

    fn announce(size: u64) -> Announce {
        Announce {
            transfer_id: "r1".into(),
            file_name: "out.bin".into(),
            total_size: size,
            block_size: BLOCK,
            chunk_size: 2,
        }
    }

    fn start(
        size: u64,
    ) -> (
        ReceiverSession,
        Reaction,
        Arc<Mutex<MemoryOutput>>,
        mpsc::UnboundedReceiver<TransferEvent>,
    ) {
        let (sink, output) = MemorySink::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (session, reaction) =
            ReceiverSession::start(&announce(size), Box::new(sink), &config(), tx);
        (session, reaction, output, rx)
    }

    fn header(index: u64, data: &[u8]) -> BlockHeader {
        BlockHeader {
            transfer_id: "r1".into(),
            block_index: index,
            digest: digest(data),
        }
    }

    fn end(index: u64) -> BlockEnd {
        BlockEnd {
            transfer_id: "r1".into(),
            block_index: index,
        }
    }

    async fn feed(session: &mut ReceiverSession, index: u64, data: &[u8]) -> Reaction {
        session.on_block_header(&header(index, data));
        for chunk in data.chunks(2) {
            session.on_chunk(chunk);
        }
        session.on_block_end(&end(index)).await
    }

    #[tokio::test]
    async fn pulls_block_zero_on_start() {
        let (session, reaction, _, _) = start(10);
        assert_eq!(reaction, Reaction::Pull(0));
        assert_eq!(session.state(), TransferState::AwaitingBlock(0));
    }

    #[tokio::test]
    async fn persists_blocks_in_order() {
        let (mut session, _, output, _) = start(10);
        assert_eq!(feed(&mut session, 0, b"abcd").await, Reaction::Pull(1));
        assert_eq!(session.state(), TransferState::AwaitingBlock(1));
        assert_eq!(feed(&mut session, 1, b"efgh").await, Reaction::Pull(2));
        assert_eq!(
            feed(&mut session, 2, b"ij").await,
            Reaction::Finished(TransferState::Completed)
        );

        let out = output.lock().unwrap();
        assert_eq!(out.data, b"abcdefghij");
        assert_eq!(out.status, SinkStatus::Finalized);
        assert_eq!(session.progress().transferred_bytes, 10);
    }

    #[tokio::test]
    async fn progress_names_block_in_flight() {
        let (mut session, _, _, _) = start(10);
        assert_eq!(session.progress().current_block, Some(0));

        feed(&mut session, 0, b"abcd").await;
        session.on_block_header(&header(1, b"efgh"));
        session.on_chunk(b"ef");
        let progress = session.progress();
        assert_eq!(progress.state, TransferState::ReceivingChunks(1));
        assert_eq!(progress.current_block, Some(1));
        assert_eq!(progress.transferred_bytes, 4);

        session.cancel();
        assert_eq!(session.progress().current_block, None);
    }

    #[tokio::test]
    async fn mismatch_pulls_same_block_again() {
        let (mut session, _, output, mut events) = start(8);

        session.on_block_header(&header(0, b"abcd"));
        session.on_chunk(b"ab");
        session.on_chunk(b"cX");
        assert_eq!(session.on_block_end(&end(0)).await, Reaction::Pull(0));
        assert_eq!(session.state(), TransferState::Retrying(0));
        assert!(output.lock().unwrap().data.is_empty());
        assert!(matches!(
            events.try_recv().unwrap(),
            TransferEvent::BlockRetry { index: 0, attempt: 1, .. }
        ));

        assert_eq!(feed(&mut session, 0, b"abcd").await, Reaction::Pull(1));
        assert_eq!(output.lock().unwrap().data, b"abcd");
        assert_eq!(session.progress().retries, 1);
    }

    #[tokio::test]
    async fn retry_cap_fails_as_corrupt() {
        let (mut session, _, output, _) = start(4);
        let good = header(0, b"abcd");

        for _ in 0..2 {
            session.on_block_header(&good);
            session.on_chunk(b"zzzz");
            assert_eq!(session.on_block_end(&end(0)).await, Reaction::Pull(0));
        }
        session.on_block_header(&good);
        session.on_chunk(b"zzzz");
        assert_eq!(
            session.on_block_end(&end(0)).await,
            Reaction::Finished(TransferState::Failed(FailureKind::Corrupt))
        );
        assert_eq!(session.state().label(), "corrupt");
        assert_eq!(output.lock().unwrap().status, SinkStatus::Aborted);
    }

    #[tokio::test]
    async fn overflow_marks_block_corrupt() {
        let (mut session, _, output, _) = start(8);
        session.on_block_header(&header(0, b"abcd"));
        session.on_chunk(b"abcd");
        session.on_chunk(b"ef");
        assert_eq!(session.on_block_end(&end(0)).await, Reaction::Pull(0));
        assert!(output.lock().unwrap().data.is_empty());
    }

    #[tokio::test]
    async fn repeated_header_restarts_buffer() {
        let (mut session, _, output, _) = start(4);
        session.on_block_header(&header(0, b"abcd"));
        session.on_chunk(b"ab");
        // A second pull was answered: the block starts over.
        session.on_block_header(&header(0, b"abcd"));
        session.on_chunk(b"ab");
        session.on_chunk(b"cd");
        assert_eq!(
            session.on_block_end(&end(0)).await,
            Reaction::Finished(TransferState::Completed)
        );
        assert_eq!(output.lock().unwrap().data, b"abcd");
    }

    #[tokio::test]
    async fn stale_block_is_ignored() {
        let (mut session, _, output, _) = start(8);
        feed(&mut session, 0, b"abcd").await;

        // Duplicate answer for block 0 after it was persisted.
        session.on_block_header(&header(0, b"abcd"));
        session.on_chunk(b"abcd");
        assert_eq!(session.on_block_end(&end(0)).await, Reaction::Idle);
        assert_eq!(session.state(), TransferState::AwaitingBlock(1));

        assert_eq!(
            feed(&mut session, 1, b"efgh").await,
            Reaction::Finished(TransferState::Completed)
        );
        assert_eq!(output.lock().unwrap().data, b"abcdefgh");
    }

    #[tokio::test]
    async fn chunk_without_header_is_dropped() {
        let (mut session, _, _, _) = start(4);
        assert_eq!(session.on_chunk(b"ab"), Reaction::Idle);
        assert_eq!(session.state(), TransferState::AwaitingBlock(0));
    }

    #[tokio::test]
    async fn empty_file_completes_immediately() {
        let (session, reaction, output, _) = start(0);
        assert_eq!(reaction, Reaction::Finished(TransferState::Completed));
        assert_eq!(session.progress().percentage(), 100.0);
        let out = output.lock().unwrap();
        assert_eq!(out.status, SinkStatus::Finalized);
        assert!(out.data.is_empty());
    }

    #[tokio::test]
    async fn cancel_aborts_sink() {
        let (mut session, _, output, _) = start(8);
        session.on_block_header(&header(0, b"abcd"));
        session.on_chunk(b"ab");
        assert_eq!(session.cancel(), TransferState::Cancelled);
        assert_eq!(output.lock().unwrap().status, SinkStatus::Aborted);
        // Late messages change nothing.
        assert_eq!(session.on_block_end(&end(0)).await, Reaction::Idle);
        assert_eq!(session.state(), TransferState::Cancelled);
    }

    #[tokio::test]
    async fn stall_timeout_fails() {
        let (mut session, _, output, _) = start(8);
        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(
            session.check_stall(Instant::now(), Duration::from_secs(30)),
            Reaction::Idle
        );
        assert_eq!(
            session.check_stall(later, Duration::from_secs(30)),
            Reaction::Finished(TransferState::Failed(FailureKind::Stalled))
        );
        assert_eq!(output.lock().unwrap().status, SinkStatus::Aborted);
    }

    #[test]
    fn announce_checks() {
        let config = config();
        assert!(check_announce(&announce(10), &config).is_ok());

        let mut bad = announce(10);
        bad.block_size = BLOCK * 2;
        assert!(check_announce(&bad, &config).unwrap_err().contains("mismatch"));

        let mut bad = announce(10);
        bad.chunk_size = config.max_message_size;
        assert!(check_announce(&bad, &config).is_err());

        let mut bad = announce(10);
        bad.file_name = "../x".into();
        assert!(check_announce(&bad, &config).is_err());
    }
}
