//! One side of a channel: owns its sessions and dispatches every inbound
//! message to the session it belongs to.

use std::sync::Arc;
use std::time::Instant;

use blockpull_protocol::{
    Announce, Cancel, ControlMessage, FailureKind, Frame, PullBlock, TransferId, TransferProgress,
    TransferRole, TransferState,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::channel::Channel;
use crate::config::TransferConfig;
use crate::receiver::{Reaction, ReceiverSession, check_announce};
use crate::registry::SessionRegistry;
use crate::segment::BlockLayout;
use crate::sender::SenderSession;
use crate::sink::SinkProvider;
use crate::source::BlockSource;

/// Notable things that happened on an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// A local file was announced to the peer.
    Offered {
        transfer_id: TransferId,
        file_name: String,
        total_size: u64,
    },
    /// The peer announced a file and a sink was opened for it.
    Announced {
        transfer_id: TransferId,
        file_name: String,
        total_size: u64,
    },
    /// An announce was refused.
    Rejected {
        transfer_id: TransferId,
        reason: String,
    },
    BlockVerified {
        transfer_id: TransferId,
        index: u64,
    },
    BlockRetry {
        transfer_id: TransferId,
        index: u64,
        attempt: u32,
    },
    BlockServed {
        transfer_id: TransferId,
        index: u64,
        repeat: bool,
    },
    /// A session reached `Done` or a terminal state.
    Finished {
        transfer_id: TransferId,
        role: TransferRole,
        state: TransferState,
    },
}

enum Command {
    Offer {
        source: Arc<dyn BlockSource>,
        reply: oneshot::Sender<Result<TransferId, TransferError>>,
    },
    Cancel {
        transfer_id: TransferId,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    Progress {
        transfer_id: TransferId,
        reply: oneshot::Sender<Vec<TransferProgress>>,
    },
    Transfers {
        reply: oneshot::Sender<Vec<TransferProgress>>,
    },
}

/// Cloneable handle for driving an [`Endpoint`] while [`Endpoint::run`]
/// owns it.
#[derive(Clone)]
pub struct EndpointHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl EndpointHandle {
    /// Announces `source` to the peer.
    pub async fn offer(&self, source: Arc<dyn BlockSource>) -> Result<TransferId, TransferError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Offer { source, reply })?;
        rx.await.map_err(|_| TransferError::EndpointStopped)?
    }

    /// Cancels a transfer locally and notifies the peer.
    pub async fn cancel(&self, transfer_id: TransferId) -> Result<(), TransferError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { transfer_id, reply })?;
        rx.await.map_err(|_| TransferError::EndpointStopped)?
    }

    pub async fn progress(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<TransferProgress>, TransferError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Progress { transfer_id, reply })?;
        rx.await.map_err(|_| TransferError::EndpointStopped)
    }

    pub async fn transfers(&self) -> Result<Vec<TransferProgress>, TransferError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Transfers { reply })?;
        rx.await.map_err(|_| TransferError::EndpointStopped)
    }

    fn send(&self, command: Command) -> Result<(), TransferError> {
        self.tx
            .send(command)
            .map_err(|_| TransferError::EndpointStopped)
    }
}

/// Transfer endpoint bound to one channel.
///
/// Holds the session registry for that channel. Inbound frames, local
/// commands and timer ticks are all handled on the task running
/// [`Endpoint::run`]; sender sessions stream from their own tasks.
pub struct Endpoint {
    channel: Arc<dyn Channel>,
    config: TransferConfig,
    sinks: Arc<dyn SinkProvider>,
    registry: SessionRegistry,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<TransferEvent>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: Option<mpsc::UnboundedReceiver<Command>>,
}

impl Endpoint {
    pub fn new(
        channel: Arc<dyn Channel>,
        config: TransferConfig,
        sinks: Arc<dyn SinkProvider>,
    ) -> Result<Self, TransferError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Ok(Self {
            channel,
            config,
            sinks,
            registry: SessionRegistry::new(),
            events_tx,
            events_rx: Some(events_rx),
            commands_tx,
            commands_rx: Some(commands_rx),
        })
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransferEvent>> {
        self.events_rx.take()
    }

    pub fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            tx: self.commands_tx.clone(),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Announces `source` and registers a sender session for it.
    pub fn offer(&mut self, source: Arc<dyn BlockSource>) -> Result<TransferId, TransferError> {
        let transfer_id = self.registry.generate_id();
        let file_name = source.name().to_string();
        let total_size = source.size();

        let session = SenderSession::start(
            transfer_id.clone(),
            source,
            Arc::clone(&self.channel),
            &self.config,
            self.events_tx.clone(),
        )?;
        self.registry.insert_sender(session);
        self.emit(TransferEvent::Offered {
            transfer_id: transfer_id.clone(),
            file_name,
            total_size,
        });
        Ok(transfer_id)
    }

    /// Cancels every local session with this id and tells the peer.
    pub fn cancel(&mut self, transfer_id: &TransferId) -> Result<(), TransferError> {
        let mut found = false;

        if let Some(session) = self.registry.sender(transfer_id) {
            session.cancel();
            found = true;
            self.finish_sender(transfer_id);
        }
        if let Some(session) = self.registry.receiver_mut(transfer_id) {
            session.cancel();
            found = true;
            self.finish_receiver(transfer_id);
        }
        if !found {
            return Err(TransferError::UnknownTransfer(transfer_id.clone()));
        }

        info!(transfer_id = %transfer_id, "transfer cancelled locally");
        self.send_cancel(transfer_id, "");
        Ok(())
    }

    pub fn progress(&self, transfer_id: &TransferId) -> Vec<TransferProgress> {
        self.registry.progress(transfer_id)
    }

    pub fn transfers(&self) -> Vec<TransferProgress> {
        self.registry.all()
    }

    /// Number of sessions still registered.
    pub fn live_transfers(&self) -> usize {
        self.registry.live()
    }

    /// Routes one inbound frame to its session.
    pub async fn dispatch(&mut self, frame: Frame) {
        match frame {
            Frame::Control(ControlMessage::Announce(announce)) => self.on_announce(announce),
            Frame::Control(ControlMessage::PullBlock(pull)) => self.on_pull(pull),
            Frame::Control(ControlMessage::BlockHeader(header)) => {
                let id = header.transfer_id.clone();
                if let Some(session) = self.receiver(&id, "block_header") {
                    let reaction = session.on_block_header(&header);
                    self.react(&id, reaction);
                }
            }
            Frame::Chunk(chunk) => {
                if let Some(session) = self.receiver(&chunk.transfer_id, "chunk") {
                    session.on_chunk(&chunk.data);
                }
            }
            Frame::Control(ControlMessage::BlockEnd(end)) => {
                let id = end.transfer_id.clone();
                if let Some(session) = self.receiver(&id, "block_end") {
                    let reaction = session.on_block_end(&end).await;
                    self.react(&id, reaction);
                }
            }
            Frame::Control(ControlMessage::Cancel(cancel)) => self.on_remote_cancel(cancel),
        }
    }

    /// Applies stall timeouts and evicts finished or abandoned senders.
    ///
    /// A sender that has seen no pull within the stall timeout is retired
    /// quietly once `Done`; before that it fails as stalled and the peer
    /// is told.
    pub fn tick(&mut self, now: Instant) {
        let timeout = self.config.stall_timeout();

        let stalled: Vec<(TransferId, Reaction)> = self
            .registry
            .receivers_mut()
            .map(|session| {
                let reaction = session.check_stall(now, timeout);
                (session.transfer_id().clone(), reaction)
            })
            .filter(|(_, reaction)| *reaction != Reaction::Idle)
            .collect();
        for (id, reaction) in stalled {
            self.react(&id, reaction);
        }

        let mut expired = Vec::new();
        let mut abandoned = Vec::new();
        for session in self.registry.senders() {
            let state = session.state();
            let id = session.transfer_id().clone();
            if state.is_terminal() {
                expired.push(id);
            } else if session.is_idle(now, timeout) {
                if state == TransferState::Done {
                    expired.push(id);
                } else {
                    abandoned.push(id);
                }
            }
        }
        for id in expired {
            if let Some(progress) = self.registry.retire_sender(&id) {
                debug!(transfer_id = %id, state = %progress.label, "sender retired");
            }
        }
        for id in abandoned {
            let reason = format!("no pull for {}s", timeout.as_secs());
            let failed = self
                .registry
                .sender(&id)
                .is_some_and(|session| session.fail(FailureKind::Stalled, &reason));
            if failed {
                warn!(transfer_id = %id, reason = %reason, "sender stalled");
                self.send_cancel(&id, &reason);
                self.finish_sender(&id);
            }
        }
    }

    /// Ends every live session after the channel went away.
    pub fn close_all(&mut self, kind: FailureKind) {
        let receivers: Vec<TransferId> = self
            .registry
            .receivers()
            .map(|s| s.transfer_id().clone())
            .collect();
        for id in receivers {
            if let Some(session) = self.registry.receiver_mut(&id) {
                session.fail(kind, "channel closed".into());
            }
            self.finish_receiver(&id);
        }

        let senders: Vec<TransferId> = self
            .registry
            .senders()
            .map(|s| s.transfer_id().clone())
            .collect();
        for id in senders {
            if let Some(session) = self.registry.sender(&id) {
                if session.state() != TransferState::Done && session.fail(kind, "channel closed") {
                    self.finish_sender(&id);
                    continue;
                }
            }
            self.registry.retire_sender(&id);
        }
    }

    /// Runs the endpoint until `shutdown` fires or `inbound` ends.
    pub async fn run(
        &mut self,
        mut inbound: mpsc::UnboundedReceiver<Frame>,
        shutdown: CancellationToken,
    ) -> Result<(), TransferError> {
        let mut commands = self
            .commands_rx
            .take()
            .ok_or(TransferError::EndpointStopped)?;
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(live = self.registry.live(), "endpoint shutting down");
                    self.shutdown();
                    break;
                }
                Some(command) = commands.recv() => self.on_command(command),
                frame = inbound.recv() => match frame {
                    Some(frame) => self.dispatch(frame).await,
                    None => {
                        info!(live = self.registry.live(), "inbound stream ended");
                        self.close_all(FailureKind::ChannelClosed);
                        break;
                    }
                },
                _ = ticker.tick() => self.tick(Instant::now()),
            }
        }

        self.commands_rx = Some(commands);
        Ok(())
    }

    fn shutdown(&mut self) {
        let ids: Vec<TransferId> = self
            .registry
            .senders()
            .map(|s| s.transfer_id().clone())
            .chain(self.registry.receivers().map(|s| s.transfer_id().clone()))
            .collect();
        for id in ids {
            let _ = self.cancel(&id);
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Offer { source, reply } => {
                let _ = reply.send(self.offer(source));
            }
            Command::Cancel { transfer_id, reply } => {
                let _ = reply.send(self.cancel(&transfer_id));
            }
            Command::Progress { transfer_id, reply } => {
                let _ = reply.send(self.progress(&transfer_id));
            }
            Command::Transfers { reply } => {
                let _ = reply.send(self.transfers());
            }
        }
    }

    fn on_announce(&mut self, announce: Announce) {
        let id = announce.transfer_id.clone();
        if self.registry.is_known(TransferRole::Receiver, &id) {
            warn!(transfer_id = %id, "announce for known transfer dropped");
            return;
        }

        if let Err(reason) = check_announce(&announce, &self.config) {
            warn!(transfer_id = %id, reason = %reason, "announce rejected");
            self.send_cancel(&id, &reason);
            self.reject(&announce, reason);
            return;
        }

        let sink = match self.sinks.open(&announce) {
            Ok(sink) => sink,
            Err(e) => {
                // Reported locally only; the peer is left waiting for a pull.
                warn!(transfer_id = %id, error = %e, "no destination for transfer");
                self.reject(&announce, e.to_string());
                return;
            }
        };

        info!(
            transfer_id = %id,
            file = %announce.file_name,
            size = announce.total_size,
            "receiving transfer"
        );
        let (session, reaction) =
            ReceiverSession::start(&announce, sink, &self.config, self.events_tx.clone());
        self.registry.insert_receiver(session);
        self.emit(TransferEvent::Announced {
            transfer_id: id.clone(),
            file_name: announce.file_name,
            total_size: announce.total_size,
        });
        self.react(&id, reaction);
    }

    fn reject(&mut self, announce: &Announce, reason: String) {
        let layout = BlockLayout::new(announce.total_size, announce.block_size.max(1));
        let state = TransferState::Failed(FailureKind::Rejected);
        self.registry.tombstone(TransferProgress {
            transfer_id: announce.transfer_id.clone(),
            role: TransferRole::Receiver,
            file_name: announce.file_name.clone(),
            state,
            label: state.label().to_string(),
            total_size: announce.total_size,
            transferred_bytes: 0,
            total_blocks: layout.total_blocks(),
            retries: 0,
            current_block: None,
            rate_bps: 0.0,
            eta_secs: None,
            error: reason.clone(),
        });
        self.emit(TransferEvent::Rejected {
            transfer_id: announce.transfer_id.clone(),
            reason,
        });
    }

    fn on_pull(&mut self, pull: PullBlock) {
        match self.registry.sender(&pull.transfer_id) {
            Some(session) => {
                session.pull(pull.block_index);
            }
            None => self.log_stray(TransferRole::Sender, &pull.transfer_id, "pull_block"),
        }
    }

    fn on_remote_cancel(&mut self, cancel: Cancel) {
        let id = cancel.transfer_id;
        let mut found = false;

        if let Some(session) = self.registry.sender(&id) {
            session.cancel();
            found = true;
            self.finish_sender(&id);
        }
        if let Some(session) = self.registry.receiver_mut(&id) {
            if cancel.reason.is_empty() {
                session.cancel();
            } else {
                session.fail(FailureKind::Remote, cancel.reason.clone());
            }
            found = true;
            self.finish_receiver(&id);
        }

        if found {
            info!(transfer_id = %id, reason = %cancel.reason, "transfer cancelled by peer");
        } else {
            debug!(transfer_id = %id, "cancel for unknown transfer dropped");
        }
    }

    fn receiver(&mut self, id: &TransferId, kind: &str) -> Option<&mut ReceiverSession> {
        if self.registry.receiver_mut(id).is_none() {
            self.log_stray(TransferRole::Receiver, id, kind);
            return None;
        }
        self.registry.receiver_mut(id)
    }

    fn log_stray(&self, role: TransferRole, id: &TransferId, kind: &str) {
        if self.registry.is_known(role, id) {
            debug!(transfer_id = %id, kind, "message for finished transfer dropped");
        } else {
            warn!(transfer_id = %id, kind, "message for unknown transfer dropped");
        }
    }

    fn react(&mut self, id: &TransferId, reaction: Reaction) {
        match reaction {
            Reaction::Idle => {}
            Reaction::Pull(index) => {
                let pull = ControlMessage::PullBlock(PullBlock {
                    transfer_id: id.clone(),
                    block_index: index,
                });
                if let Err(e) = self.channel.send(pull.into()) {
                    if let Some(session) = self.registry.receiver_mut(id) {
                        session.fail(FailureKind::ChannelClosed, format!("pull failed: {e}"));
                    }
                    self.finish_receiver(id);
                }
            }
            Reaction::Finished(state) => {
                if let TransferState::Failed(kind) = state {
                    if kind != FailureKind::Remote && kind != FailureKind::ChannelClosed {
                        let reason = self
                            .registry
                            .receiver_mut(id)
                            .map(|s| s.progress().error)
                            .unwrap_or_default();
                        self.send_cancel(id, &reason);
                    }
                }
                self.finish_receiver(id);
            }
        }
    }

    fn finish_receiver(&mut self, id: &TransferId) {
        if let Some(progress) = self.registry.retire_receiver(id) {
            self.emit(TransferEvent::Finished {
                transfer_id: id.clone(),
                role: TransferRole::Receiver,
                state: progress.state,
            });
        }
    }

    fn finish_sender(&mut self, id: &TransferId) {
        if let Some(progress) = self.registry.retire_sender(id) {
            self.emit(TransferEvent::Finished {
                transfer_id: id.clone(),
                role: TransferRole::Sender,
                state: progress.state,
            });
        }
    }

    fn send_cancel(&self, id: &TransferId, reason: &str) {
        let cancel = ControlMessage::Cancel(Cancel {
            transfer_id: id.clone(),
            reason: reason.to_string(),
        });
        if let Err(e) = self.channel.send(cancel.into()) {
            debug!(transfer_id = %id, error = %e, "cancel not delivered");
        }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events_tx.send(event);
    }
}
