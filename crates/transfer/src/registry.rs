use std::collections::{HashMap, VecDeque};

use blockpull_protocol::constants::{MAX_TOMBSTONES, TRANSFER_ID_LEN};
use blockpull_protocol::{TransferId, TransferProgress, TransferRole};

use crate::receiver::ReceiverSession;
use crate::sender::SenderSession;

/// Live sessions of one endpoint, keyed by transfer id.
///
/// Sending and receiving sessions live in separate tables: the same id
/// may name a transfer in each direction. When a session is retired its
/// final progress is kept as a tombstone so the id never comes back. Only
/// the most recent tombstones are kept; the oldest are forgotten first.
pub struct SessionRegistry {
    senders: HashMap<TransferId, SenderSession>,
    receivers: HashMap<TransferId, ReceiverSession>,
    finished: HashMap<(TransferRole, TransferId), TransferProgress>,
    /// Tombstone keys, oldest first.
    finished_order: VecDeque<(TransferRole, TransferId)>,
    max_finished: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_tombstone_limit(MAX_TOMBSTONES)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry remembering at most `limit` finished transfers.
    pub fn with_tombstone_limit(limit: usize) -> Self {
        Self {
            senders: HashMap::new(),
            receivers: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            max_finished: limit.max(1),
        }
    }

    /// Generates a short id not used by any live or retired sender.
    pub fn generate_id(&self) -> TransferId {
        loop {
            let raw = uuid::Uuid::new_v4().simple().to_string();
            let id = TransferId::new(&raw[..TRANSFER_ID_LEN]);
            if !self.is_known(TransferRole::Sender, &id) {
                return id;
            }
        }
    }

    /// Returns `true` if `id` is live or was retired for `role`.
    pub fn is_known(&self, role: TransferRole, id: &TransferId) -> bool {
        let live = match role {
            TransferRole::Sender => self.senders.contains_key(id),
            TransferRole::Receiver => self.receivers.contains_key(id),
        };
        live || self.finished.contains_key(&(role, id.clone()))
    }

    pub fn insert_sender(&mut self, session: SenderSession) {
        self.senders.insert(session.transfer_id().clone(), session);
    }

    pub fn insert_receiver(&mut self, session: ReceiverSession) {
        self.receivers.insert(session.transfer_id().clone(), session);
    }

    pub fn sender(&self, id: &TransferId) -> Option<&SenderSession> {
        self.senders.get(id)
    }

    pub fn receiver_mut(&mut self, id: &TransferId) -> Option<&mut ReceiverSession> {
        self.receivers.get_mut(id)
    }

    pub fn senders(&self) -> impl Iterator<Item = &SenderSession> {
        self.senders.values()
    }

    pub fn receivers(&self) -> impl Iterator<Item = &ReceiverSession> {
        self.receivers.values()
    }

    pub fn receivers_mut(&mut self) -> impl Iterator<Item = &mut ReceiverSession> {
        self.receivers.values_mut()
    }

    /// Number of live sessions in both tables.
    pub fn live(&self) -> usize {
        self.senders.len() + self.receivers.len()
    }

    /// Removes a sender and records its final progress.
    pub fn retire_sender(&mut self, id: &TransferId) -> Option<TransferProgress> {
        let session = self.senders.remove(id)?;
        let progress = session.progress();
        self.tombstone(progress.clone());
        Some(progress)
    }

    /// Removes a receiver and records its final progress.
    pub fn retire_receiver(&mut self, id: &TransferId) -> Option<TransferProgress> {
        let session = self.receivers.remove(id)?;
        let progress = session.progress();
        self.tombstone(progress.clone());
        Some(progress)
    }

    /// Records the final progress of a transfer, including one that never
    /// got a session.
    pub fn tombstone(&mut self, progress: TransferProgress) {
        let key = (progress.role, progress.transfer_id.clone());
        if self.finished.insert(key.clone(), progress).is_none() {
            self.finished_order.push_back(key);
        }
        while self.finished_order.len() > self.max_finished {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    /// Progress of every transfer with this id, live or retired.
    pub fn progress(&self, id: &TransferId) -> Vec<TransferProgress> {
        let mut out = Vec::new();
        for role in [TransferRole::Sender, TransferRole::Receiver] {
            let live = match role {
                TransferRole::Sender => self.senders.get(id).map(SenderSession::progress),
                TransferRole::Receiver => self.receivers.get(id).map(ReceiverSession::progress),
            };
            if let Some(p) = live.or_else(|| self.finished.get(&(role, id.clone())).cloned()) {
                out.push(p);
            }
        }
        out
    }

    /// Progress of every transfer, live ones first, then retired ones in
    /// the order they finished.
    pub fn all(&self) -> Vec<TransferProgress> {
        let mut out: Vec<TransferProgress> = self
            .senders
            .values()
            .map(SenderSession::progress)
            .chain(self.receivers.values().map(ReceiverSession::progress))
            .collect();
        out.extend(
            self.finished_order
                .iter()
                .filter_map(|key| self.finished.get(key).cloned()),
        );
        out
    }
}
