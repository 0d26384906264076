use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::DIGEST_LEN;

/// Identifier of one transfer on a channel.
///
/// Generated by the sender; opaque to the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// SHA-256 digest of one block, serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDigest([u8; DIGEST_LEN]);

impl BlockDigest {
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockDigest({})", self.to_hex())
    }
}

impl fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Error returned when a digest string is not 64 hex characters.
#[derive(Debug, thiserror::Error)]
#[error("invalid block digest: {0}")]
pub struct DigestParseError(String);

impl FromStr for BlockDigest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut out).map_err(|e| DigestParseError(e.to_string()))?;
        Ok(Self(out))
    }
}

impl Serialize for BlockDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which end of a transfer a session represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferRole {
    #[serde(rename = "sender")]
    Sender,
    #[serde(rename = "receiver")]
    Receiver,
}

/// Why a transfer ended in [`TransferState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A block kept failing digest verification past the retry cap.
    Corrupt,
    /// No activity within the stall timeout.
    Stalled,
    /// The channel closed before the transfer finished.
    ChannelClosed,
    /// The announce was rejected (parameter mismatch).
    Rejected,
    /// Reading the source or writing the sink failed.
    Io,
    /// The peer cancelled after a local failure on its side.
    Remote,
}

/// Lifecycle state of one transfer, on either side.
///
/// Sender sessions move through `Idle → Announced → StreamingBlock(i)* →
/// Done`; receiver sessions through `AwaitingBlock(i) → ReceivingChunks(i) →
/// Verifying(i) → Persisted(i) | Retrying(i) → … → Completed`. Both may
/// end in `Cancelled` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Sender created, announce not yet on the channel.
    Idle,
    Announced,
    StreamingBlock(u64),
    Done,
    AwaitingBlock(u64),
    ReceivingChunks(u64),
    Verifying(u64),
    Persisted(u64),
    Retrying(u64),
    Completed,
    Cancelled,
    Failed(FailureKind),
}

impl TransferState {
    /// Short operator-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            TransferState::Idle => "idle",
            TransferState::Announced => "announced",
            TransferState::StreamingBlock(_) => "streaming",
            TransferState::Done => "done",
            TransferState::AwaitingBlock(_) => "waiting",
            TransferState::ReceivingChunks(_) => "receiving",
            TransferState::Verifying(_) => "verifying",
            TransferState::Persisted(_) => "persisted",
            TransferState::Retrying(_) => "retrying",
            TransferState::Completed => "done",
            TransferState::Cancelled => "cancelled",
            TransferState::Failed(FailureKind::Corrupt) => "corrupt",
            TransferState::Failed(_) => "failed",
        }
    }

    /// Returns `true` once the session can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Failed(_)
        )
    }

    /// Block index the state refers to, if any.
    pub fn block_index(&self) -> Option<u64> {
        match *self {
            TransferState::StreamingBlock(i)
            | TransferState::AwaitingBlock(i)
            | TransferState::ReceivingChunks(i)
            | TransferState::Verifying(i)
            | TransferState::Persisted(i)
            | TransferState::Retrying(i) => Some(i),
            _ => None,
        }
    }
}

/// Progress snapshot of one transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub role: TransferRole,
    pub file_name: String,
    pub state: TransferState,
    pub label: String,
    pub total_size: u64,
    /// Bytes persisted (receiver) or streamed (sender).
    pub transferred_bytes: u64,
    pub total_blocks: u64,
    /// Retries requested (receiver) or repeated pulls served (sender).
    pub retries: u64,
    /// Block being streamed or received, while one is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_block: Option<u64>,
    /// Bytes per second over the recent window.
    pub rate_bps: f64,
    /// Estimated seconds until the remaining bytes are through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl TransferProgress {
    /// Returns the transfer progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_size == 0 {
            return if self.state == TransferState::Completed {
                100.0
            } else {
                0.0
            };
        }
        self.transferred_bytes as f64 / self.total_size as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_progress() -> TransferProgress {
        TransferProgress {
            transfer_id: "t1".into(),
            role: TransferRole::Receiver,
            file_name: "disk.img".into(),
            state: TransferState::ReceivingChunks(2),
            label: "receiving".into(),
            total_size: 1000,
            transferred_bytes: 250,
            total_blocks: 4,
            retries: 0,
            current_block: Some(2),
            rate_bps: 0.0,
            eta_secs: None,
            error: String::new(),
        }
    }

    #[test]
    fn digest_hex_roundtrip() {
        let d = BlockDigest::from_bytes([0xab; DIGEST_LEN]);
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(DIGEST_LEN)));
        let parsed: BlockDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn digest_rejects_wrong_length() {
        assert!("abcd".parse::<BlockDigest>().is_err());
        assert!(serde_json::from_str::<BlockDigest>("\"zz\"").is_err());
    }

    #[test]
    fn state_labels_distinguish_failure_kinds() {
        assert_eq!(TransferState::Failed(FailureKind::Corrupt).label(), "corrupt");
        assert_eq!(TransferState::Failed(FailureKind::Stalled).label(), "failed");
        assert_eq!(TransferState::Retrying(3).label(), "retrying");
        assert_eq!(TransferState::Verifying(0).label(), "verifying");
        assert_eq!(TransferState::Completed.label(), "done");
        assert_eq!(TransferState::Idle.label(), "idle");
    }

    #[test]
    fn terminal_states() {
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Cancelled.is_terminal());
        assert!(TransferState::Failed(FailureKind::Io).is_terminal());
        assert!(!TransferState::Done.is_terminal());
        assert!(!TransferState::Idle.is_terminal());
        assert!(!TransferState::AwaitingBlock(0).is_terminal());
    }

    #[test]
    fn state_serialization() {
        assert_eq!(
            serde_json::to_string(&TransferState::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(
            serde_json::to_string(&TransferState::Retrying(4)).unwrap(),
            "{\"retrying\":4}"
        );
    }

    #[test]
    fn progress_percentage() {
        let p = sample_progress();
        assert!((p.percentage() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn progress_percentage_empty_file() {
        let mut p = sample_progress();
        p.total_size = 0;
        p.transferred_bytes = 0;
        assert_eq!(p.percentage(), 0.0);
        p.state = TransferState::Completed;
        assert_eq!(p.percentage(), 100.0);
    }

    #[test]
    fn progress_omits_empty_error() {
        let json = serde_json::to_string(&sample_progress()).unwrap();
        assert!(!json.contains("error"));
        assert!(!json.contains("etaSecs"));
        assert!(json.contains("transferId"));
    }

    #[test]
    fn progress_carries_current_block() {
        let p = sample_progress();
        assert_eq!(p.current_block, p.state.block_index());
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"currentBlock\":2"));

        let mut done = p;
        done.state = TransferState::Completed;
        done.current_block = done.state.block_index();
        let json = serde_json::to_string(&done).unwrap();
        assert!(!json.contains("currentBlock"));
        let back: TransferProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(back.current_block, None);
    }

    #[test]
    fn role_and_id_key_a_map() {
        let mut seen = std::collections::HashMap::new();
        let id = TransferId::from("t1");
        seen.insert((TransferRole::Sender, id.clone()), 1);
        seen.insert((TransferRole::Receiver, id.clone()), 2);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen.get(&(TransferRole::Receiver, id)), Some(&2));
    }
}
