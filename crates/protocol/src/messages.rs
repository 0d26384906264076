use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE};
use crate::types::{BlockDigest, TransferId};

// ---------------------------------------------------------------------------
// Sender -> Receiver
// ---------------------------------------------------------------------------

/// Announces a file the sender is ready to serve.
///
/// The sender streams nothing until the receiver pulls block 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announce {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub total_size: u64,
    /// Block size the sender segments with. Peers that omit it use the default.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Maximum chunk payload the sender emits.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Opens block `block_index`: its chunks follow, then a [`BlockEnd`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub transfer_id: TransferId,
    pub block_index: u64,
    pub digest: BlockDigest,
}

/// Marks the end of the chunk stream for `block_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockEnd {
    pub transfer_id: TransferId,
    pub block_index: u64,
}

// ---------------------------------------------------------------------------
// Receiver -> Sender
// ---------------------------------------------------------------------------

/// Requests block `block_index`. Repeating a request asks for a resend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullBlock {
    pub transfer_id: TransferId,
    pub block_index: u64,
}

// ---------------------------------------------------------------------------
// Either direction
// ---------------------------------------------------------------------------

/// Abandons a transfer. The id is not reused afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancel {
    pub transfer_id: TransferId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_field_names() {
        let a = Announce {
            transfer_id: "k3j9a".into(),
            file_name: "backup.tar".into(),
            total_size: 42,
            block_size: 1024,
            chunk_size: 256,
        };
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["transferId"], "k3j9a");
        assert_eq!(json["fileName"], "backup.tar");
        assert_eq!(json["totalSize"], 42);
        assert_eq!(json["blockSize"], 1024);
        assert_eq!(json["chunkSize"], 256);
    }

    #[test]
    fn announce_legacy_json_uses_default_sizes() {
        let json = r#"{"transferId":"a","fileName":"f","totalSize":7}"#;
        let a: Announce = serde_json::from_str(json).unwrap();
        assert_eq!(a.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(a.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn cancel_omits_empty_reason() {
        let c = Cancel {
            transfer_id: "x".into(),
            reason: String::new(),
        };
        let json = serde_json::to_string(&c).unwrap();
        assert!(!json.contains("reason"));
    }

    #[test]
    fn block_header_digest_is_hex() {
        let h = BlockHeader {
            transfer_id: "x".into(),
            block_index: 3,
            digest: BlockDigest::from_bytes([1; 32]),
        };
        let json = serde_json::to_value(&h).unwrap();
        assert_eq!(json["blockIndex"], 3);
        assert_eq!(json["digest"], "01".repeat(32));
    }
}
