pub mod chunk_store;
pub mod format;

use serde_derive::{Deserialize, Serialize};

/// Chunk-store status, reported by the engine's status endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the store.
    pub name: String,

    /// The number of chunks on disk.
    pub chunks: u64,

    /// Total plaintext bytes across all chunks.
    pub logical_size: u64,

    /// The on-disk size of all chunk files (encrypted, compressed).
    pub total_disk_size: u64,
}

/// Per-chunk info: plaintext size, creation time and the KMS key that wraps
/// its data key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub size: u64,
    pub created_at: String,
    pub kms_key_id: String,
}
