//! Durable metadata: assets, lineage, snapshots, namespaces, branches and
//! tags, backed by SQLite. The transaction layer's tables live in the same
//! database (see `crate::txn`), which is what lets a commit publish
//! visibility and metadata in one local transaction.

pub mod store;

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

use crate::codec::AssetKind;

pub use store::MetadataStore;

/// A stored asset's metadata row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub asset_id: String,
    pub kind: AssetKind,
    pub size: u64,
    pub metadata: HashMap<String, String>,
    pub created_at: String,
}

/// A parent or child reached through one lineage edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub asset: AssetRecord,
    pub transform_name: Option<String>,
    pub transform_digest: Option<String>,
}

/// A parent reference supplied at put time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub asset_id: String,
    pub transform_name: Option<String>,
    pub transform_digest: Option<String>,
}

/// A signed snapshot with its member set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub namespace: String,
    pub merkle_root: String,
    pub metadata: HashMap<String, String>,
    pub signature_hex: Option<String>,
    pub created_at: String,
    /// Member asset IDs, sorted.
    pub asset_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub namespace_id: String,
    pub name: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
    pub created_at: String,
}

/// A mutable branch head.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub namespace: String,
    pub branch_name: String,
    pub snapshot_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub metadata: HashMap<String, String>,
}

/// One audit entry of a branch move.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchHistoryEntry {
    pub namespace: String,
    pub branch_name: String,
    /// None for the creating update.
    pub old_snapshot_id: Option<String>,
    pub new_snapshot_id: String,
    pub updated_at: String,
}

/// A write-once tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    pub namespace: String,
    pub tag_name: String,
    pub snapshot_id: String,
    pub created_at: String,
    pub metadata: HashMap<String, String>,
}

/// Engine timestamps: RFC 3339 UTC with microsecond precision, which sorts
/// lexicographically.
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Deterministic snapshot identity (invariant: a pure function of the
/// Merkle root and timestamp). 64 hex chars, so snapshot URIs share the
/// asset-ID character class.
pub fn snapshot_id(merkle_root: &str, created_at: &str) -> String {
    blake3::hash(format!("{}:{}", merkle_root, created_at).as_bytes())
        .to_hex()
        .to_string()
}

pub(crate) fn metadata_to_json(metadata: &HashMap<String, String>) -> crate::error::CResult<String> {
    Ok(serde_json::to_string(metadata)?)
}

pub(crate) fn metadata_from_json(json: Option<String>) -> HashMap<String, String> {
    json.and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_id_is_deterministic() {
        let a = snapshot_id("root", "2024-01-01T00:00:00Z");
        let b = snapshot_id("root", "2024-01-01T00:00:00Z");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(crate::uri::is_valid_id(&a));
        assert_ne!(a, snapshot_id("root", "2024-01-01T00:00:01Z"));
        assert_ne!(a, snapshot_id("other", "2024-01-01T00:00:00Z"));
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now();
        assert!(a < b);
    }
}
