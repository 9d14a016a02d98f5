use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Engine configuration. Loaded by the front-end (e.g. from a config file)
/// and handed to [`crate::asset::AssetManager::open`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// On-disk root for chunks, metadata, vector index and keys.
    pub root_dir: PathBuf,

    /// zstd level in [1, 22].
    pub compression_level: i32,

    /// Fixed dimension of the vector index, set at init.
    pub embedding_dim: usize,

    /// If true, reads hide assets whose transaction has not committed.
    pub enable_strong_causality: bool,

    /// 32-byte master key for envelope encryption, hex-encoded.
    /// Generated (and persisted under `root_dir`) if absent.
    pub kms_master_key: Option<String>,

    /// Optional expiry for namespace signing keys, in seconds.
    pub default_namespace_key_expiry: Option<u64>,

    /// Upper bound on a single asset payload, default 100 MiB.
    pub max_message_bytes: u64,

    /// If true, `delete_tag` is permitted. Tags are write-once by default.
    pub allow_tag_delete: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root_dir: PathBuf::from(".aifs"),
            compression_level: 1,
            embedding_dim: 128,
            enable_strong_causality: true,
            kms_master_key: None,
            default_namespace_key_expiry: None,
            max_message_bytes: 100 * 1024 * 1024,
            allow_tag_delete: false,
        }
    }
}

impl Config {
    /// Checks option ranges before the engine starts.
    pub fn validate(&self) -> CResult<()> {
        if !(1..=22).contains(&self.compression_level) {
            return Err(Error::InvalidArgument(format!(
                "compression level must be in [1, 22], got {}",
                self.compression_level
            )));
        }
        if self.embedding_dim == 0 {
            return Err(Error::InvalidArgument(
                "embedding dimension must be non-zero".to_string(),
            ));
        }
        if let Some(key) = &self.kms_master_key {
            let bytes = hex::decode(key)?;
            if bytes.len() != 32 {
                return Err(Error::InvalidArgument(format!(
                    "master key must be 32 bytes, got {}",
                    bytes.len()
                )));
            }
        }
        Ok(())
    }
}
