//! Content-addressed chunk store.
//!
//! Chunks are keyed by the BLAKE3 digest of their plaintext and stored at
//! `chunks/<id[0..2]>/<id[2..4]>/<id>` so no directory grows unbounded.
//! No plaintext touches disk: stored bytes are AES-256-GCM over the
//! zstd-compressed payload under a fresh per-chunk data key (§ format).
//!
//! A path that fails digest or decryption checks is quarantined from
//! further reads until operator intervention; DataCorruption is never
//! retried.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::compress::Compressor;
use crate::error::{CResult, Error};
use crate::kms::Kms;
use crate::storage::format::ChunkHeader;
use crate::storage::{ChunkInfo, Status};
use crate::uri;

pub struct ChunkStore {
    chunks_dir: PathBuf,
    compressor: Compressor,
    kms: Arc<Kms>,
    /// The KMS key new chunks wrap their data keys under.
    kms_key_id: String,
    /// Asset IDs whose files failed integrity checks.
    quarantined: Mutex<HashSet<String>>,
}

impl ChunkStore {
    pub fn open(
        root_dir: impl AsRef<Path>,
        compressor: Compressor,
        kms: Arc<Kms>,
        kms_key_id: &str,
    ) -> CResult<Self> {
        let chunks_dir = root_dir.as_ref().join("chunks");
        fs::create_dir_all(&chunks_dir)?;
        Ok(ChunkStore {
            chunks_dir,
            compressor,
            kms,
            kms_key_id: kms_key_id.to_string(),
            quarantined: Mutex::new(HashSet::new()),
        })
    }

    /// Two-level sharded path for an asset ID.
    fn path_for(&self, asset_id: &str) -> PathBuf {
        self.chunks_dir
            .join(&asset_id[0..2])
            .join(&asset_id[2..4])
            .join(asset_id)
    }

    /// Stores `plaintext`, returning its canonical hex ID. A duplicate put
    /// is a no-op returning the existing ID.
    pub fn put(&self, plaintext: &[u8]) -> CResult<String> {
        let asset_id = blake3::hash(plaintext).to_hex().to_string();
        let path = self.path_for(&asset_id);
        if path.exists() {
            log::debug!("chunk {} already present", asset_id);
            return Ok(asset_id);
        }

        let compressed = self.compressor.compress(plaintext)?;
        let data_key = self.kms.generate_data_key(&self.kms_key_id)?;

        let mut data_nonce = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut data_nonce);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key.plaintext));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&data_nonce),
                Payload { msg: &compressed, aad: asset_id.as_bytes() },
            )
            .map_err(|_| Error::Internal("chunk encryption failed".to_string()))?;

        let header = ChunkHeader {
            plaintext_size: plaintext.len() as u64,
            kms_key_id: self.kms_key_id.clone(),
            wrap_nonce: data_key.nonce,
            wrapped_data_key: data_key.wrapped,
            data_nonce,
        };

        let parent = path
            .parent()
            .ok_or_else(|| Error::Internal("chunk path has no parent".to_string()))?;
        fs::create_dir_all(parent)?;
        // Write-then-rename so a crash never leaves a readable partial chunk.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&header.encode()?)?;
        tmp.write_all(&ciphertext)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)?;

        log::debug!("stored chunk {} ({} bytes plaintext)", asset_id, plaintext.len());
        Ok(asset_id)
    }

    /// Retrieves and verifies a chunk's plaintext.
    pub fn get(&self, asset_id: &str) -> CResult<Vec<u8>> {
        uri::validate_id(asset_id)?;
        if self.quarantined.lock()?.contains(asset_id) {
            return Err(Error::DataCorruption(format!(
                "chunk {} is quarantined",
                asset_id
            )));
        }

        let path = self.path_for(asset_id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("asset {}", asset_id)))
            }
            Err(err) => return Err(err.into()),
        };

        match self.decode_chunk(asset_id, &raw) {
            Ok(plaintext) => Ok(plaintext),
            Err(err @ Error::DataCorruption(_)) => {
                log::error!("quarantining chunk {}: {}", asset_id, err);
                self.quarantined.lock()?.insert(asset_id.to_string());
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn decode_chunk(&self, asset_id: &str, raw: &[u8]) -> CResult<Vec<u8>> {
        let (header, body_at) = ChunkHeader::decode(raw)?;
        let data_key =
            self.kms
                .unwrap_data_key(&header.wrapped_data_key, &header.wrap_nonce, &header.kms_key_id)?;
        if data_key.len() != 32 {
            return Err(Error::DataCorruption("data key is not 32 bytes".to_string()));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key));
        let compressed = cipher
            .decrypt(
                Nonce::from_slice(&header.data_nonce),
                Payload { msg: &raw[body_at..], aad: asset_id.as_bytes() },
            )
            .map_err(|_| Error::DataCorruption(format!("chunk {} failed authentication", asset_id)))?;

        let plaintext = self.compressor.decompress_opportunistic(&compressed)?;
        let digest = blake3::hash(&plaintext).to_hex().to_string();
        if digest != asset_id {
            return Err(Error::DataCorruption(format!(
                "chunk digest mismatch: stored as {} but hashes to {}",
                asset_id, digest
            )));
        }
        Ok(plaintext)
    }

    pub fn exists(&self, asset_id: &str) -> CResult<bool> {
        uri::validate_id(asset_id)?;
        Ok(self.path_for(asset_id).exists())
    }

    /// Deletes a chunk. Returns false when it was not present. Empty shard
    /// directories are pruned best-effort.
    pub fn delete(&self, asset_id: &str) -> CResult<bool> {
        uri::validate_id(asset_id)?;
        let path = self.path_for(asset_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        self.quarantined.lock()?.remove(asset_id);
        for dir in path.ancestors().skip(1).take(2) {
            let _ = fs::remove_dir(dir);
        }
        Ok(true)
    }

    /// Plaintext size, creation time and wrapping key of a chunk, from its
    /// header alone.
    pub fn info(&self, asset_id: &str) -> CResult<ChunkInfo> {
        uri::validate_id(asset_id)?;
        let path = self.path_for(asset_id);
        if !path.exists() {
            return Err(Error::NotFound(format!("asset {}", asset_id)));
        }
        let raw = fs::read(&path)?;
        let (header, _) = ChunkHeader::decode(&raw)?;
        let modified: chrono::DateTime<chrono::Utc> = fs::metadata(&path)?.modified()?.into();
        Ok(ChunkInfo {
            size: header.plaintext_size,
            created_at: modified.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            kms_key_id: header.kms_key_id,
        })
    }

    /// Walks the sharded tree and reports store totals.
    pub fn status(&self) -> CResult<Status> {
        let mut chunks = 0u64;
        let mut logical_size = 0u64;
        let mut total_disk_size = 0u64;
        for level1 in fs::read_dir(&self.chunks_dir)? {
            for level2 in fs::read_dir(level1?.path())? {
                for entry in fs::read_dir(level2?.path())? {
                    let entry = entry?;
                    let raw = fs::read(entry.path())?;
                    if let Ok((header, _)) = ChunkHeader::decode(&raw) {
                        logical_size += header.plaintext_size;
                    }
                    chunks += 1;
                    total_disk_size += entry.metadata()?.len();
                }
            }
        }
        Ok(Status { name: "chunk store".to_string(), chunks, logical_size, total_disk_size })
    }
}
