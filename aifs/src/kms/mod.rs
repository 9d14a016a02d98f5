//! Key management and envelope encryption.
//!
//! Every chunk is encrypted under a fresh 256-bit data key; the data key is
//! AES-256-GCM-wrapped under the process master key, with the KMS key ID as
//! associated data. Compromise of one data key is scoped to one chunk, and
//! the master key is only touched during key-wrap operations.
//!
//! Key metadata and wrapped key material are persisted to
//! `<dir>/kms_keys.json`; the master key lives in `<dir>/master.key` unless
//! supplied through configuration.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

const KEYS_FILE: &str = "kms_keys.json";
const MASTER_KEY_FILE: &str = "master.key";

/// KMS key flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyType {
    /// 256-bit symmetric material.
    Symmetric256,
    /// Ed25519 seed material for signing use-cases.
    Asymmetric,
}

/// Public view of a KMS key: metadata only, never material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KmsKey {
    pub key_id: String,
    pub key_type: KeyType,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub metadata: HashMap<String, String>,
}

impl KmsKey {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map_or(false, |at| now > at)
    }
}

/// A freshly generated data key together with its wrapped form.
#[derive(Debug)]
pub struct DataKey {
    pub plaintext: [u8; 32],
    pub wrapped: Vec<u8>,
    pub nonce: [u8; 12],
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredKey {
    #[serde(flatten)]
    key: KmsKey,
    /// Key material wrapped under the master key, hex-encoded.
    wrapped_material: String,
    wrap_nonce: String,
}

#[derive(Default, Serialize, Deserialize)]
struct KeysFile {
    keys: Vec<StoredKey>,
    /// Fingerprint of the wrapping master key, to reject a mismatched key
    /// file early instead of failing on the first unwrap.
    master_key_fingerprint: String,
}

/// Wraps and unwraps data keys under a fixed master key.
pub struct EnvelopeEncryption {
    cipher: Aes256Gcm,
}

impl EnvelopeEncryption {
    pub fn new(master_key: &[u8; 32]) -> Self {
        EnvelopeEncryption {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(master_key)),
        }
    }

    /// Encrypts `data_key` with `key_id` as associated data. Returns the
    /// ciphertext (with tag) and the fresh nonce.
    pub fn wrap(&self, data_key: &[u8], key_id: &str) -> CResult<(Vec<u8>, [u8; 12])> {
        let mut nonce = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let wrapped = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: data_key, aad: key_id.as_bytes() })
            .map_err(|_| Error::Internal("data key wrap failed".to_string()))?;
        Ok((wrapped, nonce))
    }

    /// Decrypts a wrapped data key. A failed tag means the key file or chunk
    /// header was tampered with.
    pub fn unwrap(&self, wrapped: &[u8], nonce: &[u8], key_id: &str) -> CResult<Vec<u8>> {
        if nonce.len() != 12 {
            return Err(Error::InvalidArgument(format!(
                "wrap nonce must be 12 bytes, got {}",
                nonce.len()
            )));
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: wrapped, aad: key_id.as_bytes() })
            .map_err(|_| Error::DataCorruption("data key unwrap failed".to_string()))
    }
}

/// The key management service.
pub struct Kms {
    dir: PathBuf,
    master_key: [u8; 32],
    envelope: EnvelopeEncryption,
    /// key_id -> (metadata, unwrapped material). Expired entries are kept
    /// until lazily purged so stale lookups can be rejected explicitly.
    keys: Mutex<HashMap<String, (KmsKey, Vec<u8>)>>,
}

impl Kms {
    /// Opens the KMS at `dir`, creating it if needed. The master key is
    /// taken from `master_key`, else read from disk, else generated and
    /// persisted.
    pub fn open(dir: impl AsRef<Path>, master_key: Option<[u8; 32]>) -> CResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let master_key = match master_key {
            Some(key) => key,
            None => Self::load_or_generate_master_key(&dir)?,
        };

        let kms = Kms {
            envelope: EnvelopeEncryption::new(&master_key),
            dir,
            master_key,
            keys: Mutex::new(HashMap::new()),
        };
        kms.load_keys()?;
        Ok(kms)
    }

    fn load_or_generate_master_key(dir: &Path) -> CResult<[u8; 32]> {
        let path = dir.join(MASTER_KEY_FILE);
        if path.exists() {
            let bytes = fs::read(&path)?;
            let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                Error::DataCorruption(format!("master key file is {} bytes, want 32", bytes.len()))
            })?;
            return Ok(key);
        }
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        fs::write(&path, key)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        log::info!("generated new KMS master key at {}", path.display());
        Ok(key)
    }

    fn fingerprint(&self) -> String {
        blake3::hash(&self.master_key).to_hex().to_string()
    }

    fn load_keys(&self) -> CResult<()> {
        let path = self.dir.join(KEYS_FILE);
        if !path.exists() {
            return Ok(());
        }
        let file: KeysFile = serde_json::from_slice(&fs::read(&path)?)?;
        if file.master_key_fingerprint != self.fingerprint() {
            return Err(Error::DataCorruption(
                "kms key file was wrapped under a different master key".to_string(),
            ));
        }
        let mut keys = self.keys.lock()?;
        for stored in file.keys {
            let wrapped = hex::decode(&stored.wrapped_material)?;
            let nonce = hex::decode(&stored.wrap_nonce)?;
            let material = self.envelope.unwrap(&wrapped, &nonce, &stored.key.key_id)?;
            keys.insert(stored.key.key_id.clone(), (stored.key, material));
        }
        Ok(())
    }

    fn save_keys(&self, keys: &HashMap<String, (KmsKey, Vec<u8>)>) -> CResult<()> {
        let mut file = KeysFile {
            keys: Vec::with_capacity(keys.len()),
            master_key_fingerprint: self.fingerprint(),
        };
        for (key, material) in keys.values() {
            let (wrapped, nonce) = self.envelope.wrap(material, &key.key_id)?;
            file.keys.push(StoredKey {
                key: key.clone(),
                wrapped_material: hex::encode(wrapped),
                wrap_nonce: hex::encode(nonce),
            });
        }
        fs::write(self.dir.join(KEYS_FILE), serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    /// Creates a key. AlreadyExists if the ID is taken.
    pub fn create_key(
        &self,
        key_id: &str,
        key_type: KeyType,
        expires_at: Option<i64>,
        metadata: HashMap<String, String>,
    ) -> CResult<KmsKey> {
        let mut keys = self.keys.lock()?;
        if keys.contains_key(key_id) {
            return Err(Error::AlreadyExists(format!("kms key {:?}", key_id)));
        }
        let mut material = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut material);
        let key = KmsKey {
            key_id: key_id.to_string(),
            key_type,
            created_at: chrono::Utc::now().timestamp(),
            expires_at,
            metadata,
        };
        keys.insert(key_id.to_string(), (key.clone(), material));
        self.save_keys(&keys)?;
        Ok(key)
    }

    /// Returns key metadata, or None when absent or expired. Expired keys
    /// are purged on sight.
    pub fn get_key(&self, key_id: &str) -> CResult<Option<KmsKey>> {
        let now = chrono::Utc::now().timestamp();
        let mut keys = self.keys.lock()?;
        let expired = matches!(keys.get(key_id), Some((key, _)) if key.is_expired(now));
        if expired {
            keys.remove(key_id);
            self.save_keys(&keys)?;
            return Ok(None);
        }
        Ok(keys.get(key_id).map(|(key, _)| key.clone()))
    }

    pub fn delete_key(&self, key_id: &str) -> CResult<bool> {
        let mut keys = self.keys.lock()?;
        let removed = keys.remove(key_id).is_some();
        if removed {
            self.save_keys(&keys)?;
        }
        Ok(removed)
    }

    /// Lists live key IDs, purging expired entries.
    pub fn list_keys(&self) -> CResult<Vec<String>> {
        let now = chrono::Utc::now().timestamp();
        let mut keys = self.keys.lock()?;
        let expired: Vec<String> = keys
            .iter()
            .filter(|(_, (key, _))| key.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            keys.remove(id);
        }
        if !expired.is_empty() {
            self.save_keys(&keys)?;
        }
        let mut ids: Vec<String> = keys.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Regenerates key material in place, keeping the key ID. Data keys
    /// wrapped before the rotation stay unwrappable: wrapping is done under
    /// the master key, so rotation is a logical event recorded on the key.
    pub fn rotate_key(&self, key_id: &str) -> CResult<bool> {
        let mut keys = self.keys.lock()?;
        let Some((key, material)) = keys.get_mut(key_id) else {
            return Ok(false);
        };
        rand::rngs::OsRng.fill_bytes(material);
        key.created_at = chrono::Utc::now().timestamp();
        self.save_keys(&keys)?;
        Ok(true)
    }

    /// Generates a fresh 256-bit data key wrapped under the master key with
    /// `kms_key_id` as associated data. Refused for absent or expired keys.
    pub fn generate_data_key(&self, kms_key_id: &str) -> CResult<DataKey> {
        let now = chrono::Utc::now().timestamp();
        {
            let keys = self.keys.lock()?;
            match keys.get(kms_key_id) {
                None => return Err(Error::NotFound(format!("kms key {:?}", kms_key_id))),
                Some((key, _)) if key.is_expired(now) => {
                    return Err(Error::FailedPrecondition(format!(
                        "kms key {:?} is expired",
                        kms_key_id
                    )))
                }
                Some(_) => {}
            }
        }
        let mut plaintext = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut plaintext);
        let (wrapped, nonce) = self.envelope.wrap(&plaintext, kms_key_id)?;
        Ok(DataKey { plaintext, wrapped, nonce })
    }

    /// Unwraps a data key produced by [`Kms::generate_data_key`].
    pub fn unwrap_data_key(&self, wrapped: &[u8], nonce: &[u8], kms_key_id: &str) -> CResult<Vec<u8>> {
        self.envelope.unwrap(wrapped, nonce, kms_key_id)
    }

    /// Wraps arbitrary secret material (e.g. a namespace signing seed) under
    /// the master key.
    pub fn wrap_secret(&self, secret: &[u8], context: &str) -> CResult<(Vec<u8>, [u8; 12])> {
        self.envelope.wrap(secret, context)
    }

    pub fn unwrap_secret(&self, wrapped: &[u8], nonce: &[u8], context: &str) -> CResult<Vec<u8>> {
        self.envelope.unwrap(wrapped, nonce, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn wrap_unwrap_roundtrip() -> CResult<()> {
        let envelope = EnvelopeEncryption::new(&[7u8; 32]);
        let data_key = [42u8; 32];
        let (wrapped, nonce) = envelope.wrap(&data_key, "key-1")?;
        assert_ne!(wrapped, data_key);
        assert_eq!(envelope.unwrap(&wrapped, &nonce, "key-1")?, data_key);
        Ok(())
    }

    #[test]
    fn wrong_aad_or_tamper_fails() -> CResult<()> {
        let envelope = EnvelopeEncryption::new(&[7u8; 32]);
        let (mut wrapped, nonce) = envelope.wrap(&[42u8; 32], "key-1")?;

        match envelope.unwrap(&wrapped, &nonce, "key-2") {
            Err(Error::DataCorruption(_)) => {}
            other => panic!("expected DataCorruption, got {:?}", other),
        }
        wrapped[0] ^= 0xff;
        assert!(envelope.unwrap(&wrapped, &nonce, "key-1").is_err());
        Ok(())
    }

    #[test]
    fn key_lifecycle() -> CResult<()> {
        let dir = tempdir()?;
        let kms = Kms::open(dir.path(), None)?;

        let key = kms.create_key("chunks", KeyType::Symmetric256, None, HashMap::new())?;
        assert_eq!(key.key_id, "chunks");
        assert!(matches!(
            kms.create_key("chunks", KeyType::Symmetric256, None, HashMap::new()),
            Err(Error::AlreadyExists(_))
        ));

        assert_eq!(kms.list_keys()?, vec!["chunks".to_string()]);
        assert!(kms.get_key("chunks")?.is_some());
        assert!(kms.get_key("missing")?.is_none());

        assert!(kms.rotate_key("chunks")?);
        assert!(!kms.rotate_key("missing")?);

        assert!(kms.delete_key("chunks")?);
        assert!(!kms.delete_key("chunks")?);
        Ok(())
    }

    #[test]
    fn data_keys_survive_reopen() -> CResult<()> {
        let dir = tempdir()?;
        let (wrapped, nonce, plaintext) = {
            let kms = Kms::open(dir.path(), None)?;
            kms.create_key("chunks", KeyType::Symmetric256, None, HashMap::new())?;
            let dk = kms.generate_data_key("chunks")?;
            (dk.wrapped, dk.nonce, dk.plaintext)
        };
        // A new instance picks up the persisted master key and key registry.
        let kms = Kms::open(dir.path(), None)?;
        assert_eq!(kms.unwrap_data_key(&wrapped, &nonce, "chunks")?, plaintext);
        assert!(kms.get_key("chunks")?.is_some());
        Ok(())
    }

    #[test]
    fn expired_key_refuses_encryption() -> CResult<()> {
        let dir = tempdir()?;
        let kms = Kms::open(dir.path(), None)?;
        let past = chrono::Utc::now().timestamp() - 10;
        kms.create_key("old", KeyType::Symmetric256, Some(past), HashMap::new())?;

        match kms.generate_data_key("old") {
            Err(Error::FailedPrecondition(_)) => {}
            other => panic!("expected FailedPrecondition, got {:?}", other),
        }
        // Lazy purge on lookup.
        assert!(kms.get_key("old")?.is_none());
        assert!(kms.list_keys()?.is_empty());
        Ok(())
    }

    #[test]
    fn missing_key_is_not_found() -> CResult<()> {
        let dir = tempdir()?;
        let kms = Kms::open(dir.path(), None)?;
        assert!(matches!(kms.generate_data_key("nope"), Err(Error::NotFound(_))));
        Ok(())
    }
}
