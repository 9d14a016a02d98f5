//! Ed25519 snapshot signing and key registries.
//!
//! A namespace owns one signing key pair; snapshots created in it are signed
//! over the canonical message `merkle_root + ":" + created_at + ":" +
//! namespace`. Verification is a boolean outcome, never an error: a snapshot
//! that does not verify is simply not served from public read paths.
//!
//! Only public keys and signatures are ever persisted or transmitted; seeds
//! stay inside the engine (wrapped by the KMS when stored).

use std::collections::HashMap;
use std::sync::Mutex;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Generates a fresh Ed25519 key pair.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing = SigningKey::generate(&mut rand::rngs::OsRng);
    let verifying = signing.verifying_key();
    (signing, verifying)
}

/// Deterministic key from a 32-byte seed.
pub fn key_from_seed(seed: &[u8]) -> CResult<SigningKey> {
    let seed: [u8; 32] = seed
        .try_into()
        .map_err(|_| Error::InvalidArgument(format!("seed must be 32 bytes, got {}", seed.len())))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// The canonical snapshot signing message.
fn snapshot_message(merkle_root: &str, created_at: &str, namespace: &str) -> Vec<u8> {
    format!("{}:{}:{}", merkle_root, created_at, namespace).into_bytes()
}

/// Signs a snapshot. Returns the signature bytes and their hex form.
pub fn sign_snapshot(
    key: &SigningKey,
    merkle_root: &str,
    created_at: &str,
    namespace: &str,
) -> (Vec<u8>, String) {
    let signature = key.sign(&snapshot_message(merkle_root, created_at, namespace));
    let bytes = signature.to_bytes().to_vec();
    let hex = hex::encode(&bytes);
    (bytes, hex)
}

/// Verifies a snapshot signature. Any parse or verification failure is
/// `false`; this is an outcome, not an error.
pub fn verify_snapshot(
    signature: &[u8],
    merkle_root: &str,
    created_at: &str,
    namespace: &str,
    public_key: &[u8],
) -> bool {
    let public: [u8; 32] = match public_key.try_into() {
        Ok(public) => public,
        Err(_) => return false,
    };
    let Ok(verifying) = VerifyingKey::from_bytes(&public) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying
        .verify(&snapshot_message(merkle_root, created_at, namespace), &signature)
        .is_ok()
}

/// Hex-string convenience wrapper over [`verify_snapshot`].
pub fn verify_snapshot_hex(
    signature_hex: &str,
    merkle_root: &str,
    created_at: &str,
    namespace: &str,
    public_key_hex: &str,
) -> bool {
    let (Ok(signature), Ok(public)) = (hex::decode(signature_hex), hex::decode(public_key_hex))
    else {
        return false;
    };
    verify_snapshot(&signature, merkle_root, created_at, namespace, &public)
}

/// An externally issued public key pinned for verification, optionally
/// scoped to one namespace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustedKey {
    pub key_id: String,
    pub public_key_hex: String,
    pub namespace: Option<String>,
}

/// In-memory registry of namespace signing keys and pinned trusted keys.
/// Durability is the asset manager's concern: it loads persisted keys at
/// open and writes new ones through the metadata store.
pub struct KeyRegistry {
    namespace_keys: Mutex<HashMap<String, SigningKey>>,
    trusted_keys: Mutex<HashMap<String, TrustedKey>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        KeyRegistry {
            namespace_keys: Mutex::new(HashMap::new()),
            trusted_keys: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts a namespace signing key, replacing any previous one.
    pub fn insert_namespace_key(&self, namespace: &str, key: SigningKey) -> CResult<()> {
        self.namespace_keys.lock()?.insert(namespace.to_string(), key);
        Ok(())
    }

    pub fn namespace_key(&self, namespace: &str) -> CResult<Option<SigningKey>> {
        Ok(self.namespace_keys.lock()?.get(namespace).cloned())
    }

    /// Public key hex for a namespace, if registered.
    pub fn namespace_public_key(&self, namespace: &str) -> CResult<Option<String>> {
        Ok(self
            .namespace_keys
            .lock()?
            .get(namespace)
            .map(|key| hex::encode(key.verifying_key().to_bytes())))
    }

    /// Lists `(namespace, public_key_hex)` pairs, sorted by namespace.
    pub fn list_namespace_keys(&self) -> CResult<Vec<(String, String)>> {
        let keys = self.namespace_keys.lock()?;
        let mut out: Vec<(String, String)> = keys
            .iter()
            .map(|(ns, key)| (ns.clone(), hex::encode(key.verifying_key().to_bytes())))
            .collect();
        out.sort();
        Ok(out)
    }

    /// Pins an external public key. AlreadyExists when the ID is taken with
    /// different material.
    pub fn pin_trusted_key(&self, key: TrustedKey) -> CResult<()> {
        let mut keys = self.trusted_keys.lock()?;
        match keys.get(&key.key_id) {
            Some(existing) if *existing == key => Ok(()),
            Some(_) => Err(Error::AlreadyExists(format!("trusted key {:?}", key.key_id))),
            None => {
                keys.insert(key.key_id.clone(), key);
                Ok(())
            }
        }
    }

    pub fn trusted_key(&self, key_id: &str) -> CResult<Option<TrustedKey>> {
        Ok(self.trusted_keys.lock()?.get(key_id).cloned())
    }

    pub fn list_trusted_keys(&self) -> CResult<Vec<TrustedKey>> {
        let keys = self.trusted_keys.lock()?;
        let mut out: Vec<TrustedKey> = keys.values().cloned().collect();
        out.sort_by(|a, b| a.key_id.cmp(&b.key_id));
        Ok(out)
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
