//! Asset manager: the cross-component orchestration layer.
//!
//! One instance owns the chunk store, KMS, metadata store, vector index,
//! transaction manager and key registry, and enforces the engine invariants
//! across them: content addressing, codec validation, strong causal
//! visibility, snapshot signing, and the delete preconditions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fs4::FileExt;

use crate::codec::{self, AssetKind};
use crate::compress::Compressor;
use crate::config::Config;
use crate::crypto::{self, KeyRegistry, TrustedKey};
use crate::error::{CResult, Error};
use crate::kms::{KeyType, Kms};
use crate::merkle::MerkleTree;
use crate::meta::store::NamespaceKeyRow;
use crate::meta::{
    now, snapshot_id, AssetRecord, BranchHistoryEntry, BranchRecord, LineageEntry, MetadataStore,
    NamespaceRecord, ParentRef, SnapshotRecord, TagRecord,
};
use crate::storage::chunk_store::ChunkStore;
use crate::txn::{TransactionManager, TransactionState};
use crate::uri;
use crate::vector::VectorIndex;

/// The KMS key chunk data keys are wrapped under.
const CHUNK_KMS_KEY: &str = "default";
/// The namespace that exists from first boot.
const DEFAULT_NAMESPACE: &str = "default";

/// A retrieved asset: payload plus metadata and its lineage neighborhood.
#[derive(Clone, Debug, PartialEq)]
pub struct Asset {
    pub record: AssetRecord,
    pub data: Vec<u8>,
    pub parents: Vec<LineageEntry>,
    pub children: Vec<LineageEntry>,
}

/// One vector-search hit.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult {
    pub asset: AssetRecord,
    pub distance: f32,
}

/// Engine-wide counters for the status endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineStatus {
    pub assets: u64,
    pub namespaces: u64,
    pub snapshots: u64,
    pub vectors: u64,
    pub pending_transactions: u64,
    pub chunk_store: crate::storage::Status,
    pub strong_causality: bool,
}

pub struct AssetManager {
    config: Config,
    kms: Arc<Kms>,
    chunks: ChunkStore,
    meta: MetadataStore,
    vectors: VectorIndex,
    txns: TransactionManager,
    keys: KeyRegistry,
    /// Exclusive root-dir lock, held for the engine's lifetime.
    _lock: std::fs::File,
}

impl AssetManager {
    /// Opens (or initializes) an engine rooted at `config.root_dir`.
    pub fn open(config: Config) -> CResult<Self> {
        config.validate()?;
        let root = &config.root_dir;
        std::fs::create_dir_all(root)?;

        let lock = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(root.join("LOCK"))?;
        lock.try_lock_exclusive().map_err(|_| {
            Error::FailedPrecondition(format!(
                "engine root {} is locked by another process",
                root.display()
            ))
        })?;

        let master_key = match &config.kms_master_key {
            Some(hex_key) => {
                let bytes = hex::decode(hex_key)?;
                Some(bytes.as_slice().try_into().map_err(|_| {
                    Error::InvalidArgument("master key must be 32 bytes".to_string())
                })?)
            }
            None => None,
        };
        let kms = Arc::new(Kms::open(root.join("kms"), master_key)?);
        if kms.get_key(CHUNK_KMS_KEY)?.is_none() {
            kms.create_key(CHUNK_KMS_KEY, KeyType::Symmetric256, None, HashMap::new())?;
        }

        let compressor = Compressor::new(config.compression_level)?;
        let chunks = ChunkStore::open(root, compressor, kms.clone(), CHUNK_KMS_KEY)?;
        let meta = MetadataStore::open(root.join("metadata.db"))?;
        let vectors = VectorIndex::open(root.join("vectors"), config.embedding_dim)?;
        let txns = TransactionManager::new(meta.connection());

        let keys = KeyRegistry::new();
        for row in meta.load_namespace_keys()? {
            let wrapped = hex::decode(&row.wrapped_seed_hex)?;
            let nonce = hex::decode(&row.wrap_nonce_hex)?;
            let seed = kms.unwrap_secret(&wrapped, &nonce, &namespace_key_context(&row.namespace))?;
            let key = crypto::key_from_seed(&seed)?;
            if hex::encode(key.verifying_key().to_bytes()) != row.public_key_hex {
                return Err(Error::DataCorruption(format!(
                    "stored public key for namespace {:?} does not match its seed",
                    row.namespace
                )));
            }
            keys.insert_namespace_key(&row.namespace, key)?;
        }
        for trusted in meta.load_trusted_keys()? {
            keys.pin_trusted_key(trusted)?;
        }

        meta.ensure_namespace(DEFAULT_NAMESPACE)?;
        log::info!(
            "engine open at {} (strong causality {})",
            root.display(),
            if config.enable_strong_causality { "on" } else { "off" }
        );
        Ok(AssetManager { config, kms, chunks, meta, vectors, txns, keys, _lock: lock })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn kms(&self) -> &Kms {
        &self.kms
    }

    // ---- assets ----

    /// Stores an asset. The payload is validated against the codec for
    /// `kind`; lineage edges and the optional embedding are recorded
    /// alongside. With strong causality on, visibility is deferred to the
    /// commit of `txn` (or of an auto-transaction wrapping this call);
    /// otherwise the asset is visible immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn put_asset(
        &self,
        data: &[u8],
        kind: AssetKind,
        embedding: Option<&[f32]>,
        metadata: Option<HashMap<String, String>>,
        parents: &[ParentRef],
        txn: Option<&str>,
    ) -> CResult<String> {
        if data.len() as u64 > self.config.max_message_bytes {
            return Err(Error::ResourceExhausted(format!(
                "payload is {} bytes, limit is {}",
                data.len(),
                self.config.max_message_bytes
            )));
        }
        if !codec::validate(kind, data) {
            return Err(Error::InvalidArgument(format!("payload is not a valid {}", kind)));
        }
        for parent in parents {
            uri::validate_id(&parent.asset_id)?;
        }

        let asset_id = self.chunks.put(data)?;
        self.meta.add_asset(&asset_id, kind, data.len() as u64, &metadata.unwrap_or_default())?;
        if let Some(vector) = embedding {
            self.vectors.add(&asset_id, vector)?;
        }
        for parent in parents {
            self.meta.add_lineage(
                &asset_id,
                &parent.asset_id,
                parent.transform_name.as_deref(),
                parent.transform_digest.as_deref(),
            )?;
        }

        if !self.config.enable_strong_causality {
            if let Some(txn) = txn {
                self.txns.add_asset(txn, &asset_id)?;
            }
            self.txns.set_visible(&asset_id)?;
            return Ok(asset_id);
        }

        match txn {
            Some(txn) => {
                self.txns.add_asset(txn, &asset_id)?;
                for parent in parents {
                    self.txns.add_dependency(txn, &parent.asset_id)?;
                }
            }
            None => {
                // Auto-transaction around this single put. If the parents
                // are not visible the put cannot become visible either, and
                // with no handle for the caller to retry on, the only sound
                // outcome is to roll back and surface the precondition.
                let auto = self.txns.begin()?;
                self.txns.add_asset(&auto, &asset_id)?;
                for parent in parents {
                    self.txns.add_dependency(&auto, &parent.asset_id)?;
                }
                if !self.txns.commit(&auto)? {
                    self.txns.rollback(&auto)?;
                    return Err(Error::FailedPrecondition(format!(
                        "parents of {} are not visible",
                        asset_id
                    )));
                }
            }
        }
        Ok(asset_id)
    }

    /// Retrieves an asset with its lineage neighborhood. In strong-causality
    /// mode an uncommitted asset is indistinguishable from an absent one.
    pub fn get_asset(&self, asset_id: &str) -> CResult<Option<Asset>> {
        uri::validate_id(asset_id)?;
        if self.config.enable_strong_causality && !self.txns.is_visible(asset_id)? {
            return Ok(None);
        }
        let data = match self.chunks.get(asset_id) {
            Ok(data) => data,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let record = match self.meta.get_asset(asset_id)? {
            Some(record) => record,
            None => {
                // A chunk without a metadata row can only come from a crash
                // between the two writes; serve it as an untyped blob.
                log::warn!("asset {} has no metadata row", asset_id);
                AssetRecord {
                    asset_id: asset_id.to_string(),
                    kind: AssetKind::Blob,
                    size: data.len() as u64,
                    metadata: HashMap::new(),
                    created_at: self.chunks.info(asset_id)?.created_at,
                }
            }
        };

        let parents = self.meta.get_parents(asset_id)?;
        let mut children = self.meta.get_children(asset_id)?;
        if self.config.enable_strong_causality {
            let mut visible = Vec::with_capacity(children.len());
            for child in children {
                if self.txns.is_visible(&child.asset.asset_id)? {
                    visible.push(child);
                }
            }
            children = visible;
        }
        Ok(Some(Asset { record, data, parents, children }))
    }

    pub fn list_assets(&self, limit: u32, offset: u32) -> CResult<Vec<AssetRecord>> {
        if !self.config.enable_strong_causality {
            return self.meta.list_assets(limit, offset);
        }
        let mut out = Vec::new();
        for asset_id in self.txns.visible_assets(limit, offset)? {
            if let Some(record) = self.meta.get_asset(&asset_id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Deletes an asset. Inclusion in any snapshot is always fatal; visible
    /// children are fatal unless `force` is set.
    pub fn delete_asset(&self, asset_id: &str, force: bool) -> CResult<bool> {
        uri::validate_id(asset_id)?;
        if !self.chunks.exists(asset_id)? && self.meta.get_asset(asset_id)?.is_none() {
            return Ok(false);
        }
        if self.meta.snapshot_references_asset(asset_id)? {
            return Err(Error::FailedPrecondition(format!(
                "asset {} is referenced by a snapshot",
                asset_id
            )));
        }
        if !force {
            for child in self.meta.get_children(asset_id)? {
                let visible = !self.config.enable_strong_causality
                    || self.txns.is_visible(&child.asset.asset_id)?;
                if visible {
                    return Err(Error::FailedPrecondition(format!(
                        "asset {} has child {}",
                        asset_id, child.asset.asset_id
                    )));
                }
            }
        }

        self.chunks.delete(asset_id)?;
        self.vectors.delete(asset_id)?;
        self.meta.delete_asset(asset_id)?;
        self.txns.remove_visibility(asset_id)?;
        log::info!("deleted asset {}", asset_id);
        Ok(true)
    }

    /// k-nearest semantic search. Invisible assets are filtered out before
    /// ranking is returned.
    pub fn vector_search(&self, query: &[f32], k: usize) -> CResult<Vec<SearchResult>> {
        let mut out = Vec::new();
        for (asset_id, distance) in self.vectors.search(query, k)? {
            if self.config.enable_strong_causality && !self.txns.is_visible(&asset_id)? {
                continue;
            }
            if let Some(asset) = self.meta.get_asset(&asset_id)? {
                out.push(SearchResult { asset, distance });
            }
        }
        Ok(out)
    }

    // ---- transactions ----

    pub fn begin_transaction(&self) -> CResult<String> {
        self.txns.begin()
    }

    pub fn commit_transaction(&self, transaction_id: &str) -> CResult<bool> {
        self.txns.commit(transaction_id)
    }

    pub fn rollback_transaction(&self, transaction_id: &str) -> CResult<bool> {
        self.txns.rollback(transaction_id)
    }

    pub fn transaction_state(&self, transaction_id: &str) -> CResult<Option<TransactionState>> {
        self.txns.state(transaction_id)
    }

    pub fn dependencies_satisfied(&self, transaction_id: &str) -> CResult<bool> {
        self.txns.dependencies_satisfied(transaction_id)
    }

    pub fn wait_for_dependencies(&self, transaction_id: &str, timeout: Duration) -> CResult<bool> {
        self.txns.wait_for_dependencies(transaction_id, timeout)
    }

    pub fn is_visible(&self, asset_id: &str) -> CResult<bool> {
        self.txns.is_visible(asset_id)
    }

    // ---- snapshots ----

    /// Creates a signed snapshot over `asset_ids` in `namespace`. The
    /// Merkle root is deterministic in the sorted ID set, the snapshot ID in
    /// `(merkle_root, created_at)`; pass `created_at` to pin identity.
    /// Signing uses the namespace key, registered on first use.
    pub fn create_snapshot(
        &self,
        namespace: &str,
        asset_ids: &[String],
        metadata: Option<HashMap<String, String>>,
        created_at: Option<String>,
    ) -> CResult<SnapshotRecord> {
        for asset_id in asset_ids {
            uri::validate_id(asset_id)?;
        }
        self.meta.ensure_namespace(namespace)?;

        let tree = MerkleTree::new(asset_ids);
        let merkle_root = tree.root();
        let created_at = created_at.unwrap_or_else(now);
        let snapshot_id = snapshot_id(&merkle_root, &created_at);

        self.register_namespace_key(namespace)?;
        let signing_key = self
            .keys
            .namespace_key(namespace)?
            .ok_or_else(|| Error::Internal(format!("no signing key for namespace {:?}", namespace)))?;
        let (_, signature_hex) =
            crypto::sign_snapshot(&signing_key, &merkle_root, &created_at, namespace);

        let mut sorted_ids: Vec<String> = asset_ids.to_vec();
        sorted_ids.sort();
        sorted_ids.dedup();
        let record = SnapshotRecord {
            snapshot_id: snapshot_id.clone(),
            namespace: namespace.to_string(),
            merkle_root,
            metadata: metadata.unwrap_or_default(),
            signature_hex: Some(signature_hex),
            created_at,
            asset_ids: sorted_ids,
        };
        self.meta.create_snapshot(&record)?;

        // Logical vector deletions are reclaimed at snapshot boundaries.
        self.vectors.compact()?;
        log::info!("created snapshot {} in {:?}", snapshot_id, namespace);
        Ok(record)
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> CResult<Option<SnapshotRecord>> {
        uri::validate_id(snapshot_id)?;
        self.meta.get_snapshot(snapshot_id)
    }

    /// Merkle inclusion proof for a member of a stored snapshot.
    pub fn snapshot_proof(
        &self,
        snapshot_id: &str,
        asset_id: &str,
    ) -> CResult<Option<Vec<crate::merkle::ProofStep>>> {
        let Some(record) = self.get_snapshot(snapshot_id)? else {
            return Err(Error::NotFound(format!("snapshot {}", snapshot_id)));
        };
        Ok(MerkleTree::new(&record.asset_ids).proof(asset_id))
    }

    /// Boolean signature check; a snapshot that does not verify is not an
    /// error. Unknown snapshots are NotFound.
    pub fn verify_snapshot(&self, snapshot_id: &str) -> CResult<bool> {
        let Some(record) = self.get_snapshot(snapshot_id)? else {
            return Err(Error::NotFound(format!("snapshot {}", snapshot_id)));
        };
        self.verify_snapshot_record(&record)
    }

    fn verify_snapshot_record(&self, record: &SnapshotRecord) -> CResult<bool> {
        let Some(signature_hex) = record.signature_hex.as_deref() else {
            return Ok(false);
        };
        let Some(public_key_hex) = self.keys.namespace_public_key(&record.namespace)? else {
            return Ok(false);
        };
        Ok(crypto::verify_snapshot_hex(
            signature_hex,
            &record.merkle_root,
            &record.created_at,
            &record.namespace,
            &public_key_hex,
        ))
    }

    /// Like [`Self::get_snapshot`], but a snapshot whose signature does not
    /// verify is, by policy, invisible.
    pub fn get_verified_snapshot(&self, snapshot_id: &str) -> CResult<SnapshotRecord> {
        let Some(record) = self.get_snapshot(snapshot_id)? else {
            return Err(Error::NotFound(format!("snapshot {}", snapshot_id)));
        };
        if !self.verify_snapshot_record(&record)? {
            return Err(Error::NotFound(format!("snapshot {}", snapshot_id)));
        }
        Ok(record)
    }

    pub fn list_snapshots(
        &self,
        namespace: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> CResult<Vec<SnapshotRecord>> {
        self.meta.list_snapshots(namespace, limit, offset)
    }

    /// Lists snapshots whose signatures verify; the rest are filtered out
    /// as if absent.
    pub fn list_verified_snapshots(
        &self,
        namespace: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> CResult<Vec<SnapshotRecord>> {
        let mut out = Vec::new();
        for record in self.meta.list_snapshots(namespace, limit, offset)? {
            if self.verify_snapshot_record(&record)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    // ---- namespaces and keys ----

    pub fn create_namespace(
        &self,
        name: &str,
        description: &str,
        metadata: Option<HashMap<String, String>>,
    ) -> CResult<NamespaceRecord> {
        self.meta.create_namespace(name, description, &metadata.unwrap_or_default())
    }

    pub fn get_namespace(&self, name: &str) -> CResult<Option<NamespaceRecord>> {
        self.meta.get_namespace(name)
    }

    pub fn list_namespaces(&self) -> CResult<Vec<NamespaceRecord>> {
        self.meta.list_namespaces()
    }

    /// Ensures `namespace` has a signing key, generating and persisting one
    /// (seed wrapped under the KMS master key) on first use. Returns the
    /// public key hex.
    pub fn register_namespace_key(&self, namespace: &str) -> CResult<String> {
        if let Some(public) = self.keys.namespace_public_key(namespace)? {
            return Ok(public);
        }
        let (signing, verifying) = crypto::generate_keypair();
        let public_key_hex = hex::encode(verifying.to_bytes());
        let (wrapped, nonce) = self
            .kms
            .wrap_secret(signing.as_bytes(), &namespace_key_context(namespace))?;
        self.meta.save_namespace_key(&NamespaceKeyRow {
            namespace: namespace.to_string(),
            public_key_hex: public_key_hex.clone(),
            wrapped_seed_hex: hex::encode(wrapped),
            wrap_nonce_hex: hex::encode(nonce),
            expires_at: self
                .config
                .default_namespace_key_expiry
                .map(|ttl| chrono::Utc::now().timestamp() + ttl as i64),
        })?;
        self.keys.insert_namespace_key(namespace, signing)?;
        log::info!("registered signing key for namespace {:?}", namespace);
        Ok(public_key_hex)
    }

    pub fn get_namespace_key(&self, namespace: &str) -> CResult<Option<String>> {
        self.keys.namespace_public_key(namespace)
    }

    pub fn list_namespace_keys(&self) -> CResult<Vec<(String, String)>> {
        self.keys.list_namespace_keys()
    }

    /// Pins an externally issued public key for verification lookups.
    pub fn pin_trusted_key(
        &self,
        key_id: &str,
        public_key_hex: &str,
        namespace: Option<&str>,
    ) -> CResult<()> {
        let key = TrustedKey {
            key_id: key_id.to_string(),
            public_key_hex: public_key_hex.to_string(),
            namespace: namespace.map(|ns| ns.to_string()),
        };
        self.keys.pin_trusted_key(key.clone())?;
        self.meta.save_trusted_key(&key)
    }

    pub fn get_trusted_key(&self, key_id: &str) -> CResult<Option<TrustedKey>> {
        self.keys.trusted_key(key_id)
    }

    pub fn list_trusted_keys(&self) -> CResult<Vec<TrustedKey>> {
        self.keys.list_trusted_keys()
    }

    // ---- branches ----

    /// Creates the branch if absent, otherwise moves its head. Total order
    /// per branch is preserved in `branch_history`.
    pub fn update_branch(
        &self,
        namespace: &str,
        branch_name: &str,
        snapshot_id: &str,
        metadata: Option<HashMap<String, String>>,
    ) -> CResult<BranchRecord> {
        self.meta.ensure_namespace(namespace)?;
        self.meta.upsert_branch(namespace, branch_name, snapshot_id, &metadata.unwrap_or_default())
    }

    pub fn get_branch(&self, namespace: &str, branch_name: &str) -> CResult<Option<BranchRecord>> {
        self.meta.get_branch(namespace, branch_name)
    }

    pub fn list_branches(&self, namespace: &str) -> CResult<Vec<BranchRecord>> {
        self.meta.list_branches(namespace)
    }

    pub fn branch_history(
        &self,
        namespace: &str,
        branch_name: &str,
        limit: u32,
        offset: u32,
    ) -> CResult<Vec<BranchHistoryEntry>> {
        self.meta.branch_history(namespace, branch_name, limit, offset)
    }

    pub fn delete_branch(&self, namespace: &str, branch_name: &str) -> CResult<bool> {
        self.meta.delete_branch(namespace, branch_name)
    }

    // ---- tags ----

    pub fn create_tag(
        &self,
        namespace: &str,
        tag_name: &str,
        snapshot_id: &str,
        metadata: Option<HashMap<String, String>>,
    ) -> CResult<TagRecord> {
        self.meta.ensure_namespace(namespace)?;
        self.meta.create_tag(namespace, tag_name, snapshot_id, &metadata.unwrap_or_default())
    }

    pub fn get_tag(&self, namespace: &str, tag_name: &str) -> CResult<Option<TagRecord>> {
        self.meta.get_tag(namespace, tag_name)
    }

    pub fn list_tags(&self, namespace: &str) -> CResult<Vec<TagRecord>> {
        self.meta.list_tags(namespace)
    }

    /// Tags are write-once; deletion requires the policy override in the
    /// engine configuration.
    pub fn delete_tag(&self, namespace: &str, tag_name: &str) -> CResult<bool> {
        if !self.config.allow_tag_delete {
            return Err(Error::FailedPrecondition(
                "tag deletion is disabled by policy".to_string(),
            ));
        }
        self.meta.delete_tag(namespace, tag_name)
    }

    // ---- status ----

    pub fn status(&self) -> CResult<EngineStatus> {
        Ok(EngineStatus {
            assets: self.meta.asset_count()?,
            namespaces: self.meta.list_namespaces()?.len() as u64,
            snapshots: self.meta.snapshot_count()?,
            vectors: self.vectors.len()? as u64,
            pending_transactions: self.txns.pending_transactions()?.len() as u64,
            chunk_store: self.chunks.status()?,
            strong_causality: self.config.enable_strong_causality,
        })
    }
}

fn namespace_key_context(namespace: &str) -> String {
    format!("namespace-key:{}", namespace)
}

#[cfg(test)]
impl AssetManager {
    /// Test-support hook: corrupts a stored snapshot's Merkle root without
    /// touching its signature.
    fn tamper_snapshot_root(&self, snapshot_id: &str, merkle_root: &str) -> CResult<()> {
        let conn = self.meta.connection();
        let conn = conn.lock()?;
        conn.execute(
            "UPDATE snapshots SET merkle_root = ?2 WHERE snapshot_id = ?1",
            rusqlite::params![snapshot_id, merkle_root],
        )?;
        Ok(())
    }
}
