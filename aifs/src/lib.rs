//! `aifs` is a semantic, content-addressed, versioned storage engine.
//!
//! Assets (blobs, tensors, embeddings, bundle artifacts) are immutable and
//! keyed by the BLAKE3 digest of their plaintext. Stored bytes are
//! zstd-compressed and envelope-encrypted with per-chunk data keys. Assets
//! carry derivation lineage, can be indexed by embedding vectors for
//! semantic retrieval, and are grouped into Merkle-rooted, Ed25519-signed
//! snapshots organized under mutable branches and immutable tags. A
//! transaction manager enforces strong causal visibility: a child asset is
//! never observable before its declared parents.
//!
//! ## Getting started
//!
//! ```no_run
//! use aifs::asset::AssetManager;
//! use aifs::codec::AssetKind;
//! use aifs::config::Config;
//! use aifs::error::CResult;
//!
//! fn run() -> CResult<()> {
//!     let mut config = Config::default();
//!     config.root_dir = "/var/lib/aifs".into();
//!     config.embedding_dim = 128;
//!
//!     let engine = AssetManager::open(config)?;
//!
//!     let asset_id = engine.put_asset(b"hello", AssetKind::Blob, None, None, &[], None)?;
//!     let asset = engine.get_asset(&asset_id)?.expect("just stored");
//!     assert_eq!(asset.data, b"hello");
//!
//!     let snapshot = engine.create_snapshot("default", &[asset_id], None, None)?;
//!     assert!(engine.verify_snapshot(&snapshot.snapshot_id)?);
//!
//!     engine.update_branch("default", "main", &snapshot.snapshot_id, None)?;
//!     engine.create_tag("default", "v1.0.0", &snapshot.snapshot_id, None)?;
//!     Ok(())
//! }
//! ```

pub mod asset;
pub mod auth;
pub mod codec;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod error;
pub mod kms;
pub mod merkle;
pub mod meta;
pub mod storage;
pub mod txn;
pub mod uri;
pub mod vector;
