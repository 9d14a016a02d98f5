//! Flat L2 vector index over fixed-dimension float32 vectors.
//!
//! The index maps integer slots to asset IDs and scans exhaustively on
//! search, which is the correct-by-construction substrate at modest scale
//! (cosine ranking is achievable by caller-side normalization). Deletion is
//! logical: the slot is dropped from the mapping and its vector reclaimed on
//! the next compaction.
//!
//! State persists as two files, `vectors.bin` and `mapping.bin`; if either
//! is absent or inconsistent the index starts empty and is rebuilt by
//! re-inserting.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

const VECTORS_FILE: &str = "vectors.bin";
const MAPPING_FILE: &str = "mapping.bin";

#[derive(Default, Serialize, Deserialize)]
struct StoredVectors {
    dimension: u32,
    vectors: Vec<Vec<f32>>,
}

#[derive(Default)]
struct Inner {
    /// Slot -> vector. Slots of deleted assets stay allocated until compaction.
    vectors: Vec<Vec<f32>>,
    slot_to_asset: HashMap<u64, String>,
    asset_to_slot: HashMap<String, u64>,
}

pub struct VectorIndex {
    dir: PathBuf,
    dimension: usize,
    inner: RwLock<Inner>,
}

impl VectorIndex {
    /// Opens (or initializes) the index at `dir` with a fixed dimension.
    pub fn open(dir: impl AsRef<Path>, dimension: usize) -> CResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let index = VectorIndex { dir, dimension, inner: RwLock::new(Inner::default()) };
        index.load()?;
        Ok(index)
    }

    fn load(&self) -> CResult<()> {
        let vectors_path = self.dir.join(VECTORS_FILE);
        let mapping_path = self.dir.join(MAPPING_FILE);
        if !vectors_path.exists() || !mapping_path.exists() {
            return Ok(());
        }
        let stored: StoredVectors = match bincode::deserialize(&fs::read(&vectors_path)?) {
            Ok(stored) => stored,
            Err(err) => {
                log::warn!("vector index unreadable, starting empty: {}", err);
                return Ok(());
            }
        };
        if stored.dimension as usize != self.dimension {
            log::warn!(
                "vector index dimension {} does not match configured {}, starting empty",
                stored.dimension,
                self.dimension
            );
            return Ok(());
        }
        let slot_to_asset: HashMap<u64, String> =
            match bincode::deserialize(&fs::read(&mapping_path)?) {
                Ok(mapping) => mapping,
                Err(err) => {
                    log::warn!("vector mapping unreadable, starting empty: {}", err);
                    return Ok(());
                }
            };

        let mut inner = self.inner.write()?;
        inner.asset_to_slot =
            slot_to_asset.iter().map(|(slot, asset)| (asset.clone(), *slot)).collect();
        inner.slot_to_asset = slot_to_asset;
        inner.vectors = stored.vectors;
        Ok(())
    }

    fn persist(&self, inner: &Inner) -> CResult<()> {
        let stored =
            StoredVectors { dimension: self.dimension as u32, vectors: inner.vectors.clone() };
        fs::write(self.dir.join(VECTORS_FILE), bincode::serialize(&stored)?)?;
        fs::write(self.dir.join(MAPPING_FILE), bincode::serialize(&inner.slot_to_asset)?)?;
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Live vector count.
    pub fn len(&self) -> CResult<usize> {
        Ok(self.inner.read()?.slot_to_asset.len())
    }

    pub fn is_empty(&self) -> CResult<bool> {
        Ok(self.len()? == 0)
    }

    fn check_dimension(&self, vector: &[f32]) -> CResult<()> {
        if vector.len() != self.dimension {
            return Err(Error::InvalidArgument(format!(
                "vector has dimension {}, index wants {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    /// Inserts (or replaces) the vector for an asset. One vector per asset
    /// at most.
    pub fn add(&self, asset_id: &str, vector: &[f32]) -> CResult<()> {
        self.check_dimension(vector)?;
        let mut inner = self.inner.write()?;
        match inner.asset_to_slot.get(asset_id).copied() {
            Some(slot) => {
                inner.vectors[slot as usize] = vector.to_vec();
            }
            None => {
                let slot = inner.vectors.len() as u64;
                inner.vectors.push(vector.to_vec());
                inner.slot_to_asset.insert(slot, asset_id.to_string());
                inner.asset_to_slot.insert(asset_id.to_string(), slot);
            }
        }
        self.persist(&inner)
    }

    /// Exhaustive k-nearest search, ascending L2 distance. Ties break on
    /// asset ID so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> CResult<Vec<(String, f32)>> {
        self.check_dimension(query)?;
        let inner = self.inner.read()?;
        let mut results: Vec<(String, f32)> = inner
            .slot_to_asset
            .iter()
            .map(|(&slot, asset_id)| {
                let vector = &inner.vectors[slot as usize];
                let distance = query
                    .iter()
                    .zip(vector.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>()
                    .sqrt();
                (asset_id.clone(), distance)
            })
            .collect();
        results.sort_by(|a, b| {
            a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(k);
        Ok(results)
    }

    /// Logical deletion; the slot's vector is reclaimed by [`Self::compact`].
    pub fn delete(&self, asset_id: &str) -> CResult<bool> {
        let mut inner = self.inner.write()?;
        let Some(slot) = inner.asset_to_slot.remove(asset_id) else {
            return Ok(false);
        };
        inner.slot_to_asset.remove(&slot);
        self.persist(&inner)?;
        Ok(true)
    }

    /// Rebuilds the slot table without orphaned vectors.
    pub fn compact(&self) -> CResult<()> {
        let mut inner = self.inner.write()?;
        let mut vectors = Vec::with_capacity(inner.slot_to_asset.len());
        let mut slot_to_asset = HashMap::new();
        let mut asset_to_slot = HashMap::new();

        let mut entries: Vec<(u64, String)> =
            inner.slot_to_asset.iter().map(|(&slot, asset)| (slot, asset.clone())).collect();
        entries.sort();
        for (old_slot, asset_id) in entries {
            let slot = vectors.len() as u64;
            vectors.push(inner.vectors[old_slot as usize].clone());
            slot_to_asset.insert(slot, asset_id.clone());
            asset_to_slot.insert(asset_id, slot);
        }
        inner.vectors = vectors;
        inner.slot_to_asset = slot_to_asset;
        inner.asset_to_slot = asset_to_slot;
        self.persist(&inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn unit(dim: usize, at: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[at] = 1.0;
        v
    }

    #[test]
    fn add_search_roundtrip() -> CResult<()> {
        let dir = tempdir()?;
        let index = VectorIndex::open(dir.path(), 4)?;
        index.add("asset-a", &unit(4, 0))?;
        index.add("asset-b", &unit(4, 1))?;
        index.add("asset-c", &[0.9, 0.1, 0.0, 0.0])?;

        let results = index.search(&unit(4, 0), 2)?;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "asset-a");
        assert!(results[0].1 < 1e-6);
        assert_eq!(results[1].0, "asset-c");
        assert!(results[0].1 <= results[1].1);
        Ok(())
    }

    #[test]
    fn wrong_dimension_is_invalid_argument() -> CResult<()> {
        let dir = tempdir()?;
        let index = VectorIndex::open(dir.path(), 4)?;
        assert!(matches!(index.add("a", &[1.0, 2.0]), Err(Error::InvalidArgument(_))));
        assert!(matches!(index.search(&[1.0; 5], 3), Err(Error::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn one_vector_per_asset() -> CResult<()> {
        let dir = tempdir()?;
        let index = VectorIndex::open(dir.path(), 2)?;
        index.add("a", &[1.0, 0.0])?;
        index.add("a", &[0.0, 1.0])?;
        assert_eq!(index.len()?, 1);
        let results = index.search(&[0.0, 1.0], 1)?;
        assert!(results[0].1 < 1e-6);
        Ok(())
    }

    #[test]
    fn delete_then_compact() -> CResult<()> {
        let dir = tempdir()?;
        let index = VectorIndex::open(dir.path(), 2)?;
        index.add("a", &[1.0, 0.0])?;
        index.add("b", &[0.0, 1.0])?;

        assert!(index.delete("a")?);
        assert!(!index.delete("a")?);
        assert_eq!(index.len()?, 1);
        // Deleted assets never surface in results.
        let results = index.search(&[1.0, 0.0], 10)?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "b");

        index.compact()?;
        let results = index.search(&[0.0, 1.0], 10)?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "b");
        assert!(results[0].1 < 1e-6);
        Ok(())
    }

    #[test]
    fn persists_across_reopen() -> CResult<()> {
        let dir = tempdir()?;
        {
            let index = VectorIndex::open(dir.path(), 3)?;
            index.add("a", &[1.0, 2.0, 3.0])?;
            index.add("b", &[3.0, 2.0, 1.0])?;
        }
        let index = VectorIndex::open(dir.path(), 3)?;
        assert_eq!(index.len()?, 2);
        assert_eq!(index.search(&[1.0, 2.0, 3.0], 1)?[0].0, "a");
        Ok(())
    }

    #[test]
    fn missing_file_starts_empty() -> CResult<()> {
        let dir = tempdir()?;
        {
            let index = VectorIndex::open(dir.path(), 3)?;
            index.add("a", &[1.0, 2.0, 3.0])?;
        }
        fs::remove_file(dir.path().join(MAPPING_FILE))?;
        let index = VectorIndex::open(dir.path(), 3)?;
        assert_eq!(index.len()?, 0);
        Ok(())
    }

    #[test]
    fn dimension_change_starts_empty() -> CResult<()> {
        let dir = tempdir()?;
        {
            let index = VectorIndex::open(dir.path(), 3)?;
            index.add("a", &[1.0, 2.0, 3.0])?;
        }
        let index = VectorIndex::open(dir.path(), 4)?;
        assert_eq!(index.len()?, 0);
        Ok(())
    }
}
