//! End-to-end scenarios through the public engine API.

use std::collections::HashMap;
use std::sync::Arc;

use aifs::asset::AssetManager;
use aifs::codec::AssetKind;
use aifs::config::Config;
use aifs::error::{CResult, Error};
use aifs::meta::ParentRef;

fn config(root: &std::path::Path, strong_causality: bool) -> Config {
    let mut config = Config::default();
    config.root_dir = root.to_path_buf();
    config.embedding_dim = 8;
    config.enable_strong_causality = strong_causality;
    config
}

fn fake_id(tag: &str) -> String {
    blake3::hash(tag.as_bytes()).to_hex().to_string()
}

#[test]
fn basic_round_trip() -> CResult<()> {
    let dir = tempfile::tempdir()?;
    let engine = AssetManager::open(config(dir.path(), false))?;

    let id_h = engine.put_asset(b"hello", AssetKind::Blob, None, None, &[], None)?;
    let asset = engine.get_asset(&id_h)?.expect("stored asset is readable");
    assert_eq!(asset.data, b"hello");

    assert!(engine.delete_asset(&id_h, false)?);
    assert!(engine.get_asset(&id_h)?.is_none());
    Ok(())
}

#[test]
fn strong_causality_scenario() -> CResult<()> {
    let dir = tempfile::tempdir()?;
    let engine = AssetManager::open(config(dir.path(), true))?;

    let t1 = engine.begin_transaction()?;
    let parent = engine.put_asset(b"parent", AssetKind::Blob, None, None, &[], Some(&t1))?;

    let t2 = engine.begin_transaction()?;
    let child = engine.put_asset(
        b"child",
        AssetKind::Blob,
        None,
        None,
        &[ParentRef { asset_id: parent.clone(), transform_name: Some("derive".into()), transform_digest: None }],
        Some(&t2),
    )?;

    assert!(!engine.is_visible(&parent)?);
    assert!(!engine.is_visible(&child)?);

    assert!(!engine.commit_transaction(&t2)?);
    assert!(engine.commit_transaction(&t1)?);
    assert!(engine.commit_transaction(&t2)?);

    assert!(engine.is_visible(&parent)?);
    assert!(engine.is_visible(&child)?);

    // A reader that sees the child can follow lineage to a visible parent.
    let child_asset = engine.get_asset(&child)?.expect("child visible after commit");
    let parent_entry = &child_asset.parents[0];
    assert_eq!(parent_entry.asset.asset_id, parent);
    assert!(engine.is_visible(&parent_entry.asset.asset_id)?);
    Ok(())
}

#[test]
fn snapshot_identity_is_reproducible() -> CResult<()> {
    let dir = tempfile::tempdir()?;
    let engine = AssetManager::open(config(dir.path(), false))?;

    let ids = vec![fake_id("id_a"), fake_id("id_b"), fake_id("id_c")];
    let created_at = "2024-01-01T00:00:00Z".to_string();

    let first = engine.create_snapshot("default", &ids, None, Some(created_at.clone()))?;
    let second = engine.create_snapshot("default", &ids, None, Some(created_at))?;
    assert_eq!(first.snapshot_id, second.snapshot_id);
    assert_eq!(first.merkle_root, second.merkle_root);

    // Member order does not matter.
    let mut reversed = ids.clone();
    reversed.reverse();
    let third = engine.create_snapshot("default", &reversed, None, Some("2024-01-01T00:00:00Z".to_string()))?;
    assert_eq!(third.snapshot_id, first.snapshot_id);
    Ok(())
}

#[test]
fn branch_update_scenario() -> CResult<()> {
    let dir = tempfile::tempdir()?;
    let engine = AssetManager::open(config(dir.path(), false))?;

    let s1 = engine.create_snapshot("default", &[fake_id("a")], None, None)?;
    std::thread::sleep(std::time::Duration::from_millis(2));
    let s2 = engine.create_snapshot("default", &[fake_id("b")], None, None)?;

    engine.update_branch("default", "main", &s1.snapshot_id, None)?;
    std::thread::sleep(std::time::Duration::from_millis(2));
    engine.update_branch("default", "main", &s2.snapshot_id, None)?;

    assert_eq!(
        engine.get_branch("default", "main")?.expect("branch exists").snapshot_id,
        s2.snapshot_id
    );
    let history = engine.branch_history("default", "main", 10, 0)?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].old_snapshot_id.as_deref(), Some(s1.snapshot_id.as_str()));
    assert_eq!(history[0].new_snapshot_id, s2.snapshot_id);
    Ok(())
}

#[test]
fn tag_immutability_scenario() -> CResult<()> {
    let dir = tempfile::tempdir()?;
    let engine = AssetManager::open(config(dir.path(), false))?;

    let s1 = engine.create_snapshot("default", &[fake_id("a")], None, None)?;
    std::thread::sleep(std::time::Duration::from_millis(2));
    let s2 = engine.create_snapshot("default", &[fake_id("b")], None, None)?;

    engine.create_tag("default", "v1.0.0", &s1.snapshot_id, None)?;
    assert!(matches!(
        engine.create_tag("default", "v1.0.0", &s2.snapshot_id, None),
        Err(Error::AlreadyExists(_))
    ));
    assert_eq!(
        engine.get_tag("default", "v1.0.0")?.expect("tag exists").snapshot_id,
        s1.snapshot_id
    );
    Ok(())
}

#[test]
fn typed_assets_round_trip_through_the_engine() -> CResult<()> {
    use aifs::codec::embedding::{EmbeddingCodec, EmbeddingValue, Metric};
    use aifs::codec::Codec;

    let dir = tempfile::tempdir()?;
    let engine = AssetManager::open(config(dir.path(), false))?;

    let value = EmbeddingValue {
        model: "all-MiniLM-L6-v2".to_string(),
        metric: Metric::Cosine,
        vector: vec![0.5; 8],
        metadata: serde_json::json!({"source": "integration"}),
    };
    let encoded = EmbeddingCodec::encode(&value)?;
    let id = engine.put_asset(
        &encoded,
        AssetKind::Embedding,
        Some(&value.vector),
        Some(HashMap::from([("origin".to_string(), "test".to_string())])),
        &[],
        None,
    )?;

    let asset = engine.get_asset(&id)?.expect("embedding asset readable");
    assert_eq!(asset.record.kind, AssetKind::Embedding);
    assert_eq!(EmbeddingCodec::decode(&asset.data)?, value);

    let hits = engine.vector_search(&vec![0.5; 8], 1)?;
    assert_eq!(hits[0].asset.asset_id, id);
    Ok(())
}

#[test]
fn concurrent_writers_preserve_dependency_order() -> CResult<()> {
    let dir = tempfile::tempdir()?;
    let engine = Arc::new(AssetManager::open(config(dir.path(), true))?);

    let t1 = engine.begin_transaction()?;
    let parent = engine.put_asset(b"slow parent", AssetKind::Blob, None, None, &[], Some(&t1))?;

    let t2 = engine.begin_transaction()?;
    engine.put_asset(
        b"dependent child",
        AssetKind::Blob,
        None,
        None,
        &[ParentRef { asset_id: parent.clone(), transform_name: None, transform_digest: None }],
        Some(&t2),
    )?;

    let waiter = {
        let engine = engine.clone();
        let t2 = t2.clone();
        std::thread::spawn(move || -> CResult<bool> {
            if !engine.wait_for_dependencies(&t2, std::time::Duration::from_secs(5))? {
                return Ok(false);
            }
            engine.commit_transaction(&t2)
        })
    };

    std::thread::sleep(std::time::Duration::from_millis(100));
    assert!(engine.commit_transaction(&t1)?);
    assert!(waiter.join().expect("waiter thread")?);
    assert!(engine.is_visible(&parent)?);
    Ok(())
}

#[test]
fn verified_listing_hides_unverifiable_snapshots() -> CResult<()> {
    let dir = tempfile::tempdir()?;
    let engine = AssetManager::open(config(dir.path(), false))?;

    engine.create_snapshot("default", &[fake_id("a")], None, None)?;
    let all = engine.list_snapshots(Some("default"), 10, 0)?;
    let verified = engine.list_verified_snapshots(Some("default"), 10, 0)?;
    assert_eq!(all.len(), 1);
    assert_eq!(verified.len(), 1);
    assert_eq!(all[0].snapshot_id, verified[0].snapshot_id);
    Ok(())
}
