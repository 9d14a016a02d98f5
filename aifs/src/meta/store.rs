use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::crypto::TrustedKey;
use crate::error::{CResult, Error};
use crate::meta::{
    metadata_from_json, metadata_to_json, now, AssetRecord, BranchHistoryEntry, BranchRecord,
    LineageEntry, NamespaceRecord, SnapshotRecord, TagRecord,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS assets (
    asset_id    TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    size        INTEGER NOT NULL,
    metadata    TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assets_created ON assets (created_at);

CREATE TABLE IF NOT EXISTS lineage (
    child_id          TEXT NOT NULL,
    parent_id         TEXT NOT NULL,
    transform_name    TEXT,
    transform_digest  TEXT,
    created_at        TEXT NOT NULL,
    PRIMARY KEY (child_id, parent_id)
);
CREATE INDEX IF NOT EXISTS idx_lineage_child ON lineage (child_id);
CREATE INDEX IF NOT EXISTS idx_lineage_parent ON lineage (parent_id);

CREATE TABLE IF NOT EXISTS snapshots (
    snapshot_id    TEXT PRIMARY KEY,
    namespace      TEXT NOT NULL,
    merkle_root    TEXT NOT NULL,
    metadata       TEXT,
    signature_hex  TEXT,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_namespace ON snapshots (namespace);

CREATE TABLE IF NOT EXISTS snapshot_assets (
    snapshot_id  TEXT NOT NULL,
    asset_id     TEXT NOT NULL,
    PRIMARY KEY (snapshot_id, asset_id)
);
CREATE INDEX IF NOT EXISTS idx_snapshot_assets_asset ON snapshot_assets (asset_id);

CREATE TABLE IF NOT EXISTS namespaces (
    namespace_id  TEXT PRIMARY KEY,
    name          TEXT UNIQUE NOT NULL,
    description   TEXT,
    metadata      TEXT,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS branches (
    namespace    TEXT NOT NULL,
    branch_name  TEXT NOT NULL,
    snapshot_id  TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    metadata     TEXT,
    PRIMARY KEY (namespace, branch_name)
);

CREATE TABLE IF NOT EXISTS branch_history (
    namespace        TEXT NOT NULL,
    branch_name      TEXT NOT NULL,
    old_snapshot_id  TEXT,
    new_snapshot_id  TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_branch_history ON branch_history (namespace, branch_name);

CREATE TABLE IF NOT EXISTS tags (
    namespace    TEXT NOT NULL,
    tag_name     TEXT NOT NULL,
    snapshot_id  TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    metadata     TEXT,
    PRIMARY KEY (namespace, tag_name)
);

CREATE TABLE IF NOT EXISTS namespace_keys (
    namespace         TEXT PRIMARY KEY,
    public_key_hex    TEXT NOT NULL,
    wrapped_seed_hex  TEXT NOT NULL,
    wrap_nonce_hex    TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    expires_at        INTEGER
);

CREATE TABLE IF NOT EXISTS trusted_keys (
    key_id          TEXT PRIMARY KEY,
    public_key_hex  TEXT NOT NULL,
    namespace       TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
    transaction_id  TEXT PRIMARY KEY,
    state           TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    committed_at    TEXT,
    metadata        TEXT
);

CREATE TABLE IF NOT EXISTS transaction_assets (
    transaction_id  TEXT NOT NULL,
    asset_id        TEXT NOT NULL,
    PRIMARY KEY (transaction_id, asset_id)
);

CREATE TABLE IF NOT EXISTS transaction_dependencies (
    transaction_id   TEXT NOT NULL,
    parent_asset_id  TEXT NOT NULL,
    PRIMARY KEY (transaction_id, parent_asset_id)
);

CREATE TABLE IF NOT EXISTS asset_visibility (
    asset_id        TEXT PRIMARY KEY,
    visible         INTEGER NOT NULL DEFAULT 0,
    transaction_id  TEXT,
    committed_at    TEXT
);
CREATE INDEX IF NOT EXISTS idx_visibility ON asset_visibility (visible, committed_at);
";

/// A persisted namespace signing key: public part in the clear, the seed
/// wrapped under the KMS master key.
#[derive(Clone, Debug)]
pub(crate) struct NamespaceKeyRow {
    pub namespace: String,
    pub public_key_hex: String,
    pub wrapped_seed_hex: String,
    pub wrap_nonce_hex: String,
    pub expires_at: Option<i64>,
}

/// The metadata store. One SQLite connection in WAL mode behind a mutex;
/// multi-row writes run inside a local transaction that fully applies or
/// fully reverts.
pub struct MetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetadataStore {
    pub fn open(path: impl AsRef<Path>) -> CResult<Self> {
        if let Some(dir) = path.as_ref().parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(MetadataStore { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Shared connection handle. The transaction manager is the only other
    /// writer, and it owns the `transactions*` and `asset_visibility`
    /// tables exclusively.
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    // ---- assets ----

    pub fn add_asset(
        &self,
        asset_id: &str,
        kind: crate::codec::AssetKind,
        size: u64,
        metadata: &HashMap<String, String>,
    ) -> CResult<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO assets (asset_id, kind, size, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![asset_id, kind.as_str(), size as i64, metadata_to_json(metadata)?, now()],
        )?;
        Ok(())
    }

    pub fn get_asset(&self, asset_id: &str) -> CResult<Option<AssetRecord>> {
        let conn = self.conn.lock()?;
        let row = conn
            .query_row(
                "SELECT asset_id, kind, size, metadata, created_at FROM assets WHERE asset_id = ?1",
                params![asset_id],
                Self::asset_row,
            )
            .optional()?;
        row.map(Self::asset_from_row).transpose()
    }

    pub fn list_assets(&self, limit: u32, offset: u32) -> CResult<Vec<AssetRecord>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT asset_id, kind, size, metadata, created_at FROM assets
             ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset], Self::asset_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(Self::asset_from_row).collect()
    }

    pub fn asset_count(&self) -> CResult<u64> {
        let conn = self.conn.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM assets", [], |row| row.get::<_, i64>(0))? as u64)
    }

    /// Removes the asset row and every lineage edge touching it.
    pub fn delete_asset(&self, asset_id: &str) -> CResult<()> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM assets WHERE asset_id = ?1", params![asset_id])?;
        tx.execute(
            "DELETE FROM lineage WHERE child_id = ?1 OR parent_id = ?1",
            params![asset_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn asset_row(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<(String, String, i64, Option<String>, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn asset_from_row(
        (asset_id, kind, size, metadata, created_at): (String, String, i64, Option<String>, String),
    ) -> CResult<AssetRecord> {
        Ok(AssetRecord {
            asset_id,
            kind: kind.parse()?,
            size: size as u64,
            metadata: metadata_from_json(metadata),
            created_at,
        })
    }

    // ---- lineage ----

    pub fn add_lineage(
        &self,
        child_id: &str,
        parent_id: &str,
        transform_name: Option<&str>,
        transform_digest: Option<&str>,
    ) -> CResult<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO lineage
             (child_id, parent_id, transform_name, transform_digest, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![child_id, parent_id, transform_name, transform_digest, now()],
        )?;
        Ok(())
    }

    pub fn get_parents(&self, asset_id: &str) -> CResult<Vec<LineageEntry>> {
        self.lineage_query(
            "SELECT a.asset_id, a.kind, a.size, a.metadata, a.created_at,
                    l.transform_name, l.transform_digest
             FROM assets a JOIN lineage l ON a.asset_id = l.parent_id
             WHERE l.child_id = ?1 ORDER BY a.asset_id",
            asset_id,
        )
    }

    pub fn get_children(&self, asset_id: &str) -> CResult<Vec<LineageEntry>> {
        self.lineage_query(
            "SELECT a.asset_id, a.kind, a.size, a.metadata, a.created_at,
                    l.transform_name, l.transform_digest
             FROM assets a JOIN lineage l ON a.asset_id = l.child_id
             WHERE l.parent_id = ?1 ORDER BY a.asset_id",
            asset_id,
        )
    }

    fn lineage_query(&self, sql: &str, asset_id: &str) -> CResult<Vec<LineageEntry>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![asset_id], |row| {
                Ok((
                    (
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ),
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(asset, transform_name, transform_digest)| {
                Ok(LineageEntry {
                    asset: Self::asset_from_row(asset)?,
                    transform_name,
                    transform_digest,
                })
            })
            .collect()
    }

    // ---- snapshots ----

    /// Persists a snapshot and its member rows atomically. Re-creating an
    /// identical snapshot (same derived ID) is a no-op.
    pub fn create_snapshot(&self, record: &SnapshotRecord) -> CResult<()> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO snapshots
             (snapshot_id, namespace, merkle_root, metadata, signature_hex, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.snapshot_id,
                record.namespace,
                record.merkle_root,
                metadata_to_json(&record.metadata)?,
                record.signature_hex,
                record.created_at
            ],
        )?;
        for asset_id in &record.asset_ids {
            tx.execute(
                "INSERT OR IGNORE INTO snapshot_assets (snapshot_id, asset_id) VALUES (?1, ?2)",
                params![record.snapshot_id, asset_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> CResult<Option<SnapshotRecord>> {
        let conn = self.conn.lock()?;
        let row = conn
            .query_row(
                "SELECT snapshot_id, namespace, merkle_root, metadata, signature_hex, created_at
                 FROM snapshots WHERE snapshot_id = ?1",
                params![snapshot_id],
                Self::snapshot_row,
            )
            .optional()?;
        let Some(mut record) = row else { return Ok(None) };
        record.asset_ids = Self::snapshot_members(&conn, &record.snapshot_id)?;
        Ok(Some(record))
    }

    pub fn list_snapshots(
        &self,
        namespace: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> CResult<Vec<SnapshotRecord>> {
        let conn = self.conn.lock()?;
        let mut records = match namespace {
            Some(namespace) => {
                let mut stmt = conn.prepare(
                    "SELECT snapshot_id, namespace, merkle_root, metadata, signature_hex, created_at
                     FROM snapshots WHERE namespace = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(params![namespace, limit, offset], Self::snapshot_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT snapshot_id, namespace, merkle_root, metadata, signature_hex, created_at
                     FROM snapshots ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt.query_map(params![limit, offset], Self::snapshot_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        for record in &mut records {
            record.asset_ids = Self::snapshot_members(&conn, &record.snapshot_id)?;
        }
        Ok(records)
    }

    pub fn snapshot_count(&self) -> CResult<u64> {
        let conn = self.conn.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get::<_, i64>(0))? as u64)
    }

    /// True when any snapshot includes the asset.
    pub fn snapshot_references_asset(&self, asset_id: &str) -> CResult<bool> {
        let conn = self.conn.lock()?;
        Ok(conn
            .query_row(
                "SELECT 1 FROM snapshot_assets WHERE asset_id = ?1 LIMIT 1",
                params![asset_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    /// Overwrites a snapshot's stored signature (used by re-signing and by
    /// tamper tests).
    pub fn set_snapshot_signature(&self, snapshot_id: &str, signature_hex: Option<&str>) -> CResult<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "UPDATE snapshots SET signature_hex = ?2 WHERE snapshot_id = ?1",
            params![snapshot_id, signature_hex],
        )?;
        Ok(())
    }

    fn snapshot_members(conn: &Connection, snapshot_id: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT asset_id FROM snapshot_assets WHERE snapshot_id = ?1 ORDER BY asset_id",
        )?;
        let result = stmt.query_map(params![snapshot_id], |row| row.get(0))?.collect();
        result
    }

    fn snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRecord> {
        Ok(SnapshotRecord {
            snapshot_id: row.get(0)?,
            namespace: row.get(1)?,
            merkle_root: row.get(2)?,
            metadata: metadata_from_json(row.get(3)?),
            signature_hex: row.get(4)?,
            created_at: row.get(5)?,
            asset_ids: Vec::new(),
        })
    }

    // ---- namespaces ----

    /// Creates a namespace; a duplicate name is AlreadyExists.
    pub fn create_namespace(
        &self,
        name: &str,
        description: &str,
        metadata: &HashMap<String, String>,
    ) -> CResult<NamespaceRecord> {
        let conn = self.conn.lock()?;
        let created_at = now();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO namespaces (namespace_id, name, description, metadata, created_at)
             VALUES (?1, ?1, ?2, ?3, ?4)",
            params![name, description, metadata_to_json(metadata)?, created_at],
        )?;
        if inserted == 0 {
            return Err(Error::AlreadyExists(format!("namespace {:?}", name)));
        }
        Ok(NamespaceRecord {
            namespace_id: name.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            metadata: metadata.clone(),
            created_at,
        })
    }

    /// Creates the namespace if absent, otherwise returns the existing row.
    pub fn ensure_namespace(&self, name: &str) -> CResult<NamespaceRecord> {
        match self.create_namespace(name, "", &HashMap::new()) {
            Ok(record) => Ok(record),
            Err(Error::AlreadyExists(_)) => self
                .get_namespace(name)?
                .ok_or_else(|| Error::Internal(format!("namespace {:?} vanished", name))),
            Err(err) => Err(err),
        }
    }

    pub fn get_namespace(&self, name: &str) -> CResult<Option<NamespaceRecord>> {
        let conn = self.conn.lock()?;
        Ok(conn
            .query_row(
                "SELECT namespace_id, name, description, metadata, created_at
                 FROM namespaces WHERE name = ?1",
                params![name],
                |row| {
                    Ok(NamespaceRecord {
                        namespace_id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        metadata: metadata_from_json(row.get(3)?),
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn list_namespaces(&self) -> CResult<Vec<NamespaceRecord>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT namespace_id, name, description, metadata, created_at
             FROM namespaces ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(NamespaceRecord {
                namespace_id: row.get(0)?,
                name: row.get(1)?,
                description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                metadata: metadata_from_json(row.get(3)?),
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- branches ----

    /// Creates or moves a branch head. The target snapshot must exist; the
    /// move and its history row commit atomically.
    pub fn upsert_branch(
        &self,
        namespace: &str,
        branch_name: &str,
        snapshot_id: &str,
        metadata: &HashMap<String, String>,
    ) -> CResult<BranchRecord> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;

        let snapshot_exists = tx
            .query_row(
                "SELECT 1 FROM snapshots WHERE snapshot_id = ?1",
                params![snapshot_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !snapshot_exists {
            return Err(Error::FailedPrecondition(format!(
                "branch target snapshot {} does not exist",
                snapshot_id
            )));
        }

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT snapshot_id, created_at FROM branches
                 WHERE namespace = ?1 AND branch_name = ?2",
                params![namespace, branch_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let updated_at = now();
        let (created_at, old_snapshot_id) = match existing {
            Some((old_snapshot, created_at)) => {
                tx.execute(
                    "UPDATE branches SET snapshot_id = ?3, updated_at = ?4, metadata = ?5
                     WHERE namespace = ?1 AND branch_name = ?2",
                    params![namespace, branch_name, snapshot_id, updated_at, metadata_to_json(metadata)?],
                )?;
                (created_at, Some(old_snapshot))
            }
            None => {
                tx.execute(
                    "INSERT INTO branches
                     (namespace, branch_name, snapshot_id, created_at, updated_at, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
                    params![namespace, branch_name, snapshot_id, updated_at, metadata_to_json(metadata)?],
                )?;
                (updated_at.clone(), None)
            }
        };
        tx.execute(
            "INSERT INTO branch_history
             (namespace, branch_name, old_snapshot_id, new_snapshot_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![namespace, branch_name, old_snapshot_id, snapshot_id, updated_at],
        )?;
        tx.commit()?;

        Ok(BranchRecord {
            namespace: namespace.to_string(),
            branch_name: branch_name.to_string(),
            snapshot_id: snapshot_id.to_string(),
            created_at,
            updated_at,
            metadata: metadata.clone(),
        })
    }

    pub fn get_branch(&self, namespace: &str, branch_name: &str) -> CResult<Option<BranchRecord>> {
        let conn = self.conn.lock()?;
        Ok(conn
            .query_row(
                "SELECT namespace, branch_name, snapshot_id, created_at, updated_at, metadata
                 FROM branches WHERE namespace = ?1 AND branch_name = ?2",
                params![namespace, branch_name],
                Self::branch_row,
            )
            .optional()?)
    }

    pub fn list_branches(&self, namespace: &str) -> CResult<Vec<BranchRecord>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT namespace, branch_name, snapshot_id, created_at, updated_at, metadata
             FROM branches WHERE namespace = ?1 ORDER BY branch_name",
        )?;
        let rows = stmt.query_map(params![namespace], Self::branch_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Branch audit trail, newest first.
    pub fn branch_history(
        &self,
        namespace: &str,
        branch_name: &str,
        limit: u32,
        offset: u32,
    ) -> CResult<Vec<BranchHistoryEntry>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT namespace, branch_name, old_snapshot_id, new_snapshot_id, updated_at
             FROM branch_history WHERE namespace = ?1 AND branch_name = ?2
             ORDER BY updated_at DESC, rowid DESC LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(params![namespace, branch_name, limit, offset], |row| {
            Ok(BranchHistoryEntry {
                namespace: row.get(0)?,
                branch_name: row.get(1)?,
                old_snapshot_id: row.get(2)?,
                new_snapshot_id: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_branch(&self, namespace: &str, branch_name: &str) -> CResult<bool> {
        let conn = self.conn.lock()?;
        let deleted = conn.execute(
            "DELETE FROM branches WHERE namespace = ?1 AND branch_name = ?2",
            params![namespace, branch_name],
        )?;
        Ok(deleted > 0)
    }

    fn branch_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BranchRecord> {
        Ok(BranchRecord {
            namespace: row.get(0)?,
            branch_name: row.get(1)?,
            snapshot_id: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            metadata: metadata_from_json(row.get(5)?),
        })
    }

    // ---- tags ----

    /// Creates a tag. Tags are write-once: re-creating with the identical
    /// target is an idempotent success, any other target is AlreadyExists.
    pub fn create_tag(
        &self,
        namespace: &str,
        tag_name: &str,
        snapshot_id: &str,
        metadata: &HashMap<String, String>,
    ) -> CResult<TagRecord> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;

        let snapshot_exists = tx
            .query_row(
                "SELECT 1 FROM snapshots WHERE snapshot_id = ?1",
                params![snapshot_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !snapshot_exists {
            return Err(Error::FailedPrecondition(format!(
                "tag target snapshot {} does not exist",
                snapshot_id
            )));
        }

        let existing = tx
            .query_row(
                "SELECT namespace, tag_name, snapshot_id, created_at, metadata
                 FROM tags WHERE namespace = ?1 AND tag_name = ?2",
                params![namespace, tag_name],
                Self::tag_row,
            )
            .optional()?;
        if let Some(existing) = existing {
            return if existing.snapshot_id == snapshot_id {
                Ok(existing)
            } else {
                Err(Error::AlreadyExists(format!(
                    "tag {:?} in namespace {:?} already points at {}",
                    tag_name, namespace, existing.snapshot_id
                )))
            };
        }

        let created_at = now();
        tx.execute(
            "INSERT INTO tags (namespace, tag_name, snapshot_id, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![namespace, tag_name, snapshot_id, created_at, metadata_to_json(metadata)?],
        )?;
        tx.commit()?;

        Ok(TagRecord {
            namespace: namespace.to_string(),
            tag_name: tag_name.to_string(),
            snapshot_id: snapshot_id.to_string(),
            created_at,
            metadata: metadata.clone(),
        })
    }

    pub fn get_tag(&self, namespace: &str, tag_name: &str) -> CResult<Option<TagRecord>> {
        let conn = self.conn.lock()?;
        Ok(conn
            .query_row(
                "SELECT namespace, tag_name, snapshot_id, created_at, metadata
                 FROM tags WHERE namespace = ?1 AND tag_name = ?2",
                params![namespace, tag_name],
                Self::tag_row,
            )
            .optional()?)
    }

    pub fn list_tags(&self, namespace: &str) -> CResult<Vec<TagRecord>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT namespace, tag_name, snapshot_id, created_at, metadata
             FROM tags WHERE namespace = ?1 ORDER BY tag_name",
        )?;
        let rows = stmt.query_map(params![namespace], Self::tag_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_tag(&self, namespace: &str, tag_name: &str) -> CResult<bool> {
        let conn = self.conn.lock()?;
        let deleted = conn.execute(
            "DELETE FROM tags WHERE namespace = ?1 AND tag_name = ?2",
            params![namespace, tag_name],
        )?;
        Ok(deleted > 0)
    }

    fn tag_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TagRecord> {
        Ok(TagRecord {
            namespace: row.get(0)?,
            tag_name: row.get(1)?,
            snapshot_id: row.get(2)?,
            created_at: row.get(3)?,
            metadata: metadata_from_json(row.get(4)?),
        })
    }

    // ---- key persistence ----

    pub(crate) fn save_namespace_key(&self, key: &NamespaceKeyRow) -> CResult<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO namespace_keys
             (namespace, public_key_hex, wrapped_seed_hex, wrap_nonce_hex, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key.namespace,
                key.public_key_hex,
                key.wrapped_seed_hex,
                key.wrap_nonce_hex,
                now(),
                key.expires_at
            ],
        )?;
        Ok(())
    }

    pub(crate) fn load_namespace_keys(&self) -> CResult<Vec<NamespaceKeyRow>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT namespace, public_key_hex, wrapped_seed_hex, wrap_nonce_hex, expires_at
             FROM namespace_keys",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(NamespaceKeyRow {
                namespace: row.get(0)?,
                public_key_hex: row.get(1)?,
                wrapped_seed_hex: row.get(2)?,
                wrap_nonce_hex: row.get(3)?,
                expires_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub(crate) fn save_trusted_key(&self, key: &TrustedKey) -> CResult<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO trusted_keys (key_id, public_key_hex, namespace, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key.key_id, key.public_key_hex, key.namespace, now()],
        )?;
        Ok(())
    }

    pub(crate) fn load_trusted_keys(&self) -> CResult<Vec<TrustedKey>> {
        let conn = self.conn.lock()?;
        let mut stmt =
            conn.prepare("SELECT key_id, public_key_hex, namespace FROM trusted_keys")?;
        let rows = stmt.query_map([], |row| {
            Ok(TrustedKey {
                key_id: row.get(0)?,
                public_key_hex: row.get(1)?,
                namespace: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AssetKind;
    use crate::meta::snapshot_id;
    use tempfile::tempdir;

    fn setup() -> CResult<(tempfile::TempDir, MetadataStore)> {
        let dir = tempdir()?;
        let store = MetadataStore::open(dir.path().join("metadata.db"))?;
        Ok((dir, store))
    }

    fn fake_id(tag: &str) -> String {
        blake3::hash(tag.as_bytes()).to_hex().to_string()
    }

    fn snapshot(store: &MetadataStore, namespace: &str, members: &[String]) -> CResult<String> {
        let created_at = now();
        let root = crate::merkle::MerkleTree::new(members).root();
        let id = snapshot_id(&root, &created_at);
        store.create_snapshot(&SnapshotRecord {
            snapshot_id: id.clone(),
            namespace: namespace.to_string(),
            merkle_root: root,
            metadata: HashMap::new(),
            signature_hex: None,
            created_at,
            asset_ids: members.to_vec(),
        })?;
        Ok(id)
    }

    #[test]
    fn asset_roundtrip() -> CResult<()> {
        let (_dir, store) = setup()?;
        let id = fake_id("a");
        let mut metadata = HashMap::new();
        metadata.insert("origin".to_string(), "unit-test".to_string());

        store.add_asset(&id, AssetKind::Blob, 5, &metadata)?;
        let record = store.get_asset(&id)?.expect("asset present");
        assert_eq!(record.asset_id, id);
        assert_eq!(record.kind, AssetKind::Blob);
        assert_eq!(record.size, 5);
        assert_eq!(record.metadata, metadata);

        assert!(store.get_asset(&fake_id("missing"))?.is_none());
        assert_eq!(store.asset_count()?, 1);

        store.delete_asset(&id)?;
        assert!(store.get_asset(&id)?.is_none());
        Ok(())
    }

    #[test]
    fn listing_is_paginated_newest_first() -> CResult<()> {
        let (_dir, store) = setup()?;
        for i in 0..5 {
            store.add_asset(&fake_id(&format!("a{}", i)), AssetKind::Blob, i, &HashMap::new())?;
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let page = store.list_assets(2, 0)?;
        assert_eq!(page.len(), 2);
        assert!(page[0].created_at > page[1].created_at);
        assert_eq!(store.list_assets(10, 4)?.len(), 1);
        Ok(())
    }

    #[test]
    fn lineage_both_directions() -> CResult<()> {
        let (_dir, store) = setup()?;
        let parent = fake_id("parent");
        let child = fake_id("child");
        store.add_asset(&parent, AssetKind::Blob, 1, &HashMap::new())?;
        store.add_asset(&child, AssetKind::Blob, 1, &HashMap::new())?;
        store.add_lineage(&child, &parent, Some("resize"), Some("sha256:abc"))?;

        let parents = store.get_parents(&child)?;
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].asset.asset_id, parent);
        assert_eq!(parents[0].transform_name.as_deref(), Some("resize"));

        let children = store.get_children(&parent)?;
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].asset.asset_id, child);

        // Deleting the child removes its edges.
        store.delete_asset(&child)?;
        assert!(store.get_children(&parent)?.is_empty());
        Ok(())
    }

    #[test]
    fn snapshot_roundtrip_and_reference_check() -> CResult<()> {
        let (_dir, store) = setup()?;
        let members = vec![fake_id("m1"), fake_id("m2")];
        let id = snapshot(&store, "main", &members)?;

        let record = store.get_snapshot(&id)?.expect("snapshot present");
        assert_eq!(record.namespace, "main");
        let mut sorted = members.clone();
        sorted.sort();
        assert_eq!(record.asset_ids, sorted);

        assert!(store.snapshot_references_asset(&members[0])?);
        assert!(!store.snapshot_references_asset(&fake_id("free"))?);
        assert_eq!(store.list_snapshots(Some("main"), 10, 0)?.len(), 1);
        assert!(store.list_snapshots(Some("other"), 10, 0)?.is_empty());
        Ok(())
    }

    #[test]
    fn namespace_name_is_unique() -> CResult<()> {
        let (_dir, store) = setup()?;
        store.create_namespace("main", "primary", &HashMap::new())?;
        assert!(matches!(
            store.create_namespace("main", "again", &HashMap::new()),
            Err(Error::AlreadyExists(_))
        ));
        // ensure_namespace tolerates both cases.
        assert_eq!(store.ensure_namespace("main")?.description, "primary");
        assert_eq!(store.ensure_namespace("fresh")?.name, "fresh");
        assert_eq!(store.list_namespaces()?.len(), 2);
        Ok(())
    }

    #[test]
    fn branch_update_keeps_history() -> CResult<()> {
        let (_dir, store) = setup()?;
        let s1 = snapshot(&store, "main", &[fake_id("a")])?;
        std::thread::sleep(std::time::Duration::from_millis(2));
        let s2 = snapshot(&store, "main", &[fake_id("b")])?;

        let branch = store.upsert_branch("main", "main", &s1, &HashMap::new())?;
        assert_eq!(branch.snapshot_id, s1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let branch = store.upsert_branch("main", "main", &s2, &HashMap::new())?;
        assert_eq!(branch.snapshot_id, s2);
        assert!(branch.created_at < branch.updated_at);

        let history = store.branch_history("main", "main", 10, 0)?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old_snapshot_id.as_deref(), Some(s1.as_str()));
        assert_eq!(history[0].new_snapshot_id, s2);
        assert_eq!(history[1].old_snapshot_id, None);
        assert_eq!(history[1].new_snapshot_id, s1);

        assert!(store.delete_branch("main", "main")?);
        assert!(!store.delete_branch("main", "main")?);
        // History survives branch deletion.
        assert_eq!(store.branch_history("main", "main", 10, 0)?.len(), 2);
        Ok(())
    }

    #[test]
    fn branch_requires_existing_snapshot() -> CResult<()> {
        let (_dir, store) = setup()?;
        assert!(matches!(
            store.upsert_branch("main", "main", &fake_id("nope"), &HashMap::new()),
            Err(Error::FailedPrecondition(_))
        ));
        Ok(())
    }

    #[test]
    fn tags_are_write_once() -> CResult<()> {
        let (_dir, store) = setup()?;
        let s1 = snapshot(&store, "main", &[fake_id("a")])?;
        std::thread::sleep(std::time::Duration::from_millis(2));
        let s2 = snapshot(&store, "main", &[fake_id("b")])?;

        let tag = store.create_tag("main", "v1.0.0", &s1, &HashMap::new())?;
        assert_eq!(tag.snapshot_id, s1);
        // Identical target: idempotent success.
        let again = store.create_tag("main", "v1.0.0", &s1, &HashMap::new())?;
        assert_eq!(again.created_at, tag.created_at);
        // Different target: refused.
        assert!(matches!(
            store.create_tag("main", "v1.0.0", &s2, &HashMap::new()),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(store.get_tag("main", "v1.0.0")?.expect("tag").snapshot_id, s1);
        assert_eq!(store.list_tags("main")?.len(), 1);
        Ok(())
    }

    #[test]
    fn key_rows_roundtrip() -> CResult<()> {
        let (_dir, store) = setup()?;
        store.save_namespace_key(&NamespaceKeyRow {
            namespace: "main".to_string(),
            public_key_hex: "aa".to_string(),
            wrapped_seed_hex: "bb".to_string(),
            wrap_nonce_hex: "cc".to_string(),
            expires_at: None,
        })?;
        let keys = store.load_namespace_keys()?;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].namespace, "main");

        store.save_trusted_key(&TrustedKey {
            key_id: "ci".to_string(),
            public_key_hex: "dd".to_string(),
            namespace: None,
        })?;
        assert_eq!(store.load_trusted_keys()?.len(), 1);
        Ok(())
    }
}
