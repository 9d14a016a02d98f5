//! Group-commit transactions with dependency-gated visibility.
//!
//! The visibility rule: an asset becomes readable to non-transactional
//! lookups only once every transaction it belongs to has COMMITTED and
//! every declared parent is itself visible. The commit path refuses to
//! advance while a parent is invisible, so a reader that observes a child
//! can follow lineage edges and find each parent already visible.
//!
//! State transitions are serialized under one mutex; visibility rows are
//! published inside a single database transaction so a transaction's asset
//! set appears atomically, with one shared `committed_at`. Readers never
//! take the state mutex — they consult `asset_visibility` directly.
//!
//! Two transactions that each declare the other's asset as a parent
//! deadlock by construction: commit of either returns false, and the engine
//! surfaces the condition to the caller instead of breaking the cycle.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::meta::now;

/// Transaction states. COMMITTED, ROLLED_BACK and FAILED are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Pending => "pending",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::RollingBack => "rolling_back",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Failed
        )
    }
}

impl std::str::FromStr for TransactionState {
    type Err = Error;

    fn from_str(s: &str) -> CResult<Self> {
        match s {
            "pending" => Ok(TransactionState::Pending),
            "committing" => Ok(TransactionState::Committing),
            "committed" => Ok(TransactionState::Committed),
            "rolling_back" => Ok(TransactionState::RollingBack),
            "rolled_back" => Ok(TransactionState::RolledBack),
            "failed" => Ok(TransactionState::Failed),
            other => Err(Error::Internal(format!("unknown transaction state {:?}", other))),
        }
    }
}

#[derive(Default)]
struct ActiveTransaction {
    assets: HashSet<String>,
    dependencies: HashSet<String>,
}

#[derive(Default)]
struct ManagerState {
    /// PENDING transactions only.
    active: HashMap<String, ActiveTransaction>,
    /// asset_id -> the live transaction it is enrolled in.
    asset_owner: HashMap<String, String>,
}

/// The transaction manager. Holds exclusive write access to the
/// `transactions*` and `asset_visibility` tables.
pub struct TransactionManager {
    conn: Arc<Mutex<Connection>>,
    state: Mutex<ManagerState>,
}

impl TransactionManager {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        TransactionManager { conn, state: Mutex::new(ManagerState::default()) }
    }

    /// Begins a fresh PENDING transaction.
    pub fn begin(&self) -> CResult<String> {
        let transaction_id = uuid::Uuid::new_v4().to_string();
        let mut state = self.state.lock()?;
        {
            let conn = self.conn.lock()?;
            conn.execute(
                "INSERT INTO transactions (transaction_id, state, created_at) VALUES (?1, ?2, ?3)",
                params![transaction_id, TransactionState::Pending.as_str(), now()],
            )?;
        }
        state.active.insert(transaction_id.clone(), ActiveTransaction::default());
        log::debug!("began transaction {}", transaction_id);
        Ok(transaction_id)
    }

    /// Enrolls an asset. Only legal while PENDING, and an asset can belong
    /// to at most one live transaction.
    pub fn add_asset(&self, transaction_id: &str, asset_id: &str) -> CResult<()> {
        let mut state = self.state.lock()?;
        if !state.active.contains_key(transaction_id) {
            return Err(Error::NotFound(format!("pending transaction {}", transaction_id)));
        }
        if let Some(owner) = state.asset_owner.get(asset_id) {
            if owner != transaction_id {
                return Err(Error::FailedPrecondition(format!(
                    "asset {} is already enrolled in transaction {}",
                    asset_id, owner
                )));
            }
            return Ok(());
        }
        {
            let conn = self.conn.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO transaction_assets (transaction_id, asset_id) VALUES (?1, ?2)",
                params![transaction_id, asset_id],
            )?;
        }
        let txn = state
            .active
            .get_mut(transaction_id)
            .ok_or_else(|| Error::Internal("active set changed underfoot".to_string()))?;
        txn.assets.insert(asset_id.to_string());
        state.asset_owner.insert(asset_id.to_string(), transaction_id.to_string());
        Ok(())
    }

    /// Declares that this transaction's assets depend on a parent asset.
    /// Only legal while PENDING.
    pub fn add_dependency(&self, transaction_id: &str, parent_asset_id: &str) -> CResult<()> {
        let mut state = self.state.lock()?;
        let Some(txn) = state.active.get_mut(transaction_id) else {
            return Err(Error::NotFound(format!("pending transaction {}", transaction_id)));
        };
        {
            let conn = self.conn.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO transaction_dependencies (transaction_id, parent_asset_id)
                 VALUES (?1, ?2)",
                params![transaction_id, parent_asset_id],
            )?;
        }
        txn.dependencies.insert(parent_asset_id.to_string());
        Ok(())
    }

    /// True iff every declared parent is visible.
    pub fn dependencies_satisfied(&self, transaction_id: &str) -> CResult<bool> {
        let state = self.state.lock()?;
        let Some(txn) = state.active.get(transaction_id) else {
            return Err(Error::NotFound(format!("pending transaction {}", transaction_id)));
        };
        let dependencies: Vec<String> = txn.dependencies.iter().cloned().collect();
        drop(state);
        for parent in &dependencies {
            if !self.is_visible(parent)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Commits. Returns false (leaving the transaction PENDING) while any
    /// dependency is invisible. On success every enrolled asset becomes
    /// visible atomically, stamped with one `committed_at`.
    pub fn commit(&self, transaction_id: &str) -> CResult<bool> {
        let mut state = self.state.lock()?;
        let Some(txn) = state.active.get(transaction_id) else {
            return Err(Error::NotFound(format!("pending transaction {}", transaction_id)));
        };

        // Dependency gate, checked under the state lock so no concurrent
        // rollback can invalidate the answer between check and publish.
        let dependencies: Vec<String> = txn.dependencies.iter().cloned().collect();
        let assets: Vec<String> = txn.assets.iter().cloned().collect();
        for parent in &dependencies {
            if !self.is_visible(parent)? {
                log::debug!(
                    "commit of {} refused: parent {} is not visible",
                    transaction_id,
                    parent
                );
                return Ok(false);
            }
        }

        let result = self.publish(transaction_id, &assets);
        match result {
            Ok(()) => {
                for asset_id in &assets {
                    state.asset_owner.remove(asset_id);
                }
                state.active.remove(transaction_id);
                log::debug!("committed transaction {} ({} assets)", transaction_id, assets.len());
                Ok(true)
            }
            Err(err) => {
                // Leave visibility unchanged, mark the record FAILED.
                log::error!("commit of {} failed: {}", transaction_id, err);
                if let Ok(conn) = self.conn.lock() {
                    let _ = conn.execute(
                        "UPDATE transactions SET state = ?2 WHERE transaction_id = ?1",
                        params![transaction_id, TransactionState::Failed.as_str()],
                    );
                }
                for asset_id in &assets {
                    state.asset_owner.remove(asset_id);
                }
                state.active.remove(transaction_id);
                Err(err)
            }
        }
    }

    /// COMMITTING -> publish visibility -> COMMITTED, in one database
    /// transaction.
    fn publish(&self, transaction_id: &str, assets: &[String]) -> CResult<()> {
        let mut conn = self.conn.lock()?;
        let committed_at = now();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE transactions SET state = ?2, committed_at = ?3 WHERE transaction_id = ?1",
            params![transaction_id, TransactionState::Committing.as_str(), committed_at],
        )?;
        for asset_id in assets {
            tx.execute(
                "INSERT OR REPLACE INTO asset_visibility
                 (asset_id, visible, transaction_id, committed_at)
                 VALUES (?1, 1, ?2, ?3)",
                params![asset_id, transaction_id, committed_at],
            )?;
        }
        tx.execute(
            "UPDATE transactions SET state = ?2 WHERE transaction_id = ?1",
            params![transaction_id, TransactionState::Committed.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Rolls back a PENDING transaction, removing any visibility rows its
    /// assets may hold.
    pub fn rollback(&self, transaction_id: &str) -> CResult<bool> {
        let mut state = self.state.lock()?;
        let Some(txn) = state.active.get(transaction_id) else {
            return Err(Error::NotFound(format!("pending transaction {}", transaction_id)));
        };
        let assets: Vec<String> = txn.assets.iter().cloned().collect();

        {
            let mut conn = self.conn.lock()?;
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE transactions SET state = ?2 WHERE transaction_id = ?1",
                params![transaction_id, TransactionState::RollingBack.as_str()],
            )?;
            for asset_id in &assets {
                tx.execute("DELETE FROM asset_visibility WHERE asset_id = ?1", params![asset_id])?;
            }
            tx.execute(
                "UPDATE transactions SET state = ?2 WHERE transaction_id = ?1",
                params![transaction_id, TransactionState::RolledBack.as_str()],
            )?;
            tx.commit()?;
        }

        for asset_id in &assets {
            state.asset_owner.remove(asset_id);
        }
        state.active.remove(transaction_id);
        log::debug!("rolled back transaction {}", transaction_id);
        Ok(true)
    }

    /// Reader-path visibility check; takes no transaction-state lock.
    pub fn is_visible(&self, asset_id: &str) -> CResult<bool> {
        let conn = self.conn.lock()?;
        Ok(conn
            .query_row(
                "SELECT visible FROM asset_visibility WHERE asset_id = ?1",
                params![asset_id],
                |row| row.get::<_, bool>(0),
            )
            .optional()?
            .unwrap_or(false))
    }

    /// Marks an asset visible immediately, outside any transaction. Used
    /// when strong causality is disabled (bulk-load bootstrap).
    pub fn set_visible(&self, asset_id: &str) -> CResult<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO asset_visibility (asset_id, visible, transaction_id, committed_at)
             VALUES (?1, 1, NULL, ?2)",
            params![asset_id, now()],
        )?;
        Ok(())
    }

    /// Drops the visibility row (asset deletion).
    pub fn remove_visibility(&self, asset_id: &str) -> CResult<()> {
        let conn = self.conn.lock()?;
        conn.execute("DELETE FROM asset_visibility WHERE asset_id = ?1", params![asset_id])?;
        Ok(())
    }

    /// Visible asset IDs, most recently committed first.
    pub fn visible_assets(&self, limit: u32, offset: u32) -> CResult<Vec<String>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT asset_id FROM asset_visibility WHERE visible = 1
             ORDER BY committed_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Current state of a transaction, live or finished.
    pub fn state(&self, transaction_id: &str) -> CResult<Option<TransactionState>> {
        {
            let state = self.state.lock()?;
            if state.active.contains_key(transaction_id) {
                return Ok(Some(TransactionState::Pending));
            }
        }
        let conn = self.conn.lock()?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT state FROM transactions WHERE transaction_id = ?1",
                params![transaction_id],
                |row| row.get(0),
            )
            .optional()?;
        stored.map(|s| s.parse()).transpose()
    }

    /// IDs of transactions still PENDING.
    pub fn pending_transactions(&self) -> CResult<Vec<String>> {
        let state = self.state.lock()?;
        let mut ids: Vec<String> = state.active.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Advisory bounded wait: polls dependency visibility until satisfied
    /// or the wall-clock timeout expires. Mutates nothing and does not
    /// commit.
    pub fn wait_for_dependencies(&self, transaction_id: &str, timeout: Duration) -> CResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.dependencies_satisfied(transaction_id)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(100).min(timeout));
        }
    }

    /// Deletes terminal transaction records older than `max_age`. Visibility
    /// rows are kept: they are the durable record of what is readable.
    pub fn cleanup_finished(&self, max_age: Duration) -> CResult<usize> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|err| Error::InvalidArgument(err.to_string()))?;
        let cutoff = cutoff.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let mut stmt = tx.prepare(
            "SELECT transaction_id FROM transactions
             WHERE state IN ('committed', 'rolled_back', 'failed') AND created_at < ?1",
        )?;
        let old: Vec<String> = stmt
            .query_map(params![cutoff], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for transaction_id in &old {
            tx.execute("DELETE FROM transactions WHERE transaction_id = ?1", params![transaction_id])?;
            tx.execute(
                "DELETE FROM transaction_assets WHERE transaction_id = ?1",
                params![transaction_id],
            )?;
            tx.execute(
                "DELETE FROM transaction_dependencies WHERE transaction_id = ?1",
                params![transaction_id],
            )?;
        }
        tx.commit()?;
        Ok(old.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetadataStore;
    use tempfile::tempdir;

    fn setup() -> CResult<(tempfile::TempDir, TransactionManager)> {
        let dir = tempdir()?;
        let store = MetadataStore::open(dir.path().join("metadata.db"))?;
        Ok((dir, TransactionManager::new(store.connection())))
    }

    fn id(tag: &str) -> String {
        blake3::hash(tag.as_bytes()).to_hex().to_string()
    }

    #[test]
    fn commit_without_dependencies() -> CResult<()> {
        let (_dir, mgr) = setup()?;
        let txn = mgr.begin()?;
        mgr.add_asset(&txn, &id("a"))?;
        assert!(!mgr.is_visible(&id("a"))?);
        assert!(mgr.dependencies_satisfied(&txn)?);
        assert!(mgr.commit(&txn)?);
        assert!(mgr.is_visible(&id("a"))?);
        assert_eq!(mgr.state(&txn)?, Some(TransactionState::Committed));
        Ok(())
    }

    #[test]
    fn child_cannot_commit_before_parent() -> CResult<()> {
        let (_dir, mgr) = setup()?;
        let parent = id("parent");
        let child = id("child");

        let t1 = mgr.begin()?;
        mgr.add_asset(&t1, &parent)?;

        let t2 = mgr.begin()?;
        mgr.add_asset(&t2, &child)?;
        mgr.add_dependency(&t2, &parent)?;

        assert!(!mgr.is_visible(&parent)?);
        assert!(!mgr.is_visible(&child)?);

        // Child first: refused, still pending.
        assert!(!mgr.commit(&t2)?);
        assert_eq!(mgr.state(&t2)?, Some(TransactionState::Pending));
        assert!(!mgr.is_visible(&child)?);

        assert!(mgr.commit(&t1)?);
        assert!(mgr.commit(&t2)?);
        assert!(mgr.is_visible(&parent)?);
        assert!(mgr.is_visible(&child)?);
        Ok(())
    }

    #[test]
    fn all_assets_surface_together() -> CResult<()> {
        let (_dir, mgr) = setup()?;
        let txn = mgr.begin()?;
        for tag in ["x", "y", "z"] {
            mgr.add_asset(&txn, &id(tag))?;
        }
        assert!(mgr.commit(&txn)?);
        let visible = mgr.visible_assets(10, 0)?;
        assert_eq!(visible.len(), 3);
        Ok(())
    }

    #[test]
    fn asset_enrolled_once() -> CResult<()> {
        let (_dir, mgr) = setup()?;
        let t1 = mgr.begin()?;
        let t2 = mgr.begin()?;
        mgr.add_asset(&t1, &id("a"))?;
        // Re-enrolling in the same transaction is fine.
        mgr.add_asset(&t1, &id("a"))?;
        assert!(matches!(mgr.add_asset(&t2, &id("a")), Err(Error::FailedPrecondition(_))));
        // After commit the asset is free again.
        assert!(mgr.commit(&t1)?);
        mgr.add_asset(&t2, &id("a"))?;
        Ok(())
    }

    #[test]
    fn rollback_removes_visibility() -> CResult<()> {
        let (_dir, mgr) = setup()?;
        // Simulate a bulk-load insert that was made visible immediately.
        mgr.set_visible(&id("a"))?;

        let txn = mgr.begin()?;
        mgr.add_asset(&txn, &id("a"))?;
        assert!(mgr.rollback(&txn)?);
        assert!(!mgr.is_visible(&id("a"))?);
        assert_eq!(mgr.state(&txn)?, Some(TransactionState::RolledBack));
        // A rolled-back transaction is terminal.
        assert!(matches!(mgr.commit(&txn), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn dependency_cycle_deadlocks_both() -> CResult<()> {
        let (_dir, mgr) = setup()?;
        let a = id("a");
        let b = id("b");

        let t1 = mgr.begin()?;
        mgr.add_asset(&t1, &a)?;
        mgr.add_dependency(&t1, &b)?;

        let t2 = mgr.begin()?;
        mgr.add_asset(&t2, &b)?;
        mgr.add_dependency(&t2, &a)?;

        // No implicit cycle breaker: both commits are refused.
        assert!(!mgr.commit(&t1)?);
        assert!(!mgr.commit(&t2)?);
        assert!(!mgr.commit(&t1)?);
        assert_eq!(mgr.pending_transactions()?.len(), 2);
        Ok(())
    }

    #[test]
    fn wait_for_dependencies_times_out_without_mutation() -> CResult<()> {
        let (_dir, mgr) = setup()?;
        let txn = mgr.begin()?;
        mgr.add_dependency(&txn, &id("never"))?;

        let started = Instant::now();
        assert!(!mgr.wait_for_dependencies(&txn, Duration::from_millis(250))?);
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(mgr.state(&txn)?, Some(TransactionState::Pending));
        Ok(())
    }

    #[test]
    fn wait_observes_concurrent_commit() -> CResult<()> {
        let (_dir, mgr) = setup()?;
        let mgr = std::sync::Arc::new(mgr);
        let parent = id("parent");

        let t1 = mgr.begin()?;
        mgr.add_asset(&t1, &parent)?;
        let t2 = mgr.begin()?;
        mgr.add_dependency(&t2, &parent)?;

        let committer = {
            let mgr = mgr.clone();
            let t1 = t1.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(150));
                mgr.commit(&t1)
            })
        };
        assert!(mgr.wait_for_dependencies(&t2, Duration::from_secs(5))?);
        assert!(committer.join().expect("committer thread")?);
        assert!(mgr.commit(&t2)?);
        Ok(())
    }

    #[test]
    fn cleanup_drops_only_old_terminal_records() -> CResult<()> {
        let (_dir, mgr) = setup()?;
        let done = mgr.begin()?;
        mgr.add_asset(&done, &id("a"))?;
        assert!(mgr.commit(&done)?);
        let live = mgr.begin()?;

        // Everything is younger than an hour: nothing to clean.
        assert_eq!(mgr.cleanup_finished(Duration::from_secs(3600))?, 0);
        // With a zero horizon the committed record goes, the pending stays.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.cleanup_finished(Duration::from_secs(0))?, 1);
        assert_eq!(mgr.state(&done)?, None);
        assert_eq!(mgr.state(&live)?, Some(TransactionState::Pending));
        // Visibility survives cleanup.
        assert!(mgr.is_visible(&id("a"))?);
        Ok(())
    }
}
