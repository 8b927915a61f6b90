// ============================================================================
// In-Memory Store
// ============================================================================
//
// Reference `Store` driver. One table per hierarchy root, rows keyed by
// identifier. Writes go straight to the tables and are recorded in the
// transaction's undo log; rollback replays the log. Reads see the latest
// written state (no isolation between concurrent transactions).
//
// Referential integrity is enforced on every write: a row may only reference
// rows that exist, and a row that is still referenced cannot be deleted.
//
// ============================================================================

use super::{Record, Store, StoreStats};
use crate::core::{EntityKey, Identifier, PersistenceError, Result};
use crate::transaction::{Change, TransactionId, TransactionManager};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::trace;

#[derive(Debug, Clone)]
struct StoredRow {
    record: Record,
    /// Insertion position, used for stable scan order.
    position: u64,
}

#[derive(Debug, Default)]
struct Table {
    rows: HashMap<Identifier, StoredRow>,
    next_position: u64,
}

/// All tables plus the reverse reference index kept in step with them.
#[derive(Debug, Default)]
struct Tables {
    by_root: HashMap<String, Table>,
    /// target -> rows referencing it, with the number of references each
    referrers: HashMap<EntityKey, HashMap<EntityKey, usize>>,
}

impl Tables {
    fn row(&self, key: &EntityKey) -> Option<&StoredRow> {
        self.by_root.get(key.root()).and_then(|t| t.rows.get(key.id()))
    }

    fn exists(&self, key: &EntityKey) -> bool {
        self.row(key).is_some()
    }

    fn index(&mut self, record: &Record) {
        for target in record.references.values().flatten() {
            if target != &record.key {
                *self
                    .referrers
                    .entry(target.clone())
                    .or_default()
                    .entry(record.key.clone())
                    .or_default() += 1;
            }
        }
    }

    fn unindex(&mut self, record: &Record) {
        for target in record.references.values().flatten() {
            let Some(holders) = self.referrers.get_mut(target) else { continue };
            if let Some(count) = holders.get_mut(&record.key) {
                *count -= 1;
                if *count == 0 {
                    holders.remove(&record.key);
                }
            }
            if holders.is_empty() {
                self.referrers.remove(target);
            }
        }
    }

    /// Some row other than `key` itself that still references it.
    fn referrer_of(&self, key: &EntityKey) -> Option<&EntityKey> {
        self.referrers
            .get(key)
            .and_then(|holders| holders.keys().find(|holder| *holder != key))
    }

    /// Stores a row at `position`, or at the end of its table when `None`.
    fn put(&mut self, record: Record, position: Option<u64>) {
        self.index(&record);
        let table = self.by_root.entry(record.key.root().to_string()).or_default();
        let position = position.unwrap_or_else(|| {
            let next = table.next_position;
            table.next_position += 1;
            next
        });
        if let Some(old) = table
            .rows
            .insert(record.key.id().clone(), StoredRow { record, position })
        {
            self.unindex(&old.record);
        }
    }

    /// Swaps the record of an existing row and returns the old one.
    fn replace(&mut self, record: Record) -> Option<Record> {
        let row = self
            .by_root
            .get_mut(record.key.root())
            .and_then(|t| t.rows.get_mut(record.key.id()))?;
        let before = std::mem::replace(&mut row.record, record);
        let current = row.record.clone();
        self.unindex(&before);
        self.index(&current);
        Some(before)
    }

    fn take(&mut self, key: &EntityKey) -> Option<StoredRow> {
        let removed = self
            .by_root
            .get_mut(key.root())
            .and_then(|t| t.rows.remove(key.id()))?;
        self.unindex(&removed.record);
        Some(removed)
    }

    fn check_references(&self, record: &Record) -> Result<()> {
        for (association, keys) in &record.references {
            for key in keys {
                if key != &record.key && !self.exists(key) {
                    return Err(PersistenceError::ConstraintViolation(format!(
                        "{}.{} references missing row {}",
                        record.key, association, key
                    )));
                }
            }
        }
        Ok(())
    }
}

pub struct InMemoryStore {
    tables: RwLock<Tables>,
    sequences: Mutex<HashMap<String, i64>>,
    transactions: TransactionManager,
    stats: StoreStats,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            sequences: Mutex::new(HashMap::new()),
            transactions: TransactionManager::new(),
            stats: StoreStats::default(),
        }
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Number of rows stored for hierarchy `root`.
    pub async fn row_count(&self, root: &str) -> usize {
        let tables = self.tables.read().await;
        tables.by_root.get(root).map(|t| t.rows.len()).unwrap_or(0)
    }

    async fn ensure_active(&self, txn: TransactionId) -> Result<()> {
        if self.transactions.is_active(txn).await {
            Ok(())
        } else {
            Err(PersistenceError::IllegalState(format!(
                "Transaction {} is not active",
                txn
            )))
        }
    }
}

fn check_version(stored: &Record, expected: Option<i64>) -> Result<()> {
    match expected {
        Some(expected) if stored.version != Some(expected) => {
            Err(PersistenceError::OptimisticLock(format!(
                "{} is at version {:?}, expected {}",
                stored.key, stored.version, expected
            )))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<TransactionId> {
        let txn = self.transactions.begin().await;
        trace!(%txn, "store transaction started");
        Ok(txn)
    }

    async fn commit(&self, txn: TransactionId) -> Result<()> {
        self.transactions.commit(txn).await?;
        trace!(%txn, "store transaction committed");
        Ok(())
    }

    async fn rollback(&self, txn: TransactionId) -> Result<()> {
        let undo = self.transactions.rollback(txn).await?;
        let mut tables = self.tables.write().await;
        for change in &undo {
            trace!(%txn, key = %change.key(), "undo");
            match change {
                Change::Insert { key } => {
                    tables.take(key);
                }
                Change::Update { before, .. } => {
                    tables.replace(before.clone());
                }
                Change::Delete {
                    before, position, ..
                } => {
                    tables.put(before.clone(), Some(*position));
                }
            }
        }
        trace!(%txn, undone = undo.len(), "store transaction rolled back");
        Ok(())
    }

    async fn insert(&self, txn: TransactionId, record: Record) -> Result<()> {
        self.ensure_active(txn).await?;
        let mut tables = self.tables.write().await;

        if tables.exists(&record.key) {
            return Err(PersistenceError::EntityExists(record.key.to_string()));
        }
        tables.check_references(&record)?;

        let key = record.key.clone();
        tables.put(record, None);
        self.transactions
            .record_change(txn, Change::Insert { key: key.clone() })
            .await?;
        self.stats.record_insert();
        trace!(%txn, %key, "insert");
        Ok(())
    }

    async fn update(
        &self,
        txn: TransactionId,
        record: Record,
        expected_version: Option<i64>,
    ) -> Result<()> {
        self.ensure_active(txn).await?;
        let mut tables = self.tables.write().await;

        tables.check_references(&record)?;
        let key = record.key.clone();
        let row = tables
            .row(&key)
            .ok_or_else(|| PersistenceError::EntityNotFound(key.to_string()))?;
        check_version(&row.record, expected_version)?;

        let before = tables
            .replace(record)
            .ok_or_else(|| PersistenceError::EntityNotFound(key.to_string()))?;
        self.transactions
            .record_change(txn, Change::Update { key: key.clone(), before })
            .await?;
        self.stats.record_update();
        trace!(%txn, %key, "update");
        Ok(())
    }

    async fn delete(
        &self,
        txn: TransactionId,
        key: &EntityKey,
        expected_version: Option<i64>,
    ) -> Result<()> {
        self.ensure_active(txn).await?;
        let mut tables = self.tables.write().await;

        let stored = tables
            .row(key)
            .ok_or_else(|| PersistenceError::EntityNotFound(key.to_string()))?;
        check_version(&stored.record, expected_version)?;

        if let Some(referrer) = tables.referrer_of(key) {
            return Err(PersistenceError::ConstraintViolation(format!(
                "{} is still referenced by {}",
                key, referrer
            )));
        }

        let Some(removed) = tables.take(key) else {
            return Err(PersistenceError::EntityNotFound(key.to_string()));
        };
        self.transactions
            .record_change(
                txn,
                Change::Delete {
                    key: key.clone(),
                    before: removed.record,
                    position: removed.position,
                },
            )
            .await?;
        self.stats.record_delete();
        trace!(%txn, %key, "delete");
        Ok(())
    }

    async fn select(&self, key: &EntityKey) -> Result<Option<Record>> {
        self.stats.record_select();
        let tables = self.tables.read().await;
        Ok(tables.row(key).map(|row| row.record.clone()))
    }

    async fn select_referencing(
        &self,
        root: &str,
        association: &str,
        target: &EntityKey,
    ) -> Result<Vec<Record>> {
        self.stats.record_select();
        let tables = self.tables.read().await;
        let Some(table) = tables.by_root.get(root) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<&StoredRow> = table
            .rows
            .values()
            .filter(|row| {
                row.record
                    .references
                    .get(association)
                    .is_some_and(|keys| keys.contains(target))
            })
            .collect();
        rows.sort_by_key(|row| row.position);
        Ok(rows.into_iter().map(|row| row.record.clone()).collect())
    }

    async fn next_sequence(&self, root: &str) -> Result<i64> {
        let mut sequences = self.sequences.lock().await;
        let next = sequences.entry(root.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn order(id: i64) -> Record {
        let mut record = Record::new(EntityKey::new("Order", id), "Order");
        record.attributes.insert("total".into(), Value::Integer(10));
        record
    }

    fn line(id: i64, order_id: i64) -> Record {
        let mut record = Record::new(EntityKey::new("Line", id), "Line");
        record
            .references
            .insert("order".into(), vec![EntityKey::new("Order", order_id)]);
        record
    }

    #[tokio::test]
    async fn test_insert_select_commit() {
        let store = InMemoryStore::new();
        let txn = store.begin().await.unwrap();
        store.insert(txn, order(1)).await.unwrap();
        store.commit(txn).await.unwrap();

        let found = store.select(&EntityKey::new("Order", 1)).await.unwrap();
        assert_eq!(found, Some(order(1)));
        assert_eq!(store.stats().inserts(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert() {
        let store = InMemoryStore::new();
        let txn = store.begin().await.unwrap();
        store.insert(txn, order(1)).await.unwrap();
        let err = store.insert(txn, order(1)).await.unwrap_err();
        assert!(matches!(err, PersistenceError::EntityExists(_)));
    }

    #[tokio::test]
    async fn test_referential_integrity() {
        let store = InMemoryStore::new();
        let txn = store.begin().await.unwrap();
        let err = store.insert(txn, line(1, 9)).await.unwrap_err();
        assert!(matches!(err, PersistenceError::ConstraintViolation(_)));

        store.insert(txn, order(9)).await.unwrap();
        store.insert(txn, line(1, 9)).await.unwrap();
        let err = store
            .delete(txn, &EntityKey::new("Order", 9), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::ConstraintViolation(_)));

        store.delete(txn, &EntityKey::new("Line", 1), None).await.unwrap();
        store.delete(txn, &EntityKey::new("Order", 9), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_referrers_follow_updates_and_rollback() {
        let store = InMemoryStore::new();
        let setup = store.begin().await.unwrap();
        store.insert(setup, order(1)).await.unwrap();
        store.insert(setup, order(2)).await.unwrap();
        store.insert(setup, line(1, 1)).await.unwrap();
        store.commit(setup).await.unwrap();

        let txn = store.begin().await.unwrap();
        store.update(txn, line(1, 2), None).await.unwrap();
        let err = store
            .delete(txn, &EntityKey::new("Order", 2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::ConstraintViolation(_)));
        store.delete(txn, &EntityKey::new("Order", 1), None).await.unwrap();
        store.rollback(txn).await.unwrap();

        let txn = store.begin().await.unwrap();
        let err = store
            .delete(txn, &EntityKey::new("Order", 1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::ConstraintViolation(_)));
        store.delete(txn, &EntityKey::new("Order", 2), None).await.unwrap();

        let mut own = order(3);
        own.references
            .insert("parent".into(), vec![EntityKey::new("Order", 3)]);
        store.insert(txn, own).await.unwrap();
        store.delete(txn, &EntityKey::new("Order", 3), None).await.unwrap();
        store.commit(txn).await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_restores_rows() {
        let store = InMemoryStore::new();
        let setup = store.begin().await.unwrap();
        store.insert(setup, order(1)).await.unwrap();
        store.commit(setup).await.unwrap();

        let txn = store.begin().await.unwrap();
        let mut changed = order(1);
        changed.attributes.insert("total".into(), Value::Integer(99));
        store.update(txn, changed, None).await.unwrap();
        store.insert(txn, order(2)).await.unwrap();
        store.delete(txn, &EntityKey::new("Order", 1), None).await.unwrap();
        store.rollback(txn).await.unwrap();

        assert_eq!(store.select(&EntityKey::new("Order", 1)).await.unwrap(), Some(order(1)));
        assert_eq!(store.select(&EntityKey::new("Order", 2)).await.unwrap(), None);
        assert_eq!(store.row_count("Order").await, 1);
    }

    #[tokio::test]
    async fn test_optimistic_version_check() {
        let store = InMemoryStore::new();
        let txn = store.begin().await.unwrap();
        let mut versioned = order(1);
        versioned.version = Some(1);
        store.insert(txn, versioned.clone()).await.unwrap();

        versioned.version = Some(2);
        store.update(txn, versioned.clone(), Some(1)).await.unwrap();
        let err = store.update(txn, versioned, Some(1)).await.unwrap_err();
        assert!(matches!(err, PersistenceError::OptimisticLock(_)));
    }

    #[tokio::test]
    async fn test_select_referencing_in_insertion_order() {
        let store = InMemoryStore::new();
        let txn = store.begin().await.unwrap();
        store.insert(txn, order(1)).await.unwrap();
        for id in [5, 3, 4] {
            store.insert(txn, line(id, 1)).await.unwrap();
        }
        let lines = store
            .select_referencing("Line", "order", &EntityKey::new("Order", 1))
            .await
            .unwrap();
        let ids: Vec<_> = lines.iter().map(|r| r.key.id().to_string()).collect();
        assert_eq!(ids, vec!["5", "3", "4"]);
    }

    #[tokio::test]
    async fn test_sequences_survive_rollback() {
        let store = InMemoryStore::new();
        let txn = store.begin().await.unwrap();
        assert_eq!(store.next_sequence("Order").await.unwrap(), 1);
        store.rollback(txn).await.unwrap();
        assert_eq!(store.next_sequence("Order").await.unwrap(), 2);
        assert_eq!(store.next_sequence("Line").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_writes_require_active_transaction() {
        let store = InMemoryStore::new();
        let txn = store.begin().await.unwrap();
        store.commit(txn).await.unwrap();
        let err = store.insert(txn, order(1)).await.unwrap_err();
        assert!(matches!(err, PersistenceError::IllegalState(_)));
    }
}
