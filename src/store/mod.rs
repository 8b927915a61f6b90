// ============================================================================
// Store Module
// ============================================================================
//
// Boundary to the data store a persistence unit writes through. The context
// only ever talks to `dyn Store`; `InMemoryStore` is the reference driver.
//
// ============================================================================

pub mod memory;

pub use memory::InMemoryStore;

use crate::core::{EntityKey, Result, Value};
use crate::transaction::TransactionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Row image of one entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: EntityKey,
    /// Most specific entity type of the stored instance.
    pub concrete_type: String,
    pub attributes: BTreeMap<String, Value>,
    /// Foreign keys of owning relationships, by relationship name.
    pub references: BTreeMap<String, Vec<EntityKey>>,
    pub version: Option<i64>,
}

impl Record {
    pub fn new(key: EntityKey, concrete_type: impl Into<String>) -> Self {
        Self {
            key,
            concrete_type: concrete_type.into(),
            attributes: BTreeMap::new(),
            references: BTreeMap::new(),
            version: None,
        }
    }

    pub fn references_key(&self, key: &EntityKey) -> bool {
        self.references.values().any(|keys| keys.contains(key))
    }
}

/// Operations a persistence unit needs from its data store.
///
/// Writes happen inside a store transaction. Violations of referential or
/// identity constraints are reported as `ConstraintViolation`,
/// `EntityExists` or `OptimisticLock`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<TransactionId>;
    async fn commit(&self, txn: TransactionId) -> Result<()>;
    async fn rollback(&self, txn: TransactionId) -> Result<()>;

    async fn insert(&self, txn: TransactionId, record: Record) -> Result<()>;

    /// Replaces the row for `record.key`. When `expected_version` is set the
    /// stored version must match it.
    async fn update(
        &self,
        txn: TransactionId,
        record: Record,
        expected_version: Option<i64>,
    ) -> Result<()>;

    async fn delete(
        &self,
        txn: TransactionId,
        key: &EntityKey,
        expected_version: Option<i64>,
    ) -> Result<()>;

    async fn select(&self, key: &EntityKey) -> Result<Option<Record>>;

    /// Rows of hierarchy `root` whose `association` references `target`,
    /// in insertion order.
    async fn select_referencing(
        &self,
        root: &str,
        association: &str,
        target: &EntityKey,
    ) -> Result<Vec<Record>>;

    /// Next value of the identifier sequence of hierarchy `root`.
    async fn next_sequence(&self, root: &str) -> Result<i64>;
}

/// Operation counters of a store driver.
#[derive(Debug, Default)]
pub struct StoreStats {
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    selects: AtomicU64,
}

impl StoreStats {
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn selects(&self) -> u64 {
        self.selects.load(Ordering::Relaxed)
    }

    pub(crate) fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_select(&self) {
        self.selects.fetch_add(1, Ordering::Relaxed);
    }
}
