// ============================================================================
// Transaction Manager
// ============================================================================

use super::{Change, Transaction, TransactionId};
use crate::core::{PersistenceError, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Open transactions of one store and their undo logs. A transaction leaves
/// the manager when it commits or rolls back.
#[derive(Default)]
pub struct TransactionManager {
    open: RwLock<HashMap<TransactionId, Transaction>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin(&self) -> TransactionId {
        let id = TransactionId::new();
        self.open.write().await.insert(id, Transaction::new(id));
        id
    }

    pub async fn is_active(&self, txn_id: TransactionId) -> bool {
        self.open
            .read()
            .await
            .get(&txn_id)
            .is_some_and(|t| t.state().is_active())
    }

    pub async fn record_change(&self, txn_id: TransactionId, change: Change) -> Result<()> {
        let mut open = self.open.write().await;
        open.get_mut(&txn_id)
            .ok_or_else(|| not_found(txn_id))?
            .record_change(change)
    }

    pub async fn commit(&self, txn_id: TransactionId) -> Result<()> {
        let mut open = self.open.write().await;
        open.get_mut(&txn_id).ok_or_else(|| not_found(txn_id))?.commit()?;
        open.remove(&txn_id);
        Ok(())
    }

    /// Aborts the transaction and returns its undo log, newest change first.
    /// Rolling back an unknown transaction yields an empty log.
    pub async fn rollback(&self, txn_id: TransactionId) -> Result<Vec<Change>> {
        let mut open = self.open.write().await;
        let Some(mut transaction) = open.remove(&txn_id) else {
            return Ok(Vec::new());
        };
        transaction.rollback()
    }

    /// Transactions begun and not yet committed or rolled back.
    pub async fn active_count(&self) -> usize {
        self.open.read().await.len()
    }
}

fn not_found(txn_id: TransactionId) -> PersistenceError {
    PersistenceError::IllegalState(format!("Transaction {} is not open", txn_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityKey;

    #[tokio::test]
    async fn test_begin_commit() {
        let manager = TransactionManager::new();
        let txn = manager.begin().await;
        assert!(manager.is_active(txn).await);
        manager
            .record_change(txn, Change::Insert { key: EntityKey::new("Order", 1) })
            .await
            .unwrap();

        manager.commit(txn).await.unwrap();
        assert!(!manager.is_active(txn).await);
        assert_eq!(manager.active_count().await, 0);
        assert!(manager.commit(txn).await.is_err());
        assert!(manager.record_change(txn, Change::Insert { key: EntityKey::new("Order", 2) }).await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_hands_back_undo_log() {
        let manager = TransactionManager::new();
        let txn = manager.begin().await;
        manager
            .record_change(txn, Change::Insert { key: EntityKey::new("Order", 1) })
            .await
            .unwrap();

        let undo = manager.rollback(txn).await.unwrap();
        assert_eq!(undo.len(), 1);
        assert_eq!(manager.active_count().await, 0);
        assert!(manager.rollback(txn).await.unwrap().is_empty());
    }
}
