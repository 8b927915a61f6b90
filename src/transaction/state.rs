// ============================================================================
// Store Transactions
// ============================================================================
//
// A store transaction is open until it commits or aborts. While open it
// collects the undo log of its writes; commit discards the log, abort
// hands it back for replay.
//
// ============================================================================

use super::Change;
use crate::core::{PersistenceError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique transaction number, increasing in begin order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionState::Active => "ACTIVE",
            TransactionState::Committed => "COMMITTED",
            TransactionState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Open store transaction with the undo log of its writes.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    /// Oldest write first.
    undo_log: Vec<Change>,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            undo_log: Vec::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn ensure_active(&self, action: &str) -> Result<()> {
        if self.state.is_active() {
            return Ok(());
        }
        Err(PersistenceError::IllegalState(format!(
            "Cannot {} in transaction {}: it is {}",
            action, self.id, self.state
        )))
    }

    pub fn record_change(&mut self, change: Change) -> Result<()> {
        self.ensure_active("record a write")?;
        self.undo_log.push(change);
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit")?;
        self.undo_log.clear();
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Aborts and returns the writes to undo, newest first.
    pub fn rollback(&mut self) -> Result<Vec<Change>> {
        self.ensure_active("roll back")?;
        self.state = TransactionState::Aborted;
        let mut undo = std::mem::take(&mut self.undo_log);
        undo.reverse();
        Ok(undo)
    }
}
