// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Command Pattern for reversible store writes. Each Change carries what is
// needed to undo the write it describes.
//
// ============================================================================

use crate::core::EntityKey;
use crate::store::Record;

/// A single reversible write recorded in a transaction.
///
/// Sequence allocations are never recorded: identifiers handed out by a
/// sequence stay consumed after rollback.
#[derive(Debug, Clone)]
pub enum Change {
    /// A row was inserted; undo removes it.
    Insert { key: EntityKey },

    /// A row was overwritten; undo restores `before`.
    Update { key: EntityKey, before: Record },

    /// A row was deleted; undo puts `before` back at its original position.
    Delete {
        key: EntityKey,
        before: Record,
        position: u64,
    },
}

impl Change {
    /// Key of the row affected by this change
    pub fn key(&self) -> &EntityKey {
        match self {
            Change::Insert { key } => key,
            Change::Update { key, .. } => key,
            Change::Delete { key, .. } => key,
        }
    }
}
