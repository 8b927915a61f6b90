// ============================================================================
// Store Transaction Module
// ============================================================================
//
// Transaction bookkeeping for store drivers. Writes are applied to the
// tables directly and every write records a reversible `Change`; rollback
// replays the undo log newest-first.
//
// Design Patterns Used:
// - State Pattern: Transaction state management (Active, Committed, Aborted)
// - Command Pattern: Reversible operations for rollback
//
// ============================================================================

pub mod change;
pub mod manager;
pub mod state;

pub use change::Change;
pub use manager::TransactionManager;
pub use state::{Transaction, TransactionId, TransactionState};
