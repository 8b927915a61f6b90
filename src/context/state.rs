// ============================================================================
// Entity Lifecycle States
// ============================================================================
//
//            persist                 remove
//   New ───────────────> Managed ───────────────> Removed
//                         │  ^                      │
//                  detach │  └──────── persist ─────┘
//        clear / rollback │                         │ flush (delete)
//                         v                         v
//                      Detached                (untracked)
//
// Transitions are pure: they decide the outcome of an operation for one
// instance and never touch the identity map or fire callbacks.
//
// ============================================================================

use crate::core::{PersistenceError, Result};
use crate::entity::EntityRef;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// No persistent identity, not tracked by any context.
    New,
    /// Tracked by a context and synchronized at flush.
    Managed,
    /// Tracked and scheduled for deletion at flush.
    Removed,
    /// Has persistent identity but is not tracked by this context.
    Detached,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::Managed => write!(f, "MANAGED"),
            Self::Removed => write!(f, "REMOVED"),
            Self::Detached => write!(f, "DETACHED"),
        }
    }
}

/// Result of applying an operation to one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Transition { from: EntityState, to: EntityState },
    /// The contract defines the operation as a no-op in this state.
    Ignored,
}

/// What merge does with an instance in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// The instance is managed already and is its own managed copy.
    Reuse,
    /// State is copied onto a managed instance (existing or new).
    Copy,
}

impl EntityState {
    pub fn is_tracked(&self) -> bool {
        matches!(self, Self::Managed | Self::Removed)
    }

    pub fn persist(self, instance: &EntityRef) -> Result<Outcome> {
        match self {
            Self::New | Self::Removed => Ok(Outcome::Transition {
                from: self,
                to: Self::Managed,
            }),
            Self::Managed => Ok(Outcome::Ignored),
            Self::Detached => Err(PersistenceError::EntityExists(format!(
                "{:?} is detached; use merge to reattach it",
                instance
            ))),
        }
    }

    pub fn remove(self, instance: &EntityRef) -> Result<Outcome> {
        match self {
            Self::Managed => Ok(Outcome::Transition {
                from: self,
                to: Self::Removed,
            }),
            Self::New | Self::Removed => Ok(Outcome::Ignored),
            Self::Detached => Err(PersistenceError::IllegalArgument(format!(
                "Cannot remove detached instance {:?}",
                instance
            ))),
        }
    }

    pub fn detach(self) -> Outcome {
        match self {
            Self::Managed | Self::Removed => Outcome::Transition {
                from: self,
                to: Self::Detached,
            },
            Self::New | Self::Detached => Outcome::Ignored,
        }
    }

    pub fn refresh(self, instance: &EntityRef) -> Result<()> {
        match self {
            Self::Managed => Ok(()),
            other => Err(PersistenceError::IllegalArgument(format!(
                "Cannot refresh {:?} in state {}",
                instance, other
            ))),
        }
    }

    pub fn merge(self, instance: &EntityRef) -> Result<MergeAction> {
        match self {
            Self::Managed => Ok(MergeAction::Reuse),
            Self::New | Self::Detached => Ok(MergeAction::Copy),
            Self::Removed => Err(PersistenceError::IllegalArgument(format!(
                "Cannot merge removed instance {:?}",
                instance
            ))),
        }
    }
}
