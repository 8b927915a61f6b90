use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Entity already exists: {0}")]
    EntityExists(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Optimistic lock failure: {0}")]
    OptimisticLock(String),

    #[error("Callback {event} on '{entity}' failed: {source}")]
    CallbackFailure {
        entity: String,
        event: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Transaction required: {0}")]
    TransactionRequired(String),

    #[error("Transaction marked for rollback: {0}")]
    RollbackOnly(String),

    #[error("Store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

impl PersistenceError {
    /// Whether this failure forces the enclosing transaction into rollback-only.
    ///
    /// API misuse (illegal state/argument, missing transaction, bad
    /// configuration) is reported to the caller without dooming the transaction.
    pub fn marks_rollback(&self) -> bool {
        matches!(
            self,
            Self::EntityExists(_)
                | Self::EntityNotFound(_)
                | Self::ConstraintViolation(_)
                | Self::OptimisticLock(_)
                | Self::CallbackFailure { .. }
                | Self::Store(_)
        )
    }
}
