// ============================================================================
// Persistence Context
// ============================================================================
//
// Unit of work over one identity map. Application operations enter here,
// are expanded by the cascade resolver, decided per instance by the state
// machine, and written to the store by the flush coordinator.
//
// Synchronous operations (persist, remove, detach, contains, clear) never
// touch the store. Operations that may read or write it (find, refresh,
// merge, flush, commit) are async.
//
// A context is confined to one logical flow of control; it is `Send` but
// all mutating operations take `&mut self`.
//
// ============================================================================

pub mod cascade;
pub mod flush;
pub mod identity_map;
mod load;
mod merge;
pub mod state;

pub use cascade::{CascadeNode, CascadeResolver};
pub use flush::FlushPlan;
pub use identity_map::{IdentityMap, ManagedEntry};
pub use state::{EntityState, MergeAction, Outcome};

use crate::cache::{CacheRetrieveMode, CacheStoreMode};
use crate::callback::LifecycleEvent;
use crate::config::PersistenceContextType;
use crate::core::{EntityKey, PersistenceError, Result};
use crate::entity::EntityRef;
use crate::facade::UnitInner;
use crate::metamodel::{CascadeType, IdentifierKind};
use crate::store::Record;
use crate::transaction::TransactionId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Context-side view of the store transaction.
#[derive(Debug)]
struct ActiveTransaction {
    id: TransactionId,
    rollback_only: bool,
    /// Keys written in this transaction; evicted from the cache on rollback.
    touched: HashSet<EntityKey>,
    /// Row images written in this transaction, cached on commit.
    written: HashMap<EntityKey, Record>,
    /// Instances inserted in this transaction, flagged when their key was
    /// assigned by the flush.
    inserted: Vec<(EntityRef, bool)>,
    /// Instances whose rows this transaction deleted.
    deleted: Vec<EntityRef>,
}

impl ActiveTransaction {
    fn new(id: TransactionId) -> Self {
        Self {
            id,
            rollback_only: false,
            touched: HashSet::new(),
            written: HashMap::new(),
            inserted: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

pub struct PersistenceContext {
    unit: Arc<UnitInner>,
    context_type: PersistenceContextType,
    identity_map: IdentityMap,
    transaction: Option<ActiveTransaction>,
    retrieve_mode: CacheRetrieveMode,
    store_mode: CacheStoreMode,
    closed: bool,
}

impl PersistenceContext {
    pub(crate) fn new(unit: Arc<UnitInner>, context_type: PersistenceContextType) -> Self {
        debug!(unit = %unit.config.name, ?context_type, "persistence context created");
        Self {
            retrieve_mode: unit.config.retrieve_mode,
            store_mode: unit.config.store_mode,
            unit,
            context_type,
            identity_map: IdentityMap::new(),
            transaction: None,
            closed: false,
        }
    }

    pub fn context_type(&self) -> PersistenceContextType {
        self.context_type
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn retrieve_mode(&self) -> CacheRetrieveMode {
        self.retrieve_mode
    }

    pub fn set_retrieve_mode(&mut self, mode: CacheRetrieveMode) {
        self.retrieve_mode = mode;
    }

    pub fn store_mode(&self) -> CacheStoreMode {
        self.store_mode
    }

    pub fn set_store_mode(&mut self, mode: CacheStoreMode) {
        self.store_mode = mode;
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    /// Lifecycle state of `entity` relative to this context.
    pub fn state_of(&self, entity: &EntityRef) -> EntityState {
        self.identity_map.state_of(entity)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(PersistenceError::IllegalState(
                "Persistence context is closed".into(),
            ));
        }
        Ok(())
    }

    fn require_transaction(&self, operation: &str) -> Result<()> {
        if self.transaction.is_none() {
            return Err(PersistenceError::TransactionRequired(format!(
                "{} needs an active transaction",
                operation
            )));
        }
        Ok(())
    }

    /// Transaction-scoped contexts only mutate inside a transaction.
    fn require_for_mutation(&self, operation: &str) -> Result<()> {
        match self.context_type {
            PersistenceContextType::Transaction => self.require_transaction(operation),
            PersistenceContextType::Extended => Ok(()),
        }
    }

    fn mark_rollback_only(&mut self, cause: &PersistenceError) {
        if let Some(txn) = self.transaction.as_mut() {
            if !txn.rollback_only {
                debug!(txn = %txn.id, %cause, "transaction marked rollback-only");
            }
            txn.rollback_only = true;
        }
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.marks_rollback() {
                self.mark_rollback_only(e);
            }
        }
        result
    }

    fn detach_all(&mut self) -> usize {
        let detached = self.identity_map.drain().len();
        if detached > 0 {
            trace!(detached, "context cleared");
        }
        detached
    }

    // ------------------------------------------------------------------
    // persist / remove / detach
    // ------------------------------------------------------------------

    /// Makes `entity` and everything reachable through PERSIST cascades
    /// managed. Inserts happen at flush.
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        self.require_for_mutation("persist")?;
        let result = self.persist_graph(entity);
        self.guard(result)
    }

    fn persist_graph(&mut self, root: &EntityRef) -> Result<()> {
        let unit = self.unit.clone();
        unit.metamodel.entity(root.entity_type())?;
        let nodes = CascadeResolver::new(&unit.metamodel).collect(root, CascadeType::Persist)?;

        // Decide every node before changing any of them.
        let mut decided = Vec::with_capacity(nodes.len());
        for node in nodes {
            let outcome = self.identity_map.state_of(&node.instance).persist(&node.instance)?;
            if matches!(outcome, Outcome::Transition { from: EntityState::New, .. })
                && node.descriptor.is_abstract()
            {
                return Err(PersistenceError::IllegalArgument(format!(
                    "Cannot persist instance of abstract entity type '{}'",
                    node.descriptor.name()
                )));
            }
            decided.push((node, outcome));
        }

        for (node, outcome) in decided {
            let CascadeNode {
                instance,
                descriptor,
            } = node;
            match outcome {
                Outcome::Ignored => trace!(instance = ?instance, "persist ignored"),
                Outcome::Transition { from, to } => {
                    if from == EntityState::New {
                        unit.dispatcher
                            .dispatch(&descriptor, LifecycleEvent::PrePersist, &instance)?;
                        let mut entry = ManagedEntry::new(instance.clone(), descriptor.clone());
                        let bound_at_persist = matches!(
                            descriptor.identifier(),
                            IdentifierKind::Assigned | IdentifierKind::Embedded { .. }
                        );
                        if bound_at_persist {
                            entry.key = instance
                                .id()
                                .filter(|id| id.is_complete())
                                .map(|id| descriptor.key(id));
                        }
                        self.identity_map.insert(entry)?;
                    } else if let Some(entry) = self.identity_map.get_mut(instance.instance_id()) {
                        entry.state = to;
                    }
                    trace!(instance = ?instance, %from, %to, "state transition");
                }
            }
        }
        Ok(())
    }

    /// Schedules `entity` and everything reachable through REMOVE cascades
    /// for deletion. Each reached instance is judged by its own state: new
    /// and already removed instances are skipped, the traversal continues
    /// through them.
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        self.require_for_mutation("remove")?;
        let result = self.remove_graph(entity);
        self.guard(result)
    }

    fn remove_graph(&mut self, root: &EntityRef) -> Result<()> {
        let unit = self.unit.clone();
        unit.metamodel.entity(root.entity_type())?;
        let nodes = CascadeResolver::new(&unit.metamodel).collect(root, CascadeType::Remove)?;

        let mut decided = Vec::with_capacity(nodes.len());
        for node in nodes {
            let outcome = self.identity_map.state_of(&node.instance).remove(&node.instance)?;
            decided.push((node, outcome));
        }

        for (node, outcome) in decided {
            match outcome {
                Outcome::Ignored => trace!(instance = ?node.instance, "remove ignored"),
                Outcome::Transition { from, to } => {
                    unit.dispatcher
                        .dispatch(&node.descriptor, LifecycleEvent::PreRemove, &node.instance)?;
                    if let Some(entry) = self.identity_map.get_mut(node.instance.instance_id()) {
                        entry.state = to;
                    }
                    trace!(instance = ?node.instance, %from, %to, "state transition");
                }
            }
        }
        Ok(())
    }

    /// Stops tracking `entity` and everything reachable through DETACH
    /// cascades. Unflushed changes to them are discarded.
    pub fn detach(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        let unit = self.unit.clone();
        unit.metamodel.entity(entity.entity_type())?;
        let nodes = CascadeResolver::new(&unit.metamodel).collect(entity, CascadeType::Detach)?;
        for node in nodes {
            match self.identity_map.state_of(&node.instance).detach() {
                Outcome::Ignored => trace!(instance = ?node.instance, "detach ignored"),
                Outcome::Transition { from, to } => {
                    self.identity_map.remove(node.instance.instance_id());
                    trace!(instance = ?node.instance, %from, %to, "state transition");
                }
            }
        }
        Ok(())
    }

    /// Detaches every tracked instance.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.detach_all();
        Ok(())
    }

    /// Whether `entity` is managed by this context. Removed instances are
    /// not contained, even before the delete is flushed.
    pub fn contains(&self, entity: &EntityRef) -> Result<bool> {
        self.ensure_open()?;
        if !self.unit.metamodel.is_entity(entity.entity_type()) {
            return Err(PersistenceError::IllegalArgument(format!(
                "'{}' is not an entity type",
                entity.entity_type()
            )));
        }
        Ok(self.identity_map.contains(entity))
    }

    // ------------------------------------------------------------------
    // transactions
    // ------------------------------------------------------------------

    pub fn is_transaction_active(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.transaction
            .as_ref()
            .map(|t| t.rollback_only)
            .unwrap_or(false)
    }

    pub fn set_rollback_only(&mut self) -> Result<()> {
        match self.transaction.as_mut() {
            Some(txn) => {
                txn.rollback_only = true;
                Ok(())
            }
            None => Err(PersistenceError::IllegalState(
                "No active transaction".into(),
            )),
        }
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.transaction.is_some() {
            return Err(PersistenceError::IllegalState(
                "Transaction already active".into(),
            ));
        }
        let id = self.unit.store.begin().await?;
        debug!(txn = %id, "transaction started");
        self.transaction = Some(ActiveTransaction::new(id));
        Ok(())
    }

    /// Flushes, commits the store transaction and caches the written rows.
    ///
    /// A rollback-only transaction is rolled back and reported as
    /// `RollbackOnly`; any failure on the way rolls back and returns the cause.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let Some(txn) = self.transaction.as_ref() else {
            return Err(PersistenceError::IllegalState(
                "No active transaction".into(),
            ));
        };
        let txn_id = txn.id;

        if txn.rollback_only {
            self.rollback_inner().await?;
            return Err(PersistenceError::RollbackOnly(format!(
                "Transaction {} was marked for rollback",
                txn_id
            )));
        }

        if let Err(e) = self.flush_inner().await {
            warn!(txn = %txn_id, error = %e, "flush failed at commit, rolling back");
            self.rollback_after_failure().await;
            return Err(e);
        }

        if let Err(e) = self.unit.store.commit(txn_id).await {
            warn!(txn = %txn_id, error = %e, "store commit failed, rolling back");
            self.rollback_after_failure().await;
            return Err(e);
        }

        if let Some(txn) = self.transaction.take() {
            for record in txn.written.into_values() {
                self.unit.cache.put(record);
            }
        }
        if self.context_type == PersistenceContextType::Transaction {
            self.detach_all();
        }
        debug!(txn = %txn_id, "transaction committed");
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.transaction.is_none() {
            return Err(PersistenceError::IllegalState(
                "No active transaction".into(),
            ));
        }
        self.rollback_inner().await
    }

    async fn rollback_after_failure(&mut self) {
        if let Err(e) = self.rollback_inner().await {
            warn!(error = %e, "rollback after failure also failed");
        }
    }

    /// Rolls the store back and detaches everything. Instance field values
    /// are left as they are; identifiers generated or derived by the flush
    /// are cleared so a later persist assigns fresh ones.
    async fn rollback_inner(&mut self) -> Result<()> {
        let Some(txn) = self.transaction.take() else {
            return Ok(());
        };
        let result = self.unit.store.rollback(txn.id).await;
        for key in &txn.touched {
            self.unit.cache.invalidate(key);
        }
        // Deleted rows are back, inserted ones are gone. An instance both
        // inserted and deleted here ends up unsaved.
        for instance in &txn.deleted {
            instance.update_metadata(|m| m.persisted = true);
        }
        for (instance, key_from_flush) in &txn.inserted {
            instance.update_metadata(|m| {
                m.persisted = false;
                m.persisted_at = None;
            });
            if *key_from_flush {
                instance.clear_id();
            }
        }
        let detached = self.detach_all();
        debug!(txn = %txn.id, detached, "transaction rolled back");
        result
    }

    /// Rolls back an active transaction and detaches everything. Every later
    /// operation fails with `IllegalState`.
    pub async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = self.rollback_inner().await;
        self.detach_all();
        self.closed = true;
        debug!("persistence context closed");
        result
    }
}

impl std::fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("context_type", &self.context_type)
            .field("entries", &self.identity_map.len())
            .field("transaction", &self.transaction.as_ref().map(|t| t.id))
            .field("closed", &self.closed)
            .finish()
    }
}
