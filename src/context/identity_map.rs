use super::state::EntityState;
use crate::core::{EntityKey, PersistenceError, Result};
use crate::entity::{EntityRef, EntitySnapshot, InstanceId};
use crate::metamodel::EntityDescriptor;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Tracking record of one instance inside a persistence context.
#[derive(Debug, Clone)]
pub struct ManagedEntry {
    pub instance: EntityRef,
    pub descriptor: Arc<EntityDescriptor>,
    pub state: EntityState,
    /// Bound once the identifier is known: at persist for assigned and
    /// embedded keys, at flush for generated and derived ones.
    pub key: Option<EntityKey>,
    /// State as last written to or read from the store; `None` while the
    /// instance has not been inserted yet.
    pub snapshot: Option<EntitySnapshot>,
}

impl ManagedEntry {
    pub fn new(instance: EntityRef, descriptor: Arc<EntityDescriptor>) -> Self {
        Self {
            instance,
            descriptor,
            state: EntityState::Managed,
            key: None,
            snapshot: None,
        }
    }

    pub fn is_stored(&self) -> bool {
        self.snapshot.is_some()
    }
}

/// At most one tracked instance per `EntityKey`.
///
/// Entries iterate in instance creation order, which keeps flush planning
/// deterministic.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: BTreeMap<InstanceId, ManagedEntry>,
    keys: HashMap<EntityKey, InstanceId>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: InstanceId) -> Option<&ManagedEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut ManagedEntry> {
        self.entries.get_mut(&id)
    }

    pub fn entry_of(&self, instance: &EntityRef) -> Option<&ManagedEntry> {
        self.entries
            .get(&instance.instance_id())
            .filter(|e| e.instance.same_instance(instance))
    }

    pub fn find_by_key(&self, key: &EntityKey) -> Option<&ManagedEntry> {
        self.keys.get(key).and_then(|id| self.entries.get(id))
    }

    /// Lifecycle state of `instance` as seen by this context.
    pub fn state_of(&self, instance: &EntityRef) -> EntityState {
        match self.entry_of(instance) {
            Some(entry) => entry.state,
            None if instance.is_persisted() => EntityState::Detached,
            None => EntityState::New,
        }
    }

    /// True only for instances in the Managed state.
    pub fn contains(&self, instance: &EntityRef) -> bool {
        self.entry_of(instance)
            .is_some_and(|e| e.state == EntityState::Managed)
    }

    fn check_key(&self, id: InstanceId, key: &EntityKey) -> Result<()> {
        match self.keys.get(key) {
            Some(bound) if *bound != id => Err(PersistenceError::EntityExists(format!(
                "{} is already managed by this context",
                key
            ))),
            _ => Ok(()),
        }
    }

    pub fn insert(&mut self, entry: ManagedEntry) -> Result<()> {
        let id = entry.instance.instance_id();
        if let Some(key) = &entry.key {
            self.check_key(id, key)?;
            self.keys.insert(key.clone(), id);
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    /// Binds `key` to an already tracked instance.
    pub fn bind_key(&mut self, id: InstanceId, key: EntityKey) -> Result<()> {
        self.check_key(id, &key)?;
        let Some(entry) = self.entries.get_mut(&id) else {
            return Err(PersistenceError::IllegalState(format!(
                "Instance {} is not tracked",
                id
            )));
        };
        if let Some(old) = entry.key.replace(key.clone()) {
            if old != key {
                self.keys.remove(&old);
            }
        }
        self.keys.insert(key, id);
        Ok(())
    }

    pub fn remove(&mut self, id: InstanceId) -> Option<ManagedEntry> {
        let entry = self.entries.remove(&id)?;
        if let Some(key) = &entry.key {
            if self.keys.get(key) == Some(&id) {
                self.keys.remove(key);
            }
        }
        Some(entry)
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedEntry> {
        self.entries.values()
    }

    /// Ids of entries in `state`, in creation order.
    pub fn ids_in_state(&self, state: EntityState) -> Vec<InstanceId> {
        self.entries
            .values()
            .filter(|e| e.state == state)
            .map(|e| e.instance.instance_id())
            .collect()
    }

    /// Empties the map, handing back every entry.
    pub fn drain(&mut self) -> Vec<ManagedEntry> {
        self.keys.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
