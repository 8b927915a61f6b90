use super::{CascadeResolver, EntityState, ManagedEntry, PersistenceContext};
use crate::cache::{CacheRetrieveMode, CacheStoreMode};
use crate::callback::LifecycleEvent;
use crate::config::PersistenceContextType;
use crate::core::{EntityKey, Identifier, PersistenceError, Result};
use crate::entity::{Association, EntityRef, EntitySnapshot, InstanceId};
use crate::metamodel::{CascadeType, RelationshipEdge};
use crate::store::Record;
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use tracing::{trace, warn};

/// Bookkeeping of one load: rows still to be wired into instances, the
/// instances wired so far and the entries this load created.
#[derive(Default)]
struct Hydration {
    worklist: VecDeque<(EntityRef, Record)>,
    loaded: Vec<EntityRef>,
    created: Vec<InstanceId>,
    /// Map-valued associations are keyed once every target is hydrated.
    keyed: Vec<(EntityRef, String, String, Vec<EntityRef>)>,
}

impl PersistenceContext {
    /// Finds the instance of `entity_type` (or a subtype) with `id`.
    ///
    /// The identity map is consulted first, then the second-level cache and
    /// the store. Loaded instances are managed, with their associations
    /// loaded as well. In a transaction-scoped context without an active
    /// transaction the result comes back detached.
    pub async fn find(
        &mut self,
        entity_type: &str,
        id: impl Into<Identifier>,
    ) -> Result<Option<EntityRef>> {
        self.ensure_open()?;
        let descriptor = self
            .unit
            .metamodel
            .try_entity(entity_type)
            .cloned()
            .ok_or_else(|| {
                PersistenceError::IllegalArgument(format!("'{}' is not an entity type", entity_type))
            })?;
        let key = descriptor.key(id.into());

        if let Some(entry) = self.identity_map.find_by_key(&key) {
            if entry.state == EntityState::Removed || !entry.descriptor.is_subtype_of(entity_type) {
                return Ok(None);
            }
            return Ok(Some(entry.instance.clone()));
        }

        let result = self.load_graph(entity_type, key).await;
        let result = self.guard(result);
        if self.context_type == PersistenceContextType::Transaction && self.transaction.is_none() {
            self.detach_all();
        }
        result
    }

    /// Loads the row for `key` and everything it is associated with.
    pub(super) async fn load_graph(
        &mut self,
        entity_type: &str,
        key: EntityKey,
    ) -> Result<Option<EntityRef>> {
        let Some(record) = self.fetch_record(entity_type, &key).await? else {
            trace!(%key, "not found");
            return Ok(None);
        };
        if !self.unit.metamodel.is_subtype(&record.concrete_type, entity_type) {
            trace!(%key, concrete = %record.concrete_type, "row is of another type");
            return Ok(None);
        }

        let mut hydration = Hydration::default();
        let instance = self.instance_for_record(record, &mut hydration)?;
        self.hydrate(hydration).await?;
        Ok(Some(instance))
    }

    /// Row for `key`: from the cache when retrieval is enabled, otherwise
    /// from the store, caching what the store returns unless the row was
    /// written by the current transaction.
    async fn fetch_record(&self, entity_type: &str, key: &EntityKey) -> Result<Option<Record>> {
        if self.retrieve_mode == CacheRetrieveMode::Use {
            if let Some(record) = self.unit.cache.get(entity_type, key) {
                trace!(%key, "cache hit");
                return Ok(Some(record));
            }
        }

        let record = self.unit.store.select(key).await?;
        if let Some(record) = &record {
            let written_here = self
                .transaction
                .as_ref()
                .is_some_and(|t| t.touched.contains(key));
            if self.store_mode != CacheStoreMode::Bypass && !written_here {
                self.unit.cache.put(record.clone());
            }
        }
        Ok(record)
    }

    /// Managed instance for `record`, reusing the tracked one for its key.
    fn instance_for_record(&mut self, record: Record, hydration: &mut Hydration) -> Result<EntityRef> {
        if let Some(entry) = self.identity_map.find_by_key(&record.key) {
            return Ok(entry.instance.clone());
        }
        let descriptor = self.unit.metamodel.entity(&record.concrete_type)?.clone();
        let instance = EntityRef::new(record.concrete_type.clone());
        instance.set_id(record.key.id().clone());

        let mut entry = ManagedEntry::new(instance.clone(), descriptor);
        entry.key = Some(record.key.clone());
        entry.snapshot = Some(EntitySnapshot::capture(&instance));
        self.identity_map.insert(entry)?;

        hydration.created.push(instance.instance_id());
        hydration.worklist.push_back((instance.clone(), record));
        Ok(instance)
    }

    async fn instance_for_key(
        &mut self,
        edge: &RelationshipEdge,
        key: &EntityKey,
        hydration: &mut Hydration,
    ) -> Result<Option<EntityRef>> {
        if let Some(entry) = self.identity_map.find_by_key(key) {
            return Ok(Some(entry.instance.clone()));
        }
        match self.fetch_record(&edge.target, key).await? {
            Some(record) => Ok(Some(self.instance_for_record(record, hydration)?)),
            None => {
                warn!(%key, relationship = %edge.name, "dangling reference");
                Ok(None)
            }
        }
    }

    /// Wires every queued row into its instance. Entries created by a
    /// failed load are dropped again.
    async fn hydrate(&mut self, mut hydration: Hydration) -> Result<Vec<EntityRef>> {
        match self.hydrate_rows(&mut hydration).await {
            Ok(()) => Ok(hydration.loaded),
            Err(e) => {
                for id in hydration.created {
                    self.identity_map.remove(id);
                }
                Err(e)
            }
        }
    }

    async fn hydrate_rows(&mut self, hydration: &mut Hydration) -> Result<()> {
        let unit = self.unit.clone();
        while let Some((instance, record)) = hydration.worklist.pop_front() {
            let descriptor = unit.metamodel.entity(&record.concrete_type)?.clone();
            let mut associations = BTreeMap::new();

            for edge in descriptor.relationships() {
                let mut targets = Vec::new();
                if edge.is_owning() {
                    let keys = record.references.get(&edge.name).cloned().unwrap_or_default();
                    for key in keys {
                        if let Some(target) = self.instance_for_key(edge, &key, hydration).await? {
                            targets.push(target);
                        }
                    }
                } else {
                    let target_root = unit.metamodel.entity(&edge.target)?.root().to_string();
                    let mapped_by = edge.mapped_by.as_deref().unwrap_or_default();
                    let rows = unit
                        .store
                        .select_referencing(&target_root, mapped_by, &record.key)
                        .await?;
                    for row in rows {
                        if unit.metamodel.is_subtype(&row.concrete_type, &edge.target) {
                            targets.push(self.instance_for_record(row, hydration)?);
                        }
                    }
                }

                let association = if edge.multiplicity.is_single_valued() {
                    Association::One(targets.into_iter().next())
                } else if let Some(map_key) = &edge.map_key {
                    hydration.keyed.push((
                        instance.clone(),
                        edge.name.clone(),
                        map_key.clone(),
                        targets,
                    ));
                    Association::Keyed(BTreeMap::new())
                } else {
                    Association::Many(targets)
                };
                associations.insert(edge.name.clone(), association);
            }

            instance.set_id(record.key.id().clone());
            instance.replace_state(record.attributes.clone(), associations);
            instance.update_metadata(|m| {
                m.persisted = true;
                m.loaded_at = Some(Utc::now());
            });
            hydration.loaded.push(instance);
        }

        for (owner, name, map_key, targets) in hydration.keyed.drain(..) {
            let keyed = targets
                .into_iter()
                .map(|t| (t.get(&map_key).to_string(), t))
                .collect();
            owner.set_association(name, Association::Keyed(keyed));
        }

        for instance in &hydration.loaded {
            if let Some(entry) = self.identity_map.get_mut(instance.instance_id()) {
                entry.snapshot = Some(EntitySnapshot::capture(instance));
            }
        }
        for instance in &hydration.loaded {
            let descriptor = unit.metamodel.entity(instance.entity_type())?;
            unit.dispatcher
                .dispatch(descriptor, LifecycleEvent::PostLoad, instance)?;
        }
        trace!(loaded = hydration.loaded.len(), "hydrated");
        Ok(())
    }

    /// Overwrites `entity` and everything reachable through REFRESH cascades
    /// with the stored state, discarding unflushed changes.
    pub async fn refresh(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        self.require_for_mutation("refresh")?;
        let result = self.refresh_graph(entity).await;
        self.guard(result)
    }

    async fn refresh_graph(&mut self, root: &EntityRef) -> Result<()> {
        let unit = self.unit.clone();
        unit.metamodel.entity(root.entity_type())?;
        let nodes = CascadeResolver::new(&unit.metamodel).collect(root, CascadeType::Refresh)?;
        for node in &nodes {
            self.identity_map.state_of(&node.instance).refresh(&node.instance)?;
        }

        let mut hydration = Hydration::default();
        for node in nodes {
            let key = match self.identity_map.entry_of(&node.instance) {
                Some(entry) if entry.is_stored() => entry.key.clone(),
                _ => None,
            }
            .ok_or_else(|| {
                PersistenceError::EntityNotFound(format!("{:?} has not been written yet", node.instance))
            })?;
            let record = unit
                .store
                .select(&key)
                .await?
                .ok_or_else(|| PersistenceError::EntityNotFound(format!("{} no longer exists", key)))?;
            if self.store_mode == CacheStoreMode::Refresh {
                unit.cache.put(record.clone());
            }
            hydration.worklist.push_back((node.instance, record));
        }
        self.hydrate(hydration).await?;
        Ok(())
    }
}
