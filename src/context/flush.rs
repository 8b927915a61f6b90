// ============================================================================
// Flush Coordinator
// ============================================================================
//
// Synchronizes the identity map with the store inside the active
// transaction. A flush runs in fixed phases:
//
//   1. orphan removal     dropped targets of orphan-removal edges
//   2. persist-on-flush   PERSIST cascades from every managed entry
//   3. reference check    no managed row may point at transient or removed
//   4. plan               inserts, fixups, updates, nullify, deletes
//   5. execute            in that order, against the store
//
// Inserts are ordered so that a referenced row exists before the row that
// references it. Deletes are ordered the other way around. When a cycle can
// only be broken through an optional relationship, that relationship is
// written in a second statement (fixup on insert, nullify on delete).
//
// ============================================================================

use super::{EntityState, ManagedEntry, PersistenceContext};
use crate::callback::LifecycleEvent;
use crate::core::{EntityKey, Identifier, PersistenceError, Result};
use crate::entity::{EntityRef, EntitySnapshot, InstanceId};
use crate::metamodel::{GenerationStrategy, IdentifierKind};
use crate::store::Record;
use crate::transaction::TransactionId;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, debug_span, trace, Instrument};
use uuid::Uuid;

/// Store statements one flush will issue, in execution order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushPlan {
    pub inserts: Vec<InstanceId>,
    /// Relationships left out of an insert and written afterwards.
    pub fixups: Vec<(InstanceId, Vec<String>)>,
    pub updates: Vec<InstanceId>,
    /// Relationships cleared before the deletes so a cycle can be deleted.
    pub nullify: Vec<(InstanceId, Vec<String>)>,
    pub deletes: Vec<InstanceId>,
    /// Removed before ever being inserted; dropped without a statement.
    pub discards: Vec<InstanceId>,
}

#[derive(Debug, Clone)]
struct Dependency {
    /// Must be handled before the dependent node.
    target: InstanceId,
    /// Row that holds the reference.
    holder: InstanceId,
    relationship: String,
    /// Cannot be broken by writing the relationship separately.
    hard: bool,
    broken: bool,
}

/// Unresolved dependencies of one node on nodes not yet ordered.
#[derive(Debug, Default, Clone, Copy)]
struct Waiting {
    hard: usize,
    soft: usize,
}

impl Waiting {
    fn is_clear(&self) -> bool {
        self.hard == 0 && self.soft == 0
    }
}

/// Kahn ordering with the smallest ready instance first. A blocked graph is
/// unblocked by breaking the soft dependencies of the smallest node that
/// has nothing but soft ones left.
fn order(
    mut nodes: BTreeMap<InstanceId, Vec<Dependency>>,
    what: &str,
) -> Result<(Vec<InstanceId>, BTreeMap<InstanceId, Vec<String>>)> {
    let mut waiting: BTreeMap<InstanceId, Waiting> = BTreeMap::new();
    // target -> (dependent node, index into its dependency list)
    let mut dependents: HashMap<InstanceId, Vec<(InstanceId, usize)>> = HashMap::new();
    for (&node, deps) in &nodes {
        let counts = waiting.entry(node).or_default();
        for (index, dep) in deps.iter().enumerate() {
            if dep.broken || dep.target == node || !nodes.contains_key(&dep.target) {
                continue;
            }
            if dep.hard {
                counts.hard += 1;
            } else {
                counts.soft += 1;
            }
            dependents.entry(dep.target).or_default().push((node, index));
        }
    }

    let mut ready: BTreeSet<InstanceId> = waiting
        .iter()
        .filter(|(_, w)| w.is_clear())
        .map(|(id, _)| *id)
        .collect();
    let mut ordered = Vec::with_capacity(nodes.len());
    let mut broken: BTreeMap<InstanceId, Vec<String>> = BTreeMap::new();

    while !waiting.is_empty() {
        if let Some(id) = ready.pop_first() {
            waiting.remove(&id);
            ordered.push(id);
            for &(node, index) in dependents.get(&id).into_iter().flatten() {
                let dep = &nodes[&node][index];
                if dep.broken {
                    continue;
                }
                if let Some(counts) = waiting.get_mut(&node) {
                    if dep.hard {
                        counts.hard -= 1;
                    } else {
                        counts.soft -= 1;
                    }
                    if counts.is_clear() {
                        ready.insert(node);
                    }
                }
            }
            continue;
        }

        let breakable = waiting
            .iter()
            .find(|(_, w)| w.hard == 0)
            .map(|(id, _)| *id);
        let Some(id) = breakable else {
            let members: Vec<String> = waiting.keys().map(|id| id.to_string()).collect();
            return Err(PersistenceError::ConstraintViolation(format!(
                "Cannot order {}: cycle of required references between instances {}",
                what,
                members.join(", ")
            )));
        };
        if let Some(deps) = nodes.get_mut(&id) {
            for dep in deps.iter_mut() {
                if !dep.broken && dep.target != id && waiting.contains_key(&dep.target) {
                    dep.broken = true;
                    let names = broken.entry(dep.holder).or_default();
                    if !names.contains(&dep.relationship) {
                        names.push(dep.relationship.clone());
                    }
                }
            }
        }
        if let Some(counts) = waiting.get_mut(&id) {
            counts.soft = 0;
        }
        ready.insert(id);
        trace!(instance = %id, what, "dependency cycle broken");
    }
    Ok((ordered, broken))
}

/// Changed declared attributes or owning relationships.
fn is_dirty(entry: &ManagedEntry, snapshot: &EntitySnapshot) -> bool {
    let current = EntitySnapshot::capture(&entry.instance);
    let attributes_changed = snapshot
        .changed_attributes(&current)
        .iter()
        .any(|name| entry.descriptor.attribute(name).is_some());
    attributes_changed
        || entry
            .descriptor
            .owning_relationships()
            .any(|edge| snapshot.association_changed(&current, &edge.name))
}

impl FlushPlan {
    pub fn build(map: &super::IdentityMap) -> Result<Self> {
        let mut plan = FlushPlan::default();
        let mut pending = Vec::new();
        let mut doomed = Vec::new();

        for entry in map.iter() {
            let id = entry.instance.instance_id();
            match (entry.state, &entry.snapshot) {
                (EntityState::Managed, None) => pending.push(id),
                (EntityState::Managed, Some(snapshot)) => {
                    if is_dirty(entry, snapshot) {
                        plan.updates.push(id);
                    }
                }
                (EntityState::Removed, Some(_)) => doomed.push(id),
                (EntityState::Removed, None) => plan.discards.push(id),
                _ => {}
            }
        }

        let (inserts, fixups) = order(Self::insert_dependencies(map, &pending), "inserts")?;
        plan.inserts = inserts;
        plan.fixups = fixups.into_iter().collect();

        let (deletes, nullify) = order(Self::delete_dependencies(map, &doomed), "deletes")?;
        plan.deletes = deletes;
        plan.nullify = nullify.into_iter().collect();

        Ok(plan)
    }

    /// A pending row depends on every pending row it references.
    fn insert_dependencies(
        map: &super::IdentityMap,
        pending: &[InstanceId],
    ) -> BTreeMap<InstanceId, Vec<Dependency>> {
        let pending_set: HashSet<InstanceId> = pending.iter().copied().collect();
        let mut nodes = BTreeMap::new();
        for id in pending {
            let Some(entry) = map.get(*id) else { continue };
            let derived_from = match entry.descriptor.identifier() {
                IdentifierKind::Derived { association, .. } => Some(association.as_str()),
                _ => None,
            };
            let mut deps = Vec::new();
            for edge in entry.descriptor.owning_relationships() {
                let hard = derived_from == Some(edge.name.as_str())
                    || (edge.multiplicity.is_single_valued() && !edge.optional);
                let targets = entry
                    .instance
                    .association(&edge.name)
                    .map(|a| a.target_ids())
                    .unwrap_or_default();
                for target in targets {
                    if target != *id && pending_set.contains(&target) {
                        deps.push(Dependency {
                            target,
                            holder: *id,
                            relationship: edge.name.clone(),
                            hard,
                            broken: false,
                        });
                    }
                }
            }
            nodes.insert(*id, deps);
        }
        nodes
    }

    /// A doomed row must go before every doomed row it referenced when it
    /// was last synchronized.
    fn delete_dependencies(
        map: &super::IdentityMap,
        doomed: &[InstanceId],
    ) -> BTreeMap<InstanceId, Vec<Dependency>> {
        let doomed_set: HashSet<InstanceId> = doomed.iter().copied().collect();
        let mut nodes: BTreeMap<InstanceId, Vec<Dependency>> =
            doomed.iter().map(|id| (*id, Vec::new())).collect();
        for holder in doomed {
            let Some(entry) = map.get(*holder) else { continue };
            let Some(snapshot) = &entry.snapshot else { continue };
            let derived_from = match entry.descriptor.identifier() {
                IdentifierKind::Derived { association, .. } => Some(association.as_str()),
                _ => None,
            };
            for edge in entry.descriptor.owning_relationships() {
                let hard = derived_from == Some(edge.name.as_str())
                    || (edge.multiplicity.is_single_valued() && !edge.optional);
                let targets = snapshot.associations.get(&edge.name).cloned().unwrap_or_default();
                for target in targets {
                    if target == *holder || !doomed_set.contains(&target) {
                        continue;
                    }
                    if let Some(deps) = nodes.get_mut(&target) {
                        deps.push(Dependency {
                            target: *holder,
                            holder: *holder,
                            relationship: edge.name.clone(),
                            hard,
                            broken: false,
                        });
                    }
                }
            }
        }
        nodes
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.fixups.is_empty()
            && self.updates.is_empty()
            && self.nullify.is_empty()
            && self.deletes.is_empty()
            && self.discards.is_empty()
    }

    /// Relationships of `id` written by a fixup instead of its insert.
    pub fn deferred(&self, id: InstanceId) -> &[String] {
        self.fixups
            .iter()
            .find(|(fixed, _)| *fixed == id)
            .map(|(_, names)| names.as_slice())
            .unwrap_or(&[])
    }
}

impl PersistenceContext {
    /// Writes pending changes to the store. Needs an active transaction;
    /// any failure marks it rollback-only.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.require_transaction("flush")?;
        let result = self.flush_inner().await;
        if let Err(e) = &result {
            self.mark_rollback_only(e);
        }
        result
    }

    pub(super) async fn flush_inner(&mut self) -> Result<()> {
        let span = debug_span!("flush", entries = self.identity_map.len());
        self.run_flush().instrument(span).await
    }

    async fn run_flush(&mut self) -> Result<()> {
        let txn = self.active_txn_id()?;

        self.remove_orphans()?;
        self.persist_on_flush()?;
        self.check_references()?;

        let plan = FlushPlan::build(&self.identity_map)?;
        if plan.is_empty() {
            trace!("nothing to flush");
            return Ok(());
        }
        debug!(
            inserts = plan.inserts.len(),
            fixups = plan.fixups.len(),
            updates = plan.updates.len(),
            nullify = plan.nullify.len(),
            deletes = plan.deletes.len(),
            discards = plan.discards.len(),
            "flush planned"
        );

        for id in &plan.inserts {
            let deferred = plan.deferred(*id).to_vec();
            self.execute_insert(txn, *id, &deferred).await?;
        }
        for (id, _) in &plan.fixups {
            self.execute_fixup(txn, *id).await?;
        }
        for id in &plan.updates {
            self.execute_update(txn, *id).await?;
        }
        for (id, relationships) in &plan.nullify {
            self.execute_nullify(txn, *id, relationships).await?;
        }
        for id in &plan.deletes {
            self.execute_delete(txn, *id).await?;
        }
        for id in &plan.discards {
            if let Some(entry) = self.identity_map.remove(*id) {
                trace!(instance = ?entry.instance, "discarded unsaved removal");
            }
        }
        Ok(())
    }

    fn active_txn_id(&self) -> Result<TransactionId> {
        self.transaction
            .as_ref()
            .map(|t| t.id)
            .ok_or_else(|| PersistenceError::TransactionRequired("flush needs an active transaction".into()))
    }

    fn remove_orphans(&mut self) -> Result<()> {
        let mut orphans = Vec::new();
        for entry in self.identity_map.iter() {
            if entry.state != EntityState::Managed {
                continue;
            }
            let Some(snapshot) = &entry.snapshot else { continue };
            let current = EntitySnapshot::capture(&entry.instance);
            for edge in entry.descriptor.relationships().iter().filter(|e| e.orphan_removal) {
                orphans.extend(snapshot.dropped_targets(&current, &edge.name));
            }
        }
        for id in orphans {
            let orphan = match self.identity_map.get(id) {
                Some(entry) if entry.state == EntityState::Managed => entry.instance.clone(),
                _ => continue,
            };
            trace!(instance = ?orphan, "removing orphan");
            self.remove_graph(&orphan)?;
        }
        Ok(())
    }

    fn persist_on_flush(&mut self) -> Result<()> {
        for id in self.identity_map.ids_in_state(EntityState::Managed) {
            let instance = match self.identity_map.get(id) {
                Some(entry) if entry.state == EntityState::Managed => entry.instance.clone(),
                _ => continue,
            };
            self.persist_graph(&instance)?;
        }
        Ok(())
    }

    fn check_references(&self) -> Result<()> {
        let metamodel = &self.unit.metamodel;
        for entry in self.identity_map.iter() {
            if entry.state != EntityState::Managed {
                continue;
            }
            for edge in entry.descriptor.owning_relationships() {
                let Some(association) = entry.instance.association(&edge.name) else {
                    continue;
                };
                for target in association.targets() {
                    if !metamodel.is_subtype(target.entity_type(), &edge.target) {
                        return Err(PersistenceError::ConstraintViolation(format!(
                            "{:?}.{} expects {}, got {:?}",
                            entry.instance, edge.name, edge.target, target
                        )));
                    }
                    match self.identity_map.entry_of(&target) {
                        Some(t) if t.state == EntityState::Removed => {
                            return Err(PersistenceError::ConstraintViolation(format!(
                                "{:?}.{} references removed instance {:?}",
                                entry.instance, edge.name, target
                            )));
                        }
                        Some(_) => {}
                        None if target.id().is_none() => {
                            return Err(PersistenceError::ConstraintViolation(format!(
                                "{:?}.{} references transient instance {:?} (relationship does not cascade PERSIST)",
                                entry.instance, edge.name, target
                            )));
                        }
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn key_of(&self, target: &EntityRef) -> Result<EntityKey> {
        if let Some(entry) = self.identity_map.entry_of(target) {
            return entry.key.clone().ok_or_else(|| {
                PersistenceError::ConstraintViolation(format!("{:?} has no identifier yet", target))
            });
        }
        let id = target.id().ok_or_else(|| {
            PersistenceError::ConstraintViolation(format!("{:?} is transient", target))
        })?;
        Ok(self.unit.metamodel.entity(target.entity_type())?.key(id))
    }

    /// Row image of a tracked instance. `skip` relationships are written
    /// as empty.
    fn build_record(&self, id: InstanceId, skip: &[String]) -> Result<Record> {
        let entry = self.tracked(id)?;
        let descriptor = &entry.descriptor;
        let key = entry.key.clone().ok_or_else(|| {
            PersistenceError::IllegalState(format!("{:?} has no bound key", entry.instance))
        })?;

        let mut record = Record::new(key, descriptor.name());
        for attribute in descriptor.attributes() {
            let value = entry.instance.get(&attribute.name);
            attribute.validate(descriptor.name(), &value)?;
            record.attributes.insert(attribute.name.clone(), value);
        }
        for edge in descriptor.owning_relationships() {
            if skip.contains(&edge.name) {
                record.references.insert(edge.name.clone(), Vec::new());
                continue;
            }
            let targets = entry
                .instance
                .association(&edge.name)
                .map(|a| a.targets())
                .unwrap_or_default();
            let keys = targets
                .iter()
                .map(|t| self.key_of(t))
                .collect::<Result<Vec<_>>>()?;
            if keys.is_empty() && edge.multiplicity.is_single_valued() && !edge.optional {
                return Err(PersistenceError::ConstraintViolation(format!(
                    "Relationship '{}.{}' is not optional",
                    descriptor.name(),
                    edge.name
                )));
            }
            record.references.insert(edge.name.clone(), keys);
        }
        record.version = descriptor
            .version_attribute()
            .and_then(|v| entry.instance.get(v).as_i64());
        Ok(record)
    }

    fn tracked(&self, id: InstanceId) -> Result<&ManagedEntry> {
        self.identity_map
            .get(id)
            .ok_or_else(|| PersistenceError::IllegalState(format!("Instance {} is not tracked", id)))
    }

    /// Works out the key of an instance about to be inserted and binds it.
    async fn resolve_key(&mut self, id: InstanceId) -> Result<EntityKey> {
        let (instance, descriptor) = {
            let entry = self.tracked(id)?;
            (entry.instance.clone(), entry.descriptor.clone())
        };

        let identifier = match descriptor.identifier() {
            IdentifierKind::Assigned => instance
                .id()
                .filter(|id| id.is_complete())
                .ok_or_else(|| {
                    PersistenceError::ConstraintViolation(format!(
                        "{:?} has no assigned identifier",
                        instance
                    ))
                })?,
            IdentifierKind::Embedded { embeddable } => {
                let id = instance.id().ok_or_else(|| {
                    PersistenceError::ConstraintViolation(format!(
                        "{:?} has no embedded identifier",
                        instance
                    ))
                })?;
                self.check_embedded(&instance, embeddable, &id)?;
                id
            }
            IdentifierKind::Generated(GenerationStrategy::Sequence) => {
                Identifier::from(self.unit.store.next_sequence(descriptor.root()).await?)
            }
            IdentifierKind::Generated(GenerationStrategy::Uuid) => Identifier::from(Uuid::new_v4()),
            IdentifierKind::Derived {
                association,
                components,
            } => {
                let owner = instance.reference(association).ok_or_else(|| {
                    PersistenceError::ConstraintViolation(format!(
                        "{:?} derives its identifier from '{}', which is not set",
                        instance, association
                    ))
                })?;
                let owner_id = self.key_of(&owner)?.id().clone();
                if components.is_empty() {
                    owner_id
                } else {
                    let mut parts = vec![(association.clone(), owner_id)];
                    for component in components {
                        parts.push((component.clone(), Identifier::Scalar(instance.get(component))));
                    }
                    let id = Identifier::composite(parts);
                    if !id.is_complete() {
                        return Err(PersistenceError::ConstraintViolation(format!(
                            "Derived identifier of {:?} is incomplete: {}",
                            instance, id
                        )));
                    }
                    id
                }
            }
        };

        instance.set_id(identifier.clone());
        let key = descriptor.key(identifier);
        self.identity_map.bind_key(id, key.clone())?;
        Ok(key)
    }

    fn check_embedded(&self, instance: &EntityRef, embeddable: &str, id: &Identifier) -> Result<()> {
        let attributes = self
            .unit
            .metamodel
            .embeddable_attributes(embeddable)
            .ok_or_else(|| PersistenceError::Configuration(format!("Unknown embeddable '{}'", embeddable)))?;
        let mut expected: Vec<&str> = attributes.iter().map(|a| a.name.as_str()).collect();
        expected.sort_unstable();
        if id.component_names() != expected || !id.is_complete() {
            return Err(PersistenceError::ConstraintViolation(format!(
                "{:?}: identifier {} does not match embeddable {}",
                instance, id, embeddable
            )));
        }
        for attribute in attributes {
            if let Some(value) = id.component(&attribute.name).and_then(Identifier::as_scalar) {
                attribute.validate(embeddable, value)?;
            }
        }
        Ok(())
    }

    fn track_write(&mut self, key: EntityKey, record: Option<Record>) {
        if let Some(txn) = self.transaction.as_mut() {
            txn.touched.insert(key.clone());
            match record {
                Some(record) => {
                    txn.written.insert(key, record);
                }
                None => {
                    txn.written.remove(&key);
                }
            }
        }
    }

    fn refresh_snapshot(&mut self, id: InstanceId) {
        if let Some(entry) = self.identity_map.get_mut(id) {
            entry.snapshot = Some(EntitySnapshot::capture(&entry.instance));
        }
    }

    async fn execute_insert(&mut self, txn: TransactionId, id: InstanceId, deferred: &[String]) -> Result<()> {
        let key = self.resolve_key(id).await?;
        let (instance, descriptor) = {
            let entry = self.tracked(id)?;
            (entry.instance.clone(), entry.descriptor.clone())
        };
        if let Some(version) = descriptor.version_attribute() {
            instance.set(version, 1i64);
        }

        let record = self.build_record(id, deferred)?;
        self.unit.store.insert(txn, record.clone()).await?;
        trace!(%key, "inserted");

        instance.update_metadata(|m| {
            m.persisted = true;
            m.persisted_at = Some(Utc::now());
        });
        self.refresh_snapshot(id);
        self.track_write(key, Some(record));
        let key_from_flush = matches!(
            descriptor.identifier(),
            IdentifierKind::Generated(_) | IdentifierKind::Derived { .. }
        );
        if let Some(txn) = self.transaction.as_mut() {
            txn.inserted.push((instance.clone(), key_from_flush));
        }
        self.unit
            .dispatcher
            .dispatch(&descriptor, LifecycleEvent::PostPersist, &instance)
    }

    async fn execute_fixup(&mut self, txn: TransactionId, id: InstanceId) -> Result<()> {
        let record = self.build_record(id, &[])?;
        let key = record.key.clone();
        self.unit.store.update(txn, record.clone(), record.version).await?;
        trace!(%key, "deferred references written");
        self.track_write(key, Some(record));
        Ok(())
    }

    async fn execute_update(&mut self, txn: TransactionId, id: InstanceId) -> Result<()> {
        let (instance, descriptor, expected) = {
            let entry = self.tracked(id)?;
            let expected = entry.descriptor.version_attribute().and_then(|v| {
                entry
                    .snapshot
                    .as_ref()
                    .and_then(|s| s.attributes.get(v))
                    .and_then(|value| value.as_i64())
            });
            (entry.instance.clone(), entry.descriptor.clone(), expected)
        };

        self.unit
            .dispatcher
            .dispatch(&descriptor, LifecycleEvent::PreUpdate, &instance)?;
        if let Some(version) = descriptor.version_attribute() {
            instance.set(version, expected.unwrap_or(0) + 1);
        }

        let record = self.build_record(id, &[])?;
        let key = record.key.clone();
        self.unit.store.update(txn, record.clone(), expected).await?;
        trace!(%key, "updated");

        instance.update_metadata(|m| m.updated_at = Some(Utc::now()));
        self.refresh_snapshot(id);
        self.unit.cache.invalidate(&key);
        self.track_write(key, Some(record));
        self.unit
            .dispatcher
            .dispatch(&descriptor, LifecycleEvent::PostUpdate, &instance)
    }

    async fn execute_nullify(&mut self, txn: TransactionId, id: InstanceId, relationships: &[String]) -> Result<()> {
        let key = self.tracked(id)?.key.clone().ok_or_else(|| {
            PersistenceError::IllegalState(format!("Instance {} has no bound key", id))
        })?;
        let mut record = self
            .unit
            .store
            .select(&key)
            .await?
            .ok_or_else(|| PersistenceError::EntityNotFound(key.to_string()))?;
        for relationship in relationships {
            record.references.insert(relationship.clone(), Vec::new());
        }
        let expected = record.version;
        self.unit.store.update(txn, record, expected).await?;
        trace!(%key, ?relationships, "references cleared before delete");
        self.track_write(key, None);
        Ok(())
    }

    async fn execute_delete(&mut self, txn: TransactionId, id: InstanceId) -> Result<()> {
        let (key, expected) = {
            let entry = self.tracked(id)?;
            let key = entry.key.clone().ok_or_else(|| {
                PersistenceError::IllegalState(format!("{:?} has no bound key", entry.instance))
            })?;
            let expected = entry.descriptor.version_attribute().and_then(|v| {
                entry
                    .snapshot
                    .as_ref()
                    .and_then(|s| s.attributes.get(v))
                    .and_then(|value| value.as_i64())
            });
            (key, expected)
        };

        self.unit.store.delete(txn, &key, expected).await?;
        trace!(%key, "deleted");
        self.unit.cache.invalidate(&key);
        self.track_write(key, None);

        if let Some(entry) = self.identity_map.remove(id) {
            entry.instance.update_metadata(|m| m.persisted = false);
            if let Some(txn) = self.transaction.as_mut() {
                txn.deleted.push(entry.instance.clone());
            }
            self.unit
                .dispatcher
                .dispatch(&entry.descriptor, LifecycleEvent::PostRemove, &entry.instance)?;
        }
        Ok(())
    }
}
