// ============================================================================
// Entity Instances
// ============================================================================
//
// Application-visible entity instances. An `EntityRef` is a cheap, cloneable
// handle; two handles are the same instance exactly when they point at the
// same cell, which is what "instance identity" means throughout the crate.
// Persistence contexts track instances through these handles but never own
// them: a detached instance keeps its field values after leaving a context.
//
// ============================================================================

use crate::core::{Identifier, Value};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global instance counter
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an instance, ordered by creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Bookkeeping the provider keeps on each instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceMetadata {
    /// Whether a row for this instance exists (or existed) in the store; an
    /// instance with persistent identity outside a context is detached.
    pub persisted: bool,
    /// Timestamp of the insert.
    pub persisted_at: Option<DateTime<Utc>>,
    /// Timestamp of the last flushed update.
    pub updated_at: Option<DateTime<Utc>>,
    /// Timestamp of the last load or refresh from the store or cache.
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Value of a relationship on an instance.
#[derive(Clone)]
pub enum Association {
    One(Option<EntityRef>),
    Many(Vec<EntityRef>),
    Keyed(BTreeMap<String, EntityRef>),
}

impl Association {
    pub fn targets(&self) -> Vec<EntityRef> {
        match self {
            Self::One(target) => target.iter().cloned().collect(),
            Self::Many(targets) => targets.clone(),
            Self::Keyed(targets) => targets.values().cloned().collect(),
        }
    }

    pub fn target_ids(&self) -> Vec<InstanceId> {
        match self {
            Self::One(target) => target.iter().map(EntityRef::instance_id).collect(),
            Self::Many(targets) => targets.iter().map(EntityRef::instance_id).collect(),
            Self::Keyed(targets) => targets.values().map(EntityRef::instance_id).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::One(target) => target.is_none(),
            Self::Many(targets) => targets.is_empty(),
            Self::Keyed(targets) => targets.is_empty(),
        }
    }
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(target) => f.debug_tuple("One").field(&target.as_ref().map(EntityRef::instance_id)).finish(),
            Self::Many(_) => f.debug_tuple("Many").field(&self.target_ids()).finish(),
            Self::Keyed(targets) => {
                let keys: BTreeMap<_, _> = targets.iter().map(|(k, v)| (k, v.instance_id())).collect();
                f.debug_tuple("Keyed").field(&keys).finish()
            }
        }
    }
}

#[derive(Default)]
struct EntityData {
    id: Option<Identifier>,
    attributes: BTreeMap<String, Value>,
    associations: BTreeMap<String, Association>,
    metadata: InstanceMetadata,
}

struct EntityCell {
    instance_id: InstanceId,
    entity_type: String,
    data: RwLock<EntityData>,
}

/// Shared handle to one entity instance.
///
/// Accessors take short-lived locks and hand out clones, so no lock is ever
/// held while another instance is touched.
#[derive(Clone)]
pub struct EntityRef(Arc<EntityCell>);

impl EntityRef {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self(Arc::new(EntityCell {
            instance_id: InstanceId::next(),
            entity_type: entity_type.into(),
            data: RwLock::new(EntityData::default()),
        }))
    }

    pub fn with_id(self, id: impl Into<Identifier>) -> Self {
        self.set_id(id);
        self
    }

    pub fn with(self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(attribute, value);
        self
    }

    pub fn instance_id(&self) -> InstanceId {
        self.0.instance_id
    }

    pub fn entity_type(&self) -> &str {
        &self.0.entity_type
    }

    pub fn same_instance(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn id(&self) -> Option<Identifier> {
        self.0.data.read().id.clone()
    }

    pub fn set_id(&self, id: impl Into<Identifier>) {
        self.0.data.write().id = Some(id.into());
    }

    pub(crate) fn clear_id(&self) {
        self.0.data.write().id = None;
    }

    /// Attribute value, `Value::Null` when never set.
    pub fn get(&self, attribute: &str) -> Value {
        self.0
            .data
            .read()
            .attributes
            .get(attribute)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn set(&self, attribute: impl Into<String>, value: impl Into<Value>) {
        self.0
            .data
            .write()
            .attributes
            .insert(attribute.into(), value.into());
    }

    pub fn attributes(&self) -> BTreeMap<String, Value> {
        self.0.data.read().attributes.clone()
    }

    pub fn association(&self, name: &str) -> Option<Association> {
        self.0.data.read().associations.get(name).cloned()
    }

    pub fn associations(&self) -> BTreeMap<String, Association> {
        self.0.data.read().associations.clone()
    }

    pub fn reference(&self, name: &str) -> Option<EntityRef> {
        match self.association(name) {
            Some(Association::One(target)) => target,
            _ => None,
        }
    }

    pub fn set_reference(&self, name: impl Into<String>, target: Option<EntityRef>) {
        self.set_association(name, Association::One(target));
    }

    /// Elements of a list- or map-valued association.
    pub fn collection(&self, name: &str) -> Vec<EntityRef> {
        self.association(name)
            .map(|a| a.targets())
            .unwrap_or_default()
    }

    pub fn add_to(&self, name: impl Into<String>, target: &EntityRef) {
        let mut data = self.0.data.write();
        let slot = data
            .associations
            .entry(name.into())
            .or_insert_with(|| Association::Many(Vec::new()));
        match slot {
            Association::Many(targets) => targets.push(target.clone()),
            other => *other = Association::Many(vec![target.clone()]),
        }
    }

    pub fn remove_from(&self, name: &str, target: &EntityRef) -> bool {
        let mut data = self.0.data.write();
        match data.associations.get_mut(name) {
            Some(Association::Many(targets)) => {
                let before = targets.len();
                targets.retain(|t| !t.same_instance(target));
                before != targets.len()
            }
            Some(Association::Keyed(targets)) => {
                let before = targets.len();
                targets.retain(|_, t| !t.same_instance(target));
                before != targets.len()
            }
            Some(Association::One(slot)) if slot.as_ref().is_some_and(|t| t.same_instance(target)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn put_keyed(&self, name: impl Into<String>, key: impl Into<String>, target: &EntityRef) {
        let mut data = self.0.data.write();
        let slot = data
            .associations
            .entry(name.into())
            .or_insert_with(|| Association::Keyed(BTreeMap::new()));
        match slot {
            Association::Keyed(targets) => {
                targets.insert(key.into(), target.clone());
            }
            other => {
                let mut targets = BTreeMap::new();
                targets.insert(key.into(), target.clone());
                *other = Association::Keyed(targets);
            }
        }
    }

    pub fn keyed(&self, name: &str) -> BTreeMap<String, EntityRef> {
        match self.association(name) {
            Some(Association::Keyed(targets)) => targets,
            _ => BTreeMap::new(),
        }
    }

    pub fn set_association(&self, name: impl Into<String>, association: Association) {
        self.0
            .data
            .write()
            .associations
            .insert(name.into(), association);
    }

    pub fn metadata(&self) -> InstanceMetadata {
        self.0.data.read().metadata.clone()
    }

    pub fn is_persisted(&self) -> bool {
        self.0.data.read().metadata.persisted
    }

    pub(crate) fn update_metadata(&self, f: impl FnOnce(&mut InstanceMetadata)) {
        f(&mut self.0.data.write().metadata);
    }

    /// Overwrites attributes and associations in one step (load, refresh, merge).
    pub(crate) fn replace_state(
        &self,
        attributes: BTreeMap<String, Value>,
        associations: BTreeMap<String, Association>,
    ) {
        let mut data = self.0.data.write();
        data.attributes = attributes;
        data.associations = associations;
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_instance(other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance_id().hash(state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}{}[{}]", self.entity_type(), self.instance_id(), id),
            None => write!(f, "{}{}[?]", self.entity_type(), self.instance_id()),
        }
    }
}
