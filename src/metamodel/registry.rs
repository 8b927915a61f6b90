use super::types::{AttributeDef, IdentifierKind, ManagedTypeKind, RelationshipEdge};
use crate::callback::{CallbackFn, LifecycleEvent};
use crate::core::{EntityKey, Identifier, PersistenceError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Callback resolved at metadata-load time, ready to invoke.
#[derive(Clone)]
pub struct ResolvedCallback {
    /// Human-readable source, e.g. `Order.onPrePersist` or `AuditListener`.
    pub origin: String,
    pub handler: CallbackFn,
}

impl fmt::Debug for ResolvedCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCallback").field("origin", &self.origin).finish()
    }
}

/// Flattened, validated view of one entity type with everything inherited
/// from its ancestors already folded in.
#[derive(Debug)]
pub struct EntityDescriptor {
    pub(crate) name: String,
    pub(crate) root: String,
    pub(crate) lineage: Vec<String>,
    pub(crate) is_abstract: bool,
    pub(crate) identifier: IdentifierKind,
    pub(crate) attributes: Vec<AttributeDef>,
    pub(crate) relationships: Vec<RelationshipEdge>,
    pub(crate) version_attribute: Option<String>,
    pub(crate) declared_cacheable: Option<bool>,
    pub(crate) callbacks: HashMap<LifecycleEvent, Vec<ResolvedCallback>>,
}

impl EntityDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Topmost entity of the hierarchy; identity-map keys are scoped to it.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Ancestor chain, root-most declaration first, ending with this type.
    /// Mapped superclasses appear in the chain too.
    pub fn lineage(&self) -> &[String] {
        &self.lineage
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub fn identifier(&self) -> &IdentifierKind {
        &self.identifier
    }

    pub fn attributes(&self) -> &[AttributeDef] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn relationships(&self) -> &[RelationshipEdge] {
        &self.relationships
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipEdge> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn owning_relationships(&self) -> impl Iterator<Item = &RelationshipEdge> {
        self.relationships.iter().filter(|r| r.is_owning())
    }

    pub fn version_attribute(&self) -> Option<&str> {
        self.version_attribute.as_deref()
    }

    /// `Cacheable` value declared on this type or inherited from the nearest
    /// ancestor that declares one.
    pub fn declared_cacheable(&self) -> Option<bool> {
        self.declared_cacheable
    }

    pub fn callbacks(&self, event: LifecycleEvent) -> &[ResolvedCallback] {
        self.callbacks.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_subtype_of(&self, name: &str) -> bool {
        self.lineage.iter().any(|t| t == name)
    }

    pub fn key(&self, id: Identifier) -> EntityKey {
        EntityKey::new(self.root.clone(), id)
    }
}

/// Immutable registry of managed types, shared by every persistence context
/// of a unit. Built once by `MetamodelBuilder`.
#[derive(Debug, Clone, Default)]
pub struct Metamodel {
    pub(crate) kinds: Arc<HashMap<String, ManagedTypeKind>>,
    pub(crate) entities: Arc<HashMap<String, Arc<EntityDescriptor>>>,
    pub(crate) embeddables: Arc<HashMap<String, Vec<AttributeDef>>>,
}

impl Metamodel {
    /// Looks up an entity type. Anything that is not an entity (unknown
    /// names, embeddables, mapped superclasses) is an `IllegalState`.
    pub fn entity(&self, name: &str) -> Result<&Arc<EntityDescriptor>> {
        self.entities.get(name).ok_or_else(|| match self.kinds.get(name) {
            Some(kind) => PersistenceError::IllegalState(format!(
                "'{}' is a {:?}, not an entity type",
                name, kind
            )),
            None => PersistenceError::IllegalState(format!("'{}' is not a known entity type", name)),
        })
    }

    pub fn try_entity(&self, name: &str) -> Option<&Arc<EntityDescriptor>> {
        self.entities.get(name)
    }

    pub fn managed_kind(&self, name: &str) -> Option<ManagedTypeKind> {
        self.kinds.get(name).copied()
    }

    pub fn embeddable_attributes(&self, name: &str) -> Option<&[AttributeDef]> {
        self.embeddables.get(name).map(Vec::as_slice)
    }

    pub fn is_entity(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Whether `sub` is `sup` or one of its descendants.
    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        self.entities
            .get(sub)
            .map(|d| d.is_subtype_of(sup))
            .unwrap_or(false)
    }

    /// `name` and every entity type that descends from it.
    pub fn subtypes_of(&self, name: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entities
            .values()
            .filter(|d| d.is_subtype_of(name))
            .map(|d| d.name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn entity_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
