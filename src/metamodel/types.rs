// ============================================================================
// Mapping Declarations
// ============================================================================
//
// Declarative description of managed types as handed over by a metadata
// loader (annotations, XML descriptors or hand-written code). Declarations are
// validated and flattened by `MetamodelBuilder` into the immutable `Metamodel`.
//
// ============================================================================

use crate::callback::{CallbackFn, LifecycleEvent};
use crate::core::{DataType, PersistenceError, Result, Value};
use crate::entity::EntityRef;
use std::fmt;
use std::sync::Arc;

/// Kind of managed type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedTypeKind {
    /// Has identity, can be persisted and looked up.
    Entity,
    /// Contributes attributes, relationships and callbacks to entity subtypes.
    MappedSuperclass,
    /// Value type without identity (embedded ids, embedded attributes).
    Embeddable,
}

#[derive(Debug, Clone)]
pub struct AttributeDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl AttributeDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn validate(&self, entity: &str, value: &Value) -> Result<()> {
        if value.is_null() {
            if !self.nullable {
                return Err(PersistenceError::ConstraintViolation(format!(
                    "Attribute '{}.{}' cannot be NULL",
                    entity, self.name
                )));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(PersistenceError::ConstraintViolation(format!(
                "Attribute '{}.{}' expects type {}, got {}",
                entity,
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStrategy {
    /// Monotonic integer sequence per hierarchy root, allocated by the store.
    Sequence,
    /// Random v4 UUID allocated by the provider.
    Uuid,
}

/// How an entity hierarchy obtains its primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierKind {
    /// Scalar set by the application before persist.
    Assigned,
    /// Allocated when the instance is inserted.
    Generated(GenerationStrategy),
    /// Composite whose components are the attributes of an embeddable type.
    Embedded { embeddable: String },
    /// Copied from the key of the entity referenced by `association`.
    ///
    /// With no `components` the dependent shares the owner's key. Otherwise
    /// the key is a composite holding the owner key under the association
    /// name plus the named attributes of the dependent itself.
    Derived {
        association: String,
        components: Vec<String>,
    },
}

impl IdentifierKind {
    pub fn derived(association: impl Into<String>) -> Self {
        Self::Derived {
            association: association.into(),
            components: Vec::new(),
        }
    }

    pub fn derived_with<I, S>(association: impl Into<String>, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Derived {
            association: association.into(),
            components: components.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the key only becomes known while flushing.
    pub fn resolved_at_flush(&self) -> bool {
        matches!(self, Self::Generated(_) | Self::Derived { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeType {
    Persist,
    Merge,
    Remove,
    Refresh,
    Detach,
    All,
}

impl CascadeType {
    fn bit(self) -> u8 {
        match self {
            Self::Persist => 1,
            Self::Merge => 1 << 1,
            Self::Remove => 1 << 2,
            Self::Refresh => 1 << 3,
            Self::Detach => 1 << 4,
            Self::All => 0b1_1111,
        }
    }
}

impl fmt::Display for CascadeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persist => write!(f, "PERSIST"),
            Self::Merge => write!(f, "MERGE"),
            Self::Remove => write!(f, "REMOVE"),
            Self::Refresh => write!(f, "REFRESH"),
            Self::Detach => write!(f, "DETACH"),
            Self::All => write!(f, "ALL"),
        }
    }
}

/// Set of operations propagated across a relationship.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeSet(u8);

impl CascadeSet {
    pub fn none() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self(CascadeType::All.bit())
    }

    pub fn with(self, op: CascadeType) -> Self {
        Self(self.0 | op.bit())
    }

    /// `All` is contained only when every individual operation is.
    pub fn contains(&self, op: CascadeType) -> bool {
        let bit = op.bit();
        self.0 & bit == bit
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<CascadeType> for CascadeSet {
    fn from_iter<I: IntoIterator<Item = CascadeType>>(iter: I) -> Self {
        iter.into_iter().fold(Self::none(), Self::with)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

impl Multiplicity {
    pub fn is_single_valued(&self) -> bool {
        matches!(self, Self::OneToOne | Self::ManyToOne)
    }
}

/// Static relationship mapping between two entity types.
#[derive(Debug, Clone)]
pub struct RelationshipEdge {
    pub name: String,
    pub target: String,
    pub multiplicity: Multiplicity,
    pub cascade: CascadeSet,
    /// Name of the owning relationship on the target; `None` on the owning side.
    pub mapped_by: Option<String>,
    /// A non-optional owning reference must point at an existing row.
    pub optional: bool,
    pub orphan_removal: bool,
    /// Target attribute whose value keys a map-valued association.
    pub map_key: Option<String>,
}

impl RelationshipEdge {
    fn new(name: impl Into<String>, target: impl Into<String>, multiplicity: Multiplicity) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            multiplicity,
            cascade: CascadeSet::none(),
            mapped_by: None,
            optional: true,
            orphan_removal: false,
            map_key: None,
        }
    }

    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Multiplicity::OneToOne)
    }

    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Multiplicity::ManyToOne)
    }

    pub fn one_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Multiplicity::OneToMany)
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Multiplicity::ManyToMany)
    }

    pub fn cascade<I: IntoIterator<Item = CascadeType>>(mut self, ops: I) -> Self {
        self.cascade = ops.into_iter().fold(self.cascade, CascadeSet::with);
        self
    }

    pub fn cascade_all(mut self) -> Self {
        self.cascade = CascadeSet::all();
        self
    }

    pub fn mapped_by(mut self, owner: impl Into<String>) -> Self {
        self.mapped_by = Some(owner.into());
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self
    }

    pub fn map_key(mut self, attribute: impl Into<String>) -> Self {
        self.map_key = Some(attribute.into());
        self
    }

    pub fn is_owning(&self) -> bool {
        self.mapped_by.is_none()
    }

    pub fn cascades(&self, op: CascadeType) -> bool {
        self.cascade.contains(op)
    }
}

/// Where a callback method was declared. XML declarations replace annotation
/// declarations for the same (type, event) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclarationSource {
    Annotation,
    Xml,
}

#[derive(Clone)]
pub struct CallbackMethod {
    pub name: String,
    pub event: LifecycleEvent,
    pub source: DeclarationSource,
    pub handler: CallbackFn,
}

impl fmt::Debug for CallbackMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackMethod")
            .field("name", &self.name)
            .field("event", &self.event)
            .field("source", &self.source)
            .finish()
    }
}

/// External listener class with handlers for some lifecycle events.
#[derive(Clone)]
pub struct EntityListener {
    pub name: String,
    pub handlers: Vec<(LifecycleEvent, CallbackFn)>,
}

impl EntityListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
        }
    }

    pub fn on<F>(mut self, event: LifecycleEvent, handler: F) -> Self
    where
        F: Fn(&EntityRef) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.push((event, Arc::new(handler)));
        self
    }

    pub(crate) fn handlers_for(&self, event: LifecycleEvent) -> impl Iterator<Item = &CallbackFn> {
        self.handlers
            .iter()
            .filter(move |(ev, _)| *ev == event)
            .map(|(_, handler)| handler)
    }
}

impl fmt::Debug for EntityListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let events: Vec<_> = self.handlers.iter().map(|(ev, _)| *ev).collect();
        f.debug_struct("EntityListener")
            .field("name", &self.name)
            .field("events", &events)
            .finish()
    }
}

/// Declaration of one managed type.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub name: String,
    pub kind: ManagedTypeKind,
    pub parent: Option<String>,
    pub is_abstract: bool,
    pub identifier: Option<IdentifierKind>,
    pub attributes: Vec<AttributeDef>,
    pub relationships: Vec<RelationshipEdge>,
    pub version_attribute: Option<String>,
    pub cacheable: Option<bool>,
    pub callbacks: Vec<CallbackMethod>,
    pub listeners: Vec<EntityListener>,
    pub exclude_superclass_listeners: bool,
    pub exclude_default_listeners: bool,
}

impl EntityType {
    fn new(name: impl Into<String>, kind: ManagedTypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parent: None,
            is_abstract: false,
            identifier: None,
            attributes: Vec::new(),
            relationships: Vec::new(),
            version_attribute: None,
            cacheable: None,
            callbacks: Vec::new(),
            listeners: Vec::new(),
            exclude_superclass_listeners: false,
            exclude_default_listeners: false,
        }
    }

    pub fn entity(name: impl Into<String>) -> Self {
        Self::new(name, ManagedTypeKind::Entity)
    }

    pub fn mapped_superclass(name: impl Into<String>) -> Self {
        Self::new(name, ManagedTypeKind::MappedSuperclass)
    }

    pub fn embeddable(name: impl Into<String>) -> Self {
        Self::new(name, ManagedTypeKind::Embeddable)
    }

    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn id(mut self, kind: IdentifierKind) -> Self {
        self.identifier = Some(kind);
        self
    }

    pub fn attribute(mut self, attribute: AttributeDef) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn attr(self, name: impl Into<String>, data_type: DataType) -> Self {
        self.attribute(AttributeDef::new(name, data_type))
    }

    pub fn relationship(mut self, edge: RelationshipEdge) -> Self {
        self.relationships.push(edge);
        self
    }

    pub fn version(mut self, attribute: impl Into<String>) -> Self {
        self.version_attribute = Some(attribute.into());
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = Some(cacheable);
        self
    }

    /// Declares a callback method through an annotation.
    pub fn on<F>(self, event: LifecycleEvent, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&EntityRef) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callback(event, method, DeclarationSource::Annotation, handler)
    }

    /// Declares a callback method through an XML descriptor.
    pub fn on_xml<F>(self, event: LifecycleEvent, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&EntityRef) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callback(event, method, DeclarationSource::Xml, handler)
    }

    pub fn callback<F>(
        mut self,
        event: LifecycleEvent,
        method: impl Into<String>,
        source: DeclarationSource,
        handler: F,
    ) -> Self
    where
        F: Fn(&EntityRef) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.push(CallbackMethod {
            name: method.into(),
            event,
            source,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn listener(mut self, listener: EntityListener) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn exclude_superclass_listeners(mut self) -> Self {
        self.exclude_superclass_listeners = true;
        self
    }

    pub fn exclude_default_listeners(mut self) -> Self {
        self.exclude_default_listeners = true;
        self
    }
}
