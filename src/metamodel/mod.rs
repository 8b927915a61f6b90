// ============================================================================
// Metamodel
// ============================================================================
//
// Static mapping metadata: managed types, identifiers, relationships, cascade
// rules and resolved callback tables. Loaded once, then shared read-only by
// every persistence context of a unit.
//
// ============================================================================

pub mod builder;
pub mod registry;
pub mod types;

pub use builder::MetamodelBuilder;
pub use registry::{EntityDescriptor, Metamodel, ResolvedCallback};
pub use types::{
    AttributeDef, CallbackMethod, CascadeSet, CascadeType, DeclarationSource, EntityListener,
    EntityType, GenerationStrategy, IdentifierKind, ManagedTypeKind, Multiplicity,
    RelationshipEdge,
};
