// ============================================================================
// RustMemORM Library
// ============================================================================
//
// Persistence-context engine: an identity map per unit of work, the entity
// lifecycle state machine, cascading of operations over relationship
// graphs, lifecycle callbacks, ordered flushing and a shared second-level
// cache.
//
// ============================================================================

//! # Example
//!
//! ```
//! use rustmemorm::{
//!     DataType, EntityRef, EntityType, IdentifierKind, MetamodelBuilder, PersistenceUnit,
//!     PersistenceUnitConfig,
//! };
//!
//! # tokio_test::block_on(async {
//! let metamodel = MetamodelBuilder::new()
//!     .add(
//!         EntityType::entity("Customer")
//!             .id(IdentifierKind::Assigned)
//!             .attr("name", DataType::Text),
//!     )
//!     .build()?;
//! let unit = PersistenceUnit::in_memory(PersistenceUnitConfig::new("shop"), metamodel);
//!
//! let mut ctx = unit.create_context();
//! ctx.begin().await?;
//! let alice = EntityRef::new("Customer").with_id(1).with("name", "Alice");
//! ctx.persist(&alice)?;
//! ctx.commit().await?;
//!
//! ctx.begin().await?;
//! let found = ctx.find("Customer", 1).await?.expect("stored");
//! assert_eq!(found.get("name").as_str(), Some("Alice"));
//! ctx.commit().await?;
//! # Ok::<(), rustmemorm::PersistenceError>(())
//! # }).unwrap();
//! ```

pub mod cache;
pub mod callback;
pub mod config;
pub mod context;
pub mod core;
pub mod entity;
pub mod facade;
pub mod metamodel;
pub mod store;
pub mod transaction;

pub use cache::{Cache, CacheRetrieveMode, CacheStats, CacheStoreMode, SharedCacheMode};
pub use callback::{LifecycleEvent, ListenerRegistration};
pub use config::{PersistenceContextType, PersistenceUnitConfig};
pub use context::{EntityState, PersistenceContext};
pub use core::{DataType, EntityKey, Identifier, PersistenceError, Result, Value};
pub use entity::{Association, EntityRef, InstanceId};
pub use facade::PersistenceUnit;
pub use metamodel::{
    AttributeDef, CascadeType, EntityListener, EntityType, GenerationStrategy, IdentifierKind,
    Metamodel, MetamodelBuilder, RelationshipEdge,
};
pub use store::{InMemoryStore, Record, Store};
