use crate::cache::{Cache, SecondLevelCache};
use crate::callback::{CallbackDispatcher, LifecycleEvent, ListenerRegistration, ListenerRegistry};
use crate::config::{PersistenceContextType, PersistenceUnitConfig};
use crate::context::PersistenceContext;
use crate::core::{PersistenceError, Result};
use crate::entity::EntityRef;
use crate::metamodel::Metamodel;
use crate::store::{InMemoryStore, Store};
use std::sync::Arc;
use tracing::info;

/// State shared by every context of a unit. Read-only apart from the cache
/// and the listener registry, which synchronize internally.
pub(crate) struct UnitInner {
    pub(crate) config: PersistenceUnitConfig,
    pub(crate) metamodel: Metamodel,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) cache: Arc<SecondLevelCache>,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) dispatcher: CallbackDispatcher,
}

/// Factory for persistence contexts over one metamodel and one store.
///
/// Cheap to clone; clones share the store, cache and listeners.
#[derive(Clone)]
pub struct PersistenceUnit {
    inner: Arc<UnitInner>,
}

impl PersistenceUnit {
    pub fn new(config: PersistenceUnitConfig, metamodel: Metamodel, store: Arc<dyn Store>) -> Self {
        let cache = Arc::new(SecondLevelCache::new(
            metamodel.clone(),
            config.shared_cache_mode,
            config.cache_capacity,
        ));
        let listeners = ListenerRegistry::new();
        let dispatcher = CallbackDispatcher::new(listeners.clone());
        info!(
            unit = %config.name,
            entities = metamodel.entity_names().len(),
            cache_mode = ?config.shared_cache_mode,
            "persistence unit created"
        );
        Self {
            inner: Arc::new(UnitInner {
                config,
                metamodel,
                store,
                cache,
                listeners,
                dispatcher,
            }),
        }
    }

    /// Unit backed by a fresh `InMemoryStore`.
    pub fn in_memory(config: PersistenceUnitConfig, metamodel: Metamodel) -> Self {
        Self::new(config, metamodel, Arc::new(InMemoryStore::new()))
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &PersistenceUnitConfig {
        &self.inner.config
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.inner.metamodel
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn cache(&self) -> Cache {
        Cache::new(self.inner.cache.clone())
    }

    /// Context of the configured type.
    pub fn create_context(&self) -> PersistenceContext {
        self.create_context_of(self.inner.config.context_type)
    }

    pub fn create_context_of(&self, context_type: PersistenceContextType) -> PersistenceContext {
        PersistenceContext::new(self.inner.clone(), context_type)
    }

    /// Registers a listener for `event` on `entity_type` and its subtypes.
    /// It fires after every statically declared callback.
    pub fn add_listener<F>(
        &self,
        entity_type: &str,
        event: LifecycleEvent,
        handler: F,
    ) -> Result<ListenerRegistration>
    where
        F: Fn(&EntityRef) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if !self.inner.metamodel.is_entity(entity_type) {
            return Err(PersistenceError::IllegalArgument(format!(
                "Cannot listen on '{}': not an entity type",
                entity_type
            )));
        }
        Ok(self.inner.listeners.add(entity_type, event, handler))
    }

    /// Whether instances of `entity_type` go to the second-level cache.
    pub fn is_cacheable(&self, entity_type: &str) -> Result<bool> {
        let descriptor = self.inner.metamodel.entity(entity_type)?;
        Ok(self.inner.cache.is_cacheable(descriptor))
    }
}

impl std::fmt::Debug for PersistenceUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceUnit")
            .field("name", &self.inner.config.name)
            .field("listeners", &self.inner.listeners)
            .finish()
    }
}
