// ============================================================================
// Lifecycle Callbacks
// ============================================================================
//
// Static callbacks (entity methods, default and entity listeners) are
// resolved into per-type tables when the metamodel is built. Listeners added
// at runtime live in a `ListenerRegistry` shared by the persistence unit and
// are looked up on every dispatch, so a cancelled registration stops firing
// for the very next event.
//
// ============================================================================

use crate::core::{PersistenceError, Result};
use crate::entity::EntityRef;
use crate::metamodel::EntityDescriptor;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecycleEvent {
    PrePersist,
    PostPersist,
    PreRemove,
    PostRemove,
    PreUpdate,
    PostUpdate,
    PostLoad,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 7] = [
        LifecycleEvent::PrePersist,
        LifecycleEvent::PostPersist,
        LifecycleEvent::PreRemove,
        LifecycleEvent::PostRemove,
        LifecycleEvent::PreUpdate,
        LifecycleEvent::PostUpdate,
        LifecycleEvent::PostLoad,
    ];
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PrePersist => "PrePersist",
            Self::PostPersist => "PostPersist",
            Self::PreRemove => "PreRemove",
            Self::PostRemove => "PostRemove",
            Self::PreUpdate => "PreUpdate",
            Self::PostUpdate => "PostUpdate",
            Self::PostLoad => "PostLoad",
        };
        write!(f, "{}", name)
    }
}

/// Callback handler. Errors abort the triggering operation.
pub type CallbackFn = Arc<dyn Fn(&EntityRef) -> anyhow::Result<()> + Send + Sync>;

struct DynamicListener {
    id: u64,
    entity_type: String,
    event: LifecycleEvent,
    handler: CallbackFn,
}

#[derive(Default)]
struct RegistryInner {
    listeners: RwLock<Vec<DynamicListener>>,
    next_id: AtomicU64,
}

/// Listeners added after the metamodel was built, in registration order.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event` on `entity_type` and its subtypes.
    pub fn add<F>(
        &self,
        entity_type: impl Into<String>,
        event: LifecycleEvent,
        handler: F,
    ) -> ListenerRegistration
    where
        F: Fn(&EntityRef) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let entity_type = entity_type.into();
        self.inner.listeners.write().push(DynamicListener {
            id,
            entity_type: entity_type.clone(),
            event,
            handler: Arc::new(handler),
        });
        trace!(id, entity_type = %entity_type, %event, "listener registered");
        ListenerRegistration {
            id,
            entity_type,
            event,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handlers currently registered for `event` on any type in `lineage`.
    fn handlers_for(&self, lineage: &[String], event: LifecycleEvent) -> Vec<(u64, CallbackFn)> {
        self.inner
            .listeners
            .read()
            .iter()
            .filter(|l| l.event == event && lineage.iter().any(|t| *t == l.entity_type))
            .map(|l| (l.id, l.handler.clone()))
            .collect()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

fn remove_listener(inner: &RegistryInner, id: u64) -> bool {
    let mut listeners = inner.listeners.write();
    let before = listeners.len();
    listeners.retain(|l| l.id != id);
    before != listeners.len()
}

/// Handle returned by `ListenerRegistry::add`. Dropping it keeps the
/// listener registered; `cancel` removes it.
#[derive(Debug)]
pub struct ListenerRegistration {
    id: u64,
    entity_type: String,
    event: LifecycleEvent,
    registry: Weak<RegistryInner>,
}

impl ListenerRegistration {
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn event(&self) -> LifecycleEvent {
        self.event
    }

    /// Removes the listener. Returns `false` when it was already cancelled.
    pub fn cancel(&self) -> bool {
        let removed = self
            .registry
            .upgrade()
            .map(|inner| remove_listener(&inner, self.id))
            .unwrap_or(false);
        if removed {
            trace!(id = self.id, entity_type = %self.entity_type, event = %self.event, "listener cancelled");
        }
        removed
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|inner| inner.listeners.read().iter().any(|l| l.id == self.id))
            .unwrap_or(false)
    }
}

/// Invokes the callbacks of one event on one instance.
#[derive(Debug, Clone, Default)]
pub struct CallbackDispatcher {
    listeners: ListenerRegistry,
}

impl CallbackDispatcher {
    pub fn new(listeners: ListenerRegistry) -> Self {
        Self { listeners }
    }

    /// Runs the static table of `descriptor` for `event`, then the dynamic
    /// listeners registered on the type or an ancestor. Stops at the first
    /// failing handler.
    pub fn dispatch(
        &self,
        descriptor: &EntityDescriptor,
        event: LifecycleEvent,
        instance: &EntityRef,
    ) -> Result<()> {
        for callback in descriptor.callbacks(event) {
            (callback.handler)(instance)
                .map_err(|e| failure(descriptor, event, &callback.origin, e))?;
        }

        // Snapshot under the lock, invoke after releasing it: handlers may
        // register or cancel listeners themselves.
        let dynamic = self.listeners.handlers_for(descriptor.lineage(), event);
        for (id, handler) in dynamic {
            handler(instance)
                .map_err(|e| failure(descriptor, event, &format!("listener #{}", id), e))?;
        }
        Ok(())
    }
}

fn failure(
    descriptor: &EntityDescriptor,
    event: LifecycleEvent,
    origin: &str,
    source: anyhow::Error,
) -> PersistenceError {
    warn!(
        entity = descriptor.name(),
        %event,
        origin,
        error = %source,
        "lifecycle callback failed"
    );
    PersistenceError::CallbackFailure {
        entity: descriptor.name().to_string(),
        event: event.to_string(),
        source: source.context(format!("{} raised an error", origin)),
    }
}
