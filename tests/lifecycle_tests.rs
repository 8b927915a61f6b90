/// Entity lifecycle tests
///
/// persist / remove / detach / find through a persistence context, the
/// transaction requirements of each context type, and rollback.
/// Run with: cargo test --test lifecycle_tests

use rustmemorm::{
    DataType, EntityRef, EntityState, EntityType, GenerationStrategy, Identifier, IdentifierKind,
    InMemoryStore, LifecycleEvent, Metamodel, MetamodelBuilder, PersistenceContextType,
    PersistenceError, PersistenceUnit, PersistenceUnitConfig, RelationshipEdge, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn metamodel() -> Metamodel {
    MetamodelBuilder::new()
        .add(
            EntityType::entity("Customer")
                .id(IdentifierKind::Assigned)
                .attr("name", DataType::Text)
                .attr("version", DataType::Integer)
                .version("version"),
        )
        .add(
            EntityType::entity("Invoice")
                .id(IdentifierKind::Generated(GenerationStrategy::Sequence))
                .attr("amount", DataType::Integer)
                .relationship(RelationshipEdge::many_to_one("customer", "Customer").optional(false)),
        )
        .add(
            EntityType::entity("Party")
                .id(IdentifierKind::Assigned)
                .abstract_type(),
        )
        .add(EntityType::entity("Company").extends("Party"))
        .add(EntityType::embeddable("Address").attr("city", DataType::Text))
        .build()
        .unwrap()
}

fn unit() -> (PersistenceUnit, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let unit = PersistenceUnit::new(PersistenceUnitConfig::new("lifecycle"), metamodel(), store.clone());
    (unit, store)
}

fn customer(id: i64, name: &str) -> EntityRef {
    EntityRef::new("Customer").with_id(id).with("name", name)
}

#[tokio::test]
async fn test_persist_commit_and_find() {
    let (unit, store) = unit();

    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    let alice = customer(1, "Alice");
    ctx.persist(&alice).unwrap();
    assert!(ctx.contains(&alice).unwrap());
    assert_eq!(ctx.state_of(&alice), EntityState::Managed);
    ctx.commit().await.unwrap();

    // Transaction-scoped: everything is detached at commit
    assert!(!ctx.contains(&alice).unwrap());
    assert_eq!(ctx.state_of(&alice), EntityState::Detached);
    assert!(alice.is_persisted());
    assert_eq!(alice.get("version"), Value::Integer(1));
    assert_eq!(store.row_count("Customer").await, 1);

    let mut other = unit.create_context();
    other.begin().await.unwrap();
    let first = other.find("Customer", 1).await.unwrap().unwrap();
    let second = other.find("Customer", 1).await.unwrap().unwrap();
    assert!(first.same_instance(&second));
    assert!(!first.same_instance(&alice));
    assert_eq!(first.get("name").as_str(), Some("Alice"));
    assert!(other.find("Customer", 2).await.unwrap().is_none());
    other.commit().await.unwrap();
}

#[tokio::test]
async fn test_persist_detached_is_rejected() {
    let (unit, _store) = unit();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    let alice = customer(1, "Alice");
    ctx.persist(&alice).unwrap();
    ctx.commit().await.unwrap();

    ctx.begin().await.unwrap();
    let err = ctx.persist(&alice).unwrap_err();
    assert!(matches!(err, PersistenceError::EntityExists(_)));
    assert!(ctx.is_rollback_only());
    let err = ctx.commit().await.unwrap_err();
    assert!(matches!(err, PersistenceError::RollbackOnly(_)));
    assert!(!ctx.is_transaction_active());
}

#[tokio::test]
async fn test_remove_rules() {
    let (unit, store) = unit();
    let mut ctx = unit.create_context_of(PersistenceContextType::Extended);
    ctx.begin().await.unwrap();

    // Removing a new instance is ignored
    let stranger = customer(9, "Stranger");
    ctx.remove(&stranger).unwrap();
    assert_eq!(ctx.state_of(&stranger), EntityState::New);

    let alice = customer(1, "Alice");
    ctx.persist(&alice).unwrap();
    ctx.commit().await.unwrap();

    ctx.begin().await.unwrap();
    ctx.remove(&alice).unwrap();
    assert_eq!(ctx.state_of(&alice), EntityState::Removed);
    assert!(!ctx.contains(&alice).unwrap());
    // Removing twice is ignored, persisting again cancels the removal
    ctx.remove(&alice).unwrap();
    ctx.persist(&alice).unwrap();
    assert_eq!(ctx.state_of(&alice), EntityState::Managed);
    ctx.commit().await.unwrap();
    assert_eq!(store.row_count("Customer").await, 1);

    ctx.begin().await.unwrap();
    ctx.detach(&alice).unwrap();
    let err = ctx.remove(&alice).unwrap_err();
    assert!(matches!(err, PersistenceError::IllegalArgument(_)));
    // API misuse does not doom the transaction
    assert!(!ctx.is_rollback_only());
    ctx.commit().await.unwrap();
}

#[tokio::test]
async fn test_removed_before_flush_is_never_written() {
    let (unit, store) = unit();
    let pre_remove = Arc::new(AtomicUsize::new(0));
    let post_remove = Arc::new(AtomicUsize::new(0));
    let counter = pre_remove.clone();
    unit.add_listener("Customer", LifecycleEvent::PreRemove, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    let counter = post_remove.clone();
    unit.add_listener("Customer", LifecycleEvent::PostRemove, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    let ghost = customer(7, "Ghost");
    ctx.persist(&ghost).unwrap();
    ctx.remove(&ghost).unwrap();
    ctx.commit().await.unwrap();

    assert_eq!(store.row_count("Customer").await, 0);
    assert_eq!(store.stats().deletes(), 0);
    assert_eq!(pre_remove.load(Ordering::SeqCst), 1);
    assert_eq!(post_remove.load(Ordering::SeqCst), 0);
    assert!(!ghost.is_persisted());
}

#[tokio::test]
async fn test_generated_identifiers_are_assigned_at_flush() {
    let (unit, _store) = unit();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();

    let acme = customer(1, "Acme");
    ctx.persist(&acme).unwrap();
    let first = EntityRef::new("Invoice").with("amount", 10);
    first.set_reference("customer", Some(acme.clone()));
    let second = EntityRef::new("Invoice").with("amount", 20);
    second.set_reference("customer", Some(acme.clone()));
    ctx.persist(&first).unwrap();
    ctx.persist(&second).unwrap();
    assert!(first.id().is_none());

    ctx.flush().await.unwrap();
    assert_eq!(first.id(), Some(Identifier::from(1)));
    assert_eq!(second.id(), Some(Identifier::from(2)));
    ctx.commit().await.unwrap();

    ctx.begin().await.unwrap();
    let loaded = ctx.find("Invoice", 2).await.unwrap().unwrap();
    let owner = loaded.reference("customer").unwrap();
    assert_eq!(owner.get("name").as_str(), Some("Acme"));
    ctx.commit().await.unwrap();
}

#[tokio::test]
async fn test_transient_reference_fails_flush() {
    let (unit, store) = unit();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();

    let nobody = EntityRef::new("Customer").with("name", "Nobody");
    let invoice = EntityRef::new("Invoice").with("amount", 5);
    invoice.set_reference("customer", Some(nobody));
    ctx.persist(&invoice).unwrap();

    let err = ctx.flush().await.unwrap_err();
    assert!(matches!(err, PersistenceError::ConstraintViolation(_)));
    assert!(ctx.is_rollback_only());
    assert!(matches!(
        ctx.commit().await.unwrap_err(),
        PersistenceError::RollbackOnly(_)
    ));
    assert_eq!(store.row_count("Invoice").await, 0);
}

#[tokio::test]
async fn test_missing_required_reference() {
    let (unit, _store) = unit();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    ctx.persist(&EntityRef::new("Invoice").with("amount", 5)).unwrap();
    let err = ctx.commit().await.unwrap_err();
    assert!(matches!(err, PersistenceError::ConstraintViolation(_)));
    assert!(!ctx.is_transaction_active());
}

#[tokio::test]
async fn test_transaction_requirements() {
    let (unit, _store) = unit();

    let mut scoped = unit.create_context();
    let alice = customer(1, "Alice");
    assert!(matches!(
        scoped.persist(&alice).unwrap_err(),
        PersistenceError::TransactionRequired(_)
    ));
    assert!(matches!(
        scoped.flush().await.unwrap_err(),
        PersistenceError::TransactionRequired(_)
    ));
    assert!(matches!(
        scoped.commit().await.unwrap_err(),
        PersistenceError::IllegalState(_)
    ));

    let mut extended = unit.create_context_of(PersistenceContextType::Extended);
    extended.persist(&alice).unwrap();
    assert!(matches!(
        extended.flush().await.unwrap_err(),
        PersistenceError::TransactionRequired(_)
    ));
    // Queued work is written by the next transaction
    extended.begin().await.unwrap();
    extended.commit().await.unwrap();
    assert!(alice.is_persisted());
    assert!(extended.contains(&alice).unwrap());

    extended.begin().await.unwrap();
    assert!(matches!(
        extended.begin().await.unwrap_err(),
        PersistenceError::IllegalState(_)
    ));
    extended.rollback().await.unwrap();
}

#[tokio::test]
async fn test_find_outside_transaction_detaches() {
    let (unit, _store) = unit();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    ctx.persist(&customer(1, "Alice")).unwrap();
    ctx.commit().await.unwrap();

    let found = ctx.find("Customer", 1).await.unwrap().unwrap();
    assert_eq!(found.get("name").as_str(), Some("Alice"));
    assert!(!ctx.contains(&found).unwrap());
    assert_eq!(ctx.state_of(&found), EntityState::Detached);
}

#[tokio::test]
async fn test_rollback_detaches_and_undoes_writes() {
    let (unit, store) = unit();
    let mut ctx = unit.create_context_of(PersistenceContextType::Extended);
    ctx.begin().await.unwrap();
    let alice = customer(1, "Alice");
    ctx.persist(&alice).unwrap();
    ctx.flush().await.unwrap();
    assert_eq!(store.row_count("Customer").await, 1);

    ctx.rollback().await.unwrap();
    assert_eq!(store.row_count("Customer").await, 0);
    assert!(!ctx.contains(&alice).unwrap());
    assert!(!alice.is_persisted());
    assert_eq!(ctx.state_of(&alice), EntityState::New);

    // The instance can be persisted again
    ctx.begin().await.unwrap();
    ctx.persist(&alice).unwrap();
    ctx.commit().await.unwrap();
    assert_eq!(store.row_count("Customer").await, 1);
}

#[tokio::test]
async fn test_rolled_back_delete_leaves_instance_detached() {
    let (unit, store) = unit();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    ctx.persist(&customer(7, "Gina")).unwrap();
    ctx.commit().await.unwrap();

    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    let gina = ctx.find("Customer", 7).await.unwrap().unwrap();
    ctx.remove(&gina).unwrap();
    ctx.flush().await.unwrap();
    assert_eq!(store.row_count("Customer").await, 0);
    assert!(!gina.is_persisted());

    ctx.rollback().await.unwrap();
    assert_eq!(store.row_count("Customer").await, 1);
    assert!(gina.is_persisted());
    assert_eq!(ctx.state_of(&gina), EntityState::Detached);

    ctx.begin().await.unwrap();
    assert!(matches!(
        ctx.remove(&gina).unwrap_err(),
        PersistenceError::IllegalArgument(_)
    ));
    assert!(matches!(
        ctx.persist(&gina).unwrap_err(),
        PersistenceError::EntityExists(_)
    ));
    ctx.rollback().await.unwrap();
    assert_eq!(store.row_count("Customer").await, 1);
}

#[tokio::test]
async fn test_rollback_clears_generated_identifiers() {
    let (unit, store) = unit();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    let acme = customer(1, "Acme");
    let invoice = EntityRef::new("Invoice").with("amount", 10);
    invoice.set_reference("customer", Some(acme.clone()));
    ctx.persist(&acme).unwrap();
    ctx.persist(&invoice).unwrap();
    ctx.flush().await.unwrap();
    assert_eq!(invoice.id(), Some(Identifier::from(1)));

    ctx.rollback().await.unwrap();
    assert_eq!(invoice.id(), None);
    assert_eq!(acme.id(), Some(Identifier::from(1)));
    assert_eq!(ctx.state_of(&invoice), EntityState::New);

    ctx.begin().await.unwrap();
    ctx.persist(&acme).unwrap();
    ctx.persist(&invoice).unwrap();
    ctx.commit().await.unwrap();
    assert_eq!(invoice.id(), Some(Identifier::from(2)));
    assert_eq!(store.row_count("Invoice").await, 1);
}

#[tokio::test]
async fn test_optimistic_lock_on_concurrent_update() {
    let (unit, _store) = unit();
    let mut setup = unit.create_context();
    setup.begin().await.unwrap();
    setup.persist(&customer(1, "Alice")).unwrap();
    setup.commit().await.unwrap();

    let mut first = unit.create_context();
    let mut second = unit.create_context();
    first.begin().await.unwrap();
    second.begin().await.unwrap();
    let a = first.find("Customer", 1).await.unwrap().unwrap();
    let b = second.find("Customer", 1).await.unwrap().unwrap();

    a.set("name", "Alicia");
    first.commit().await.unwrap();
    assert_eq!(a.get("version"), Value::Integer(2));

    b.set("name", "Ally");
    let err = second.commit().await.unwrap_err();
    assert!(matches!(err, PersistenceError::OptimisticLock(_)));
}

#[tokio::test]
async fn test_invalid_types_and_closed_context() {
    let (unit, _store) = unit();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();

    let party = EntityRef::new("Party").with_id(1);
    assert!(matches!(
        ctx.persist(&party).unwrap_err(),
        PersistenceError::IllegalArgument(_)
    ));
    ctx.persist(&EntityRef::new("Company").with_id(2)).unwrap();

    let address = EntityRef::new("Address").with("city", "Oslo");
    assert!(matches!(
        ctx.persist(&address).unwrap_err(),
        PersistenceError::IllegalState(_)
    ));
    assert!(matches!(
        ctx.contains(&address).unwrap_err(),
        PersistenceError::IllegalArgument(_)
    ));
    assert!(matches!(
        ctx.find("Address", 1).await.unwrap_err(),
        PersistenceError::IllegalArgument(_)
    ));

    ctx.close().await.unwrap();
    assert!(!ctx.is_open());
    assert!(matches!(
        ctx.persist(&EntityRef::new("Company").with_id(3)).unwrap_err(),
        PersistenceError::IllegalState(_)
    ));
    assert!(matches!(
        ctx.find("Company", 2).await.unwrap_err(),
        PersistenceError::IllegalState(_)
    ));
    assert!(ctx.close().await.is_err());
}
