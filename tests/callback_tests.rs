/// Lifecycle callback tests
///
/// Invocation order across entity methods, default listeners, entity
/// listeners and dynamically registered listeners; XML overrides;
/// failures and cancellation.
/// Run with: cargo test --test callback_tests

use rustmemorm::{
    DataType, EntityListener, EntityRef, EntityType, IdentifierKind, LifecycleEvent, Metamodel,
    MetamodelBuilder, PersistenceError, PersistenceUnit, PersistenceUnitConfig,
};
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, label: &'static str) -> impl Fn(&EntityRef) -> anyhow::Result<()> + Send + Sync + 'static {
    let log = log.clone();
    move |_| {
        log.lock().unwrap().push(label.to_string());
        Ok(())
    }
}

fn metamodel(log: &Log) -> Metamodel {
    MetamodelBuilder::new()
        .add(
            EntityType::entity("Animal")
                .id(IdentifierKind::Assigned)
                .attr("name", DataType::Text)
                .attr("stamp", DataType::Text)
                .on(LifecycleEvent::PrePersist, "checkAnimal", record(log, "Animal.checkAnimal"))
                .on(LifecycleEvent::PreUpdate, "touch", |e: &EntityRef| {
                    e.set("stamp", "touched");
                    Ok(())
                })
                .listener(EntityListener::new("AnimalAudit").on(LifecycleEvent::PrePersist, record(log, "AnimalAudit"))),
        )
        .add(
            EntityType::entity("Dog")
                .extends("Animal")
                .on(LifecycleEvent::PrePersist, "checkDog", record(log, "Dog.checkDog"))
                .listener(EntityListener::new("DogAudit").on(LifecycleEvent::PrePersist, record(log, "DogAudit"))),
        )
        .add(
            EntityType::entity("Cat")
                .extends("Animal")
                .exclude_default_listeners()
                .exclude_superclass_listeners(),
        )
        .add(
            EntityType::entity("Plant")
                .id(IdentifierKind::Assigned)
                .exclude_default_listeners()
                .on(LifecycleEvent::PrePersist, "grow", record(log, "annotation"))
                .on_xml(LifecycleEvent::PrePersist, "growFromXml", record(log, "xml")),
        )
        .add(
            EntityType::entity("Fragile")
                .id(IdentifierKind::Assigned)
                .on(LifecycleEvent::PrePersist, "refuse", |_: &EntityRef| {
                    Err(anyhow::anyhow!("fragile instances cannot be stored"))
                }),
        )
        .default_listener(EntityListener::new("GlobalAudit").on(LifecycleEvent::PrePersist, record(log, "GlobalAudit")))
        .build()
        .unwrap()
}

fn setup() -> (PersistenceUnit, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let unit = PersistenceUnit::in_memory(PersistenceUnitConfig::new("callbacks"), metamodel(&log));
    (unit, log)
}

fn drain(log: &Log) -> Vec<String> {
    std::mem::take(&mut *log.lock().unwrap())
}

#[tokio::test]
async fn test_invocation_order() {
    let (unit, log) = setup();
    unit.add_listener("Animal", LifecycleEvent::PrePersist, record(&log, "dynamic"))
        .unwrap();

    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    ctx.persist(&EntityRef::new("Dog").with_id(1)).unwrap();
    assert_eq!(
        drain(&log),
        vec![
            "Animal.checkAnimal",
            "Dog.checkDog",
            "GlobalAudit",
            "AnimalAudit",
            "DogAudit",
            "dynamic"
        ]
    );

    ctx.persist(&EntityRef::new("Cat").with_id(2)).unwrap();
    assert_eq!(drain(&log), vec!["Animal.checkAnimal", "dynamic"]);
    ctx.commit().await.unwrap();
}

#[tokio::test]
async fn test_xml_declaration_overrides_annotation() {
    let (unit, log) = setup();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    ctx.persist(&EntityRef::new("Plant").with_id(1)).unwrap();
    let fired = drain(&log);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0], "xml");
    ctx.commit().await.unwrap();
}

#[tokio::test]
async fn test_failing_callback_aborts_and_dooms_transaction() {
    let (unit, _log) = setup();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    let fragile = EntityRef::new("Fragile").with_id(1);

    let err = ctx.persist(&fragile).unwrap_err();
    match &err {
        PersistenceError::CallbackFailure { entity, event, .. } => {
            assert_eq!(entity, "Fragile");
            assert_eq!(event, "PrePersist");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!ctx.contains(&fragile).unwrap());
    assert!(ctx.is_rollback_only());
    assert!(matches!(
        ctx.commit().await.unwrap_err(),
        PersistenceError::RollbackOnly(_)
    ));
}

#[tokio::test]
async fn test_update_and_load_callbacks() {
    let (unit, log) = setup();
    let updates = unit
        .add_listener("Animal", LifecycleEvent::PostUpdate, record(&log, "updated"))
        .unwrap();
    let loads = unit
        .add_listener("Dog", LifecycleEvent::PostLoad, record(&log, "loaded"))
        .unwrap();

    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    ctx.persist(&EntityRef::new("Dog").with_id(1).with("name", "Rex")).unwrap();
    ctx.commit().await.unwrap();
    drain(&log);

    // Clean instances are not updated
    ctx.begin().await.unwrap();
    let rex = ctx.find("Animal", 1).await.unwrap().unwrap();
    assert_eq!(rex.entity_type(), "Dog");
    ctx.commit().await.unwrap();
    assert_eq!(drain(&log), vec!["loaded"]);

    ctx.begin().await.unwrap();
    let rex = ctx.find("Dog", 1).await.unwrap().unwrap();
    rex.set("name", "Rex II");
    ctx.commit().await.unwrap();
    assert_eq!(drain(&log), vec!["loaded", "updated"]);

    // PreUpdate changes made by the callback are written with the update
    ctx.begin().await.unwrap();
    let rex = ctx.find("Dog", 1).await.unwrap().unwrap();
    assert_eq!(rex.get("stamp").as_str(), Some("touched"));
    assert_eq!(rex.get("name").as_str(), Some("Rex II"));
    ctx.commit().await.unwrap();

    assert!(updates.is_active());
    assert!(loads.cancel());
}

#[tokio::test]
async fn test_cancelled_listener_stops_firing() {
    let (unit, log) = setup();
    let registration = unit
        .add_listener("Animal", LifecycleEvent::PostPersist, record(&log, "stored"))
        .unwrap();
    assert_eq!(registration.entity_type(), "Animal");
    assert_eq!(registration.event(), LifecycleEvent::PostPersist);

    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    ctx.persist(&EntityRef::new("Cat").with_id(1)).unwrap();
    ctx.commit().await.unwrap();
    assert!(drain(&log).contains(&"stored".to_string()));

    assert!(registration.cancel());
    assert!(!registration.is_active());
    assert!(!registration.cancel());

    ctx.begin().await.unwrap();
    ctx.persist(&EntityRef::new("Cat").with_id(2)).unwrap();
    ctx.commit().await.unwrap();
    assert!(!drain(&log).contains(&"stored".to_string()));
}

#[tokio::test]
async fn test_listener_requires_entity_type() {
    let (unit, _log) = setup();
    let err = unit
        .add_listener("Unicorn", LifecycleEvent::PostLoad, |_: &EntityRef| Ok(()))
        .unwrap_err();
    assert!(matches!(err, PersistenceError::IllegalArgument(_)));
}
