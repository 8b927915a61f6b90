/// Identifier tests
///
/// Embedded composite keys and identifiers derived from a parent entity,
/// including a dependent whose key is the parent's embedded key.
/// Run with: cargo test --test identifier_tests

use rustmemorm::{
    DataType, EntityRef, EntityType, GenerationStrategy, Identifier, IdentifierKind, Metamodel,
    MetamodelBuilder, PersistenceError, PersistenceUnit, PersistenceUnitConfig, RelationshipEdge,
};

fn metamodel() -> Metamodel {
    MetamodelBuilder::new()
        .add(
            EntityType::embeddable("PersonId")
                .attr("firstName", DataType::Text)
                .attr("lastName", DataType::Text),
        )
        .add(
            EntityType::entity("Person")
                .id(IdentifierKind::Embedded {
                    embeddable: "PersonId".into(),
                })
                .attr("age", DataType::Integer),
        )
        .add(
            EntityType::entity("MedicalHistory")
                .id(IdentifierKind::derived("patient"))
                .attr("notes", DataType::Text)
                .relationship(RelationshipEdge::one_to_one("patient", "Person").optional(false)),
        )
        .add(
            EntityType::entity("Employee")
                .id(IdentifierKind::Generated(GenerationStrategy::Sequence))
                .attr("name", DataType::Text),
        )
        .add(
            EntityType::entity("Dependent")
                .id(IdentifierKind::derived_with("employee", ["name"]))
                .attr("name", DataType::Text)
                .relationship(RelationshipEdge::many_to_one("employee", "Employee").optional(false)),
        )
        .build()
        .unwrap()
}

fn person_id(first: &str, last: &str) -> Identifier {
    Identifier::composite([
        ("firstName", Identifier::from(first)),
        ("lastName", Identifier::from(last)),
    ])
}

fn unit() -> PersistenceUnit {
    PersistenceUnit::in_memory(PersistenceUnitConfig::new("identifiers"), metamodel())
}

#[tokio::test]
async fn test_dependent_shares_embedded_parent_key() {
    let unit = unit();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();

    let george = EntityRef::new("Person")
        .with_id(person_id("George", "Smith"))
        .with("age", 52);
    // Created before its owner, still inserted after it
    let history = EntityRef::new("MedicalHistory").with("notes", "healthy");
    history.set_reference("patient", Some(george.clone()));
    ctx.persist(&history).unwrap();
    ctx.persist(&george).unwrap();
    assert!(history.id().is_none());
    ctx.commit().await.unwrap();

    assert_eq!(history.id(), Some(person_id("George", "Smith")));

    ctx.begin().await.unwrap();
    let loaded = ctx
        .find("MedicalHistory", person_id("George", "Smith"))
        .await
        .unwrap()
        .unwrap();
    let patient = ctx
        .find("Person", person_id("George", "Smith"))
        .await
        .unwrap()
        .unwrap();
    assert!(loaded.reference("patient").unwrap().same_instance(&patient));
    assert_eq!(patient.get("age").as_i64(), Some(52));
    ctx.commit().await.unwrap();
}

#[tokio::test]
async fn test_derived_key_with_own_component() {
    let unit = unit();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();

    let employee = EntityRef::new("Employee").with("name", "Ann");
    let joe = EntityRef::new("Dependent").with("name", "Joe");
    joe.set_reference("employee", Some(employee.clone()));
    ctx.persist(&employee).unwrap();
    ctx.persist(&joe).unwrap();
    ctx.commit().await.unwrap();

    let expected = Identifier::composite([
        ("employee", Identifier::from(1)),
        ("name", Identifier::from("Joe")),
    ]);
    assert_eq!(employee.id(), Some(Identifier::from(1)));
    assert_eq!(joe.id(), Some(expected.clone()));

    ctx.begin().await.unwrap();
    let found = ctx.find("Dependent", expected).await.unwrap().unwrap();
    assert_eq!(found.get("name").as_str(), Some("Joe"));
    assert_eq!(
        found.reference("employee").unwrap().get("name").as_str(),
        Some("Ann")
    );
    ctx.commit().await.unwrap();
}

#[tokio::test]
async fn test_embedded_key_must_match_embeddable() {
    let unit = unit();

    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    ctx.persist(&EntityRef::new("Person").with_id(7)).unwrap();
    let err = ctx.commit().await.unwrap_err();
    assert!(matches!(err, PersistenceError::ConstraintViolation(_)));

    ctx.begin().await.unwrap();
    let partial = Identifier::composite([("firstName", Identifier::from("Ann"))]);
    ctx.persist(&EntityRef::new("Person").with_id(partial)).unwrap();
    let err = ctx.commit().await.unwrap_err();
    assert!(matches!(err, PersistenceError::ConstraintViolation(_)));
}

#[tokio::test]
async fn test_derived_key_needs_owner() {
    let unit = unit();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    ctx.persist(&EntityRef::new("MedicalHistory").with("notes", "orphan"))
        .unwrap();
    let err = ctx.flush().await.unwrap_err();
    assert!(matches!(err, PersistenceError::ConstraintViolation(_)));
    assert!(ctx.is_rollback_only());
    ctx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_embedded_key_in_context() {
    let unit = unit();
    let mut ctx = unit.create_context();
    ctx.begin().await.unwrap();
    ctx.persist(&EntityRef::new("Person").with_id(person_id("A", "B")))
        .unwrap();
    let err = ctx
        .persist(&EntityRef::new("Person").with_id(person_id("A", "B")))
        .unwrap_err();
    assert!(matches!(err, PersistenceError::EntityExists(_)));
    ctx.rollback().await.unwrap();
}
