// ============================================================================
// Metamodel Builder
// ============================================================================
//
// Validates declarations once at load time and flattens inheritance into
// per-entity descriptors. Everything that can be rejected statically is
// rejected here as a `Configuration` error, so cascades, flushes and callback
// dispatch never have to re-check mapping metadata.
//
// ============================================================================

use super::registry::{EntityDescriptor, Metamodel, ResolvedCallback};
use super::types::{
    AttributeDef, DeclarationSource, EntityListener, EntityType, IdentifierKind, ManagedTypeKind,
    RelationshipEdge,
};
use crate::callback::LifecycleEvent;
use crate::core::{DataType, PersistenceError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MetamodelBuilder {
    types: Vec<EntityType>,
    default_listeners: Vec<EntityListener>,
}

fn config_err(msg: String) -> PersistenceError {
    PersistenceError::Configuration(msg)
}

impl MetamodelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, managed_type: EntityType) -> Self {
        self.types.push(managed_type);
        self
    }

    /// Registers a listener that applies to every entity type unless the
    /// type (or an ancestor) excludes default listeners.
    pub fn default_listener(mut self, listener: EntityListener) -> Self {
        self.default_listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<Metamodel> {
        let mut decls: HashMap<String, EntityType> = HashMap::new();
        for decl in self.types {
            if decls.contains_key(&decl.name) {
                return Err(config_err(format!("Managed type '{}' declared twice", decl.name)));
            }
            decls.insert(decl.name.clone(), decl);
        }

        for decl in decls.values() {
            let Some(parent) = &decl.parent else {
                continue;
            };
            if decl.kind == ManagedTypeKind::Embeddable {
                return Err(config_err(format!(
                    "Embeddable '{}' cannot extend '{}'",
                    decl.name, parent
                )));
            }
            match decls.get(parent) {
                None => {
                    return Err(config_err(format!(
                        "'{}' extends unknown type '{}'",
                        decl.name, parent
                    )));
                }
                Some(p) if p.kind == ManagedTypeKind::Embeddable => {
                    return Err(config_err(format!(
                        "'{}' cannot extend embeddable '{}'",
                        decl.name, parent
                    )));
                }
                Some(_) => {}
            }
        }

        let kinds: HashMap<String, ManagedTypeKind> = decls
            .iter()
            .map(|(name, decl)| (name.clone(), decl.kind))
            .collect();

        let embeddables: HashMap<String, Vec<AttributeDef>> = decls
            .values()
            .filter(|d| d.kind == ManagedTypeKind::Embeddable)
            .map(|d| (d.name.clone(), d.attributes.clone()))
            .collect();

        let mut entities: HashMap<String, EntityDescriptor> = HashMap::new();
        for decl in decls.values().filter(|d| d.kind == ManagedTypeKind::Entity) {
            let descriptor = flatten(&decls, decl, &self.default_listeners)?;
            entities.insert(decl.name.clone(), descriptor);
        }

        for descriptor in entities.values() {
            for edge in &descriptor.relationships {
                validate_relationship(&kinds, &entities, descriptor, edge)?;
            }
            validate_identifier(&kinds, &entities, descriptor)?;
        }

        debug!(
            entities = entities.len(),
            embeddables = embeddables.len(),
            "metamodel built"
        );

        Ok(Metamodel {
            kinds: Arc::new(kinds),
            entities: Arc::new(
                entities
                    .into_iter()
                    .map(|(name, d)| (name, Arc::new(d)))
                    .collect(),
            ),
            embeddables: Arc::new(embeddables),
        })
    }
}

fn lineage_of(decls: &HashMap<String, EntityType>, name: &str) -> Result<Vec<String>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(name.to_string());
    while let Some(type_name) = current {
        if !seen.insert(type_name.clone()) {
            return Err(config_err(format!(
                "Inheritance cycle through '{}'",
                type_name
            )));
        }
        current = decls.get(&type_name).and_then(|d| d.parent.clone());
        chain.push(type_name);
    }
    chain.reverse();
    Ok(chain)
}

fn flatten(
    decls: &HashMap<String, EntityType>,
    decl: &EntityType,
    default_listeners: &[EntityListener],
) -> Result<EntityDescriptor> {
    let lineage = lineage_of(decls, &decl.name)?;
    let chain: Vec<&EntityType> = lineage.iter().filter_map(|n| decls.get(n)).collect();

    let root_idx = chain
        .iter()
        .position(|t| t.kind == ManagedTypeKind::Entity)
        .unwrap_or(chain.len() - 1);
    let root = chain[root_idx].name.clone();

    let mut identifier = None;
    for (idx, t) in chain.iter().enumerate() {
        let Some(kind) = &t.identifier else {
            continue;
        };
        if identifier.is_some() {
            return Err(config_err(format!(
                "'{}' redeclares the identifier of hierarchy '{}'",
                t.name, root
            )));
        }
        if idx > root_idx {
            return Err(config_err(format!(
                "Identifier of hierarchy '{}' must be declared on the root entity or above, found on '{}'",
                root, t.name
            )));
        }
        identifier = Some(kind.clone());
    }
    let identifier = identifier.ok_or_else(|| {
        config_err(format!("Entity hierarchy '{}' declares no identifier", root))
    })?;

    let mut attributes: Vec<AttributeDef> = Vec::new();
    let mut relationships: Vec<RelationshipEdge> = Vec::new();
    for t in &chain {
        for attr in &t.attributes {
            if attributes.iter().any(|a| a.name == attr.name) {
                return Err(config_err(format!(
                    "Attribute '{}' declared twice in the hierarchy of '{}'",
                    attr.name, decl.name
                )));
            }
            attributes.push(attr.clone());
        }
        for edge in &t.relationships {
            if relationships.iter().any(|r| r.name == edge.name)
                || attributes.iter().any(|a| a.name == edge.name)
            {
                return Err(config_err(format!(
                    "Relationship '{}' clashes with another member in the hierarchy of '{}'",
                    edge.name, decl.name
                )));
            }
            relationships.push(edge.clone());
        }
    }

    let version_attribute = chain.iter().rev().find_map(|t| t.version_attribute.clone());
    if let Some(version) = &version_attribute {
        match attributes.iter().find(|a| &a.name == version) {
            Some(attr) if attr.data_type == DataType::Integer => {}
            Some(attr) => {
                return Err(config_err(format!(
                    "Version attribute '{}.{}' must be INTEGER, found {}",
                    decl.name, version, attr.data_type
                )));
            }
            None => {
                return Err(config_err(format!(
                    "Version attribute '{}' is not an attribute of '{}'",
                    version, decl.name
                )));
            }
        }
    }

    Ok(EntityDescriptor {
        name: decl.name.clone(),
        root,
        lineage,
        is_abstract: decl.is_abstract,
        identifier,
        attributes,
        relationships,
        version_attribute,
        declared_cacheable: chain.iter().rev().find_map(|t| t.cacheable),
        callbacks: resolve_callbacks(&chain, default_listeners),
    })
}

/// Builds the per-event invocation table for one entity type.
///
/// Order: entity callback methods (root-most declaration first), default
/// listeners, then entity listeners (root-most first). An XML-declared method
/// replaces annotation-declared ones for the same (type, event); a method
/// re-declared under the same name by a descendant hides the ancestor's.
fn resolve_callbacks(
    chain: &[&EntityType],
    default_listeners: &[EntityListener],
) -> HashMap<LifecycleEvent, Vec<ResolvedCallback>> {
    let exclude_defaults = chain.iter().any(|t| t.exclude_default_listeners);
    let listener_start = chain
        .iter()
        .rposition(|t| t.exclude_superclass_listeners)
        .unwrap_or(0);

    let mut table = HashMap::new();
    for event in LifecycleEvent::ALL {
        let mut resolved = Vec::new();

        for (idx, t) in chain.iter().enumerate() {
            let declared: Vec<_> = t.callbacks.iter().filter(|m| m.event == event).collect();
            let has_xml = declared.iter().any(|m| m.source == DeclarationSource::Xml);
            for method in declared {
                if has_xml && method.source != DeclarationSource::Xml {
                    continue;
                }
                let overridden = chain[idx + 1..]
                    .iter()
                    .any(|d| d.callbacks.iter().any(|o| o.name == method.name));
                if overridden {
                    continue;
                }
                resolved.push(ResolvedCallback {
                    origin: format!("{}.{}", t.name, method.name),
                    handler: method.handler.clone(),
                });
            }
        }

        if !exclude_defaults {
            for listener in default_listeners {
                for handler in listener.handlers_for(event) {
                    resolved.push(ResolvedCallback {
                        origin: listener.name.clone(),
                        handler: handler.clone(),
                    });
                }
            }
        }

        for t in &chain[listener_start..] {
            for listener in &t.listeners {
                for handler in listener.handlers_for(event) {
                    resolved.push(ResolvedCallback {
                        origin: listener.name.clone(),
                        handler: handler.clone(),
                    });
                }
            }
        }

        if !resolved.is_empty() {
            table.insert(event, resolved);
        }
    }
    table
}

fn validate_relationship(
    kinds: &HashMap<String, ManagedTypeKind>,
    entities: &HashMap<String, EntityDescriptor>,
    owner: &EntityDescriptor,
    edge: &RelationshipEdge,
) -> Result<()> {
    match kinds.get(&edge.target) {
        None => {
            return Err(config_err(format!(
                "Relationship '{}.{}' targets unknown type '{}'",
                owner.name, edge.name, edge.target
            )));
        }
        Some(ManagedTypeKind::Entity) => {}
        Some(kind) if !edge.cascade.is_empty() => {
            return Err(config_err(format!(
                "Relationship '{}.{}' cascades into non-entity type '{}' ({:?})",
                owner.name, edge.name, edge.target, kind
            )));
        }
        Some(kind) => {
            return Err(config_err(format!(
                "Relationship '{}.{}' targets non-entity type '{}' ({:?})",
                owner.name, edge.name, edge.target, kind
            )));
        }
    }

    let Some(target) = entities.get(&edge.target) else {
        return Err(config_err(format!(
            "Relationship '{}.{}' targets unknown entity '{}'",
            owner.name, edge.name, edge.target
        )));
    };

    if let Some(mapped_by) = &edge.mapped_by {
        let back = target.relationship(mapped_by);
        let valid = back
            .map(|b| b.is_owning() && owner.is_subtype_of(&b.target))
            .unwrap_or(false);
        if !valid {
            return Err(config_err(format!(
                "Relationship '{}.{}' is mapped by '{}.{}', which is not an owning relationship back to '{}'",
                owner.name, edge.name, target.name, mapped_by, owner.name
            )));
        }
    }

    if let Some(map_key) = &edge.map_key {
        if edge.multiplicity.is_single_valued() {
            return Err(config_err(format!(
                "Single-valued relationship '{}.{}' cannot declare a map key",
                owner.name, edge.name
            )));
        }
        if target.attribute(map_key).is_none() {
            return Err(config_err(format!(
                "Map key '{}' of '{}.{}' is not an attribute of '{}'",
                map_key, owner.name, edge.name, target.name
            )));
        }
    }

    Ok(())
}

fn validate_identifier(
    kinds: &HashMap<String, ManagedTypeKind>,
    entities: &HashMap<String, EntityDescriptor>,
    descriptor: &EntityDescriptor,
) -> Result<()> {
    match &descriptor.identifier {
        IdentifierKind::Embedded { embeddable } => {
            if kinds.get(embeddable) != Some(&ManagedTypeKind::Embeddable) {
                return Err(config_err(format!(
                    "Embedded identifier of '{}' names '{}', which is not an embeddable",
                    descriptor.name, embeddable
                )));
            }
        }
        IdentifierKind::Derived {
            association,
            components,
        } => {
            let edge = descriptor
                .relationship(association)
                .filter(|e| e.is_owning() && e.multiplicity.is_single_valued())
                .ok_or_else(|| {
                    config_err(format!(
                        "Derived identifier of '{}' must use an owning single-valued relationship, '{}' is not one",
                        descriptor.name, association
                    ))
                })?;
            if entities
                .get(&edge.target)
                .map(|t| t.root == descriptor.root)
                .unwrap_or(false)
            {
                return Err(config_err(format!(
                    "Derived identifier of '{}' cannot be derived from its own hierarchy",
                    descriptor.name
                )));
            }
            for component in components {
                if descriptor.attribute(component).is_none() {
                    return Err(config_err(format!(
                        "Derived identifier component '{}' is not an attribute of '{}'",
                        component, descriptor.name
                    )));
                }
            }
        }
        IdentifierKind::Assigned | IdentifierKind::Generated(_) => {}
    }
    Ok(())
}
