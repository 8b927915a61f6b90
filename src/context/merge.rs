use super::{CascadeNode, CascadeResolver, EntityState, MergeAction, PersistenceContext};
use crate::core::{PersistenceError, Result};
use crate::entity::{Association, EntityRef, InstanceId};
use crate::metamodel::{CascadeType, IdentifierKind};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Managed counterpart chosen for one merged instance.
struct Counterpart {
    node: CascadeNode,
    managed: EntityRef,
    /// No stored row or tracked instance was found; `managed` is new.
    fresh: bool,
}

fn remap(
    associations: BTreeMap<String, Association>,
    counterparts: &HashMap<InstanceId, EntityRef>,
) -> BTreeMap<String, Association> {
    let swap = |target: EntityRef| {
        counterparts
            .get(&target.instance_id())
            .cloned()
            .unwrap_or(target)
    };
    associations
        .into_iter()
        .map(|(name, association)| {
            let mapped = match association {
                Association::One(target) => Association::One(target.map(swap)),
                Association::Many(targets) => Association::Many(targets.into_iter().map(swap).collect()),
                Association::Keyed(targets) => {
                    Association::Keyed(targets.into_iter().map(|(k, t)| (k, swap(t))).collect())
                }
            };
            (name, mapped)
        })
        .collect()
}

impl PersistenceContext {
    /// Copies the state of `entity` onto its managed counterpart and
    /// returns that counterpart; `entity` itself stays untracked unless it
    /// was managed already. Follows MERGE cascades.
    pub async fn merge(&mut self, entity: &EntityRef) -> Result<EntityRef> {
        self.ensure_open()?;
        self.require_for_mutation("merge")?;
        let result = self.merge_graph(entity).await;
        self.guard(result)
    }

    async fn merge_graph(&mut self, root: &EntityRef) -> Result<EntityRef> {
        let unit = self.unit.clone();
        unit.metamodel.entity(root.entity_type())?;
        let nodes = CascadeResolver::new(&unit.metamodel).collect(root, CascadeType::Merge)?;

        let mut decided = Vec::with_capacity(nodes.len());
        for node in nodes {
            let action = self.identity_map.state_of(&node.instance).merge(&node.instance)?;
            decided.push((node, action));
        }

        let mut counterparts: HashMap<InstanceId, EntityRef> = HashMap::new();
        let mut copies = Vec::new();
        let mut reused = Vec::new();
        for (node, action) in decided {
            match action {
                MergeAction::Reuse => {
                    counterparts.insert(node.instance.instance_id(), node.instance.clone());
                    reused.push(node);
                }
                MergeAction::Copy => {
                    let counterpart = self.counterpart_of(node).await?;
                    counterparts.insert(
                        counterpart.node.instance.instance_id(),
                        counterpart.managed.clone(),
                    );
                    copies.push(counterpart);
                }
            }
        }

        // Plain references to untracked instances point at their managed
        // counterpart when one exists.
        let mut references = Vec::new();
        for node in copies.iter().map(|c| &c.node).chain(reused.iter()) {
            for edge in node.descriptor.relationships() {
                if edge.cascades(CascadeType::Merge) {
                    continue;
                }
                for target in node.instance.association(&edge.name).map(|a| a.targets()).unwrap_or_default() {
                    if !counterparts.contains_key(&target.instance_id())
                        && self.identity_map.state_of(&target) == EntityState::Detached
                    {
                        references.push(target);
                    }
                }
            }
        }
        for target in references {
            if counterparts.contains_key(&target.instance_id()) {
                continue;
            }
            if let Some(managed) = self.existing_counterpart(&target).await? {
                counterparts.insert(target.instance_id(), managed);
            }
        }

        for copy in &copies {
            let source = &copy.node.instance;
            let mut attributes = source.attributes();
            if let Some(version) = copy.node.descriptor.version_attribute() {
                if !copy.fresh {
                    attributes.insert(version.to_string(), copy.managed.get(version));
                }
            }
            copy.managed
                .replace_state(attributes, remap(source.associations(), &counterparts));
            if copy.fresh {
                let keeps_id = !matches!(copy.node.descriptor.identifier(), IdentifierKind::Generated(_));
                if let Some(id) = source.id().filter(|_| keeps_id) {
                    copy.managed.set_id(id);
                }
            }
            trace!(source = ?source, managed = ?copy.managed, fresh = copy.fresh, "merged");
        }
        for node in &reused {
            node.instance
                .replace_state(node.instance.attributes(), remap(node.instance.associations(), &counterparts));
        }
        for copy in copies.iter().filter(|c| c.fresh) {
            self.persist_graph(&copy.managed)?;
        }

        counterparts.get(&root.instance_id()).cloned().ok_or_else(|| {
            PersistenceError::IllegalState(format!("Merge of {:?} produced no managed instance", root))
        })
    }

    async fn counterpart_of(&mut self, node: CascadeNode) -> Result<Counterpart> {
        if let Some(managed) = self.existing_counterpart(&node.instance).await? {
            if let Some(version) = node.descriptor.version_attribute() {
                let incoming = node.instance.get(version);
                let current = managed.get(version);
                if !incoming.is_null() && incoming != current {
                    return Err(PersistenceError::OptimisticLock(format!(
                        "{:?} carries version {}, stored version is {}",
                        node.instance, incoming, current
                    )));
                }
            }
            return Ok(Counterpart {
                node,
                managed,
                fresh: false,
            });
        }
        let managed = EntityRef::new(node.instance.entity_type());
        Ok(Counterpart {
            node,
            managed,
            fresh: true,
        })
    }

    /// Tracked or stored instance with the identity of `instance`.
    async fn existing_counterpart(&mut self, instance: &EntityRef) -> Result<Option<EntityRef>> {
        let Some(id) = instance.id().filter(|id| id.is_complete()) else {
            return Ok(None);
        };
        let descriptor = self.unit.metamodel.entity(instance.entity_type())?.clone();
        let key = descriptor.key(id);
        if let Some(entry) = self.identity_map.find_by_key(&key) {
            if entry.state == EntityState::Removed {
                return Err(PersistenceError::IllegalArgument(format!(
                    "Cannot merge into removed instance {:?}",
                    entry.instance
                )));
            }
            return Ok(Some(entry.instance.clone()));
        }
        self.load_graph(descriptor.name(), key).await
    }
}
