use super::instance::{EntityRef, InstanceId};
use crate::core::{Identifier, Value};
use std::collections::{BTreeMap, BTreeSet};

/// State of an instance as of its last flush or load; the baseline for dirty
/// checking and orphan detection.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub id: Option<Identifier>,
    pub attributes: BTreeMap<String, Value>,
    pub associations: BTreeMap<String, Vec<InstanceId>>,
}

impl EntitySnapshot {
    pub fn capture(instance: &EntityRef) -> Self {
        Self {
            id: instance.id(),
            attributes: instance.attributes(),
            associations: instance
                .associations()
                .into_iter()
                .map(|(name, assoc)| (name, assoc.target_ids()))
                .collect(),
        }
    }

    fn attribute(&self, name: &str) -> &Value {
        self.attributes.get(name).unwrap_or(&Value::Null)
    }

    /// Names of attributes whose values differ; a missing attribute counts as NULL.
    pub fn changed_attributes(&self, current: &EntitySnapshot) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .attributes
            .keys()
            .chain(current.attributes.keys())
            .collect();
        names
            .into_iter()
            .filter(|name| self.attribute(name) != current.attribute(name))
            .cloned()
            .collect()
    }

    pub fn association_changed(&self, current: &EntitySnapshot, name: &str) -> bool {
        let before = self.associations.get(name).map(Vec::as_slice).unwrap_or(&[]);
        let after = current.associations.get(name).map(Vec::as_slice).unwrap_or(&[]);
        before != after
    }

    /// Targets present in this snapshot's association but gone from `current`.
    pub fn dropped_targets(&self, current: &EntitySnapshot, name: &str) -> Vec<InstanceId> {
        let after: BTreeSet<InstanceId> = current
            .associations
            .get(name)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        self.associations
            .get(name)
            .map(|ids| ids.iter().copied().filter(|id| !after.contains(id)).collect())
            .unwrap_or_default()
    }
}
