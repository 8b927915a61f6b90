use crate::core::Result;
use crate::entity::{EntityRef, InstanceId};
use crate::metamodel::{CascadeType, EntityDescriptor, Metamodel, RelationshipEdge};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// Expands one operation over the relationship graph.
///
/// Traversal is a depth-first preorder from the root: every instance
/// reachable through edges that cascade the operation is yielded once,
/// parents before children and siblings in relationship declaration order.
/// Instance identity is the visited key, so cycles and diamonds terminate
/// and keyless new instances are handled the same as managed ones.
pub struct CascadeResolver<'a> {
    metamodel: &'a Metamodel,
}

/// One reachable instance with its resolved type.
#[derive(Debug, Clone)]
pub struct CascadeNode {
    pub instance: EntityRef,
    pub descriptor: Arc<EntityDescriptor>,
}

/// Orphan removal implies cascading remove.
fn edge_cascades(edge: &RelationshipEdge, op: CascadeType) -> bool {
    edge.cascades(op) || (op == CascadeType::Remove && edge.orphan_removal)
}

impl<'a> CascadeResolver<'a> {
    pub fn new(metamodel: &'a Metamodel) -> Self {
        Self { metamodel }
    }

    pub fn collect(&self, root: &EntityRef, op: CascadeType) -> Result<Vec<CascadeNode>> {
        let mut visited: HashSet<InstanceId> = HashSet::new();
        let mut stack = vec![root.clone()];
        let mut nodes = Vec::new();

        while let Some(instance) = stack.pop() {
            if !visited.insert(instance.instance_id()) {
                continue;
            }
            let descriptor = self.metamodel.entity(instance.entity_type())?.clone();

            let mut children = Vec::new();
            for edge in descriptor.relationships() {
                if !edge_cascades(edge, op) {
                    continue;
                }
                if let Some(association) = instance.association(&edge.name) {
                    children.extend(association.targets());
                }
            }
            // Reverse so the first declared child is visited first.
            for child in children.into_iter().rev() {
                if !visited.contains(&child.instance_id()) {
                    stack.push(child);
                }
            }
            nodes.push(CascadeNode {
                instance,
                descriptor,
            });
        }

        trace!(
            root = ?root,
            op = %op,
            reached = nodes.len(),
            "cascade expanded"
        );
        Ok(nodes)
    }
}
