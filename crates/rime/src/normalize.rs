//! Sideload normalization.
//!
//! Turns a batch of wire resources into flat entities whose relationships
//! hold stubs only. Embedded targets that carry attributes become entities of
//! their own. A visited set keyed by `(model, id key)` bounds the walk, so
//! cyclic sideload graphs terminate.

use std::collections::{HashSet, VecDeque};

use tracing::trace;

use crate::types::{Entity, Linkage, Relationships, Resource};

/// Normalize a batch of root resources.
///
/// Roots are authoritative: every root is emitted, in order, so a later root
/// with the same key overwrites an earlier one when the result is applied.
/// Sideloaded entities are emitted once per batch, and never when a root with
/// the same key is present.
pub(crate) fn normalize(roots: impl IntoIterator<Item = Resource>) -> Vec<Entity> {
    let mut visited: HashSet<(String, String)> = HashSet::new();
    let mut queue: VecDeque<Resource> = VecDeque::new();
    let mut entities = Vec::new();

    let roots: Vec<Resource> = roots.into_iter().collect();
    for root in &roots {
        visited.insert((root.model.clone(), root.key()));
    }

    for root in roots {
        let (entity, sideloads) = split(root);
        entities.push(entity);
        queue.extend(sideloads);
    }

    while let Some(resource) = queue.pop_front() {
        if !visited.insert((resource.model.clone(), resource.key())) {
            trace!(model = %resource.model, key = %resource.key(), "sideload already visited");
            continue;
        }
        let (entity, sideloads) = split(resource);
        entities.push(entity);
        queue.extend(sideloads);
    }

    entities
}

/// Split a resource into its stub-only entity and its embedded sideloads.
fn split(resource: Resource) -> (Entity, Vec<Resource>) {
    let mut sideloads = Vec::new();
    let mut relationships = Relationships::new();

    for (name, linkage) in resource.relationships {
        relationships.insert(name, linkage.to_relationship());
        match linkage {
            Linkage::One(target) if !target.is_stub() => sideloads.push(*target),
            Linkage::Many(targets) => {
                sideloads.extend(targets.into_iter().filter(|target| !target.is_stub()))
            }
            Linkage::One(_) | Linkage::Null => {}
        }
    }

    let entity = Entity {
        model: resource.model,
        id: resource.id,
        attributes: resource.attributes.unwrap_or_default(),
        relationships,
    };
    (entity, sideloads)
}
