//! Cascade propagation over the relationship graph.

use crate::error::CoreResult;
use crate::schema::{CascadeOp, RelationshipDef};
use crate::session::Session;
use crate::types::EntityKey;
use std::collections::HashSet;
use tracing::trace;

/// Computes the cascade closure of `op` from `root`.
///
/// Depth-first traversal following only relationships whose cascade set
/// contains `op`. Each entity is visited at most once - a per-traversal
/// visited set keyed by session key guards cycles (and the identity map
/// guarantees one key per (type, id)), so order/item/delivery loops
/// terminate.
///
/// The returned list is in traversal preorder with `root` first. For
/// `Remove` the session reorders deletes dependency-safely afterwards;
/// for `Persist`/`Merge` the preorder is used as the registration order.
///
/// Traversing an unloaded relationship of a managed entity forces its
/// materialization for `Remove` and `Merge` (the closure must see every
/// reachable child); for `Persist` only already-materialized values are
/// followed, since stored targets cannot be transient.
pub(crate) fn closure(
    session: &mut Session,
    op: CascadeOp,
    root: EntityKey,
) -> CoreResult<Vec<EntityKey>> {
    let mut visited: HashSet<EntityKey> = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![root];

    while let Some(key) = stack.pop() {
        if !visited.insert(key) {
            continue;
        }
        order.push(key);

        let etype = session.entity(key)?.entity_type();
        let rels: Vec<RelationshipDef> = session
            .schema()
            .relationships_of(etype)
            .filter(|rel| rel.cascade.contains(op))
            .cloned()
            .collect();

        for rel in rels {
            let targets = session.cascade_targets(key, &rel, op)?;
            trace!(
                entity = %etype,
                relation = rel.name,
                targets = targets.len(),
                ?op,
                "cascade step"
            );
            // Reverse so the first declared target is visited first.
            for target in targets.into_iter().rev() {
                if !visited.contains(&target) {
                    stack.push(target);
                }
            }
        }
    }

    Ok(order)
}
