use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::debug;

use crate::types::{Kind, ObjectId, Relation};

use super::index::{Adjacency, EdgeIndex};

// Most objects reach only a handful of same-kind neighbours.
type Hops = SmallVec<[ObjectId; 4]>;

impl EdgeIndex {
    /// Looks for a path that leaves `start` through `relation` edges to
    /// objects of `kind` and comes back to `start`.
    ///
    /// Returns the path `[start, .., start]` when one exists. Nodes reached
    /// twice through different branches (diamonds) are not cycles.
    pub fn is_cyclic_for_relation_for_kind(
        &self,
        start: &ObjectId,
        relation: &Relation,
        kind: &Kind,
    ) -> Option<Vec<ObjectId>> {
        let adj = self.adj.read();
        let mut path = vec![start.clone()];
        let mut stack: Vec<(Hops, usize)> =
            vec![(next_hops(&adj, start, relation, kind), 0)];
        let mut expanded: FxHashSet<ObjectId> = FxHashSet::default();
        expanded.insert(start.clone());

        loop {
            let Some((hops, cursor)) = stack.last_mut() else {
                break;
            };
            if *cursor >= hops.len() {
                stack.pop();
                path.pop();
                continue;
            }
            let candidate = hops[*cursor].clone();
            *cursor += 1;

            if &candidate == start {
                path.push(candidate);
                debug!(start = %start, relation = %relation, len = path.len(), "cache.cycle.found");
                return Some(path);
            }
            // Anything already expanded could not reach `start`.
            if !expanded.insert(candidate.clone()) {
                continue;
            }
            let hops = next_hops(&adj, &candidate, relation, kind);
            path.push(candidate);
            stack.push((hops, 0));
        }
        None
    }
}

fn next_hops(adj: &Adjacency, node: &ObjectId, relation: &Relation, kind: &Kind) -> Hops {
    let Some(targets) = adj.forward.get(node).and_then(|usage| usage.get(relation)) else {
        return Hops::new();
    };
    let mut hops: Hops = targets.iter().filter(|t| t.is_kind(kind)).cloned().collect();
    hops.sort_unstable();
    hops
}
