// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Shortest-path search over the link cache's graph. Edge weight is the
// metric engine's `link_to_path_component`, which is additive for every
// metric except WCETT; for WCETT this is the standard ETT-sum
// approximation used to pick candidate paths, with channel-diversity
// accounted for afterward by `path_metric` when the caller wants the
// true non-additive cost of a specific discovered path.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Ordering;

use super::NodeId;

#[derive(Clone, Copy, Eq, PartialEq)]
struct HeapEntry {
    cost: u64,
    node: NodeId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reverse for a min-heap
        other.cost.cmp(&self.cost)
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One directed edge as seen by the search: destination node, the link
/// used to reach it, and its weight.
#[derive(Clone)]
pub struct Edge {
    pub to: NodeId,
    pub link: super::LinkId,
    pub weight: u64,
}

/// Dijkstra from `source` over `neighbors`, returning the predecessor link
/// for every reachable node so the caller can walk the tree back to a
/// source route.
pub fn shortest_paths<F>(source: NodeId, neighbors: F) -> HashMap<NodeId, (NodeId, super::LinkId, u64)>
where
    F: Fn(NodeId) -> Vec<Edge>,
{
    let mut dist: HashMap<NodeId, u64> = HashMap::new();
    let mut prev: HashMap<NodeId, (NodeId, super::LinkId, u64)> = HashMap::new();
    let mut heap = BinaryHeap::new();

    dist.insert(source, 0);
    heap.push(HeapEntry { cost: 0, node: source });

    while let Some(HeapEntry { cost, node }) = heap.pop() {
        if cost > *dist.get(&node).unwrap_or(&u64::MAX) {
            continue;
        }
        for edge in neighbors(node) {
            if edge.weight == u64::MAX {
                continue;
            }
            let next_cost = cost.saturating_add(edge.weight);
            if next_cost < *dist.get(&edge.to).unwrap_or(&u64::MAX) {
                dist.insert(edge.to, next_cost);
                prev.insert(edge.to, (node, edge.link, edge.weight));
                heap.push(HeapEntry { cost: next_cost, node: edge.to });
            }
        }
    }

    prev
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linkcache::LinkId;

    #[test]
    fn finds_shorter_two_hop_over_direct_expensive_edge() {
        // 0 -> 1 costs 100 direct, or 0 -> 2 -> 1 costs 1 + 1.
        let edges: HashMap<NodeId, Vec<Edge>> = [
            (NodeId(0), vec![Edge { to: NodeId(1), link: LinkId(0), weight: 100 }, Edge { to: NodeId(2), link: LinkId(1), weight: 1 }]),
            (NodeId(2), vec![Edge { to: NodeId(1), link: LinkId(2), weight: 1 }]),
        ]
        .into_iter()
        .collect();

        let prev = shortest_paths(NodeId(0), |n| edges.get(&n).cloned().unwrap_or_default());
        let (pred, _, cost_to_1) = *prev.get(&NodeId(1)).unwrap();
        assert_eq!(pred, NodeId(2));
        assert_eq!(cost_to_1, 1);
    }
}
