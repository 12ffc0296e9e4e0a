//! Topological order and cycle detection for [`DiGraph`].
//!
//! Both are the same Kahn peeling: repeatedly remove zero-indegree nodes.
//! The order is what the path-value computation iterates in reverse; the
//! cycle witness backs the acyclicity assertion after back-edge removal.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::graph::{DiGraph, NodeKey};

/// Kahn topological order. Ties (several nodes at indegree zero) resolve in
/// queue insertion order, which follows handle order for the initial seeds.
///
/// Returns an empty order if the graph has a cycle — callers are expected to
/// have guaranteed acyclicity.
pub fn topo_order<N: NodeKey>(g: &DiGraph<N>) -> Vec<N> {
    let mut indegrees: FxHashMap<N, u32> = g.nodes().map(|v| (v, g.indegree(v))).collect();
    let mut queue: VecDeque<N> = g.nodes().filter(|&v| g.indegree(v) == 0).collect();
    let mut order = Vec::with_capacity(g.node_count());

    while let Some(v) = queue.pop_front() {
        order.push(v);
        for w in g.adj(v) {
            let d = indegrees.get_mut(&w).unwrap();
            *d -= 1;
            if *d == 0 {
                queue.push_back(w);
            }
        }
    }

    if order.len() != g.node_count() {
        order.clear();
    }
    order
}

/// Find a witness cycle: an ordered node list starting and ending at the
/// same node, or `None` when the graph is acyclic.
///
/// After the Kahn peeling, every node with residual indegree sits on or
/// downstream of a cycle; walking residual predecessor links from any of
/// them must revisit a node, and that revisit closes the witness.
pub fn find_cycle<N: NodeKey>(g: &DiGraph<N>) -> Option<Vec<N>> {
    let mut indegrees: FxHashMap<N, u32> = g.nodes().map(|v| (v, g.indegree(v))).collect();
    let mut queue: VecDeque<N> = g.nodes().filter(|&v| g.indegree(v) == 0).collect();

    while let Some(v) = queue.pop_front() {
        for w in g.adj(v) {
            let d = indegrees.get_mut(&w).unwrap();
            *d -= 1;
            if *d == 0 {
                queue.push_back(w);
            }
        }
    }

    // Residual predecessor links among nodes still carrying indegree.
    let mut pred: FxHashMap<N, N> = FxHashMap::default();
    let mut root = None;
    for v in g.nodes() {
        if indegrees[&v] > 0 {
            root = Some(v);
            for w in g.adj(v) {
                if indegrees[&w] > 0 {
                    pred.insert(w, v);
                }
            }
        }
    }

    let mut cur = root?;

    // Walk backwards until a node repeats; that node is on the cycle.
    let mut visited = rustc_hash::FxHashSet::default();
    while visited.insert(cur) {
        cur = pred[&cur];
    }

    let start = cur;
    let mut cycle = vec![start];
    loop {
        cur = pred[&cur];
        cycle.push(cur);
        if cur == start {
            break;
        }
    }
    cycle.reverse();
    Some(cycle)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{cycle_graph, path_graph};
    use crate::graph::DiGraph;

    #[test]
    fn orders_a_chain() {
        let g = path_graph(5);
        assert_eq!(topo_order(&g), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn orders_a_diamond_with_deterministic_ties() {
        let mut g = DiGraph::new();
        for v in 0..4u32 {
            g.insert(v);
        }
        g.connect(0, 1);
        g.connect(0, 2);
        g.connect(1, 3);
        g.connect(2, 3);

        // 1 and 2 tie; adjacency order of node 0 breaks it.
        assert_eq!(topo_order(&g), vec![0, 1, 2, 3]);
    }

    #[test]
    fn empty_order_on_cycle() {
        assert!(topo_order(&cycle_graph(3)).is_empty());

        // Cycle with a tail: the tail peels, the ring does not.
        let mut g = cycle_graph(3);
        g.insert(10);
        g.connect(2, 10);
        assert!(topo_order(&g).is_empty());
    }

    #[test]
    fn no_cycle_in_dag() {
        assert!(find_cycle(&path_graph(4)).is_none());

        let mut g = DiGraph::new();
        for v in 0..4u32 {
            g.insert(v);
        }
        g.connect(0, 1);
        g.connect(0, 2);
        g.connect(1, 3);
        g.connect(2, 3);
        assert!(find_cycle(&g).is_none());
    }

    #[test]
    fn witness_closes_on_itself() {
        let cycle = find_cycle(&cycle_graph(4)).expect("ring has a cycle");
        assert!(cycle.len() >= 2);
        assert_eq!(cycle.first(), cycle.last());
        // Consecutive witness nodes are connected in the graph.
        let g = cycle_graph(4);
        for pair in cycle.windows(2) {
            assert!(g.is_edge(pair[0], pair[1]));
        }
    }

    #[test]
    fn witness_found_behind_a_tail() {
        // 0 -> 1 -> 2 -> 3 -> 1: the cycle is {1, 2, 3}.
        let mut g = DiGraph::new();
        for v in 0..4u32 {
            g.insert(v);
        }
        g.connect(0, 1);
        g.connect(1, 2);
        g.connect(2, 3);
        g.connect(3, 1);

        let cycle = find_cycle(&g).expect("cycle expected");
        assert_eq!(cycle.first(), cycle.last());
        assert!(!cycle.contains(&0));
        for pair in cycle.windows(2) {
            assert!(g.is_edge(pair[0], pair[1]));
        }
    }
}
