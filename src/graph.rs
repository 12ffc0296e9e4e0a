//! Directed graph over opaque node handles.
//!
//! The profiling engine never owns basic blocks; it works with whatever
//! handle type the host IR provides, so the graph is generic over any
//! ordered, hashable handle. Adjacency iterates in ascending handle order —
//! path values are partial sums over that order, and the report's path
//! enumeration must walk edges in exactly the same order, so the ordering is
//! a contract, not an implementation detail.
//!
//! Operations on absent nodes are programming errors and panic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::fmt::Write as _;
use std::hash::Hash;

/// Bound for graph node handles: cheap to copy, ordered, hashable.
pub trait NodeKey: Copy + Eq + Ord + Hash + Debug {}

impl<T: Copy + Eq + Ord + Hash + Debug> NodeKey for T {}

/// A directed graph with set-semantics edges (multi-edges forbidden) and
/// handle-ordered adjacency.
#[derive(Debug, Clone, Default)]
pub struct DiGraph<N: NodeKey> {
    adj: BTreeMap<N, BTreeSet<N>>,
    indegrees: BTreeMap<N, u32>,
}

impl<N: NodeKey> DiGraph<N> {
    pub fn new() -> Self {
        Self {
            adj: BTreeMap::new(),
            indegrees: BTreeMap::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.adj.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adj.values().map(|s| s.len()).sum()
    }

    pub fn contains(&self, v: N) -> bool {
        self.adj.contains_key(&v)
    }

    /// Insert a node. Returns false if it was already present.
    pub fn insert(&mut self, v: N) -> bool {
        if self.contains(v) {
            return false;
        }
        self.adj.insert(v, BTreeSet::new());
        self.indegrees.insert(v, 0);
        true
    }

    /// Remove a node and every incident edge. Returns false if absent.
    pub fn remove(&mut self, v: N) -> bool {
        let Some(succs) = self.adj.remove(&v) else {
            return false;
        };
        for w in succs {
            *self.indegrees.get_mut(&w).expect("successor indegree") -= 1;
        }
        self.indegrees.remove(&v);
        for (_, succs) in self.adj.iter_mut() {
            succs.remove(&v);
        }
        true
    }

    /// Add the edge `src -> dst`. Idempotent; returns whether the edge is new.
    /// Both endpoints must be present.
    pub fn connect(&mut self, src: N, dst: N) -> bool {
        assert!(self.contains(src), "connect: graph does not contain {src:?}");
        assert!(self.contains(dst), "connect: graph does not contain {dst:?}");
        if self.adj.get_mut(&src).unwrap().insert(dst) {
            *self.indegrees.get_mut(&dst).unwrap() += 1;
            true
        } else {
            false
        }
    }

    /// Remove the edge `src -> dst`. The edge must be present.
    pub fn disconnect(&mut self, src: N, dst: N) {
        assert!(self.contains(src), "disconnect: graph does not contain {src:?}");
        assert!(self.contains(dst), "disconnect: graph does not contain {dst:?}");
        let removed = self.adj.get_mut(&src).unwrap().remove(&dst);
        assert!(removed, "disconnect: no edge {src:?} -> {dst:?}");
        *self.indegrees.get_mut(&dst).unwrap() -= 1;
    }

    pub fn is_edge(&self, src: N, dst: N) -> bool {
        self.adj.get(&src).is_some_and(|s| s.contains(&dst))
    }

    pub fn indegree(&self, v: N) -> u32 {
        *self
            .indegrees
            .get(&v)
            .unwrap_or_else(|| panic!("indegree: graph does not contain {v:?}"))
    }

    pub fn outdegree(&self, v: N) -> u32 {
        self.adj
            .get(&v)
            .unwrap_or_else(|| panic!("outdegree: graph does not contain {v:?}"))
            .len() as u32
    }

    /// Successors of `v` in ascending handle order.
    pub fn adj(&self, v: N) -> impl Iterator<Item = N> + '_ {
        self.adj
            .get(&v)
            .unwrap_or_else(|| panic!("adj: graph does not contain {v:?}"))
            .iter()
            .copied()
    }

    /// All nodes in ascending handle order.
    pub fn nodes(&self) -> impl Iterator<Item = N> + '_ {
        self.adj.keys().copied()
    }

    /// All edges, ordered by (src, dst).
    pub fn edges(&self) -> impl Iterator<Item = (N, N)> + '_ {
        self.adj
            .iter()
            .flat_map(|(&v, succs)| succs.iter().map(move |&w| (v, w)))
    }

    /// Nodes with indegree zero, in handle order.
    pub fn entries(&self) -> Vec<N> {
        self.nodes().filter(|&v| self.indegree(v) == 0).collect()
    }

    /// Nodes with outdegree zero, in handle order.
    pub fn exits(&self) -> Vec<N> {
        self.nodes().filter(|&v| self.outdegree(v) == 0).collect()
    }

    /// Predecessor lists, ordered by handle within each list. One O(E) scan;
    /// used by the spanning-tree pass which needs incident edges both ways.
    pub fn predecessor_map(&self) -> BTreeMap<N, Vec<N>> {
        let mut preds: BTreeMap<N, Vec<N>> = self.nodes().map(|v| (v, Vec::new())).collect();
        for (v, w) in self.edges() {
            preds.get_mut(&w).unwrap().push(v);
        }
        preds
    }

    /// Graphviz rendering, for debugging.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {\n");
        for (v, succs) in &self.adj {
            let _ = write!(out, "\t\"{v:?}\" -> {{ ");
            for w in succs {
                let _ = write!(out, "\"{w:?}\" ");
            }
            let _ = writeln!(out, "}};");
        }
        out.push('}');
        out
    }
}

// ─── Single-entry single-exit DAG ───────────────────────────────────────────

/// A directed acyclic graph with a unique entry (indegree 0) and a unique
/// exit (outdegree 0) — the shape of a loop body once the back edge is
/// removed. Entry and exit are computed once at construction; the graph is
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct LoopDag<N: NodeKey> {
    graph: DiGraph<N>,
    entry: N,
    exit: N,
}

impl<N: NodeKey> LoopDag<N> {
    /// Wrap a graph, asserting the single-entry/single-exit shape. Callers
    /// must have established acyclicity; it is re-checked in debug builds.
    pub fn new(graph: DiGraph<N>) -> Self {
        debug_assert!(
            crate::topo::find_cycle(&graph).is_none(),
            "loop graph has a cycle after back-edge removal"
        );
        let entries = graph.entries();
        let exits = graph.exits();
        assert!(
            entries.len() == 1,
            "loop graph has {} entries, expected 1",
            entries.len()
        );
        assert!(
            exits.len() == 1,
            "loop graph has {} exits, expected 1",
            exits.len()
        );
        Self {
            entry: entries[0],
            exit: exits[0],
            graph,
        }
    }

    pub fn graph(&self) -> &DiGraph<N> {
        &self.graph
    }

    pub fn entry(&self) -> N {
        self.entry
    }

    pub fn exit(&self) -> N {
        self.exit
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
