//! Ball–Larus path numbering for a single-entry/single-exit loop DAG.
//!
//! Three steps, mirroring the classic algorithm:
//!
//! 1. Walk the DAG in reverse topological order assigning each edge a value
//!    such that summing values along any entry→exit path yields a unique id
//!    in `0..num_paths`.
//! 2. Re-add the back edge as a synthetic zero-weight exit→entry edge and
//!    build a maximum spanning tree over the undirected view, weights being
//!    the edge values. Tree edges cost nothing at runtime.
//! 3. For every chord (non-tree edge), derive the counter increment from the
//!    cycle the chord closes with the tree.
//!
//! The synthetic edge is kept distinct from any real edge between the same
//! pair of blocks: the tree records *which* directed edge connected each
//! vertex, and increment derivation walks those recorded edges. Conflating
//! the two (e.g. looking edges up by endpoints) mis-weights loops that
//! branch straight from header to latch.

use std::collections::{BTreeMap, VecDeque};

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::graph::{LoopDag, NodeKey};
use crate::topo;

/// A directed edge of the augmented loop graph: a real control-flow edge or
/// the synthetic exit→entry back edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeRef<N> {
    Real(N, N),
    Back,
}

/// The loop has more acyclic paths than a 32-bit counter can number.
#[derive(Debug, Error)]
#[error("loop has {num_paths} acyclic paths, exceeding the 32-bit path id space")]
pub struct PathOverflow {
    /// Saturating path count.
    pub num_paths: i64,
}

/// The per-loop profiling solution: edge values, spanning tree, increments.
#[derive(Debug)]
pub struct PathProfile<N: NodeKey> {
    entry: N,
    exit: N,
    num_paths: i64,
    edge_vals: BTreeMap<(N, N), i32>,
    /// child → (parent, directed edge realizing the connection).
    tree: BTreeMap<N, (N, EdgeRef<N>)>,
    /// Non-zero increments on real chord edges, in edge order.
    increments: BTreeMap<(N, N), i32>,
    /// Increment of the synthetic chord; zero when the synthetic edge is in
    /// the tree or its increment vanishes.
    back_increment: i32,
}

impl<N: NodeKey> PathProfile<N> {
    pub fn compute(dag: &LoopDag<N>) -> Result<Self, PathOverflow> {
        let (num_paths, edge_vals) = edge_values(dag)?;
        let tree = max_spanning_tree(dag, &edge_vals);
        let (increments, back_increment) = chord_increments(dag, &edge_vals, &tree);
        Ok(Self {
            entry: dag.entry(),
            exit: dag.exit(),
            num_paths,
            edge_vals,
            tree,
            increments,
            back_increment,
        })
    }

    pub fn entry(&self) -> N {
        self.entry
    }

    pub fn exit(&self) -> N {
        self.exit
    }

    /// Number of acyclic entry→exit paths; path ids are `0..num_paths`.
    pub fn num_paths(&self) -> i64 {
        self.num_paths
    }

    pub fn edge_val(&self, src: N, dst: N) -> i32 {
        self.edge_vals[&(src, dst)]
    }

    /// Non-zero increments on real chords, ordered by edge.
    pub fn increments(&self) -> impl Iterator<Item = ((N, N), i32)> + '_ {
        self.increments.iter().map(|(&e, &i)| (e, i))
    }

    /// The increment belonging to the synthetic exit→entry chord, applied at
    /// the iteration boundary on the latch.
    pub fn back_increment(&self) -> i32 {
        self.back_increment
    }

    /// Spanning-tree edges (directed as they appear in the augmented graph).
    pub fn tree_edges(&self) -> impl Iterator<Item = EdgeRef<N>> + '_ {
        self.tree.values().map(|&(_, e)| e)
    }

    /// Enumerate entry→exit paths in adjacency order with an explicit stack,
    /// invoking `f(path_id, blocks)` for each, stopping after `limit` paths.
    /// Returns the number of paths emitted.
    pub fn for_each_path(
        &self,
        dag: &LoopDag<N>,
        limit: usize,
        mut f: impl FnMut(i32, &[N]),
    ) -> usize {
        let g = dag.graph();
        let mut emitted = 0usize;
        if limit == 0 {
            return 0;
        }

        // Frame: (successors, next successor index, value added on entry).
        let mut path = vec![self.entry];
        let mut sum: i64 = 0;
        let mut frames: Vec<(Vec<N>, usize, i64)> =
            vec![(g.adj(self.entry).collect(), 0, 0)];

        while let Some(frame) = frames.last_mut() {
            if frame.0.is_empty() {
                // Only the exit has no successors.
                f(sum as i32, &path);
                emitted += 1;
                if emitted >= limit {
                    return emitted;
                }
                sum -= frame.2;
                frames.pop();
                path.pop();
            } else if frame.1 < frame.0.len() {
                let node = *path.last().unwrap();
                let next = frame.0[frame.1];
                frame.1 += 1;
                let val = i64::from(self.edge_vals[&(node, next)]);
                sum += val;
                path.push(next);
                frames.push((g.adj(next).collect(), 0, val));
            } else {
                sum -= frame.2;
                frames.pop();
                path.pop();
            }
        }

        emitted
    }
}

// ─── Edge values ────────────────────────────────────────────────────────────

type EdgeVals<N> = BTreeMap<(N, N), i32>;

/// Reverse-topological edge-value assignment. For each vertex, successor
/// edges receive the running partial sum of successor path counts, in
/// adjacency order — the same order the report's path enumeration walks.
fn edge_values<N: NodeKey>(dag: &LoopDag<N>) -> Result<(i64, EdgeVals<N>), PathOverflow> {
    let g = dag.graph();
    let order = topo::topo_order(g);
    assert_eq!(
        order.len(),
        g.node_count(),
        "loop graph is not acyclic"
    );

    let mut num_paths: FxHashMap<N, i64> = FxHashMap::default();
    let mut vals: BTreeMap<(N, N), i64> = BTreeMap::new();

    for &v in order.iter().rev() {
        if g.outdegree(v) == 0 {
            num_paths.insert(v, 1);
        } else {
            let mut running: i64 = 0;
            for w in g.adj(v) {
                vals.insert((v, w), running);
                running = running.saturating_add(num_paths[&w]);
            }
            num_paths.insert(v, running);
        }
    }

    let total = num_paths[&dag.entry()];
    if total > i64::from(i32::MAX) {
        return Err(PathOverflow { num_paths: total });
    }

    // Every value is bounded by the entry's path count, so the casts hold.
    let vals = vals.into_iter().map(|(e, v)| (e, v as i32)).collect();
    Ok((total, vals))
}

// ─── Maximum spanning tree ──────────────────────────────────────────────────

fn edge_weight<N: NodeKey>(vals: &EdgeVals<N>, e: EdgeRef<N>) -> i64 {
    match e {
        EdgeRef::Real(src, dst) => i64::from(vals[&(src, dst)]),
        EdgeRef::Back => 0,
    }
}

/// The strongest directed edge connecting `v` and `w` in the augmented
/// graph, if any. Ties prefer the v→w direction, then w→v, then the
/// synthetic edge, so the choice is deterministic.
fn best_edge_between<N: NodeKey>(
    dag: &LoopDag<N>,
    vals: &EdgeVals<N>,
    v: N,
    w: N,
) -> Option<EdgeRef<N>> {
    let g = dag.graph();
    let mut candidates = Vec::with_capacity(3);
    if g.is_edge(v, w) {
        candidates.push(EdgeRef::Real(v, w));
    }
    if g.is_edge(w, v) {
        candidates.push(EdgeRef::Real(w, v));
    }
    let pair = (dag.exit(), dag.entry());
    if pair == (v, w) || pair == (w, v) {
        candidates.push(EdgeRef::Back);
    }
    // Stable max: later candidates must strictly exceed earlier ones.
    candidates
        .into_iter()
        .fold(None, |best: Option<EdgeRef<N>>, c| match best {
            Some(b) if edge_weight(vals, c) <= edge_weight(vals, b) => Some(b),
            _ => Some(c),
        })
}

/// Prim over the undirected view of the augmented graph. Seeded at the
/// lowest-handle vertex (keyed +1 so it is selected first); selection ties
/// break to the lowest handle.
fn max_spanning_tree<N: NodeKey>(
    dag: &LoopDag<N>,
    vals: &EdgeVals<N>,
) -> BTreeMap<N, (N, EdgeRef<N>)> {
    let g = dag.graph();
    let nodes: Vec<N> = g.nodes().collect();
    let mut in_tree: FxHashSet<N> = FxHashSet::default();
    let mut key: FxHashMap<N, i64> = nodes.iter().map(|&v| (v, i64::MIN)).collect();
    let mut parent: FxHashMap<N, (N, EdgeRef<N>)> = FxHashMap::default();
    let mut tree = BTreeMap::new();

    key.insert(nodes[0], 1);

    for _ in 0..nodes.len() {
        let mut best: Option<(N, i64)> = None;
        for &v in &nodes {
            if in_tree.contains(&v) {
                continue;
            }
            if best.is_none_or(|(_, bk)| key[&v] > bk) {
                best = Some((v, key[&v]));
            }
        }
        let (v, k) = best.expect("spanning tree selection ran out of vertices");
        assert!(k > i64::MIN, "loop graph is disconnected");

        in_tree.insert(v);
        if let Some(&(p, e)) = parent.get(&v) {
            tree.insert(v, (p, e));
        }

        for &w in &nodes {
            if in_tree.contains(&w) {
                continue;
            }
            if let Some(e) = best_edge_between(dag, vals, v, w) {
                let weight = edge_weight(vals, e);
                if weight > key[&w] {
                    key.insert(w, weight);
                    parent.insert(w, (v, e));
                }
            }
        }
    }

    assert_eq!(
        tree.len(),
        nodes.len() - 1,
        "spanning tree size must be V - 1"
    );
    tree
}

// ─── Chord increments ───────────────────────────────────────────────────────

fn endpoints<N: NodeKey>(dag: &LoopDag<N>, e: EdgeRef<N>) -> (N, N) {
    match e {
        EdgeRef::Real(src, dst) => (src, dst),
        EdgeRef::Back => (dag.exit(), dag.entry()),
    }
}

/// The unique tree path from `src` to `dst` as traversal steps
/// `(from, to, via)`, found by BFS over the undirected tree.
fn tree_path<N: NodeKey>(
    dag: &LoopDag<N>,
    tree: &BTreeMap<N, (N, EdgeRef<N>)>,
    src: N,
    dst: N,
) -> Vec<(N, N, EdgeRef<N>)> {
    if src == dst {
        return Vec::new();
    }

    // Undirected tree adjacency with the realizing edge on each link.
    let mut links: FxHashMap<N, Vec<(N, EdgeRef<N>)>> = FxHashMap::default();
    for (&child, &(parent, e)) in tree {
        links.entry(child).or_default().push((parent, e));
        links.entry(parent).or_default().push((child, e));
    }

    let mut pred: FxHashMap<N, (N, EdgeRef<N>)> = FxHashMap::default();
    let mut visited: FxHashSet<N> = FxHashSet::default();
    let mut queue = VecDeque::new();
    visited.insert(src);
    queue.push_back(src);

    'search: while let Some(v) = queue.pop_front() {
        let Some(neighbors) = links.get(&v) else {
            continue;
        };
        for &(w, e) in neighbors {
            if visited.insert(w) {
                pred.insert(w, (v, e));
                if w == dst {
                    break 'search;
                }
                queue.push_back(w);
            }
        }
    }

    assert!(
        pred.contains_key(&dst),
        "chord endpoint not reachable through the spanning tree"
    );

    let mut path = Vec::new();
    let mut cur = dst;
    while cur != src {
        let (prev, e) = pred[&cur];
        path.push((prev, cur, e));
        cur = prev;
    }
    path.reverse();
    path
}

/// For every augmented edge outside the tree, derive the counter increment:
/// the chord's own value plus the signed values of tree edges along the
/// unique tree path between its endpoints (negative when traversed with the
/// edge direction, positive against it).
fn chord_increments<N: NodeKey>(
    dag: &LoopDag<N>,
    vals: &EdgeVals<N>,
    tree: &BTreeMap<N, (N, EdgeRef<N>)>,
) -> (BTreeMap<(N, N), i32>, i32) {
    let tree_set: FxHashSet<EdgeRef<N>> = tree.values().map(|&(_, e)| e).collect();

    let mut augmented: Vec<EdgeRef<N>> = dag
        .graph()
        .edges()
        .map(|(s, d)| EdgeRef::Real(s, d))
        .collect();
    augmented.push(EdgeRef::Back);

    let mut increments = BTreeMap::new();
    let mut back_increment = 0i32;

    for chord in augmented {
        if tree_set.contains(&chord) {
            continue;
        }
        let (src, dst) = endpoints(dag, chord);
        let mut inc: i64 = 0;
        for (from, to, via) in tree_path(dag, tree, src, dst) {
            let w = edge_weight(vals, via);
            let (vsrc, vdst) = endpoints(dag, via);
            if (vsrc, vdst) == (from, to) {
                inc -= w;
            } else {
                inc += w;
            }
        }
        inc += edge_weight(vals, chord);

        if inc == 0 {
            continue;
        }
        let inc = i32::try_from(inc).expect("chord increment exceeds 32 bits");
        match chord {
            EdgeRef::Real(s, d) => {
                increments.insert((s, d), inc);
            }
            EdgeRef::Back => back_increment = inc,
        }
    }

    (increments, back_increment)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
