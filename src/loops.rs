//! Natural-loop discovery over the IR.
//!
//! The pass needs the canonical loop vocabulary: header, latch, preheader,
//! member blocks, exit blocks, nesting. Dominators come from the iterative
//! Cooper–Harvey–Kennedy scheme over reverse postorder; a back edge is any
//! edge whose target dominates its source; membership is the reverse flood
//! from the latch bounded by the header.
//!
//! Also home to the loop-graph builder: the projection of one innermost
//! loop into a [`LoopDag`] with the back edge removed.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::graph::{DiGraph, LoopDag};
use crate::ir::{Arena, BlockId, Function, Id};

// ─── Dominators ─────────────────────────────────────────────────────────────

/// Immediate-dominator map for the blocks reachable from the entry.
/// The entry maps to itself.
pub struct Dominators {
    idom: FxHashMap<BlockId, BlockId>,
    entry: BlockId,
}

impl Dominators {
    pub fn compute(func: &Function) -> Self {
        let entry = func.entry();

        // Postorder DFS, iterative.
        let mut postorder = Vec::new();
        let mut visited = rustc_hash::FxHashSet::default();
        let mut stack = vec![(entry, 0usize)];
        visited.insert(entry);
        while let Some((bb, succ_idx)) = stack.pop() {
            let succs = func.successors(bb);
            if succ_idx < succs.len() {
                stack.push((bb, succ_idx + 1));
                let next = succs[succ_idx];
                if visited.insert(next) {
                    stack.push((next, 0));
                }
            } else {
                postorder.push(bb);
            }
        }

        let rpo: Vec<BlockId> = postorder.iter().rev().copied().collect();
        let rpo_num: FxHashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, &bb)| (bb, i)).collect();

        let mut idom: FxHashMap<BlockId, BlockId> = FxHashMap::default();
        idom.insert(entry, entry);

        let intersect = |idom: &FxHashMap<BlockId, BlockId>, mut a: BlockId, mut b: BlockId| {
            while a != b {
                while rpo_num[&a] > rpo_num[&b] {
                    a = idom[&a];
                }
                while rpo_num[&b] > rpo_num[&a] {
                    b = idom[&b];
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &bb in rpo.iter().skip(1) {
                let mut new_idom = None;
                for pred in func.predecessors(bb) {
                    if !idom.contains_key(&pred) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(cur) => intersect(&idom, pred, cur),
                    });
                }
                let new_idom = new_idom.expect("reachable block with no processed predecessor");
                if idom.get(&bb) != Some(&new_idom) {
                    idom.insert(bb, new_idom);
                    changed = true;
                }
            }
        }

        Self { idom, entry }
    }

    /// Does `a` dominate `b`? Blocks unreachable from the entry dominate
    /// nothing and are dominated by nothing.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.idom.contains_key(&a) || !self.idom.contains_key(&b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            if cur == self.entry {
                return false;
            }
            cur = self.idom[&cur];
        }
    }
}

// ─── Loop forest ────────────────────────────────────────────────────────────

pub type LoopId = Id<NaturalLoop>;

/// One natural loop. Loops sharing a header are merged, so a loop may carry
/// several latches (and is then not in simplified form).
#[derive(Debug)]
pub struct NaturalLoop {
    pub header: BlockId,
    pub latches: Vec<BlockId>,
    pub blocks: BTreeSet<BlockId>,
    pub parent: Option<LoopId>,
    pub children: Vec<LoopId>,
}

/// All natural loops of a function, with nesting. Loop IDs are assigned in
/// ascending header order, which is the traversal order of the pass.
pub struct LoopForest {
    pub loops: Arena<NaturalLoop>,
}

impl LoopForest {
    pub fn compute(func: &Function) -> Self {
        let doms = Dominators::compute(func);

        // Back edges grouped by header, in handle order.
        let mut latches_by_header: std::collections::BTreeMap<BlockId, Vec<BlockId>> =
            std::collections::BTreeMap::new();
        for t in func.blocks.ids() {
            for h in func.successors(t) {
                if doms.dominates(h, t) {
                    let latches = latches_by_header.entry(h).or_default();
                    if !latches.contains(&t) {
                        latches.push(t);
                    }
                }
            }
        }

        let mut loops = Arena::new();
        for (header, latches) in latches_by_header {
            let mut blocks = BTreeSet::new();
            blocks.insert(header);
            for &latch in &latches {
                let mut work = vec![latch];
                blocks.insert(latch);
                while let Some(bb) = work.pop() {
                    if bb == header {
                        continue;
                    }
                    for pred in func.predecessors(bb) {
                        if blocks.insert(pred) {
                            work.push(pred);
                        }
                    }
                }
            }
            loops.push(NaturalLoop {
                header,
                latches,
                blocks,
                parent: None,
                children: Vec::new(),
            });
        }

        let mut forest = Self { loops };
        forest.link_nesting();
        forest
    }

    /// Parent = the smallest strictly larger loop containing the header.
    fn link_nesting(&mut self) {
        let ids: Vec<LoopId> = self.loops.ids().collect();
        for &id in &ids {
            let header = self.loops[id].header;
            let size = self.loops[id].blocks.len();
            let mut best: Option<(usize, LoopId)> = None;
            for &other in &ids {
                if other == id {
                    continue;
                }
                let o = &self.loops[other];
                if o.blocks.contains(&header) && o.blocks.len() > size {
                    if best.is_none_or(|(bs, _)| o.blocks.len() < bs) {
                        best = Some((o.blocks.len(), other));
                    }
                }
            }
            if let Some((_, parent)) = best {
                self.loops[id].parent = Some(parent);
            }
        }
        for &id in &ids {
            if let Some(parent) = self.loops[id].parent {
                self.loops[parent].children.push(id);
            }
        }
    }

    /// A loop with no nested loops.
    pub fn is_innermost(&self, id: LoopId) -> bool {
        self.loops[id].children.is_empty()
    }

    /// The unique latch, when there is exactly one.
    pub fn single_latch(&self, id: LoopId) -> Option<BlockId> {
        match self.loops[id].latches.as_slice() {
            [latch] => Some(*latch),
            _ => None,
        }
    }

    /// The preheader: the unique out-of-loop predecessor of the header,
    /// required to branch only to the header.
    pub fn preheader(&self, func: &Function, id: LoopId) -> Option<BlockId> {
        let lp = &self.loops[id];
        let outside: Vec<BlockId> = func
            .predecessors(lp.header)
            .into_iter()
            .filter(|p| !lp.blocks.contains(p))
            .collect();
        match outside.as_slice() {
            [pre] if func.successors(*pre) == vec![lp.header] => Some(*pre),
            _ => None,
        }
    }

    /// Blocks outside the loop targeted by edges from inside, deduplicated,
    /// in handle order.
    pub fn exit_blocks(&self, func: &Function, id: LoopId) -> Vec<BlockId> {
        let lp = &self.loops[id];
        let mut exits = BTreeSet::new();
        for &bb in &lp.blocks {
            for succ in func.successors(bb) {
                if !lp.blocks.contains(&succ) {
                    exits.insert(succ);
                }
            }
        }
        exits.into_iter().collect()
    }

    /// Dedicated exits: every exit block is reached only from inside the loop.
    pub fn has_dedicated_exits(&self, func: &Function, id: LoopId) -> bool {
        let lp = &self.loops[id];
        self.exit_blocks(func, id).iter().all(|&exit| {
            func.predecessors(exit)
                .iter()
                .all(|p| lp.blocks.contains(p))
        })
    }

    /// The canonical shape required for instrumentation: unique preheader,
    /// single latch, dedicated exits.
    pub fn is_simplified(&self, func: &Function, id: LoopId) -> bool {
        self.preheader(func, id).is_some()
            && self.single_latch(id).is_some()
            && self.has_dedicated_exits(func, id)
    }

    /// Register a freshly inserted block with a loop and every enclosing loop.
    pub fn add_block(&mut self, id: LoopId, bb: BlockId) {
        let mut cur = Some(id);
        while let Some(l) = cur {
            self.loops[l].blocks.insert(bb);
            cur = self.loops[l].parent;
        }
    }
}

// ─── Loop graph builder ─────────────────────────────────────────────────────

/// Project an innermost loop into a single-entry/single-exit DAG:
/// keep the member blocks reachable from the latch, connect intra-loop
/// control-flow edges, then cut the back edge.
///
/// The caller must have validated simplified form (single latch).
pub fn build_loop_dag(func: &Function, forest: &LoopForest, id: LoopId) -> LoopDag<BlockId> {
    let lp = &forest.loops[id];
    let latch = forest
        .single_latch(id)
        .expect("build_loop_dag requires a single latch");

    // Blocks dead inside the body never execute an iteration; drop them.
    let reachable = func.reachable_from(latch);
    let retained: BTreeSet<BlockId> = lp
        .blocks
        .iter()
        .copied()
        .filter(|bb| reachable.contains(bb))
        .collect();

    let mut g = DiGraph::new();
    for &bb in &retained {
        g.insert(bb);
    }
    for &bb in &retained {
        for succ in func.successors(bb) {
            if retained.contains(&succ) {
                g.connect(bb, succ);
            }
        }
    }

    g.disconnect(latch, lp.header);
    LoopDag::new(g)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
