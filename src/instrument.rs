//! IR emission: probe declarations and per-loop instrumentation.
//!
//! The runtime ABI is seven `INSTRUMENT_*` externs with C linkage. Every
//! simplified loop gets header/latch/exit probes; innermost loops
//! additionally get the path counter: a stack slot allocated in the
//! preheader, zeroed at the header, bumped on chord edges (each split into a
//! fresh block), and read into `INSTRUMENT_path` at the latch.
//!
//! The synthetic chord's increment belongs to the iteration boundary and is
//! emitted on the latch ahead of the counter read, so the reported id equals
//! the Ball–Larus path sum.

use crate::ballarus::PathProfile;
use crate::graph::LoopDag;
use crate::ir::{
    BinOp, BlockId, DebugLoc, FuncId, Function, GlobalId, Inst, InstKind, Module, Operand, Ty,
    ValueId,
};
use crate::loops::{LoopForest, LoopId};

/// Constructor/destructor priority for the runtime hooks; 65535 runs last.
pub const CTOR_DTOR_PRIORITY: u16 = 65535;

/// Handles to the runtime probe declarations, resolved once per module.
#[derive(Debug, Clone, Copy)]
pub struct Probes {
    pub initialize: FuncId,
    pub cleanup: FuncId,
    pub enter_loop: FuncId,
    pub exit_loop: FuncId,
    pub latch: FuncId,
    pub header: FuncId,
    pub path: FuncId,
}

impl Probes {
    /// Declare the probe externs, reusing declarations already present.
    pub fn declare(module: &mut Module) -> Self {
        let named = |m: &mut Module, n: &str, params: Vec<Ty>| {
            m.get_or_insert_function(n, params, Ty::Void)
        };
        Self {
            initialize: named(module, "INSTRUMENT_initialize", vec![]),
            cleanup: named(module, "INSTRUMENT_cleanup", vec![]),
            enter_loop: named(module, "INSTRUMENT_enter_loop", vec![Ty::Ptr]),
            exit_loop: named(module, "INSTRUMENT_exit_loop", vec![Ty::Ptr]),
            latch: named(module, "INSTRUMENT_latch", vec![Ty::Ptr]),
            header: named(module, "INSTRUMENT_header", vec![Ty::Ptr]),
            path: named(module, "INSTRUMENT_path", vec![Ty::I32]),
        }
    }

    /// Hook `initialize`/`cleanup` into the module ctor/dtor lists.
    /// Idempotent.
    pub fn attach_ctor_dtor(&self, module: &mut Module) {
        module.append_ctor(self.initialize, CTOR_DTOR_PRIORITY);
        module.append_dtor(self.cleanup, CTOR_DTOR_PRIORITY);
    }
}

/// Whether the loop header already carries a header-probe call — the marker
/// that an earlier run instrumented this loop.
pub fn already_instrumented(func: &Function, header: BlockId, probes: &Probes) -> bool {
    func.blocks[header]
        .insts
        .iter()
        .any(|i| matches!(i.kind, InstKind::Call { callee, .. } if callee == probes.header))
}

/// Place the probes every simplified loop receives: `header(name)` at the
/// header's first insertion point, `latch(name)` before the latch
/// terminator, `exit_loop(name)` at each exit block's first insertion point.
///
/// Must run after any path instrumentation of the same loop so the header
/// probe lands ahead of the counter store.
pub fn place_loop_probes(
    func: &mut Function,
    forest: &LoopForest,
    id: LoopId,
    probes: &Probes,
    name: GlobalId,
) {
    let header = forest.loops[id].header;
    let latch = forest
        .single_latch(id)
        .expect("probe placement requires a simplified loop");
    let exits = forest.exit_blocks(func, id);

    let arg = Operand::Global(name);

    let loc = func.blocks[header].first_loc();
    let at = func.blocks[header].first_insertion_index();
    insert_probe_call(func, header, at, probes.header, arg, loc);

    let loc = func.blocks[latch].last_loc();
    let at = func.blocks[latch].insts.len();
    insert_probe_call(func, latch, at, probes.latch, arg, loc);

    for exit in exits {
        let loc = func.blocks[exit].first_loc();
        let at = func.blocks[exit].first_insertion_index();
        insert_probe_call(func, exit, at, probes.exit_loop, arg, loc);
    }
}

fn insert_probe_call(
    func: &mut Function,
    bb: BlockId,
    at: usize,
    callee: FuncId,
    arg: Operand,
    loc: Option<DebugLoc>,
) {
    func.insert_inst(
        bb,
        at,
        Inst::with_loc(
            InstKind::Call {
                callee,
                args: vec![arg],
                dst: None,
            },
            loc,
        ),
    );
}

/// The residue of instrumenting one innermost loop.
pub struct PathInstrumentation {
    /// The counter's stack slot.
    pub counter: ValueId,
    /// Blocks created by chord-edge splitting, already registered with the
    /// loop forest.
    pub split_blocks: Vec<BlockId>,
}

/// Emit the path-counter machinery for an innermost loop.
pub fn instrument_path_profile(
    func: &mut Function,
    forest: &mut LoopForest,
    id: LoopId,
    dag: &LoopDag<BlockId>,
    profile: &PathProfile<BlockId>,
    probes: &Probes,
) -> PathInstrumentation {
    let header = dag.entry();
    let latch = dag.exit();
    let preheader = forest
        .preheader(func, id)
        .expect("simplified loop has a preheader");

    // 1. Counter slot in the preheader, ahead of its terminator.
    let counter = func.fresh_value();
    let loc = func.blocks[preheader].last_loc();
    let at = func.blocks[preheader].insts.len();
    func.insert_inst(
        preheader,
        at,
        Inst::with_loc(
            InstKind::Alloca {
                dst: counter,
                ty: Ty::I32,
            },
            loc,
        ),
    );

    // 2. Zero the counter every time the header executes.
    let loc = func.blocks[header].first_loc();
    let at = func.blocks[header].first_insertion_index();
    func.insert_inst(
        header,
        at,
        Inst::with_loc(
            InstKind::Store {
                value: Operand::Const(0),
                slot: counter,
            },
            loc,
        ),
    );

    // 3. One fresh block per instrumented chord.
    let mut split_blocks = Vec::new();
    for ((src, dst), inc) in profile.increments() {
        let loc = func.blocks[src].last_loc();
        let bb = func.split_edge(src, dst);
        forest.add_block(id, bb);
        emit_counter_update(func, bb, 0, counter, inc, loc);
        split_blocks.push(bb);
    }

    // 4. Iteration boundary on the latch: the synthetic chord's increment,
    //    then the counter read feeding the path probe.
    let loc = func.blocks[latch].last_loc();
    let mut at = func.blocks[latch].insts.len();
    if profile.back_increment() != 0 {
        at = emit_counter_update(func, latch, at, counter, profile.back_increment(), loc.clone());
    }
    let read = func.fresh_value();
    func.insert_inst(
        latch,
        at,
        Inst::with_loc(
            InstKind::Load {
                dst: read,
                slot: counter,
            },
            loc.clone(),
        ),
    );
    func.insert_inst(
        latch,
        at + 1,
        Inst::with_loc(
            InstKind::Call {
                callee: probes.path,
                args: vec![Operand::Value(read)],
                dst: None,
            },
            loc,
        ),
    );

    PathInstrumentation {
        counter,
        split_blocks,
    }
}

/// Load the counter, add or subtract `|inc|`, store it back. Returns the
/// index just past the inserted sequence.
fn emit_counter_update(
    func: &mut Function,
    bb: BlockId,
    at: usize,
    counter: ValueId,
    inc: i32,
    loc: Option<DebugLoc>,
) -> usize {
    let loaded = func.fresh_value();
    let updated = func.fresh_value();
    let op = if inc > 0 { BinOp::Add } else { BinOp::Sub };
    let amount = i64::from(inc.unsigned_abs());

    func.insert_inst(
        bb,
        at,
        Inst::with_loc(
            InstKind::Load {
                dst: loaded,
                slot: counter,
            },
            loc.clone(),
        ),
    );
    func.insert_inst(
        bb,
        at + 1,
        Inst::with_loc(
            InstKind::Bin {
                op,
                dst: updated,
                lhs: Operand::Value(loaded),
                rhs: Operand::Const(amount),
            },
            loc.clone(),
        ),
    );
    func.insert_inst(
        bb,
        at + 2,
        Inst::with_loc(
            InstKind::Store {
                value: Operand::Value(updated),
                slot: counter,
            },
            loc,
        ),
    );
    at + 3
}

// ─── Tests ──────────────────────────────────────────────────────────────────
