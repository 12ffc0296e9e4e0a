//! Reference interpreter for the IR.
//!
//! Executes defined functions and records every call into an `INSTRUMENT_*`
//! declaration as a [`ProbeEvent`]. This is how the instrumentation is
//! validated end to end: run the instrumented module and compare the probe
//! stream — including the per-iteration path ids — against expectations,
//! instead of eyeballing emitted IR.
//!
//! Integers are 64-bit with wrapping arithmetic; conditions treat non-zero
//! as true. A step budget guards against runaway loops in broken tests.

use rustc_hash::FxHashMap;

use crate::ir::{BinOp, BlockId, FuncId, InstKind, Module, Operand, Terminator, ValueId};

/// One observed probe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    Initialize,
    Cleanup,
    EnterLoop(String),
    ExitLoop(String),
    Latch(String),
    Header(String),
    Path(i32),
}

pub struct Interp<'m> {
    module: &'m Module,
    /// Probe calls in execution order.
    pub events: Vec<ProbeEvent>,
    steps: usize,
    max_steps: usize,
}

impl<'m> Interp<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            events: Vec::new(),
            steps: 0,
            max_steps: 1_000_000,
        }
    }

    /// Run constructors (priority ascending), then `main`, then destructors
    /// (priority descending). Returns `main`'s return value.
    pub fn run_program(&mut self, main: FuncId) -> Option<i64> {
        let mut ctors = self.module.ctors.clone();
        ctors.sort_by_key(|&(_, prio)| prio);
        for (f, _) in ctors {
            self.run_function(f);
        }

        let result = self.run_function(main);

        let mut dtors = self.module.dtors.clone();
        dtors.sort_by_key(|&(_, prio)| std::cmp::Reverse(prio));
        for (f, _) in dtors {
            self.run_function(f);
        }

        result
    }

    /// Execute one function. Declarations dispatch straight to the probe
    /// recorder (zero-argument probes only).
    pub fn run_function(&mut self, fid: FuncId) -> Option<i64> {
        let module = self.module;
        let func = &module.funcs[fid];
        if func.is_declaration {
            self.record_probe(fid, &[], &FxHashMap::default());
            return None;
        }

        let mut regs: FxHashMap<ValueId, i64> = FxHashMap::default();
        let mut slots: FxHashMap<ValueId, i64> = FxHashMap::default();
        let mut prev: Option<BlockId> = None;
        let mut cur = func.entry();

        loop {
            let block = &func.blocks[cur];
            let phi_end = block.first_insertion_index();

            // Phis read their incomings simultaneously on block entry.
            let mut phi_writes = Vec::new();
            for inst in &block.insts[..phi_end] {
                let InstKind::Phi { dst, incomings } = &inst.kind else {
                    unreachable!("leading instructions are phis");
                };
                let from = prev.expect("phi executed in the entry block");
                let (value, _) = incomings
                    .iter()
                    .find(|&&(_, pred)| pred == from)
                    .unwrap_or_else(|| {
                        panic!("phi in {} has no incoming for predecessor", block.name)
                    });
                phi_writes.push((*dst, self.eval(*value, &regs)));
            }
            for (dst, val) in phi_writes {
                regs.insert(dst, val);
            }

            for inst in &block.insts[phi_end..] {
                self.bump_step(&func.name);
                match &inst.kind {
                    InstKind::Alloca { dst, .. } => {
                        slots.insert(*dst, 0);
                    }
                    InstKind::Load { dst, slot } => {
                        let v = *slots
                            .get(slot)
                            .unwrap_or_else(|| panic!("load from unallocated slot in {}", block.name));
                        regs.insert(*dst, v);
                    }
                    InstKind::Store { value, slot } => {
                        let v = self.eval(*value, &regs);
                        slots.insert(*slot, v);
                    }
                    InstKind::Bin { op, dst, lhs, rhs } => {
                        let a = self.eval(*lhs, &regs);
                        let b = self.eval(*rhs, &regs);
                        regs.insert(*dst, apply(*op, a, b));
                    }
                    InstKind::Call { callee, args, dst } => {
                        let ret = if module.funcs[*callee].is_declaration {
                            self.record_probe(*callee, args, &regs);
                            None
                        } else {
                            self.run_function(*callee)
                        };
                        if let Some(dst) = dst {
                            regs.insert(*dst, ret.unwrap_or(0));
                        }
                    }
                    InstKind::Phi { .. } => unreachable!("phi after the leading group"),
                }
            }

            self.bump_step(&func.name);
            match block.term() {
                Terminator::Br { target } => {
                    prev = Some(cur);
                    cur = *target;
                }
                Terminator::CondBr {
                    cond,
                    then_to,
                    else_to,
                } => {
                    let taken = self.eval(*cond, &regs) != 0;
                    prev = Some(cur);
                    cur = if taken { *then_to } else { *else_to };
                }
                Terminator::Ret { value } => {
                    return (*value).map(|v| self.eval(v, &regs));
                }
            }
        }
    }

    fn eval(&self, op: Operand, regs: &FxHashMap<ValueId, i64>) -> i64 {
        match op {
            Operand::Const(c) => c,
            Operand::Value(v) => *regs
                .get(&v)
                .unwrap_or_else(|| panic!("use of undefined value %{}", v.index())),
            Operand::Global(_) => panic!("global used as an integer operand"),
        }
    }

    fn global_str(&self, op: Operand) -> String {
        match op {
            Operand::Global(g) => self.module.globals[g].value.clone(),
            other => panic!("probe name operand is not a global: {other}"),
        }
    }

    fn record_probe(&mut self, callee: FuncId, args: &[Operand], regs: &FxHashMap<ValueId, i64>) {
        let name = self.module.funcs[callee].name.as_str();
        let event = match name {
            "INSTRUMENT_initialize" => ProbeEvent::Initialize,
            "INSTRUMENT_cleanup" => ProbeEvent::Cleanup,
            "INSTRUMENT_enter_loop" => ProbeEvent::EnterLoop(self.global_str(args[0])),
            "INSTRUMENT_exit_loop" => ProbeEvent::ExitLoop(self.global_str(args[0])),
            "INSTRUMENT_latch" => ProbeEvent::Latch(self.global_str(args[0])),
            "INSTRUMENT_header" => ProbeEvent::Header(self.global_str(args[0])),
            "INSTRUMENT_path" => ProbeEvent::Path(self.eval(args[0], regs) as i32),
            other => panic!("interp: call to unknown external {other}"),
        };
        self.events.push(event);
    }

    fn bump_step(&mut self, func_name: &str) {
        self.steps += 1;
        assert!(
            self.steps <= self.max_steps,
            "interpreter exceeded {} steps in {func_name}",
            self.max_steps
        );
    }

    /// Only the path ids, in order — the usual assertion target.
    pub fn path_ids(&self) -> Vec<i32> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ProbeEvent::Path(id) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

fn apply(op: BinOp, a: i64, b: i64) -> i64 {
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Rem => {
            assert!(b != 0, "remainder by zero");
            a.wrapping_rem(b)
        }
        BinOp::Eq => i64::from(a == b),
        BinOp::Ne => i64::from(a != b),
        BinOp::Slt => i64::from(a < b),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
