//! SSA intermediate representation for the instrumentation pass.
//!
//! The IR models the host compiler surface the pass mutates: a module of
//! functions, functions of basic blocks, blocks of instructions ending in a
//! terminator. It is deliberately small — just enough surface for probe
//! calls, the path counter, and edge splitting — but faithful where it
//! matters: phi nodes, debug locations, private string globals, and module
//! constructor/destructor lists.
//!
//! Loop analysis reads this IR, the instrumenter mutates it, and the
//! interpreter executes it in tests.

use std::fmt;
use std::marker::PhantomData;

// ─── Arena and ID types ─────────────────────────────────────────────────────

/// Typed index into an [`Arena<T>`]: a `u32` plus a marker so block ids,
/// function ids, and value ids cannot be mixed up. Ids order and hash by
/// their raw index; blocks are keyed by `BlockId` in the graph layer's
/// `BTreeMap`s, which is where the ordering matters.
pub struct Id<T>(u32, PhantomData<fn() -> T>);

// Spelled out instead of derived: a derive would demand the same trait of
// `T`, and an id is nothing but its index.
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl<T> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.0);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

impl<T> Id<T> {
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw, PhantomData)
    }

    /// Position in the owning arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Append-only store that hands out typed ids. Ids are never invalidated;
/// nothing in the pass deletes IR objects, it only adds.
pub struct Arena<T>(Vec<T>);

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, item: T) -> Id<T> {
        self.0.push(item);
        Id::from_raw(self.0.len() as u32 - 1)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every id, in allocation order.
    pub fn ids(&self) -> impl Iterator<Item = Id<T>> {
        (0..self.0.len() as u32).map(Id::from_raw)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.ids().zip(self.0.iter())
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::ops::Index<Id<T>> for Arena<T> {
    type Output = T;
    fn index(&self, id: Id<T>) -> &T {
        &self.0[id.index()]
    }
}

impl<T> std::ops::IndexMut<Id<T>> for Arena<T> {
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.0[id.index()]
    }
}

impl<T: fmt::Debug> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ─── Type aliases ───────────────────────────────────────────────────────────

pub type BlockId = Id<Block>;
pub type FuncId = Id<Function>;
pub type GlobalId = Id<GlobalString>;

/// Marker type for SSA value IDs.
pub struct ValueMarker;
/// An SSA value — the result of an instruction, numbered per function.
pub type ValueId = Id<ValueMarker>;

// ─── Types, operands, debug locations ───────────────────────────────────────

/// The handful of first-class types the pass manipulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    Void,
    I32,
    Ptr,
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::I32 => write!(f, "i32"),
            Ty::Ptr => write!(f, "ptr"),
        }
    }
}

/// An instruction operand: an SSA value, an immediate, or a global address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Value(ValueId),
    Const(i64),
    Global(GlobalId),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(v) => write!(f, "%{}", v.index()),
            Operand::Const(c) => write!(f, "{c}"),
            Operand::Global(g) => write!(f, "@g{}", g.index()),
        }
    }
}

/// A source position, propagated onto every instruction the pass inserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugLoc {
    pub file: String,
    pub line: u32,
}

impl DebugLoc {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for DebugLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

// ─── Instructions ───────────────────────────────────────────────────────────

/// Binary operation kind. Comparisons produce 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Rem,
    Eq,
    Ne,
    Slt,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Rem => "rem",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::Slt => "slt",
        };
        write!(f, "{s}")
    }
}

/// A single instruction together with its optional source location.
#[derive(Debug, Clone)]
pub struct Inst {
    pub kind: InstKind,
    pub loc: Option<DebugLoc>,
}

impl Inst {
    pub fn new(kind: InstKind) -> Self {
        Self { kind, loc: None }
    }

    pub fn with_loc(kind: InstKind, loc: Option<DebugLoc>) -> Self {
        Self { kind, loc }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstKind::Phi { .. })
    }
}

#[derive(Debug, Clone)]
pub enum InstKind {
    /// Reserve a stack slot. `dst` names the slot address.
    Alloca {
        dst: ValueId,
        ty: Ty,
    },
    Load {
        dst: ValueId,
        slot: ValueId,
    },
    Store {
        value: Operand,
        slot: ValueId,
    },
    Bin {
        op: BinOp,
        dst: ValueId,
        lhs: Operand,
        rhs: Operand,
    },
    Call {
        callee: FuncId,
        args: Vec<Operand>,
        dst: Option<ValueId>,
    },
    /// SSA merge. Must appear before any non-phi instruction of its block.
    Phi {
        dst: ValueId,
        incomings: Vec<(Operand, BlockId)>,
    },
}

// ─── Terminators and blocks ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Terminator {
    Br {
        target: BlockId,
    },
    CondBr {
        cond: Operand,
        then_to: BlockId,
        else_to: BlockId,
    },
    Ret {
        value: Option<Operand>,
    },
}

impl Terminator {
    /// Successor blocks in branch order. May contain duplicates when both
    /// arms of a conditional branch target the same block.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br { target } => vec![*target],
            Terminator::CondBr {
                then_to, else_to, ..
            } => vec![*then_to, *else_to],
            Terminator::Ret { .. } => Vec::new(),
        }
    }

    /// Retarget every occurrence of `old` to `new`.
    pub fn replace_successor(&mut self, old: BlockId, new: BlockId) {
        match self {
            Terminator::Br { target } => {
                if *target == old {
                    *target = new;
                }
            }
            Terminator::CondBr {
                then_to, else_to, ..
            } => {
                if *then_to == old {
                    *then_to = new;
                }
                if *else_to == old {
                    *else_to = new;
                }
            }
            Terminator::Ret { .. } => {}
        }
    }
}

/// A basic block: leading phis, a straight-line body, one terminator.
#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Inst>,
    pub term: Option<Terminator>,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insts: Vec::new(),
            term: None,
        }
    }

    /// Index of the first non-phi position — where "first insertion point"
    /// instructions land.
    pub fn first_insertion_index(&self) -> usize {
        self.insts.iter().take_while(|i| i.is_phi()).count()
    }

    pub fn term(&self) -> &Terminator {
        self.term
            .as_ref()
            .unwrap_or_else(|| panic!("block {} has no terminator", self.name))
    }

    /// Debug location of the last located instruction in the block, if any.
    pub fn last_loc(&self) -> Option<DebugLoc> {
        self.insts.iter().rev().find_map(|i| i.loc.clone())
    }

    /// Debug location of the first located instruction in the block.
    pub fn first_loc(&self) -> Option<DebugLoc> {
        self.insts.iter().find_map(|i| i.loc.clone())
    }
}

// ─── Functions ──────────────────────────────────────────────────────────────

/// A function: either a declaration (probe extern) or a definition with a
/// block arena and an entry block.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub params: Vec<Ty>,
    pub ret: Ty,
    pub blocks: Arena<Block>,
    pub entry: Option<BlockId>,
    pub is_declaration: bool,
    next_value: u32,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            ret: Ty::Void,
            blocks: Arena::new(),
            entry: None,
            is_declaration: false,
            next_value: 0,
        }
    }

    pub fn declaration(name: impl Into<String>, params: Vec<Ty>, ret: Ty) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            blocks: Arena::new(),
            entry: None,
            is_declaration: true,
            next_value: 0,
        }
    }

    pub fn fresh_value(&mut self) -> ValueId {
        let id = ValueId::from_raw(self.next_value);
        self.next_value += 1;
        id
    }

    pub fn entry(&self) -> BlockId {
        self.entry
            .unwrap_or_else(|| panic!("function {} has no entry block", self.name))
    }

    pub fn successors(&self, bb: BlockId) -> Vec<BlockId> {
        match &self.blocks[bb].term {
            Some(t) => t.successors(),
            None => Vec::new(),
        }
    }

    /// Predecessors of `bb` in block order. Linear scan; the functions this
    /// pass sees are small.
    pub fn predecessors(&self, bb: BlockId) -> Vec<BlockId> {
        self.blocks
            .ids()
            .filter(|&p| self.successors(p).contains(&bb))
            .collect()
    }

    /// All blocks reachable from `start` by following terminators,
    /// including `start` itself.
    pub fn reachable_from(&self, start: BlockId) -> rustc_hash::FxHashSet<BlockId> {
        let mut seen = rustc_hash::FxHashSet::default();
        let mut work = vec![start];
        seen.insert(start);
        while let Some(bb) = work.pop() {
            for succ in self.successors(bb) {
                if seen.insert(succ) {
                    work.push(succ);
                }
            }
        }
        seen
    }

    /// Insert `inst` into `bb` at `index`, shifting later instructions down.
    pub fn insert_inst(&mut self, bb: BlockId, index: usize, inst: Inst) {
        self.blocks[bb].insts.insert(index, inst);
    }

    /// Split the control-flow edge `src -> dst`: insert a fresh block that
    /// branches to `dst`, retarget `src`'s terminator, and rewrite phi
    /// incomings in `dst` that referenced `src`.
    pub fn split_edge(&mut self, src: BlockId, dst: BlockId) -> BlockId {
        let name = format!("{}.{}.split", self.blocks[src].name, self.blocks[dst].name);
        let mut block = Block::new(name);
        block.term = Some(Terminator::Br { target: dst });
        let new_bb = self.blocks.push(block);

        self.blocks[src]
            .term
            .as_mut()
            .unwrap_or_else(|| panic!("split_edge: source block has no terminator"))
            .replace_successor(dst, new_bb);

        for inst in &mut self.blocks[dst].insts {
            if let InstKind::Phi { incomings, .. } = &mut inst.kind {
                for (_, pred) in incomings.iter_mut() {
                    if *pred == src {
                        *pred = new_bb;
                    }
                }
            }
        }

        new_bb
    }
}

// ─── Globals and modules ────────────────────────────────────────────────────

/// A private constant NUL-terminated byte array, addressable via
/// [`Operand::Global`].
#[derive(Debug, Clone)]
pub struct GlobalString {
    pub name: String,
    pub value: String,
}

/// A translation unit: functions, string globals, ctor/dtor lists.
#[derive(Debug, Default)]
pub struct Module {
    pub name: String,
    pub funcs: Arena<Function>,
    pub globals: Arena<GlobalString>,
    /// Constructor list: (function, priority). 65535 is the lowest priority.
    pub ctors: Vec<(FuncId, u16)>,
    pub dtors: Vec<(FuncId, u16)>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            funcs: Arena::new(),
            globals: Arena::new(),
            ctors: Vec::new(),
            dtors: Vec::new(),
        }
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.funcs
            .iter()
            .find(|(_, f)| f.name == name)
            .map(|(id, _)| id)
    }

    /// Look up a function by name, declaring it if absent. The idempotent
    /// building block behind probe declaration.
    pub fn get_or_insert_function(&mut self, name: &str, params: Vec<Ty>, ret: Ty) -> FuncId {
        if let Some(id) = self.func_by_name(name) {
            return id;
        }
        self.funcs.push(Function::declaration(name, params, ret))
    }

    pub fn add_function(&mut self, func: Function) -> FuncId {
        self.funcs.push(func)
    }

    pub fn add_global_string(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> GlobalId {
        self.globals.push(GlobalString {
            name: name.into(),
            value: value.into(),
        })
    }

    /// Append to the constructor list unless the function is already there.
    pub fn append_ctor(&mut self, func: FuncId, priority: u16) {
        if !self.ctors.iter().any(|&(f, _)| f == func) {
            self.ctors.push((func, priority));
        }
    }

    pub fn append_dtor(&mut self, func: FuncId, priority: u16) {
        if !self.dtors.iter().any(|&(f, _)| f == func) {
            self.dtors.push((func, priority));
        }
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

/// Convenience layer for constructing a [`Function`] in tests and drivers.
///
/// Tracks a current debug location that is stamped on every instruction
/// pushed until it changes.
pub struct FuncBuilder {
    func: Function,
    cur_loc: Option<DebugLoc>,
}

impl FuncBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            func: Function::new(name),
            cur_loc: None,
        }
    }

    /// Create an empty, unterminated block. The first block created becomes
    /// the entry unless [`set_entry`](Self::set_entry) overrides it.
    pub fn block(&mut self, name: impl Into<String>) -> BlockId {
        let id = self.func.blocks.push(Block::new(name));
        if self.func.entry.is_none() {
            self.func.entry = Some(id);
        }
        id
    }

    pub fn set_entry(&mut self, bb: BlockId) {
        self.func.entry = Some(bb);
    }

    /// Set the debug location stamped on subsequently pushed instructions.
    pub fn set_loc(&mut self, file: impl Into<String>, line: u32) {
        self.cur_loc = Some(DebugLoc::new(file, line));
    }

    pub fn clear_loc(&mut self) {
        self.cur_loc = None;
    }

    fn push(&mut self, bb: BlockId, kind: InstKind) {
        let inst = Inst::with_loc(kind, self.cur_loc.clone());
        self.func.blocks[bb].insts.push(inst);
    }

    pub fn phi(&mut self, bb: BlockId, incomings: &[(Operand, BlockId)]) -> ValueId {
        let dst = self.func.fresh_value();
        self.push(
            bb,
            InstKind::Phi {
                dst,
                incomings: incomings.to_vec(),
            },
        );
        dst
    }

    /// Add an incoming to an existing phi. Closes loop-carried cycles where
    /// the value flows from a block built later.
    pub fn add_phi_incoming(&mut self, bb: BlockId, phi: ValueId, value: Operand, pred: BlockId) {
        for inst in &mut self.func.blocks[bb].insts {
            if let InstKind::Phi { dst, incomings } = &mut inst.kind {
                if *dst == phi {
                    incomings.push((value, pred));
                    return;
                }
            }
        }
        panic!("no phi %{} in block {}", phi.index(), self.func.blocks[bb].name);
    }

    pub fn alloca(&mut self, bb: BlockId, ty: Ty) -> ValueId {
        let dst = self.func.fresh_value();
        self.push(bb, InstKind::Alloca { dst, ty });
        dst
    }

    pub fn load(&mut self, bb: BlockId, slot: ValueId) -> ValueId {
        let dst = self.func.fresh_value();
        self.push(bb, InstKind::Load { dst, slot });
        dst
    }

    pub fn store(&mut self, bb: BlockId, value: Operand, slot: ValueId) {
        self.push(bb, InstKind::Store { value, slot });
    }

    pub fn binop(&mut self, bb: BlockId, op: BinOp, lhs: Operand, rhs: Operand) -> ValueId {
        let dst = self.func.fresh_value();
        self.push(bb, InstKind::Bin { op, dst, lhs, rhs });
        dst
    }

    pub fn call(&mut self, bb: BlockId, callee: FuncId, args: &[Operand]) {
        self.push(
            bb,
            InstKind::Call {
                callee,
                args: args.to_vec(),
                dst: None,
            },
        );
    }

    pub fn br(&mut self, bb: BlockId, target: BlockId) {
        self.func.blocks[bb].term = Some(Terminator::Br { target });
    }

    pub fn cond_br(&mut self, bb: BlockId, cond: Operand, then_to: BlockId, else_to: BlockId) {
        self.func.blocks[bb].term = Some(Terminator::CondBr {
            cond,
            then_to,
            else_to,
        });
    }

    pub fn ret(&mut self, bb: BlockId, value: Option<Operand>) {
        self.func.blocks[bb].term = Some(Terminator::Ret { value });
    }

    /// Validate and hand back the finished function. Panics on missing
    /// entry, unterminated blocks, or phis after non-phi instructions.
    pub fn finish(self) -> Function {
        let func = self.func;
        assert!(
            func.entry.is_some(),
            "function {} has no entry block",
            func.name
        );
        for (_, block) in func.blocks.iter() {
            assert!(
                block.term.is_some(),
                "block {} is not terminated",
                block.name
            );
            let first_non_phi = block.first_insertion_index();
            assert!(
                block.insts[first_non_phi..].iter().all(|i| !i.is_phi()),
                "block {} has a phi after a non-phi instruction",
                block.name
            );
        }
        func
    }
}

// ─── Display ────────────────────────────────────────────────────────────────

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_declaration {
            return writeln!(f, "declare @{}({:?}) -> {}", self.name, self.params, self.ret);
        }
        writeln!(f, "func @{} {{", self.name)?;
        for (id, block) in self.blocks.iter() {
            let marker = if Some(id) == self.entry { " ; entry" } else { "" };
            writeln!(f, "{}:{marker}", block.name)?;
            for inst in &block.insts {
                write!(f, "  ")?;
                match &inst.kind {
                    InstKind::Alloca { dst, ty } => write!(f, "%{} = alloca {ty}", dst.index())?,
                    InstKind::Load { dst, slot } => {
                        write!(f, "%{} = load %{}", dst.index(), slot.index())?
                    }
                    InstKind::Store { value, slot } => {
                        write!(f, "store {value}, %{}", slot.index())?
                    }
                    InstKind::Bin { op, dst, lhs, rhs } => {
                        write!(f, "%{} = {op} {lhs}, {rhs}", dst.index())?
                    }
                    InstKind::Call { callee, args, dst } => {
                        if let Some(dst) = dst {
                            write!(f, "%{} = ", dst.index())?;
                        }
                        write!(f, "call #{}(", callee.index())?;
                        for (i, a) in args.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{a}")?;
                        }
                        write!(f, ")")?;
                    }
                    InstKind::Phi { dst, incomings } => {
                        write!(f, "%{} = phi", dst.index())?;
                        for (i, (val, pred)) in incomings.iter().enumerate() {
                            if i > 0 {
                                write!(f, ",")?;
                            }
                            write!(f, " [{val}, {}]", self.blocks[*pred].name)?;
                        }
                    }
                }
                if let Some(loc) = &inst.loc {
                    write!(f, "  ; {loc}")?;
                }
                writeln!(f)?;
            }
            match &block.term {
                Some(Terminator::Br { target }) => {
                    writeln!(f, "  br {}", self.blocks[*target].name)?
                }
                Some(Terminator::CondBr {
                    cond,
                    then_to,
                    else_to,
                }) => writeln!(
                    f,
                    "  condbr {cond}, {}, {}",
                    self.blocks[*then_to].name, self.blocks[*else_to].name
                )?,
                Some(Terminator::Ret { value: Some(v) }) => writeln!(f, "  ret {v}")?,
                Some(Terminator::Ret { value: None }) => writeln!(f, "  ret")?,
                None => writeln!(f, "  <unterminated>")?,
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", self.name)?;
        for (id, g) in self.globals.iter() {
            writeln!(
                f,
                "@g{} = private constant c\"{}\\00\" ; {}",
                id.index(),
                g.value,
                g.name
            )?;
        }
        for (_, func) in self.funcs.iter() {
            write!(f, "{func}")?;
        }
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
