/// Static program representation.
///
/// A kernel is decoded into a `ProgramBuilder` (mutable staging form), then
/// `link` resolves branch targets and barrier participant counts and freezes
/// it into a `Program` that every emulated thread shares read-only.
/// Instructions are a closed `Op` enum; every consumer matches exhaustively.
use std::collections::{BTreeMap, HashMap};

use crate::error::{Result, VerifyError};

/// Interned register identifier (index into `Program::register_names`).
pub type RegId = u32;

// ---------------------------------------------------------------------------
// Operands
// ---------------------------------------------------------------------------

/// Special (read-only) registers provided by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Special {
    Tid(Axis),
    Ntid(Axis),
    Ctaid(Axis),
    Nctaid(Axis),
    LaneId,
    WarpId,
    NWarpId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(RegId),
    Imm(i64),
    Special(Special),
    /// A named variable (shared declaration or kernel parameter)
    Symbol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrBase {
    Reg(RegId),
    Symbol(String),
    Absolute,
}

/// `[base+offset]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub base: AddrBase,
    pub offset: i64,
}

/// State space of a memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Shared,
    Global,
    Param,
    Local,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    MulLo,
    MulHi,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredOp {
    And,
    Or,
    Xor,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShflMode {
    Up,
    Down,
    Bfly,
    Idx,
}

/// `@%p` or `@!%p`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guard {
    pub pred: RegId,
    pub negated: bool,
}

/// Barrier operands: `bar.sync a{, b}`. `count` is filled in by `link`
/// when the source omits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierArgs {
    pub name: Operand,
    pub count: Option<Operand>,
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Label(String),
    /// Binds a `.shared` variable name to its address in the block's window
    SharedDecl { name: String, address: i64 },
    Mov { dst: RegId, src: Operand },
    Binary { op: BinOp, dst: RegId, a: Operand, b: Operand },
    Mad { dst: RegId, a: Operand, b: Operand, c: Operand },
    Unary { op: UnOp, dst: RegId, src: Operand },
    SetP {
        cmp: CmpOp,
        unsigned: bool,
        dst: RegId,
        /// Second destination of `setp ... %p|%q`, receives the negation
        dst_neg: Option<RegId>,
        a: Operand,
        b: Operand,
    },
    Selp { dst: RegId, a: Operand, b: Operand, pred: Guard },
    PredLogic { op: PredOp, dst: RegId, a: Guard, b: Option<Guard> },
    Load { space: Space, dsts: Vec<RegId>, addr: Address, width: i64 },
    Store { space: Space, addr: Address, srcs: Vec<Operand>, width: i64 },
    /// `atom` / `red`: read-modify-write, logged as a write
    Atomic { space: Space, dst: Option<RegId>, addr: Address },
    Branch { label: String, target: usize },
    BarrierSync { args: BarrierArgs, result: Option<RegId> },
    BarrierArrive { args: BarrierArgs },
    Shuffle {
        mode: ShflMode,
        dst: RegId,
        pred_dst: Option<RegId>,
        src: Operand,
        lane: Operand,
        clamp: Operand,
    },
    Exit,
    /// Anything the emulator does not interpret; its destination becomes undefined
    Other { opcode: String, dst: Option<RegId> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub guard: Option<Guard>,
    /// 1-based source line
    pub line: usize,
}

impl Instruction {
    pub fn kind(&self) -> Kind {
        match &self.op {
            Op::Label(_) => Kind::Label,
            Op::SharedDecl { .. } => Kind::SharedDecl,
            Op::Mov { .. } => Kind::Mov,
            Op::Binary { .. } => Kind::Arith,
            Op::Mad { .. } => Kind::Mad,
            Op::Unary { .. } => Kind::Unary,
            Op::SetP { .. } => Kind::SetP,
            Op::Selp { .. } => Kind::Selp,
            Op::PredLogic { .. } => Kind::PredLogic,
            Op::Load { space: Space::Shared, .. } => Kind::LoadShared,
            Op::Load { .. } => Kind::Load,
            Op::Store { space: Space::Shared, .. } => Kind::StoreShared,
            Op::Store { .. } => Kind::Store,
            Op::Atomic { space: Space::Shared, .. } => Kind::AtomicShared,
            Op::Atomic { .. } => Kind::Atomic,
            Op::Branch { .. } => Kind::Branch,
            Op::BarrierSync { .. } => Kind::BarrierSync,
            Op::BarrierArrive { .. } => Kind::BarrierArrive,
            Op::Shuffle { .. } => Kind::Shuffle,
            Op::Exit => Kind::Exit,
            Op::Other { .. } => Kind::Other,
        }
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self.op, Op::BarrierSync { .. } | Op::BarrierArrive { .. })
    }
}

/// Instruction kinds, used for static and dynamic statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Label,
    SharedDecl,
    Mov,
    Arith,
    Mad,
    Unary,
    SetP,
    Selp,
    PredLogic,
    LoadShared,
    StoreShared,
    AtomicShared,
    Load,
    Store,
    Atomic,
    Branch,
    BarrierSync,
    BarrierArrive,
    Shuffle,
    Exit,
    Other,
}

impl Kind {
    pub const COUNT: usize = 21;

    pub const ALL: [Kind; Kind::COUNT] = [
        Kind::Label,
        Kind::SharedDecl,
        Kind::Mov,
        Kind::Arith,
        Kind::Mad,
        Kind::Unary,
        Kind::SetP,
        Kind::Selp,
        Kind::PredLogic,
        Kind::LoadShared,
        Kind::StoreShared,
        Kind::AtomicShared,
        Kind::Load,
        Kind::Store,
        Kind::Atomic,
        Kind::Branch,
        Kind::BarrierSync,
        Kind::BarrierArrive,
        Kind::Shuffle,
        Kind::Exit,
        Kind::Other,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Label => "label",
            Kind::SharedDecl => "shared-decl",
            Kind::Mov => "mov",
            Kind::Arith => "arith",
            Kind::Mad => "mad",
            Kind::Unary => "unary",
            Kind::SetP => "setp",
            Kind::Selp => "selp",
            Kind::PredLogic => "pred-logic",
            Kind::LoadShared => "ld.shared",
            Kind::StoreShared => "st.shared",
            Kind::AtomicShared => "atom.shared",
            Kind::Load => "ld",
            Kind::Store => "st",
            Kind::Atomic => "atom",
            Kind::Branch => "bra",
            Kind::BarrierSync => "bar.sync",
            Kind::BarrierArrive => "bar.arrive",
            Kind::Shuffle => "shfl",
            Kind::Exit => "exit",
            Kind::Other => "other",
        }
    }
}

/// Per-kind instruction counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindCounts([u64; Kind::COUNT]);

impl Default for KindCounts {
    fn default() -> Self {
        KindCounts([0; Kind::COUNT])
    }
}

impl KindCounts {
    pub fn record(&mut self, kind: Kind) {
        self.0[kind.index()] += 1;
    }

    pub fn get(&self, kind: Kind) -> u64 {
        self.0[kind.index()]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    pub fn merge(&mut self, other: &KindCounts) {
        for (mine, theirs) in self.0.iter_mut().zip(other.0.iter()) {
            *mine += theirs;
        }
    }

    /// Non-zero counters keyed by kind name
    pub fn to_map(&self) -> BTreeMap<String, u64> {
        Kind::ALL
            .iter()
            .filter(|k| self.get(**k) > 0)
            .map(|k| (k.name().to_string(), self.get(*k)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Builder (staging form)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ProgramBuilder {
    kernel_name: String,
    instructions: Vec<Instruction>,
    register_names: Vec<String>,
    register_ids: HashMap<String, RegId>,
}

impl ProgramBuilder {
    pub fn new(kernel_name: &str) -> Self {
        ProgramBuilder {
            kernel_name: kernel_name.to_string(),
            ..Default::default()
        }
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    /// Intern a register name such as `%r12`
    pub fn register(&mut self, name: &str) -> RegId {
        if let Some(id) = self.register_ids.get(name) {
            return *id;
        }
        let id = self.register_names.len() as RegId;
        self.register_names.push(name.to_string());
        self.register_ids.insert(name.to_string(), id);
        id
    }

    pub fn push(&mut self, op: Op, guard: Option<Guard>, line: usize) {
        self.instructions.push(Instruction { op, guard, line });
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Resolve branch targets and fill in default barrier participant
    /// counts (all threads of the block), then freeze.
    pub fn link(mut self, block_threads: usize) -> Result<Program> {
        let labels: HashMap<String, usize> = self
            .instructions
            .iter()
            .enumerate()
            .filter_map(|(pc, inst)| match &inst.op {
                Op::Label(name) => Some((name.clone(), pc)),
                _ => None,
            })
            .collect();

        for inst in self.instructions.iter_mut() {
            match &mut inst.op {
                Op::Branch { label, target } => {
                    *target = *labels.get(label.as_str()).ok_or_else(|| {
                        VerifyError::UnknownLabel {
                            line: inst.line,
                            label: label.clone(),
                        }
                    })?;
                }
                Op::BarrierSync { args, .. } | Op::BarrierArrive { args } => {
                    if args.count.is_none() {
                        args.count = Some(Operand::Imm(block_threads as i64));
                    }
                }
                _ => {}
            }
        }

        let has_shuffles = self
            .instructions
            .iter()
            .any(|i| matches!(i.op, Op::Shuffle { .. }));

        Ok(Program {
            kernel_name: self.kernel_name,
            instructions: self.instructions,
            register_names: self.register_names,
            has_shuffles,
        })
    }
}

// ---------------------------------------------------------------------------
// Program (frozen)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Program {
    kernel_name: String,
    instructions: Vec<Instruction>,
    register_names: Vec<String>,
    has_shuffles: bool,
}

impl Program {
    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn get(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn register_name(&self, id: RegId) -> &str {
        self.register_names
            .get(id as usize)
            .map(String::as_str)
            .unwrap_or("%?")
    }

    /// Whether any instruction needs the whole warp (lane exchange)
    pub fn has_shuffles(&self) -> bool {
        self.has_shuffles
    }

    pub fn static_counts(&self) -> KindCounts {
        let mut counts = KindCounts::default();
        for inst in &self.instructions {
            counts.record(inst.kind());
        }
        counts
    }
}
