/// Per-thread emulation state and the dynamic trace it produces.
///
/// `ThreadState` (registers, predicates, shared-name bindings) only exists
/// while a thread is being emulated. What survives into the later passes
/// is the `Thread`: its dynamic trace of shared accesses and barrier events,
/// its Happens segments and its instruction counts.
use std::collections::HashMap;

use tracing::warn;

use crate::config::GlobalBinding;
use crate::graph::InstanceId;
use crate::happens::Happens;
use crate::kernel::{BlockLayout, Dim3};
use crate::memory::SharedAccess;
use crate::program::{Axis, KindCounts, Operand, Program, RegId, Special};
use crate::warp::WARP_SIZE;

/// Distance between the base addresses of two global bindings.
pub const GLOBAL_STRIDE: i64 = 1 << 32;

// ---------------------------------------------------------------------------
// Dynamic trace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum BarrierKind {
    /// Blocking: waits for the barrier to complete
    Sync,
    /// Non-blocking signal
    Arrive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierEvent {
    pub name: u32,
    /// Participant count declared by this thread's instruction
    pub count: usize,
    pub kind: BarrierKind,
    /// Filled in when the barrier dependence graph is built
    pub instance: Option<InstanceId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Shared { address: i64, is_write: bool },
    Barrier(BarrierEvent),
}

/// One logged (executed) instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicInstruction {
    pub pc: usize,
    pub line: usize,
    pub event: Event,
}

impl DynamicInstruction {
    pub fn barrier(&self) -> Option<&BarrierEvent> {
        match &self.event {
            Event::Barrier(b) => Some(b),
            Event::Shared { .. } => None,
        }
    }

    pub fn is_barrier(&self) -> bool {
        self.barrier().is_some()
    }

    pub fn is_sync(&self) -> bool {
        matches!(self.barrier(), Some(b) if b.kind == BarrierKind::Sync)
    }

    pub fn is_arrive(&self) -> bool {
        matches!(self.barrier(), Some(b) if b.kind == BarrierKind::Arrive)
    }
}

// ---------------------------------------------------------------------------
// Thread (persistent)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Thread {
    pub id: usize,
    pub tid: Dim3,
    pub trace: Vec<DynamicInstruction>,
    /// Happens segments, in trace order
    pub segments: Vec<Happens>,
    /// Segment of each trace entry; `None` for barrier events
    pub segment_of: Vec<Option<usize>>,
    pub counts: KindCounts,
    pub dynamic_instructions: u64,
}

impl Thread {
    pub fn new(id: usize, tid: Dim3) -> Self {
        Thread {
            id,
            tid,
            trace: Vec::new(),
            segments: Vec::new(),
            segment_of: Vec::new(),
            counts: KindCounts::default(),
            dynamic_instructions: 0,
        }
    }

    /// Keep the trace and counts of a finished emulation pass and hand back
    /// the buffered shared accesses for the block-wide log.
    pub fn finish(&mut self, state: ThreadState) -> Vec<SharedAccess> {
        self.trace = state.trace;
        self.counts = state.counts;
        self.dynamic_instructions = state.dynamic_instructions;
        self.segments.clear();
        self.segment_of.clear();
        state.accesses
    }

    /// (trace index, event) of every barrier event, in program order
    pub fn barrier_events(&self) -> impl Iterator<Item = (usize, &BarrierEvent)> {
        self.trace
            .iter()
            .enumerate()
            .filter_map(|(idx, d)| d.barrier().map(|b| (idx, b)))
    }

    pub fn segment(&self, trace_index: usize) -> Option<&Happens> {
        self.segment_of
            .get(trace_index)
            .copied()
            .flatten()
            .and_then(|s| self.segments.get(s))
    }
}

// ---------------------------------------------------------------------------
// Emulation state (transient)
// ---------------------------------------------------------------------------

/// Read-only inputs every emulation step needs.
pub struct EmulationContext<'a> {
    pub program: &'a Program,
    pub layout: BlockLayout,
    pub globals: &'a [GlobalBinding],
    pub warnings: bool,
    pub max_barriers: usize,
    pub max_steps: u64,
}

pub struct ThreadState {
    pub thread: usize,
    pub tid: Dim3,
    registers: HashMap<RegId, i64>,
    predicates: HashMap<RegId, bool>,
    shared_locations: HashMap<String, i64>,
    pub trace: Vec<DynamicInstruction>,
    pub accesses: Vec<SharedAccess>,
    pub counts: KindCounts,
    pub dynamic_instructions: u64,
}

impl ThreadState {
    pub fn new(thread: usize, tid: Dim3) -> Self {
        ThreadState {
            thread,
            tid,
            registers: HashMap::new(),
            predicates: HashMap::new(),
            shared_locations: HashMap::new(),
            trace: Vec::new(),
            accesses: Vec::new(),
            counts: KindCounts::default(),
            dynamic_instructions: 0,
        }
    }

    pub fn lane(&self) -> usize {
        self.thread % WARP_SIZE
    }

    pub fn set_value(&mut self, reg: RegId, value: i64) {
        self.registers.insert(reg, value);
    }

    /// Forget a register whose new value cannot be computed
    pub fn clear_value(&mut self, reg: RegId) {
        self.registers.remove(&reg);
    }

    pub fn get_value(&self, reg: RegId, ctx: &EmulationContext<'_>) -> Option<i64> {
        let value = self.registers.get(&reg).copied();
        if value.is_none() && ctx.warnings {
            warn!(
                thread = self.thread,
                "unable to find register {}",
                ctx.program.register_name(reg)
            );
        }
        value
    }

    pub fn set_pred(&mut self, pred: RegId, value: bool) {
        self.predicates.insert(pred, value);
    }

    pub fn clear_pred(&mut self, pred: RegId) {
        self.predicates.remove(&pred);
    }

    pub fn get_pred(&self, pred: RegId, ctx: &EmulationContext<'_>) -> Option<bool> {
        let value = self.predicates.get(&pred).copied();
        if value.is_none() && ctx.warnings {
            warn!(
                thread = self.thread,
                "unable to find predicate {}",
                ctx.program.register_name(pred)
            );
        }
        value
    }

    pub fn register_shared_location(&mut self, name: &str, address: i64) {
        self.shared_locations.insert(name.to_string(), address);
    }

    pub fn find_shared_location(&self, name: &str, ctx: &EmulationContext<'_>) -> Option<i64> {
        let address = self.shared_locations.get(name).copied();
        if address.is_none() && ctx.warnings {
            warn!(
                thread = self.thread,
                "unable to find shared memory location {name}"
            );
        }
        address
    }

    /// Resolve a symbol: shared variables first, then global bindings.
    pub fn resolve_symbol(&self, name: &str, ctx: &EmulationContext<'_>) -> Option<i64> {
        if let Some(addr) = self.shared_locations.get(name) {
            return Some(*addr);
        }
        if let Some(base) = global_base(name, ctx.globals) {
            return Some(base);
        }
        self.find_shared_location(name, ctx)
    }

    pub fn special(&self, special: Special, layout: &BlockLayout) -> i64 {
        let pick = |d: Dim3, axis: Axis| match axis {
            Axis::X => d.x as i64,
            Axis::Y => d.y as i64,
            Axis::Z => d.z as i64,
        };
        match special {
            Special::Tid(a) => pick(self.tid, a),
            Special::Ntid(a) => pick(layout.block_dim, a),
            Special::Ctaid(a) => pick(layout.block_idx, a),
            Special::Nctaid(a) => pick(layout.grid_dim, a),
            Special::LaneId => (self.thread % WARP_SIZE) as i64,
            Special::WarpId => (self.thread / WARP_SIZE) as i64,
            Special::NWarpId => layout.warps() as i64,
        }
    }

    pub fn eval(&self, operand: &Operand, ctx: &EmulationContext<'_>) -> Option<i64> {
        match operand {
            Operand::Reg(r) => self.get_value(*r, ctx),
            Operand::Imm(v) => Some(*v),
            Operand::Special(s) => Some(self.special(*s, &ctx.layout)),
            Operand::Symbol(name) => self.resolve_symbol(name, ctx),
        }
    }
}

/// Base address of a global binding, if `name` is bound
pub fn global_base(name: &str, globals: &[GlobalBinding]) -> Option<i64> {
    globals
        .iter()
        .position(|g| g.name == name)
        .map(|idx| (idx as i64 + 1) * GLOBAL_STRIDE)
}

/// Value stored at a global address, reading `width`-byte elements
pub fn global_value(address: i64, width: i64, globals: &[GlobalBinding]) -> Option<i64> {
    let idx = address / GLOBAL_STRIDE - 1;
    if idx < 0 {
        return None;
    }
    let binding = globals.get(idx as usize)?;
    let offset = address % GLOBAL_STRIDE;
    let element = offset / width.max(1);
    binding.data.get(element as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ProgramBuilder;

    fn program() -> Program {
        let mut b = ProgramBuilder::new("k");
        b.register("%r1");
        b.link(64).unwrap()
    }

    #[test]
    fn test_specials() {
        let program = program();
        let ctx = EmulationContext {
            program: &program,
            layout: BlockLayout::new(Dim3::new(8, 8, 1)),
            globals: &[],
            warnings: false,
            max_barriers: 16,
            max_steps: 1000,
        };
        let state = ThreadState::new(35, ctx.layout.thread_idx(35));
        assert_eq!(state.eval(&Operand::Special(Special::Tid(Axis::X)), &ctx), Some(3));
        assert_eq!(state.eval(&Operand::Special(Special::Tid(Axis::Y)), &ctx), Some(4));
        assert_eq!(state.eval(&Operand::Special(Special::Ntid(Axis::Y)), &ctx), Some(8));
        assert_eq!(state.eval(&Operand::Special(Special::LaneId), &ctx), Some(3));
        assert_eq!(state.eval(&Operand::Special(Special::WarpId), &ctx), Some(1));
        assert_eq!(state.eval(&Operand::Special(Special::NWarpId), &ctx), Some(2));
    }

    #[test]
    fn test_unresolved_register_is_none() {
        let program = program();
        let ctx = EmulationContext {
            program: &program,
            layout: BlockLayout::new(Dim3::x(32)),
            globals: &[],
            warnings: true,
            max_barriers: 16,
            max_steps: 1000,
        };
        let mut state = ThreadState::new(0, Dim3::new(0, 0, 0));
        assert_eq!(state.eval(&Operand::Reg(0), &ctx), None);
        state.set_value(0, 9);
        assert_eq!(state.eval(&Operand::Reg(0), &ctx), Some(9));
        state.clear_value(0);
        assert_eq!(state.get_value(0, &ctx), None);
    }

    #[test]
    fn test_global_bindings() {
        let globals = vec![
            GlobalBinding::new("a", vec![1, 2, 3]),
            GlobalBinding::new("b", vec![10, 20]),
        ];
        let base_b = global_base("b", &globals).unwrap();
        assert_eq!(base_b, 2 * GLOBAL_STRIDE);
        assert_eq!(global_value(base_b + 4, 4, &globals), Some(20));
        assert_eq!(global_value(base_b + 8, 4, &globals), None);
        assert_eq!(global_value(12, 4, &globals), None);
        assert_eq!(global_base("c", &globals), None);
    }
}
