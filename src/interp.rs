/// Scalar instruction interpreter.
///
/// `step` executes exactly one static instruction for one thread and returns
/// the next program counter. Shared accesses and barrier events are logged
/// into the thread's dynamic trace; everything else only updates registers.
/// Lookups that cannot be resolved never abort emulation: the destination is
/// left undefined and emulation carries on.
use tracing::warn;

use crate::error::{Result, VerifyError};
use crate::memory::{SharedAccess, SharedStore, WarpStep};
use crate::program::{
    AddrBase, Address, BarrierArgs, BinOp, CmpOp, Guard, Op, PredOp, Space, UnOp,
};
use crate::thread::{
    global_base, global_value, BarrierEvent, BarrierKind, DynamicInstruction, EmulationContext,
    Event, ThreadState,
};

/// Run one thread from the first instruction to exit.
pub fn emulate(ctx: &EmulationContext<'_>, state: &mut ThreadState) -> Result<()> {
    let mut store = SharedStore::new();
    let mut pc = if ctx.program.is_empty() { None } else { Some(0) };
    while let Some(current) = pc {
        if state.dynamic_instructions >= ctx.max_steps {
            return Err(VerifyError::StepLimitExceeded {
                thread: state.thread,
                limit: ctx.max_steps,
            });
        }
        record_instruction(ctx, current, state);
        pc = step(ctx, current, state, &mut store, None)?;
    }
    Ok(())
}

/// Count one executed instruction against the thread's dynamic statistics.
pub fn record_instruction(ctx: &EmulationContext<'_>, pc: usize, state: &mut ThreadState) {
    if let Some(inst) = ctx.program.get(pc) {
        state.counts.record(inst.kind());
        state.dynamic_instructions += 1;
    }
}

/// Execute the instruction at `pc` and return the next pc (`None` = exited).
/// `tag` marks shared accesses made as part of a lock-step warp instruction.
pub fn step(
    ctx: &EmulationContext<'_>,
    pc: usize,
    state: &mut ThreadState,
    store: &mut SharedStore,
    tag: Option<WarpStep>,
) -> Result<Option<usize>> {
    let Some(inst) = ctx.program.get(pc) else {
        return Ok(None);
    };
    let fallthrough = (pc + 1 < ctx.program.len()).then_some(pc + 1);

    if let Some(guard) = inst.guard {
        if !guard_holds(state, guard, ctx) {
            return Ok(fallthrough);
        }
    }

    match &inst.op {
        Op::Label(_) => {}
        Op::SharedDecl { name, address } => state.register_shared_location(name, *address),
        Op::Mov { dst, src } => {
            let value = state.eval(src, ctx);
            assign(state, *dst, value);
        }
        Op::Binary { op, dst, a, b } => {
            let value = match (state.eval(a, ctx), state.eval(b, ctx)) {
                (Some(x), Some(y)) => binary(*op, x, y),
                _ => None,
            };
            assign(state, *dst, value);
        }
        Op::Mad { dst, a, b, c } => {
            let value = match (state.eval(a, ctx), state.eval(b, ctx), state.eval(c, ctx)) {
                (Some(x), Some(y), Some(z)) => Some(x.wrapping_mul(y).wrapping_add(z)),
                _ => None,
            };
            assign(state, *dst, value);
        }
        Op::Unary { op, dst, src } => {
            let value = state.eval(src, ctx).map(|v| match op {
                UnOp::Not => !v,
                UnOp::Neg => v.wrapping_neg(),
                UnOp::Abs => v.wrapping_abs(),
            });
            assign(state, *dst, value);
        }
        Op::SetP {
            cmp,
            unsigned,
            dst,
            dst_neg,
            a,
            b,
        } => match (state.eval(a, ctx), state.eval(b, ctx)) {
            (Some(x), Some(y)) => {
                let result = compare(*cmp, *unsigned, x, y);
                state.set_pred(*dst, result);
                if let Some(neg) = dst_neg {
                    state.set_pred(*neg, !result);
                }
            }
            _ => {
                state.clear_pred(*dst);
                if let Some(neg) = dst_neg {
                    state.clear_pred(*neg);
                }
            }
        },
        Op::Selp { dst, a, b, pred } => {
            let value = match guard_value(state, *pred, ctx) {
                Some(true) => state.eval(a, ctx),
                Some(false) => state.eval(b, ctx),
                None => None,
            };
            assign(state, *dst, value);
        }
        Op::PredLogic { op, dst, a, b } => {
            let lhs = guard_value(state, *a, ctx);
            let rhs = b.and_then(|g| guard_value(state, g, ctx));
            let value = match (op, lhs, rhs) {
                (PredOp::Not, Some(x), _) => Some(!x),
                (PredOp::And, Some(x), Some(y)) => Some(x && y),
                (PredOp::Or, Some(x), Some(y)) => Some(x || y),
                (PredOp::Xor, Some(x), Some(y)) => Some(x ^ y),
                _ => None,
            };
            match value {
                Some(v) => state.set_pred(*dst, v),
                None => state.clear_pred(*dst),
            }
        }
        Op::Load {
            space,
            dsts,
            addr,
            width,
        } => load(ctx, pc, state, store, tag, *space, dsts, addr, *width),
        Op::Store {
            space,
            addr,
            srcs,
            width,
        } => {
            if *space == Space::Shared {
                if let Some(base) = resolve_address(addr, state, ctx) {
                    for (k, src) in srcs.iter().enumerate() {
                        let address = element_address(base, k, *width);
                        log_shared(state, pc, inst.line, address, true, tag);
                        match state.eval(src, ctx) {
                            Some(v) => store.write(address, v),
                            None => store.invalidate(address),
                        }
                    }
                }
            }
        }
        Op::Atomic { space, dst, addr } => {
            if *space == Space::Shared {
                if let Some(address) = resolve_address(addr, state, ctx) {
                    log_shared(state, pc, inst.line, address, true, tag);
                    store.invalidate(address);
                }
            }
            if let Some(dst) = dst {
                state.clear_value(*dst);
            }
        }
        Op::Branch { target, .. } => return Ok(Some(*target)),
        Op::BarrierSync { args, result } => {
            log_barrier(ctx, pc, inst.line, state, args, BarrierKind::Sync)?;
            if let Some(dst) = result {
                state.clear_value(*dst);
            }
        }
        Op::BarrierArrive { args } => {
            log_barrier(ctx, pc, inst.line, state, args, BarrierKind::Arrive)?;
        }
        Op::Shuffle { dst, pred_dst, .. } => {
            // Other lanes are not visible outside lock-step emulation
            state.clear_value(*dst);
            if let Some(p) = pred_dst {
                state.clear_pred(*p);
            }
        }
        Op::Exit => return Ok(None),
        Op::Other { dst, .. } => {
            if let Some(dst) = dst {
                state.clear_value(*dst);
                state.clear_pred(*dst);
            }
        }
    }
    Ok(fallthrough)
}

#[allow(clippy::too_many_arguments)]
fn load(
    ctx: &EmulationContext<'_>,
    pc: usize,
    state: &mut ThreadState,
    store: &SharedStore,
    tag: Option<WarpStep>,
    space: Space,
    dsts: &[crate::program::RegId],
    addr: &Address,
    width: i64,
) {
    let line = ctx.program.get(pc).map(|i| i.line).unwrap_or(0);
    match space {
        Space::Shared => match resolve_address(addr, state, ctx) {
            Some(base) => {
                for (k, dst) in dsts.iter().enumerate() {
                    let address = element_address(base, k, width);
                    log_shared(state, pc, line, address, false, tag);
                    let value = store.read(address);
                    assign(state, *dst, value);
                }
            }
            None => dsts.iter().for_each(|d| state.clear_value(*d)),
        },
        Space::Param => {
            // A parameter evaluates to the base address of its global binding
            let value = match &addr.base {
                AddrBase::Symbol(name) => global_base(name, ctx.globals),
                _ => None,
            };
            if value.is_none() && ctx.warnings {
                warn!(thread = state.thread, line, "no global binding for parameter load");
            }
            for (k, dst) in dsts.iter().enumerate() {
                assign(state, *dst, if k == 0 { value } else { None });
            }
        }
        Space::Global => {
            let base = resolve_address(addr, state, ctx);
            for (k, dst) in dsts.iter().enumerate() {
                let value = base
                    .and_then(|b| global_value(element_address(b, k, width), width, ctx.globals));
                assign(state, *dst, value);
            }
        }
        Space::Local | Space::Generic => dsts.iter().for_each(|d| state.clear_value(*d)),
    }
}

/// Address of element `k` of a vector access; wraps like `resolve_address`
fn element_address(base: i64, k: usize, width: i64) -> i64 {
    base.wrapping_add((k as i64).wrapping_mul(width))
}

fn assign(state: &mut ThreadState, dst: crate::program::RegId, value: Option<i64>) {
    match value {
        Some(v) => state.set_value(dst, v),
        None => state.clear_value(dst),
    }
}

/// Unresolved guards evaluate to false
pub fn guard_holds(state: &ThreadState, guard: Guard, ctx: &EmulationContext<'_>) -> bool {
    guard_value(state, guard, ctx).unwrap_or(false)
}

fn guard_value(state: &ThreadState, guard: Guard, ctx: &EmulationContext<'_>) -> Option<bool> {
    state.get_pred(guard.pred, ctx).map(|v| v != guard.negated)
}

pub fn resolve_address(
    addr: &Address,
    state: &ThreadState,
    ctx: &EmulationContext<'_>,
) -> Option<i64> {
    let base = match &addr.base {
        AddrBase::Reg(r) => state.get_value(*r, ctx)?,
        AddrBase::Symbol(name) => state.resolve_symbol(name, ctx)?,
        AddrBase::Absolute => 0,
    };
    Some(base.wrapping_add(addr.offset))
}

pub fn log_shared(
    state: &mut ThreadState,
    pc: usize,
    line: usize,
    address: i64,
    is_write: bool,
    tag: Option<WarpStep>,
) {
    let trace_index = state.trace.len();
    state.trace.push(DynamicInstruction {
        pc,
        line,
        event: Event::Shared { address, is_write },
    });
    state.accesses.push(SharedAccess {
        thread: state.thread,
        address,
        is_write,
        trace_index,
        pc,
        warp_step: tag,
    });
}

fn log_barrier(
    ctx: &EmulationContext<'_>,
    pc: usize,
    line: usize,
    state: &mut ThreadState,
    args: &BarrierArgs,
    kind: BarrierKind,
) -> Result<()> {
    let name = state.eval(&args.name, ctx).unwrap_or_else(|| {
        if ctx.warnings {
            warn!(thread = state.thread, line, "unresolved barrier name, assuming 0");
        }
        0
    });
    if name < 0 || name as usize >= ctx.max_barriers {
        return Err(VerifyError::BarrierNameOutOfRange {
            name,
            max: ctx.max_barriers,
        });
    }
    let count = args
        .count
        .as_ref()
        .and_then(|c| state.eval(c, ctx))
        .filter(|c| *c > 0)
        .map(|c| c as usize)
        .unwrap_or_else(|| ctx.layout.threads());
    state.trace.push(DynamicInstruction {
        pc,
        line,
        event: Event::Barrier(BarrierEvent {
            name: name as u32,
            count,
            kind,
            instance: None,
        }),
    });
    Ok(())
}

pub fn binary(op: BinOp, a: i64, b: i64) -> Option<i64> {
    let shift = |b: i64| (0..64).contains(&b).then_some(b as u32);
    match op {
        BinOp::Add => Some(a.wrapping_add(b)),
        BinOp::Sub => Some(a.wrapping_sub(b)),
        BinOp::MulLo => Some(a.wrapping_mul(b)),
        BinOp::MulHi => Some(a.wrapping_mul(b) >> 32),
        BinOp::Div => (b != 0).then(|| a.wrapping_div(b)),
        BinOp::Rem => (b != 0).then(|| a.wrapping_rem(b)),
        BinOp::And => Some(a & b),
        BinOp::Or => Some(a | b),
        BinOp::Xor => Some(a ^ b),
        BinOp::Shl => Some(shift(b).map(|s| a.wrapping_shl(s)).unwrap_or(0)),
        BinOp::Shr => Some(shift(b).map(|s| a >> s).unwrap_or(if a < 0 { -1 } else { 0 })),
        BinOp::Min => Some(a.min(b)),
        BinOp::Max => Some(a.max(b)),
    }
}

pub fn compare(cmp: CmpOp, unsigned: bool, a: i64, b: i64) -> bool {
    let ord = if unsigned {
        (a as u64).cmp(&(b as u64))
    } else {
        a.cmp(&b)
    };
    match cmp {
        CmpOp::Eq => ord.is_eq(),
        CmpOp::Ne => ord.is_ne(),
        CmpOp::Lt => ord.is_lt(),
        CmpOp::Le => ord.is_le(),
        CmpOp::Gt => ord.is_gt(),
        CmpOp::Ge => ord.is_ge(),
    }
}
