/// Lock-step warp emulation.
/// A warp is a group of 32 threads executing the same instruction. Lanes that
/// branch away from the warp's program counter are disabled until the warp
/// reaches their pc again (min-pc reconvergence), and lanes that exit stay
/// exited. Shuffles read the source values of every lane before any lane is
/// written.
use crate::error::{Result, VerifyError};
use crate::interp::{guard_holds, record_instruction, step};
use crate::memory::{SharedStore, WarpStep};
use crate::program::{Op, Operand, RegId, ShflMode};
use crate::thread::{EmulationContext, ThreadState};

pub const WARP_SIZE: usize = 32; // Standard CUDA warp size

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneStatus {
    /// Executes the warp's current instruction
    Enabled,
    /// Waiting at a different pc for the warp to come back
    Disabled,
    Exited,
}

/// A warp: up to 32 lanes sharing one program counter.
pub struct Warp {
    pub id: usize,
    /// Program counter of the lanes that are currently enabled
    pub pc: Option<usize>,
    /// Next pc of every lane (`None` once the lane has exited)
    lane_pcs: Vec<Option<usize>>,
    pub status: Vec<LaneStatus>,
    /// Incremented once per executed warp instruction
    pub access_id: u64,
}

impl Warp {
    /// A warp whose first `lanes` lanes start at pc 0. Lanes past the end of a
    /// partial warp start exited.
    pub fn new(id: usize, lanes: usize, program_len: usize) -> Self {
        let start = (program_len > 0).then_some(0);
        let mut warp = Warp {
            id,
            pc: start,
            lane_pcs: (0..WARP_SIZE)
                .map(|lane| if lane < lanes { start } else { None })
                .collect(),
            status: vec![LaneStatus::Exited; WARP_SIZE],
            access_id: 0,
        };
        warp.reconverge();
        warp
    }

    pub fn is_enabled(&self, lane: usize) -> bool {
        self.status.get(lane) == Some(&LaneStatus::Enabled)
    }

    pub fn enabled_lanes(&self) -> usize {
        self.status
            .iter()
            .filter(|s| **s == LaneStatus::Enabled)
            .count()
    }

    /// Record where an enabled lane goes next
    pub fn advance(&mut self, lane: usize, next: Option<usize>) {
        if let Some(slot) = self.lane_pcs.get_mut(lane) {
            *slot = next;
        }
    }

    /// Pick the smallest pending pc and enable exactly the lanes waiting there.
    pub fn reconverge(&mut self) -> Option<usize> {
        self.pc = self.lane_pcs.iter().flatten().min().copied();
        for (status, lane_pc) in self.status.iter_mut().zip(&self.lane_pcs) {
            *status = match lane_pc {
                None => LaneStatus::Exited,
                Some(pc) if Some(*pc) == self.pc => LaneStatus::Enabled,
                Some(_) => LaneStatus::Disabled,
            };
        }
        self.pc
    }

    fn next_step(&mut self) -> WarpStep {
        self.access_id += 1;
        WarpStep {
            warp: self.id,
            access_id: self.access_id,
        }
    }
}

/// Emulate the lanes of one warp in lock-step. `lanes[i]` is lane `i`.
pub fn emulate_warp(
    ctx: &EmulationContext<'_>,
    lanes: &mut [ThreadState],
    warp_idx: usize,
) -> Result<()> {
    let mut warp = Warp::new(warp_idx, lanes.len(), ctx.program.len());
    let mut store = SharedStore::new();

    while let Some(pc) = warp.pc {
        let tag = warp.next_step();
        let is_shuffle = matches!(
            ctx.program.get(pc).map(|i| &i.op),
            Some(Op::Shuffle { .. })
        );
        if is_shuffle {
            for (lane, state) in lanes.iter_mut().enumerate() {
                if warp.is_enabled(lane) {
                    check_budget(ctx, state)?;
                    record_instruction(ctx, pc, state);
                }
            }
            shuffle(ctx, pc, lanes, &warp);
            let next = (pc + 1 < ctx.program.len()).then_some(pc + 1);
            for lane in 0..lanes.len() {
                if warp.is_enabled(lane) {
                    warp.advance(lane, next);
                }
            }
        } else {
            for (lane, state) in lanes.iter_mut().enumerate() {
                if !warp.is_enabled(lane) {
                    continue;
                }
                check_budget(ctx, state)?;
                record_instruction(ctx, pc, state);
                let next = step(ctx, pc, state, &mut store, Some(tag))?;
                warp.advance(lane, next);
            }
        }
        warp.reconverge();
    }
    Ok(())
}

fn check_budget(ctx: &EmulationContext<'_>, state: &ThreadState) -> Result<()> {
    if state.dynamic_instructions >= ctx.max_steps {
        return Err(VerifyError::StepLimitExceeded {
            thread: state.thread,
            limit: ctx.max_steps,
        });
    }
    Ok(())
}

/// Source lane of `shfl` for `lane` and whether it lies inside the lane's
/// segment. `c` packs the segment mask in bits 12..8 and the clamp in bits 4..0.
pub fn shuffle_source(mode: ShflMode, lane: i64, b: i64, c: i64) -> (i64, bool) {
    let seg_mask = (c >> 8) & 0x1f;
    let clamp = c & 0x1f;
    let b = b & 0x1f;
    let max_lane = (lane & seg_mask) | (clamp & !seg_mask);
    let min_lane = lane & seg_mask;
    let (j, valid) = match mode {
        ShflMode::Up => {
            let j = lane - b;
            (j, j >= max_lane)
        }
        ShflMode::Down => {
            let j = lane + b;
            (j, j <= max_lane)
        }
        ShflMode::Bfly => {
            let j = lane ^ b;
            (j, j <= max_lane)
        }
        ShflMode::Idx => {
            let j = min_lane | (b & !seg_mask);
            (j, j <= max_lane)
        }
    };
    if valid { (j, true) } else { (lane, false) }
}

struct ShuffleLane {
    value: Option<i64>,
    source: Option<(i64, bool)>,
}

fn shuffle(ctx: &EmulationContext<'_>, pc: usize, lanes: &mut [ThreadState], warp: &Warp) {
    let Some(inst) = ctx.program.get(pc) else {
        return;
    };
    let Op::Shuffle {
        mode,
        dst,
        pred_dst,
        src,
        lane: b,
        clamp,
    } = &inst.op
    else {
        return;
    };

    // Gather every participating lane's value before anything is written
    let gathered: Vec<Option<ShuffleLane>> = lanes
        .iter()
        .enumerate()
        .map(|(lane, state)| {
            let active =
                warp.is_enabled(lane) && inst.guard.is_none_or(|g| guard_holds(state, g, ctx));
            active.then(|| ShuffleLane {
                value: state.eval(src, ctx),
                source: lane_source(ctx, state, *mode, b, clamp),
            })
        })
        .collect();

    for (lane, state) in lanes.iter_mut().enumerate() {
        let Some(me) = &gathered[lane] else {
            continue;
        };
        match me.source {
            Some((j, valid)) => {
                let from = usize::try_from(j)
                    .ok()
                    .and_then(|j| gathered.get(j))
                    .and_then(Option::as_ref);
                let value = match from {
                    Some(other) => other.value,
                    None => me.value,
                };
                write(state, *dst, value);
                if let Some(p) = pred_dst {
                    state.set_pred(*p, valid);
                }
            }
            None => {
                state.clear_value(*dst);
                if let Some(p) = pred_dst {
                    state.clear_pred(*p);
                }
            }
        }
    }
}

fn lane_source(
    ctx: &EmulationContext<'_>,
    state: &ThreadState,
    mode: ShflMode,
    b: &Operand,
    c: &Operand,
) -> Option<(i64, bool)> {
    let b = state.eval(b, ctx)?;
    let c = state.eval(c, ctx)?;
    Some(shuffle_source(mode, state.lane() as i64, b, c))
}

fn write(state: &mut ThreadState, dst: RegId, value: Option<i64>) {
    match value {
        Some(v) => state.set_value(dst, v),
        None => state.clear_value(dst),
    }
}
