/// Verifier configuration.
/// Built by the CLI (or directly by library callers) with `with_*` builder
/// methods, then handed to `Verifier::new`.
use std::path::PathBuf;
use std::sync::Arc;

use crate::kernel::Dim3;

/// Upper bound on named barriers per block (PTX `bar` ids 0..15).
pub const DEFAULT_MAX_BARRIERS: usize = 16;

/// Per-thread instruction budget before emulation gives up.
pub const DEFAULT_MAX_STEPS: u64 = 10_000_000;

/// How threads are emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarpMode {
    /// Lock-step only when the kernel exchanges values across lanes
    #[default]
    Auto,
    /// Always emulate whole warps in lock-step
    LockStep,
    /// Always emulate threads independently
    Scalar,
}

impl WarpMode {
    pub fn use_lock_step(self, has_shuffles: bool) -> bool {
        match self {
            WarpMode::Auto => has_shuffles,
            WarpMode::LockStep => true,
            WarpMode::Scalar => false,
        }
    }
}

/// Read-only data bound to a kernel parameter: `ld.param [name]` yields the
/// binding's base address and `ld.global` inside the binding reads `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalBinding {
    pub name: String,
    pub data: Arc<[i64]>,
}

impl GlobalBinding {
    pub fn new(name: &str, data: Vec<i64>) -> Self {
        GlobalBinding {
            name: name.to_string(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Block shape supplied by the caller; checked against `.maxntid`
    pub block_dim: Option<Dim3>,
    pub block_idx: Dim3,
    pub grid_dim: Dim3,
    /// Worker threads in the task pool
    pub pool_size: usize,
    /// Emit diagnostics for unresolved registers/predicates/names
    pub warnings: bool,
    /// Print per-kind statistics
    pub verbose: bool,
    /// Record and print stage timings
    pub instrument: bool,
    pub warp_mode: WarpMode,
    pub max_barriers: usize,
    pub max_steps: u64,
    pub globals: Vec<GlobalBinding>,
    /// Where to write live snapshots for the monitor (None = disabled)
    pub live_metrics: Option<PathBuf>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            block_dim: None,
            block_idx: Dim3::new(0, 0, 0),
            grid_dim: Dim3::x(1),
            pool_size: default_pool_size(),
            warnings: false,
            verbose: false,
            instrument: false,
            warp_mode: WarpMode::Auto,
            max_barriers: DEFAULT_MAX_BARRIERS,
            max_steps: DEFAULT_MAX_STEPS,
            globals: Vec::new(),
            live_metrics: None,
        }
    }
}

impl VerifierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_dim(mut self, block_dim: Dim3) -> Self {
        self.block_dim = Some(block_dim);
        self
    }

    /// Position of the verified block in the grid (%ctaid / %nctaid)
    pub fn with_grid(mut self, block_idx: Dim3, grid_dim: Dim3) -> Self {
        self.block_idx = block_idx;
        self.grid_dim = grid_dim;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_warnings(mut self, warnings: bool) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_instrument(mut self, instrument: bool) -> Self {
        self.instrument = instrument;
        self
    }

    pub fn with_warp_mode(mut self, warp_mode: WarpMode) -> Self {
        self.warp_mode = warp_mode;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_global(mut self, binding: GlobalBinding) -> Self {
        self.globals.push(binding);
        self
    }

    pub fn with_live_metrics(mut self, path: PathBuf) -> Self {
        self.live_metrics = Some(path);
        self
    }
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = VerifierConfig::new();
        assert!(cfg.block_dim.is_none());
        assert!(cfg.pool_size >= 1);
        assert_eq!(cfg.max_barriers, DEFAULT_MAX_BARRIERS);
        assert_eq!(cfg.warp_mode, WarpMode::Auto);
    }

    #[test]
    fn test_pool_size_never_zero() {
        assert_eq!(VerifierConfig::new().with_pool_size(0).pool_size, 1);
    }

    #[test]
    fn test_warp_mode_selection() {
        assert!(WarpMode::Auto.use_lock_step(true));
        assert!(!WarpMode::Auto.use_lock_step(false));
        assert!(WarpMode::LockStep.use_lock_step(false));
        assert!(!WarpMode::Scalar.use_lock_step(true));
    }
}
