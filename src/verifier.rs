/// Verification pipeline.
///
/// A `Verifier` decodes and links the kernel, then drives a `Session` through
/// the task pool one stage at a time:
///   1. emulate every thread (or every warp in lock-step)
///   2. build the barrier dependence graph from all traces
///   3. validate every barrier instance
///   4. build and resolve each thread's happens-before segments
///   5. check every run of shared-memory addresses for races
///
/// Tasks of one stage never wait on each other; `wait_until_done` separates
/// stages. Hard errors raised inside tasks are collected by the session and
/// end the run once the stage finishes.
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{GlobalBinding, VerifierConfig};
use crate::decode::decode;
use crate::error::{Result, VerifyError};
use crate::graph::{BarrierFinding, BarrierGraph, InstanceId};
use crate::happens::{self, HappensRelation};
use crate::interp;
use crate::kernel::{BlockLayout, Dim3};
use crate::memory::{SharedMemory, SHARD_COUNT};
use crate::metrics::{now_ms, write_metrics, LiveMetrics, StageSnapshot};
use crate::program::{KindCounts, Program};
use crate::race::{self, Race};
use crate::report::{Stage, StageTiming, VerificationReport};
use crate::scheduler::{TaskContext, TaskPool};
use crate::thread::{EmulationContext, Thread, ThreadState};
use crate::warp::{self, WARP_SIZE};

/// Unit of work for the task pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    EmulateThread(usize),
    EmulateWarp(usize),
    BuildHappens(usize),
    UpdateHappens(usize),
    ValidateBarrier(InstanceId),
    CheckShard(usize),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// All state shared by the tasks of one verification run.
pub struct Session {
    program: Arc<Program>,
    layout: BlockLayout,
    globals: Vec<GlobalBinding>,
    warnings: bool,
    max_barriers: usize,
    max_steps: u64,
    threads: Vec<Mutex<Thread>>,
    memory: SharedMemory,
    graph: OnceLock<BarrierGraph>,
    /// Threads moved out of their locks once happens-before is resolved
    frozen: OnceLock<Vec<Thread>>,
    /// Sorted address runs, one per race-check task
    shards: OnceLock<Vec<Vec<i64>>>,
    findings: Mutex<Vec<BarrierFinding>>,
    races: Mutex<Vec<Race>>,
    errors: Mutex<Vec<VerifyError>>,
}

impl TaskContext for Session {
    type Task = Task;

    fn execute(&self, task: Task) {
        let outcome = match task {
            Task::EmulateThread(idx) => self.emulate_thread(idx),
            Task::EmulateWarp(idx) => self.emulate_warp(idx),
            Task::BuildHappens(idx) => self.build_happens(idx),
            Task::UpdateHappens(idx) => self.update_happens(idx),
            Task::ValidateBarrier(id) => self.validate_barrier(id),
            Task::CheckShard(shard) => self.check_shard(shard),
        };
        if let Err(err) = outcome {
            debug!(?task, %err, "task failed");
            self.errors.lock().push(err);
        }
    }
}

impl Session {
    pub fn new(program: Arc<Program>, layout: BlockLayout, config: &VerifierConfig) -> Self {
        let threads = (0..layout.threads())
            .map(|idx| Mutex::new(Thread::new(idx, layout.thread_idx(idx))))
            .collect();
        Session {
            program,
            layout,
            globals: config.globals.clone(),
            warnings: config.warnings,
            max_barriers: config.max_barriers,
            max_steps: config.max_steps,
            threads,
            memory: SharedMemory::new(),
            graph: OnceLock::new(),
            frozen: OnceLock::new(),
            shards: OnceLock::new(),
            findings: Mutex::new(Vec::new()),
            races: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    fn context(&self) -> EmulationContext<'_> {
        EmulationContext {
            program: &self.program,
            layout: self.layout,
            globals: &self.globals,
            warnings: self.warnings,
            max_barriers: self.max_barriers,
            max_steps: self.max_steps,
        }
    }

    fn thread(&self, idx: usize) -> Result<&Mutex<Thread>> {
        self.threads
            .get(idx)
            .ok_or_else(|| VerifyError::Internal(format!("no thread {idx}")))
    }

    fn graph(&self) -> Result<&BarrierGraph> {
        self.graph
            .get()
            .ok_or_else(|| VerifyError::Internal("barrier graph not built".to_string()))
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    fn emulate_thread(&self, idx: usize) -> Result<()> {
        let ctx = self.context();
        let mut state = ThreadState::new(idx, self.layout.thread_idx(idx));
        interp::emulate(&ctx, &mut state)?;
        let accesses = self.thread(idx)?.lock().finish(state);
        self.memory.record_batch(accesses);
        Ok(())
    }

    fn emulate_warp(&self, warp_idx: usize) -> Result<()> {
        let ctx = self.context();
        let first = warp_idx * WARP_SIZE;
        let last = (first + WARP_SIZE).min(self.layout.threads());
        let mut lanes: Vec<ThreadState> = (first..last)
            .map(|idx| ThreadState::new(idx, self.layout.thread_idx(idx)))
            .collect();
        warp::emulate_warp(&ctx, &mut lanes, warp_idx)?;
        for state in lanes {
            let accesses = self.thread(state.thread)?.lock().finish(state);
            self.memory.record_batch(accesses);
        }
        Ok(())
    }

    fn build_happens(&self, idx: usize) -> Result<()> {
        happens::build(&mut self.thread(idx)?.lock(), self.max_barriers);
        Ok(())
    }

    fn update_happens(&self, idx: usize) -> Result<()> {
        happens::resolve(&mut self.thread(idx)?.lock());
        Ok(())
    }

    fn validate_barrier(&self, id: InstanceId) -> Result<()> {
        let findings = self.graph()?.validate_instance(id);
        if !findings.is_empty() {
            self.findings.lock().extend(findings);
        }
        Ok(())
    }

    fn check_shard(&self, shard: usize) -> Result<()> {
        let threads = self
            .frozen
            .get()
            .ok_or_else(|| VerifyError::Internal("threads not frozen".to_string()))?;
        let Some(relation) = HappensRelation::new(self.graph()?) else {
            return Ok(());
        };
        let addresses = self
            .shards
            .get()
            .and_then(|shards| shards.get(shard))
            .ok_or_else(|| VerifyError::Internal(format!("no address shard {shard}")))?;
        let races = race::check_shard(&self.memory.snapshot(addresses), threads, &relation);
        if !races.is_empty() {
            self.races.lock().extend(races);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stage boundaries (run on the driving thread)
    // -----------------------------------------------------------------------

    /// First error raised by a task of the finished stage, if any
    fn take_error(&self) -> Result<()> {
        let mut errors = std::mem::take(&mut *self.errors.lock());
        errors.sort_by_key(|e| e.to_string());
        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn build_graph(&self) -> Result<&BarrierGraph> {
        let mut guards: Vec<_> = self.threads.iter().map(|m| m.lock()).collect();
        let graph = BarrierGraph::build(guards.iter_mut().map(|g| &mut **g), self.layout.threads());
        drop(guards);
        if self.graph.set(graph).is_err() {
            return Err(VerifyError::Internal("barrier graph built twice".to_string()));
        }
        self.graph()
    }

    fn freeze(&self) -> Result<&[Thread]> {
        let threads: Vec<Thread> = self
            .threads
            .iter()
            .enumerate()
            .map(|(idx, m)| {
                std::mem::replace(&mut *m.lock(), Thread::new(idx, self.layout.thread_idx(idx)))
            })
            .collect();
        if self.frozen.set(threads).is_err() {
            return Err(VerifyError::Internal("threads frozen twice".to_string()));
        }
        self.frozen
            .get()
            .map(Vec::as_slice)
            .ok_or_else(|| VerifyError::Internal("threads not frozen".to_string()))
    }

    /// Split the logged addresses into sorted runs for the race checks;
    /// returns the number of runs
    fn partition_shards(&self, parts: usize) -> Result<usize> {
        let shards = self.memory.partition(parts);
        let count = shards.len();
        if self.shards.set(shards).is_err() {
            return Err(VerifyError::Internal("addresses partitioned twice".to_string()));
        }
        Ok(count)
    }

    fn take_findings(&self) -> Vec<BarrierFinding> {
        let mut findings = std::mem::take(&mut *self.findings.lock());
        findings.sort();
        findings
    }

    fn take_races(&self) -> Vec<Race> {
        race::merge(std::mem::take(&mut *self.races.lock()))
    }

    fn dynamic_instructions(&self) -> u64 {
        self.threads
            .iter()
            .map(|t| t.lock().dynamic_instructions)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Live progress
// ---------------------------------------------------------------------------

/// Stage timings plus the optional live snapshot file.
struct Progress<'a> {
    live: Option<&'a Path>,
    metrics: LiveMetrics,
    timings: Vec<StageTiming>,
}

impl<'a> Progress<'a> {
    fn new(live: Option<&'a Path>, pool_size: usize) -> Self {
        Progress {
            live,
            metrics: LiveMetrics {
                status: "running".to_string(),
                stages_total: Stage::ALL.len(),
                pool_size,
                ..Default::default()
            },
            timings: Vec::new(),
        }
    }

    fn begin(&mut self, stage: Stage) -> Instant {
        info!(stage = stage.name(), "stage started");
        self.metrics.stage = stage.name().to_string();
        self.publish();
        Instant::now()
    }

    fn finish(&mut self, stage: Stage, start: Instant) {
        let millis = start.elapsed().as_secs_f64() * 1000.0;
        info!(stage = stage.name(), millis, "stage finished");
        self.timings.push(StageTiming { stage, millis });
        self.metrics.stages_completed = stage.ordinal();
        self.metrics.timings.push(StageSnapshot {
            stage: stage.name().to_string(),
            millis,
        });
        self.publish();
    }

    fn end(&mut self, status: &str) {
        self.metrics.status = status.to_string();
        self.publish();
    }

    fn publish(&mut self) {
        if let Some(path) = self.live {
            self.metrics.timestamp_ms = now_ms();
            write_metrics(path, &self.metrics);
        }
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

pub struct Verifier {
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        Verifier { config }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub fn verify_file(&self, path: &Path) -> Result<VerificationReport> {
        let source = std::fs::read_to_string(path).map_err(|source| VerifyError::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        self.verify_source(&source)
    }

    pub fn verify_source(&self, source: &str) -> Result<VerificationReport> {
        let mut progress =
            Progress::new(self.config.live_metrics.as_deref(), self.config.pool_size);
        let result = self.run(source, &mut progress);
        progress.end(if result.is_ok() { "complete" } else { "failed" });
        result
    }

    /// Block shape: the caller's, the kernel's, or both when they agree
    fn block_dim(&self, declared: Option<Dim3>) -> Result<Dim3> {
        if let Some(supplied) = self.config.block_dim.filter(|d| d.checked_size().is_none()) {
            return Err(VerifyError::InvalidThreadCount(supplied.to_string()));
        }
        match (declared, self.config.block_dim) {
            (Some(declared), Some(supplied)) if declared.size() != supplied.size() => {
                Err(VerifyError::ThreadCountMismatch { declared, supplied })
            }
            (_, Some(supplied)) => Ok(supplied),
            (Some(declared), None) => Ok(declared),
            (None, None) => Err(VerifyError::NoThreadCount),
        }
    }

    fn run(&self, source: &str, progress: &mut Progress<'_>) -> Result<VerificationReport> {
        // Decode
        let start = progress.begin(Stage::Decode);
        let decoded = decode(source)?;
        let block_dim = self.block_dim(decoded.declared_block)?;
        let layout = BlockLayout {
            block_dim,
            block_idx: self.config.block_idx,
            grid_dim: self.config.grid_dim,
        };
        let program = Arc::new(decoded.builder.link(layout.threads())?);
        let lock_step = self.config.warp_mode.use_lock_step(program.has_shuffles());
        progress.metrics.kernel_name = program.kernel_name().to_string();
        progress.metrics.block = [block_dim.x, block_dim.y, block_dim.z];
        progress.metrics.threads = layout.threads();
        progress.metrics.warps = layout.warps();
        progress.metrics.lock_step = lock_step;
        info!(
            kernel = program.kernel_name(),
            instructions = program.len(),
            threads = layout.threads(),
            lock_step,
            "decoded kernel"
        );
        progress.finish(Stage::Decode, start);

        let session = Arc::new(Session::new(Arc::clone(&program), layout, &self.config));
        let pool = TaskPool::new(Arc::clone(&session), self.config.pool_size)?;

        // Emulate
        let start = progress.begin(Stage::Emulate);
        if lock_step {
            pool.submit_all((0..layout.warps()).map(Task::EmulateWarp));
        } else {
            pool.submit_all((0..layout.threads()).map(Task::EmulateThread));
        }
        pool.wait_until_done()?;
        session.take_error()?;
        progress.metrics.dynamic_instructions = session.dynamic_instructions();
        progress.metrics.shared_accesses = session.memory.total_accesses();
        progress.finish(Stage::Emulate, start);

        // Barrier graph
        let start = progress.begin(Stage::Graph);
        let graph = session.build_graph()?;
        info!(
            instances = graph.instance_count(),
            edges = graph.edge_count(),
            acyclic = graph.is_acyclic(),
            "barrier graph built"
        );
        progress.metrics.barrier_instances = graph.instance_count();
        progress.finish(Stage::Graph, start);

        // Validate
        let start = progress.begin(Stage::Validate);
        pool.submit_all(graph.instance_ids().map(Task::ValidateBarrier));
        pool.wait_until_done()?;
        session.take_error()?;
        let findings = session.take_findings();
        if let Some(err) = findings.iter().find_map(too_many_participants) {
            return Err(err);
        }
        progress.metrics.barrier_findings = findings.len();
        progress.finish(Stage::Validate, start);

        // Happens-before
        let start = progress.begin(Stage::Happens);
        let threads = layout.threads();
        pool.submit_all((0..threads).map(Task::BuildHappens));
        pool.wait_until_done()?;
        pool.submit_all((0..threads).map(Task::UpdateHappens));
        pool.wait_until_done()?;
        session.take_error()?;
        let frozen = session.freeze()?;
        progress.finish(Stage::Happens, start);

        // Races
        let start = progress.begin(Stage::Races);
        let races_checked = graph.is_acyclic();
        if races_checked {
            let shards = session.partition_shards(SHARD_COUNT)?;
            debug!(shards, addresses = session.memory.address_count(), "race check partitioned");
            pool.submit_all((0..shards).map(Task::CheckShard));
            pool.wait_until_done()?;
            session.take_error()?;
        } else {
            info!("barrier ordering cycle: skipping race detection");
        }
        let races = session.take_races();
        progress.metrics.races = races.len();
        progress.finish(Stage::Races, start);
        debug!(pool = %pool.stats(), "pipeline complete");

        let mut dynamic = KindCounts::default();
        for t in frozen {
            dynamic.merge(&t.counts);
        }
        let verdict = VerificationReport::verdict_for(&races, &findings);
        Ok(VerificationReport {
            kernel: program.kernel_name().to_string(),
            block_dim,
            threads,
            lock_step,
            static_counts: program.static_counts().to_map(),
            dynamic_counts: dynamic.to_map(),
            thread_instructions: frozen.iter().map(|t| t.dynamic_instructions).collect(),
            barrier_instances: graph.instance_count(),
            shared_accesses: session.memory.total_accesses(),
            races,
            barrier_findings: findings,
            races_checked,
            timings: progress.timings.clone(),
            verdict,
        })
    }
}

fn too_many_participants(finding: &BarrierFinding) -> Option<VerifyError> {
    match finding {
        BarrierFinding::TooManyArrivals {
            barrier,
            arrivals,
            expected,
        } => Some(VerifyError::TooManyParticipants {
            name: barrier.name,
            generation: barrier.generation,
            arrivals: *arrivals,
            expected: *expected,
        }),
        _ => None,
    }
}
