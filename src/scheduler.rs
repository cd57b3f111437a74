/// Task pool that drives every verification stage.
///
/// A fixed set of worker threads pulls tasks from one shared FIFO queue and
/// hands them to a `TaskContext`, which owns all the state the tasks touch.
/// Stages are separated by `wait_until_done`: tasks never wait on each other,
/// so ordering between stages is the only dependency mechanism.
///
/// A task that panics is counted as failed; the next `wait_until_done`
/// turns the failure count into an error. The pool's locks are
/// `parking_lot` ones, so a panicking task never poisons them.
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{Result, VerifyError};

/// Executes tasks on behalf of the pool. Implementations are shared by all
/// workers and use interior locking for mutable state.
pub trait TaskContext: Send + Sync + 'static {
    type Task: Send + 'static;

    fn execute(&self, task: Self::Task);
}

/// Counters reported by `TaskPool::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} submitted, {} completed, {} failed",
            self.submitted, self.completed, self.failed
        )
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Queue<T> {
    tasks: VecDeque<T>,
    closed: bool,
}

struct Progress {
    /// Submitted but not yet finished
    pending: usize,
    /// Failures since the last `wait_until_done`
    failed_since_wait: usize,
    stats: PoolStats,
}

struct Shared<C: TaskContext> {
    context: Arc<C>,
    queue: Mutex<Queue<C::Task>>,
    not_empty: Condvar,
    progress: Mutex<Progress>,
    done: Condvar,
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

pub struct TaskPool<C: TaskContext> {
    shared: Arc<Shared<C>>,
    workers: Vec<JoinHandle<()>>,
}

impl<C: TaskContext> TaskPool<C> {
    /// Start `size` workers (at least one) serving `context`.
    pub fn new(context: Arc<C>, size: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            context,
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            progress: Mutex::new(Progress {
                pending: 0,
                failed_since_wait: 0,
                stats: PoolStats::default(),
            }),
            done: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size.max(1));
        for idx in 0..size.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("ptxverify-worker-{idx}"))
                .spawn(move || worker_loop(shared))
                .map_err(|e| VerifyError::Internal(format!("failed to spawn worker: {e}")))?;
            workers.push(handle);
        }
        debug!(workers = workers.len(), "task pool started");
        Ok(TaskPool { shared, workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn context(&self) -> &Arc<C> {
        &self.shared.context
    }

    pub fn submit(&self, task: C::Task) {
        self.submit_all(std::iter::once(task));
    }

    /// Enqueue a batch. The pending count is raised before any task becomes
    /// visible to workers, so `wait_until_done` cannot return early.
    pub fn submit_all(&self, tasks: impl IntoIterator<Item = C::Task>) {
        let tasks: Vec<C::Task> = tasks.into_iter().collect();
        if tasks.is_empty() {
            return;
        }
        {
            let mut progress = self.shared.progress.lock();
            progress.pending += tasks.len();
            progress.stats.submitted += tasks.len() as u64;
        }
        let mut queue = self.shared.queue.lock();
        queue.tasks.extend(tasks);
        self.shared.not_empty.notify_all();
    }

    /// Block until every submitted task has finished. Fails if any task
    /// panicked since the previous call.
    pub fn wait_until_done(&self) -> Result<()> {
        let mut progress = self.shared.progress.lock();
        while progress.pending > 0 {
            self.shared.done.wait(&mut progress);
        }
        let failed = std::mem::take(&mut progress.failed_since_wait);
        if failed > 0 {
            return Err(VerifyError::Internal(format!("{failed} task(s) panicked")));
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.progress.lock().stats
    }

    /// Close the queue and join the workers. Queued tasks still run.
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.closed = true;
            self.shared.not_empty.notify_all();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<C: TaskContext> Drop for TaskPool<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<C: TaskContext>(shared: Arc<Shared<C>>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if queue.closed {
                    return;
                }
                shared.not_empty.wait(&mut queue);
            }
        };

        let context = &shared.context;
        let outcome = catch_unwind(AssertUnwindSafe(|| context.execute(task)));

        let mut progress = shared.progress.lock();
        progress.pending -= 1;
        progress.stats.completed += 1;
        if outcome.is_err() {
            progress.failed_since_wait += 1;
            progress.stats.failed += 1;
        }
        if progress.pending == 0 {
            shared.done.notify_all();
        }
    }
}
