/// Barrier dependence graph.
///
/// Every execution of a barrier by a thread is an arrival at one barrier
/// instance, keyed by (name, generation) where the generation counts how many
/// times that thread has used the name before. Nodes are instances; an edge
/// `a -> b` means `a` completes before `b` can complete:
///   - `(name, g) -> (name, g + 1)`
///   - a thread that waited at `a` and later arrives at `b`
///
/// The graph is built once from all traces and frozen. Validation queries one
/// instance at a time so it can be fanned out across the task pool.
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use serde::Serialize;

use crate::thread::{BarrierKind, Thread};

/// Index into `BarrierGraph::instances`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceId(pub usize);

/// One thread's arrival at a barrier instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub thread: usize,
    /// Index of the barrier event in the thread's trace
    pub trace_index: usize,
    pub kind: BarrierKind,
    /// Participant count declared by this arrival
    pub count: usize,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct BarrierInstance {
    pub name: u32,
    pub generation: u32,
    /// Participant count declared by the first arrival
    pub expected: usize,
    pub participants: Vec<Participant>,
}

/// (name, generation) of an instance, as it appears in findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct BarrierRef {
    pub name: u32,
    pub generation: u32,
}

impl fmt::Display for BarrierRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "barrier {} generation {}", self.name, self.generation)
    }
}

/// Problems found while validating one barrier instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BarrierFinding {
    /// Fewer threads arrive than the barrier waits for
    Deadlock {
        barrier: BarrierRef,
        arrivals: usize,
        expected: usize,
        /// Threads blocked in `bar.sync` on this instance
        waiting: Vec<usize>,
        /// Threads that never arrive, listed only for block-wide barriers
        /// where every thread of the block is a participant
        missing: Vec<usize>,
        lines: Vec<usize>,
    },
    /// Arrivals disagree on the participant count, or ask for more threads
    /// than the block has
    ArrivalMismatch {
        barrier: BarrierRef,
        declared: Vec<usize>,
        block_threads: usize,
    },
    TooManyArrivals {
        barrier: BarrierRef,
        arrivals: usize,
        expected: usize,
    },
    /// Threads reach barrier generations out of step
    OrderingCycle { barriers: Vec<BarrierRef> },
}

impl BarrierFinding {
    /// Findings that make the run structurally invalid rather than failing
    pub fn is_structural(&self) -> bool {
        matches!(self, BarrierFinding::TooManyArrivals { .. })
    }
}

impl fmt::Display for BarrierFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarrierFinding::Deadlock {
                barrier,
                arrivals,
                expected,
                missing,
                ..
            } => {
                write!(
                    f,
                    "deadlock at {barrier}: {arrivals} of {expected} participants arrive"
                )?;
                if !missing.is_empty() {
                    write!(f, " (missing threads: {})", join_limited(missing, 16))?;
                }
                Ok(())
            }
            BarrierFinding::ArrivalMismatch {
                barrier,
                declared,
                block_threads,
            } => write!(
                f,
                "arrival mismatch at {barrier}: declared counts {} for a block of {block_threads} threads",
                join_limited(declared, 8)
            ),
            BarrierFinding::TooManyArrivals {
                barrier,
                arrivals,
                expected,
            } => write!(
                f,
                "too many participants at {barrier}: {arrivals} arrivals for {expected} expected"
            ),
            BarrierFinding::OrderingCycle { barriers } => {
                let names: Vec<String> = barriers.iter().map(|b| b.to_string()).collect();
                write!(f, "barrier ordering cycle: {}", names.join(" -> "))
            }
        }
    }
}

fn join_limited(values: &[usize], limit: usize) -> String {
    let mut parts: Vec<String> = values.iter().take(limit).map(|v| v.to_string()).collect();
    if values.len() > limit {
        parts.push(format!("... {} more", values.len() - limit));
    }
    parts.join(", ")
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

pub struct BarrierGraph {
    instances: Vec<BarrierInstance>,
    successors: Vec<Vec<InstanceId>>,
    predecessors: Vec<Vec<InstanceId>>,
    block_threads: usize,
    /// `pre[i][t]`: trace entries of thread `t` below this index complete
    /// before instance `i` does. Empty when the graph has a cycle.
    pre: Vec<Vec<usize>>,
    /// `post[i][t]`: trace entries of thread `t` at or above this index start
    /// after instance `i` completes (`usize::MAX` = none).
    post: Vec<Vec<usize>>,
    acyclic: bool,
}

impl BarrierGraph {
    /// Collect the instances of every thread's barrier events, stamp each
    /// event with its instance and derive the completion bounds.
    pub fn build<'a>(
        threads: impl IntoIterator<Item = &'a mut Thread>,
        block_threads: usize,
    ) -> Self {
        let mut instances: Vec<BarrierInstance> = Vec::new();
        let mut index: HashMap<(u32, u32), InstanceId> = HashMap::new();
        let mut edges: BTreeSet<(InstanceId, InstanceId)> = BTreeSet::new();

        for thread in threads {
            let mut generations: HashMap<u32, u32> = HashMap::new();
            let mut last_sync: Option<InstanceId> = None;
            for (trace_index, entry) in thread.trace.iter_mut().enumerate() {
                let line = entry.line;
                let crate::thread::Event::Barrier(event) = &mut entry.event else {
                    continue;
                };
                let generation = generations.entry(event.name).or_insert(0);
                let key = (event.name, *generation);
                *generation += 1;

                let id = *index.entry(key).or_insert_with(|| {
                    instances.push(BarrierInstance {
                        name: key.0,
                        generation: key.1,
                        expected: event.count,
                        participants: Vec::new(),
                    });
                    InstanceId(instances.len() - 1)
                });
                instances[id.0].participants.push(Participant {
                    thread: thread.id,
                    trace_index,
                    kind: event.kind,
                    count: event.count,
                    line,
                });
                event.instance = Some(id);

                if let Some(prev) = last_sync {
                    if prev != id {
                        edges.insert((prev, id));
                    }
                }
                if event.kind == BarrierKind::Sync {
                    last_sync = Some(id);
                }
            }
        }

        for (&(name, generation), &id) in &index {
            if let Some(&next) = index.get(&(name, generation + 1)) {
                edges.insert((id, next));
            }
        }

        let mut successors = vec![Vec::new(); instances.len()];
        let mut predecessors = vec![Vec::new(); instances.len()];
        for (from, to) in edges {
            successors[from.0].push(to);
            predecessors[to.0].push(from);
        }

        let mut graph = BarrierGraph {
            instances,
            successors,
            predecessors,
            block_threads,
            pre: Vec::new(),
            post: Vec::new(),
            acyclic: false,
        };
        if let Some(order) = graph.topological_order() {
            graph.compute_bounds(&order);
            graph.acyclic = true;
        }
        graph
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instance(&self, id: InstanceId) -> Option<&BarrierInstance> {
        self.instances.get(id.0)
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = InstanceId> {
        (0..self.instances.len()).map(InstanceId)
    }

    pub fn successors(&self, id: InstanceId) -> &[InstanceId] {
        self.successors.get(id.0).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edge_count(&self) -> usize {
        self.successors.iter().map(Vec::len).sum()
    }

    /// Whether the happens-before bounds are defined
    pub fn is_acyclic(&self) -> bool {
        self.acyclic
    }

    pub fn block_threads(&self) -> usize {
        self.block_threads
    }

    pub fn pre(&self, id: InstanceId, thread: usize) -> usize {
        self.pre
            .get(id.0)
            .and_then(|p| p.get(thread))
            .copied()
            .unwrap_or(0)
    }

    pub fn post(&self, id: InstanceId, thread: usize) -> usize {
        self.post
            .get(id.0)
            .and_then(|p| p.get(thread))
            .copied()
            .unwrap_or(usize::MAX)
    }

    fn topological_order(&self) -> Option<Vec<InstanceId>> {
        let mut indegree: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut ready: VecDeque<InstanceId> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| InstanceId(i))
            .collect();
        let mut order = Vec::with_capacity(self.instances.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for next in &self.successors[id.0] {
                indegree[next.0] -= 1;
                if indegree[next.0] == 0 {
                    ready.push_back(*next);
                }
            }
        }
        (order.len() == self.instances.len()).then_some(order)
    }

    fn compute_bounds(&mut self, order: &[InstanceId]) {
        let n = self.instances.len();
        let threads = self.block_threads;
        self.pre = vec![vec![0; threads]; n];
        self.post = vec![vec![usize::MAX; threads]; n];

        for id in order {
            let mut bound = vec![0usize; threads];
            for pred in &self.predecessors[id.0] {
                for (b, p) in bound.iter_mut().zip(&self.pre[pred.0]) {
                    *b = (*b).max(*p);
                }
            }
            for p in &self.instances[id.0].participants {
                if let Some(b) = bound.get_mut(p.thread) {
                    *b = (*b).max(p.trace_index);
                }
            }
            self.pre[id.0] = bound;
        }

        for id in order.iter().rev() {
            let mut bound = vec![usize::MAX; threads];
            for succ in &self.successors[id.0] {
                for (b, p) in bound.iter_mut().zip(&self.post[succ.0]) {
                    *b = (*b).min(*p);
                }
            }
            for p in &self.instances[id.0].participants {
                if p.kind == BarrierKind::Sync {
                    if let Some(b) = bound.get_mut(p.thread) {
                        *b = (*b).min(p.trace_index + 1);
                    }
                }
            }
            self.post[id.0] = bound;
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Validate one instance. Safe to call concurrently for different ids.
    pub fn validate_instance(&self, id: InstanceId) -> Vec<BarrierFinding> {
        let Some(instance) = self.instance(id) else {
            return Vec::new();
        };
        let barrier = BarrierRef {
            name: instance.name,
            generation: instance.generation,
        };
        let mut findings = Vec::new();
        let arrivals = instance.participants.len();

        let declared: BTreeSet<usize> = instance.participants.iter().map(|p| p.count).collect();
        if declared.len() > 1 || instance.expected > self.block_threads {
            findings.push(BarrierFinding::ArrivalMismatch {
                barrier,
                declared: declared.into_iter().collect(),
                block_threads: self.block_threads,
            });
        }

        if arrivals < instance.expected {
            let arrived: BTreeSet<usize> =
                instance.participants.iter().map(|p| p.thread).collect();
            let waiting: BTreeSet<usize> = instance
                .participants
                .iter()
                .filter(|p| p.kind == BarrierKind::Sync)
                .map(|p| p.thread)
                .collect();
            let lines: BTreeSet<usize> = instance.participants.iter().map(|p| p.line).collect();
            findings.push(BarrierFinding::Deadlock {
                barrier,
                arrivals,
                expected: instance.expected,
                waiting: waiting.into_iter().collect(),
                missing: if instance.expected == self.block_threads {
                    (0..self.block_threads)
                        .filter(|t| !arrived.contains(t))
                        .collect()
                } else {
                    Vec::new()
                },
                lines: lines.into_iter().collect(),
            });
        } else if arrivals > instance.expected {
            findings.push(BarrierFinding::TooManyArrivals {
                barrier,
                arrivals,
                expected: instance.expected,
            });
        }

        if let Some(cycle) = self.cycle_through(id) {
            // Every member finds the same cycle; only its smallest reports it
            if cycle.iter().min() == Some(&id) {
                findings.push(BarrierFinding::OrderingCycle {
                    barriers: cycle
                        .iter()
                        .filter_map(|c| self.instance(*c))
                        .map(|i| BarrierRef {
                            name: i.name,
                            generation: i.generation,
                        })
                        .collect(),
                });
            }
        }
        findings
    }

    /// Shortest cycle through `start`, if any, beginning at `start`.
    pub fn cycle_through(&self, start: InstanceId) -> Option<Vec<InstanceId>> {
        if self.acyclic {
            return None;
        }
        let mut parent: HashMap<InstanceId, InstanceId> = HashMap::new();
        let mut queue: VecDeque<InstanceId> = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for next in self.successors(node) {
                if *next == start {
                    let mut path = vec![node];
                    let mut cur = node;
                    while cur != start {
                        cur = parent[&cur];
                        path.push(cur);
                    }
                    path.reverse();
                    return Some(path);
                }
                if !parent.contains_key(next) {
                    parent.insert(*next, node);
                    queue.push_back(*next);
                }
            }
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kernel::Dim3;
    use crate::thread::{BarrierEvent, DynamicInstruction, Event};

    /// Test trace builder: `s(name)`, `a(name)`, `r(addr)`, `w(addr)`
    pub(crate) fn thread(id: usize, entries: &[(&str, i64)]) -> Thread {
        thread_with_count(id, entries, 2)
    }

    pub(crate) fn thread_with_count(id: usize, entries: &[(&str, i64)], count: usize) -> Thread {
        let mut t = Thread::new(id, Dim3::new(id as u32, 0, 0));
        for (pc, (kind, arg)) in entries.iter().enumerate() {
            let event = match *kind {
                "s" | "a" => Event::Barrier(BarrierEvent {
                    name: *arg as u32,
                    count,
                    kind: if *kind == "s" {
                        BarrierKind::Sync
                    } else {
                        BarrierKind::Arrive
                    },
                    instance: None,
                }),
                "r" => Event::Shared {
                    address: *arg,
                    is_write: false,
                },
                _ => Event::Shared {
                    address: *arg,
                    is_write: true,
                },
            };
            t.trace.push(DynamicInstruction {
                pc,
                line: pc + 1,
                event,
            });
        }
        t
    }

    #[test]
    fn test_generations_and_edges() {
        let mut threads = vec![
            thread(0, &[("w", 0), ("s", 0), ("s", 0)]),
            thread(1, &[("s", 0), ("r", 0), ("s", 0)]),
        ];
        let graph = BarrierGraph::build(threads.iter_mut(), 2);
        assert_eq!(graph.instance_count(), 2);
        assert!(graph.is_acyclic());
        assert_eq!(graph.successors(InstanceId(0)), &[InstanceId(1)]);
        assert_eq!(
            threads[0].trace[2].barrier().unwrap().instance,
            Some(InstanceId(1))
        );
        for id in graph.instance_ids() {
            assert!(graph.validate_instance(id).is_empty());
        }
        // Thread 0's write (index 0) completes before generation 0
        assert_eq!(graph.pre(InstanceId(0), 0), 1);
        // Thread 1's read (index 1) starts after generation 0
        assert_eq!(graph.post(InstanceId(0), 1), 1);
    }

    #[test]
    fn test_missing_arrival_is_deadlock() {
        let mut threads = vec![
            thread_with_count(0, &[("s", 1)], 3),
            thread_with_count(1, &[("s", 1)], 3),
            thread_with_count(2, &[("w", 4)], 3),
        ];
        let graph = BarrierGraph::build(threads.iter_mut(), 3);
        let findings = graph.validate_instance(InstanceId(0));
        assert_eq!(
            findings,
            vec![BarrierFinding::Deadlock {
                barrier: BarrierRef {
                    name: 1,
                    generation: 0
                },
                arrivals: 2,
                expected: 3,
                waiting: vec![0, 1],
                missing: vec![2],
                lines: vec![1],
            }]
        );
    }

    #[test]
    fn test_partial_barrier_deadlock_names_no_missing_threads() {
        // Two of four threads take part; which one stays away is unknowable
        let mut threads = vec![
            thread_with_count(0, &[("s", 1)], 2),
            thread_with_count(1, &[("w", 4)], 2),
            thread_with_count(2, &[("w", 8)], 2),
            thread_with_count(3, &[("w", 12)], 2),
        ];
        let graph = BarrierGraph::build(threads.iter_mut(), 4);
        match graph.validate_instance(InstanceId(0)).as_slice() {
            [BarrierFinding::Deadlock {
                arrivals,
                expected,
                waiting,
                missing,
                ..
            }] => {
                assert_eq!((*arrivals, *expected), (1, 2));
                assert_eq!(waiting, &vec![0]);
                assert!(missing.is_empty());
            }
            other => panic!("unexpected findings {other:?}"),
        }
    }

    #[test]
    fn test_count_disagreement_and_excess() {
        let mut threads = vec![
            thread_with_count(0, &[("s", 0)], 1),
            thread_with_count(1, &[("s", 0)], 2),
        ];
        let graph = BarrierGraph::build(threads.iter_mut(), 2);
        let findings = graph.validate_instance(InstanceId(0));
        assert!(findings.iter().any(|f| matches!(
            f,
            BarrierFinding::ArrivalMismatch { declared, .. } if declared == &vec![1, 2]
        )));
        assert!(findings.iter().any(BarrierFinding::is_structural));
    }

    #[test]
    fn test_out_of_step_generations_form_cycle() {
        // Thread 0 waits at A then B, thread 1 waits at B then A
        let mut threads = vec![
            thread(0, &[("s", 1), ("s", 2)]),
            thread(1, &[("s", 2), ("s", 1)]),
        ];
        let graph = BarrierGraph::build(threads.iter_mut(), 2);
        assert!(!graph.is_acyclic());
        let cycles: Vec<BarrierFinding> = graph
            .instance_ids()
            .flat_map(|id| graph.validate_instance(id))
            .filter(|f| matches!(f, BarrierFinding::OrderingCycle { .. }))
            .collect();
        assert_eq!(cycles.len(), 1);
        match &cycles[0] {
            BarrierFinding::OrderingCycle { barriers } => assert_eq!(barriers.len(), 2),
            other => panic!("unexpected finding {other:?}"),
        }
    }

    #[test]
    fn test_finding_display() {
        let f = BarrierFinding::TooManyArrivals {
            barrier: BarrierRef {
                name: 3,
                generation: 1,
            },
            arrivals: 5,
            expected: 4,
        };
        assert_eq!(
            f.to_string(),
            "too many participants at barrier 3 generation 1: 5 arrivals for 4 expected"
        );
    }
}
