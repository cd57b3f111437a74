/// Happens-before segments and the relation built on them.
///
/// A thread's trace is cut at every barrier event into segments of shared
/// accesses. Each segment remembers, per barrier name, the latest `bar.sync`
/// before it and the nearest barrier event after it. Once the barrier graph
/// has assigned instances, those trace positions become instance ids and the
/// graph's completion bounds order segments of different threads.
use crate::graph::{BarrierGraph, InstanceId};
use crate::memory::SharedAccess;
use crate::thread::{BarrierKind, Thread};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Happens {
    /// First and last trace index covered by this segment (inclusive)
    pub first: usize,
    pub last: usize,
    /// Per barrier name: trace index of the latest preceding sync
    pub before: Vec<Option<usize>>,
    /// Per barrier name: trace index of the nearest following barrier event
    pub after: Vec<Option<usize>>,
    pub before_instances: Vec<InstanceId>,
    pub after_instances: Vec<InstanceId>,
}

impl Happens {
    fn open(first: usize, before: Vec<Option<usize>>, names: usize) -> Self {
        Happens {
            first,
            last: first,
            before,
            after: vec![None; names],
            before_instances: Vec::new(),
            after_instances: Vec::new(),
        }
    }

    pub fn contains(&self, trace_index: usize) -> bool {
        (self.first..=self.last).contains(&trace_index)
    }
}

/// Partition a thread's trace into segments and fill in their per-name
/// before/after vectors.
pub fn build(thread: &mut Thread, max_barriers: usize) {
    let mut segments: Vec<Happens> = Vec::new();
    let mut segment_of = vec![None; thread.trace.len()];

    // Forward: partition and `before`
    let mut before: Vec<Option<usize>> = vec![None; max_barriers];
    let mut open: Option<usize> = None;
    for (idx, entry) in thread.trace.iter().enumerate() {
        match entry.barrier() {
            Some(barrier) => {
                if barrier.kind == BarrierKind::Sync {
                    if let Some(slot) = before.get_mut(barrier.name as usize) {
                        *slot = Some(idx);
                    }
                }
                open = None;
            }
            None => {
                let seg = match open {
                    Some(seg) => seg,
                    None => {
                        segments.push(Happens::open(idx, before.clone(), max_barriers));
                        segments.len() - 1
                    }
                };
                segments[seg].last = idx;
                segment_of[idx] = Some(seg);
                open = Some(seg);
            }
        }
    }

    // Backward: `after`
    let mut after: Vec<Option<usize>> = vec![None; max_barriers];
    let mut pending = true;
    for (idx, entry) in thread.trace.iter().enumerate().rev() {
        match entry.barrier() {
            Some(barrier) => {
                if let Some(slot) = after.get_mut(barrier.name as usize) {
                    *slot = Some(idx);
                }
                pending = true;
            }
            None if pending => {
                if let Some(seg) = segment_of[idx] {
                    segments[seg].after = after.clone();
                }
                pending = false;
            }
            None => {}
        }
    }

    thread.segments = segments;
    thread.segment_of = segment_of;
}

/// Translate the trace indices of every segment into barrier instances.
/// Requires the trace to have been stamped by `BarrierGraph::build`.
pub fn resolve(thread: &mut Thread) {
    let trace = &thread.trace;
    let instance_at = |idx: &usize| {
        trace
            .get(*idx)
            .and_then(|d| d.barrier())
            .and_then(|b| b.instance)
    };
    for seg in thread.segments.iter_mut() {
        seg.before_instances = seg.before.iter().flatten().filter_map(instance_at).collect();
        seg.after_instances = seg.after.iter().flatten().filter_map(instance_at).collect();
    }
}

// ---------------------------------------------------------------------------
// Relation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Before,
    After,
    Unordered,
}

impl Order {
    pub fn reverse(self) -> Self {
        match self {
            Order::Before => Order::After,
            Order::After => Order::Before,
            Order::Unordered => Order::Unordered,
        }
    }
}

/// A shared access together with the segment holding it.
#[derive(Debug, Clone, Copy)]
pub struct Point<'a> {
    pub access: &'a SharedAccess,
    pub segment: &'a Happens,
}

/// Happens-before over the segments of all threads.
pub struct HappensRelation<'a> {
    graph: &'a BarrierGraph,
}

impl<'a> HappensRelation<'a> {
    /// `None` when the barrier graph has a cycle: the order is undefined
    pub fn new(graph: &'a BarrierGraph) -> Option<Self> {
        graph.is_acyclic().then_some(HappensRelation { graph })
    }

    /// Trace entries of `thread` below this index happen before `seg`
    pub fn before_bound(&self, seg: &Happens, thread: usize) -> usize {
        seg.before_instances
            .iter()
            .map(|i| self.graph.pre(*i, thread))
            .max()
            .unwrap_or(0)
    }

    /// Trace entries of `thread` at or above this index happen after `seg`
    pub fn after_bound(&self, seg: &Happens, thread: usize) -> usize {
        seg.after_instances
            .iter()
            .map(|i| self.graph.post(*i, thread))
            .min()
            .unwrap_or(usize::MAX)
    }

    /// Where `a` stands relative to `b`.
    pub fn order(&self, a: Point<'_>, b: Point<'_>) -> Order {
        let (x, y) = (a.access, b.access);
        if x.thread == y.thread {
            return match x.trace_index.cmp(&y.trace_index) {
                std::cmp::Ordering::Less => Order::Before,
                std::cmp::Ordering::Greater => Order::After,
                std::cmp::Ordering::Equal => Order::Unordered,
            };
        }
        if let (Some(sx), Some(sy)) = (x.warp_step, y.warp_step) {
            if sx.warp == sy.warp && sx.access_id != sy.access_id {
                return if sx.access_id < sy.access_id {
                    Order::Before
                } else {
                    Order::After
                };
            }
        }
        let side = self.one_sided(a.segment, y.thread, y.trace_index);
        if side != Order::Unordered {
            return side.reverse();
        }
        self.one_sided(b.segment, x.thread, x.trace_index)
    }

    /// Where entry (`thread`, `trace_index`) stands relative to `seg`
    fn one_sided(&self, seg: &Happens, thread: usize, trace_index: usize) -> Order {
        if trace_index < self.before_bound(seg, thread) {
            Order::Before
        } else if trace_index >= self.after_bound(seg, thread) {
            Order::After
        } else {
            Order::Unordered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{thread, thread_with_count};
    use proptest::prelude::*;

    fn prepared(mut threads: Vec<Thread>) -> (Vec<Thread>, BarrierGraph) {
        let n = threads.len();
        let graph = BarrierGraph::build(threads.iter_mut(), n);
        for t in threads.iter_mut() {
            build(t, 16);
            resolve(t);
        }
        (threads, graph)
    }

    fn access(t: &Thread, idx: usize) -> SharedAccess {
        let (address, is_write) = match t.trace[idx].event {
            crate::thread::Event::Shared { address, is_write } => (address, is_write),
            _ => panic!("not an access"),
        };
        SharedAccess {
            thread: t.id,
            address,
            is_write,
            trace_index: idx,
            pc: t.trace[idx].pc,
            warp_step: None,
        }
    }

    #[test]
    fn test_partition() {
        let mut t = thread(
            0,
            &[
                ("w", 0),
                ("r", 4),
                ("s", 0),
                ("w", 8),
                ("a", 1),
                ("r", 0),
                ("s", 0),
            ],
        );
        build(&mut t, 16);

        assert_eq!(t.segments.len(), 3);
        assert_eq!((t.segments[0].first, t.segments[0].last), (0, 1));
        assert_eq!((t.segments[1].first, t.segments[1].last), (3, 3));
        assert_eq!((t.segments[2].first, t.segments[2].last), (5, 5));
        // Each non-barrier entry in exactly one segment, barriers in none
        for (idx, entry) in t.trace.iter().enumerate() {
            let owners = t.segments.iter().filter(|s| s.contains(idx)).count();
            if entry.is_barrier() {
                assert_eq!(owners, 0);
                assert_eq!(t.segment_of[idx], None);
            } else {
                assert_eq!(owners, 1);
                assert!(t.segment(idx).unwrap().contains(idx));
            }
        }

        assert_eq!(t.segments[0].before[0], None);
        assert_eq!(t.segments[1].before[0], Some(2));
        // An arrive does not update `before`
        assert_eq!(t.segments[2].before[1], None);
        assert_eq!(t.segments[0].after[0], Some(2));
        assert_eq!(t.segments[0].after[1], Some(4));
        assert_eq!(t.segments[1].after[1], Some(4));
        assert_eq!(t.segments[2].after[0], Some(6));
        assert_eq!(t.segments[2].after[1], None);
    }

    #[test]
    fn test_sync_orders_writer_before_reader() {
        let (threads, graph) = prepared(vec![
            thread(0, &[("w", 0), ("s", 0)]),
            thread(1, &[("s", 0), ("r", 0)]),
        ]);
        let rel = HappensRelation::new(&graph).unwrap();
        let w = access(&threads[0], 0);
        let r = access(&threads[1], 1);
        let pw = Point {
            access: &w,
            segment: threads[0].segment(0).unwrap(),
        };
        let pr = Point {
            access: &r,
            segment: threads[1].segment(1).unwrap(),
        };
        assert_eq!(rel.order(pw, pr), Order::Before);
        assert_eq!(rel.order(pr, pw), Order::After);
    }

    #[test]
    fn test_no_barrier_is_unordered() {
        let (threads, graph) = prepared(vec![thread(0, &[("w", 0)]), thread(1, &[("w", 0)])]);
        let rel = HappensRelation::new(&graph).unwrap();
        let a = access(&threads[0], 0);
        let b = access(&threads[1], 0);
        let pa = Point {
            access: &a,
            segment: threads[0].segment(0).unwrap(),
        };
        let pb = Point {
            access: &b,
            segment: threads[1].segment(0).unwrap(),
        };
        assert_eq!(rel.order(pa, pb), Order::Unordered);
    }

    #[test]
    fn test_arrive_orders_producer_only() {
        // Producer arrives, consumer syncs: producer's write precedes the read,
        // but the producer's later write is unordered with the read
        let (threads, graph) = prepared(vec![
            thread(0, &[("w", 0), ("a", 1), ("w", 0)]),
            thread(1, &[("s", 1), ("r", 0)]),
        ]);
        let rel = HappensRelation::new(&graph).unwrap();
        let w0 = access(&threads[0], 0);
        let w2 = access(&threads[0], 2);
        let r = access(&threads[1], 1);
        fn point<'a>(a: &'a SharedAccess, t: &'a Thread, i: usize) -> Point<'a> {
            Point {
                access: a,
                segment: t.segment(i).unwrap(),
            }
        }
        assert_eq!(
            rel.order(point(&w0, &threads[0], 0), point(&r, &threads[1], 1)),
            Order::Before
        );
        assert_eq!(
            rel.order(point(&w2, &threads[0], 2), point(&r, &threads[1], 1)),
            Order::Unordered
        );
    }

    #[test]
    fn test_transitive_through_two_barriers() {
        let (threads, graph) = prepared(vec![
            thread(0, &[("w", 0), ("s", 0), ("s", 1)]),
            thread(1, &[("s", 0), ("s", 1)]),
            thread(2, &[("s", 1), ("r", 0)]),
        ]);
        let rel = HappensRelation::new(&graph).unwrap();
        let w = access(&threads[0], 0);
        let r = access(&threads[2], 1);
        let pw = Point {
            access: &w,
            segment: threads[0].segment(0).unwrap(),
        };
        let pr = Point {
            access: &r,
            segment: threads[2].segment(1).unwrap(),
        };
        assert_eq!(rel.order(pw, pr), Order::Before);
    }

    #[test]
    fn test_cycle_has_no_relation() {
        let mut threads = vec![
            thread(0, &[("s", 1), ("s", 2)]),
            thread(1, &[("s", 2), ("s", 1)]),
        ];
        let graph = BarrierGraph::build(threads.iter_mut(), 2);
        assert!(HappensRelation::new(&graph).is_none());
    }

    /// Every thread syncs on barrier 0 `phases - 1` times; `gaps[t][i]` is the
    /// number of writes thread `t` makes in phase `i`.
    fn phased(gaps: &[Vec<usize>]) -> (Vec<Thread>, BarrierGraph, Vec<(usize, usize, usize)>) {
        let n = gaps.len();
        let mut threads = Vec::new();
        let mut points = Vec::new();
        for (t, phases) in gaps.iter().enumerate() {
            let mut entries = Vec::new();
            for (phase, writes) in phases.iter().enumerate() {
                if phase > 0 {
                    entries.push(("s", 0));
                }
                for _ in 0..*writes {
                    points.push((t, entries.len(), phase));
                    entries.push(("w", 0));
                }
            }
            threads.push(thread_with_count(t, &entries, n));
        }
        let (threads, graph) = prepared(threads);
        (threads, graph, points)
    }

    /// Every thread visits the barriers `names` in the same order, choosing
    /// per visit whether to arrive (`true`) or sync. `plans[t].1[k]` is the
    /// number of writes thread `t` makes before visit `k` (the last entry
    /// after the final visit). Points are (thread, trace index, gap).
    fn mixed(
        names: &[i64],
        plans: &[(Vec<bool>, Vec<usize>)],
    ) -> (Vec<Thread>, BarrierGraph, Vec<(usize, usize, usize)>) {
        let n = plans.len();
        let mut threads = Vec::new();
        let mut points = Vec::new();
        for (t, (arrives, gaps)) in plans.iter().enumerate() {
            let mut entries = Vec::new();
            for (gap, writes) in gaps.iter().enumerate() {
                for _ in 0..*writes {
                    points.push((t, entries.len(), gap));
                    entries.push(("w", 0));
                }
                if let Some(name) = names.get(gap) {
                    entries.push((if arrives[gap] { "a" } else { "s" }, *name));
                }
            }
            threads.push(thread_with_count(t, &entries, n));
        }
        let (threads, graph) = prepared(threads);
        (threads, graph, points)
    }

    fn mixed_plans() -> impl Strategy<Value = (Vec<i64>, Vec<(Vec<bool>, Vec<usize>)>)> {
        (0usize..5).prop_flat_map(|visits| {
            (
                prop::collection::vec(0i64..2, visits),
                prop::collection::vec(
                    (
                        prop::collection::vec(any::<bool>(), visits),
                        prop::collection::vec(0usize..3, visits + 1),
                    ),
                    2..5,
                ),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_arrive_and_sync_form_strict_partial_order(
            (names, plans) in mixed_plans()
        ) {
            let (threads, graph, points) = mixed(&names, &plans);
            prop_assert!(graph.is_acyclic());
            let rel = HappensRelation::new(&graph).unwrap();
            let accesses: Vec<SharedAccess> = points
                .iter()
                .map(|(t, idx, _)| access(&threads[*t], *idx))
                .collect();
            let point = |i: usize| Point {
                access: &accesses[i],
                segment: threads[points[i].0].segment(points[i].1).unwrap(),
            };
            let order = |a: usize, b: usize| rel.order(point(a), point(b));

            for a in 0..points.len() {
                prop_assert_eq!(order(a, a), Order::Unordered);
                for b in 0..points.len() {
                    prop_assert_eq!(order(a, b), order(b, a).reverse());
                    let (ta, _, ga) = points[a];
                    let (tb, _, gb) = points[b];
                    if ta != tb {
                        // Nothing orders accesses with no barrier between them
                        if ga >= gb {
                            prop_assert_ne!(order(a, b), Order::Before);
                        }
                        // A sync by the later thread waits for the earlier
                        // thread's arrival at the same visit
                        let synced = (ga..gb).any(|k| !plans[tb].0[k]);
                        if synced {
                            prop_assert_eq!(order(a, b), Order::Before);
                        }
                    }
                    if order(a, b) == Order::Before {
                        for c in 0..points.len() {
                            if order(b, c) == Order::Before {
                                prop_assert_eq!(order(a, c), Order::Before);
                            }
                        }
                    }
                }
            }
        }

        #[test]
        fn prop_phases_form_strict_partial_order(
            gaps in (1usize..4).prop_flat_map(|phases| {
                prop::collection::vec(prop::collection::vec(0usize..3, phases), 2..5)
            })
        ) {
            let (threads, graph, points) = phased(&gaps);
            let rel = HappensRelation::new(&graph).unwrap();
            let accesses: Vec<SharedAccess> = points
                .iter()
                .map(|(t, idx, _)| access(&threads[*t], *idx))
                .collect();
            let point = |i: usize| Point {
                access: &accesses[i],
                segment: threads[points[i].0].segment(points[i].1).unwrap(),
            };
            let order = |a: usize, b: usize| rel.order(point(a), point(b));

            for a in 0..points.len() {
                prop_assert_eq!(order(a, a), Order::Unordered);
                for b in 0..points.len() {
                    prop_assert_eq!(order(a, b), order(b, a).reverse());
                    let (ta, _, pa) = points[a];
                    let (tb, _, pb) = points[b];
                    if ta != tb {
                        let expected = match pa.cmp(&pb) {
                            std::cmp::Ordering::Less => Order::Before,
                            std::cmp::Ordering::Greater => Order::After,
                            std::cmp::Ordering::Equal => Order::Unordered,
                        };
                        prop_assert_eq!(order(a, b), expected);
                    }
                    if order(a, b) == Order::Before {
                        for c in 0..points.len() {
                            if order(b, c) == Order::Before {
                                prop_assert_eq!(order(a, c), Order::Before);
                            }
                        }
                    }
                }
            }
        }
    }
}
