/// Shared-memory race detection.
/// Two accesses race when they touch the same address from different threads,
/// at least one writes, and the happens-before relation orders neither way.
/// Checks run over one sorted run of addresses at a time.
use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::happens::{HappensRelation, Order, Point};
use crate::kernel::Dim3;
use crate::memory::SharedAccess;
use crate::thread::Thread;

/// One side of a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessSite {
    pub thread: usize,
    pub tid: Dim3,
    pub pc: usize,
    pub line: usize,
    pub is_write: bool,
}

impl AccessSite {
    fn new(access: &SharedAccess, thread: &Thread) -> Self {
        AccessSite {
            thread: access.thread,
            tid: thread.tid,
            pc: access.pc,
            line: thread
                .trace
                .get(access.trace_index)
                .map(|d| d.line)
                .unwrap_or(0),
            is_write: access.is_write,
        }
    }
}

impl fmt::Display for AccessSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} by thread {} {} (line {}, pc {})",
            if self.is_write { "write" } else { "read" },
            self.thread,
            self.tid,
            self.line,
            self.pc
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Race {
    pub address: i64,
    pub first: AccessSite,
    pub second: AccessSite,
}

impl Race {
    /// Identity used for deduplication and for the report order
    pub fn key(&self) -> (i64, usize, usize, usize, usize) {
        (
            self.address,
            self.first.thread,
            self.first.pc,
            self.second.thread,
            self.second.pc,
        )
    }
}

impl fmt::Display for Race {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "race on shared address {:#x}: {} and {}",
            self.address, self.first, self.second
        )
    }
}

/// Check every conflicting pair in one address snapshot (see
/// `SharedMemory::snapshot`). `threads` is indexed by flat thread id.
pub fn check_shard(
    entries: &[(i64, Vec<SharedAccess>)],
    threads: &[Thread],
    relation: &HappensRelation<'_>,
) -> Vec<Race> {
    let mut seen: HashSet<(i64, usize, usize, usize, usize)> = HashSet::new();
    let mut races = Vec::new();

    for (address, accesses) in entries {
        if !accesses.iter().any(|a| a.is_write) {
            continue;
        }
        for (i, a) in accesses.iter().enumerate() {
            let Some((ta, sa)) = locate(a, threads) else {
                continue;
            };
            for b in &accesses[i + 1..] {
                if a.thread == b.thread || !(a.is_write || b.is_write) {
                    continue;
                }
                let Some((tb, sb)) = locate(b, threads) else {
                    continue;
                };
                let order = relation.order(
                    Point {
                        access: a,
                        segment: sa,
                    },
                    Point {
                        access: b,
                        segment: sb,
                    },
                );
                if order != Order::Unordered {
                    continue;
                }
                let race = Race {
                    address: *address,
                    first: AccessSite::new(a, ta),
                    second: AccessSite::new(b, tb),
                };
                if seen.insert(race.key()) {
                    races.push(race);
                }
            }
        }
    }
    races
}

fn locate<'a>(
    access: &SharedAccess,
    threads: &'a [Thread],
) -> Option<(&'a Thread, &'a crate::happens::Happens)> {
    let thread = threads.get(access.thread)?;
    Some((thread, thread.segment(access.trace_index)?))
}

/// Merge per-shard results into one deterministic, duplicate-free list.
pub fn merge(mut races: Vec<Race>) -> Vec<Race> {
    races.sort_by_key(Race::key);
    races.dedup_by_key(|r| r.key());
    races
}
