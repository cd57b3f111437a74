/// Shared-memory models.
///   - SharedMemory: the block-wide log of every shared access, keyed by
///     address in a concurrent map so emulation tasks can append in
///     parallel; race checks then take contiguous runs of the sorted
///     addresses, one run per task
///   - SharedStore: values written to shared memory by one thread (or one
///     warp in lock-step), so later loads of the same address resolve
use std::collections::HashMap;

use dashmap::DashMap;

/// Upper bound on the address partitions handed to race-check tasks.
pub const SHARD_COUNT: usize = 64;

/// Identifies one lock-step instruction of one warp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WarpStep {
    pub warp: usize,
    /// Monotonically increasing per warp; equal for all lanes of one step
    pub access_id: u64,
}

/// One logged shared-memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedAccess {
    pub thread: usize,
    pub address: i64,
    pub is_write: bool,
    /// Index into the owning thread's dynamic trace
    pub trace_index: usize,
    /// Static instruction that performed the access
    pub pc: usize,
    pub warp_step: Option<WarpStep>,
}

/// Address-keyed, append-only access log.
#[derive(Debug, Default)]
pub struct SharedMemory {
    log: DashMap<i64, Vec<SharedAccess>>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, access: SharedAccess) {
        self.log.entry(access.address).or_default().push(access);
    }

    /// Append a thread's buffered accesses.
    pub fn record_batch(&self, accesses: Vec<SharedAccess>) {
        for access in accesses {
            self.record(access);
        }
    }

    /// Every address with at least one access, ascending
    pub fn addresses(&self) -> Vec<i64> {
        let mut addresses: Vec<i64> = self.log.iter().map(|e| *e.key()).collect();
        addresses.sort_unstable();
        addresses
    }

    /// Split the sorted addresses into at most `parts` contiguous, non-empty
    /// runs.
    pub fn partition(&self, parts: usize) -> Vec<Vec<i64>> {
        let addresses = self.addresses();
        if addresses.is_empty() {
            return Vec::new();
        }
        let chunk = addresses.len().div_ceil(parts.max(1));
        addresses.chunks(chunk).map(<[i64]>::to_vec).collect()
    }

    /// Snapshot of the given addresses, in the order given, with accesses
    /// ordered by (thread, trace index) so results never depend on append
    /// order. Addresses without accesses are skipped.
    pub fn snapshot(&self, addresses: &[i64]) -> Vec<(i64, Vec<SharedAccess>)> {
        addresses
            .iter()
            .filter_map(|addr| {
                let mut accesses = self.log.get(addr)?.value().clone();
                accesses.sort_by_key(|a| (a.thread, a.trace_index));
                Some((*addr, accesses))
            })
            .collect()
    }

    pub fn total_accesses(&self) -> usize {
        self.log.iter().map(|e| e.value().len()).sum()
    }

    pub fn address_count(&self) -> usize {
        self.log.len()
    }
}

/// Sparse value store for shared memory contents seen by one thread or warp.
/// Unwritten addresses have no value.
#[derive(Debug, Default, Clone)]
pub struct SharedStore {
    data: HashMap<i64, i64>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, address: i64) -> Option<i64> {
        self.data.get(&address).copied()
    }

    pub fn write(&mut self, address: i64, value: i64) {
        self.data.insert(address, value);
    }

    /// An atomic or unknown write leaves the address without a known value
    pub fn invalidate(&mut self, address: i64) {
        self.data.remove(&address);
    }
}
