// Worker pool for the assembly phases
// Fixed set of scoped threads walking one phase plan, separated by a barrier

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::time::Instant;

use gasm_common::{ConcurrentQueue, HashIndexTable, Sequence, Transaction};
use parking_lot::Mutex;

use crate::arena::ConstructArena;
use crate::error::{AssemblyError, Result};
use crate::sequencer;
use crate::task::Phase;

/// Output of the finalize phase
#[derive(Debug)]
pub struct Assembled {
    pub sequence: Sequence,
    pub chains: usize,
}

/// Shared state accessible to all worker threads
///
/// Built once per run before the pool starts and dropped after it joins.
/// Transactional structures are mutated only through `tm` or under the
/// leader-only guarantee of a barrier-delimited phase.
pub struct SharedAssemblyState<'a, S, M> {
    /// Input segments, all `segment_length` long
    pub segments: &'a [S],
    pub segment_length: usize,
    pub num_workers: usize,

    /// Segments per dedup region
    pub dedup_chunk: usize,
    /// Construct entries probed per claim region before it restarts
    pub probe_window: usize,

    pub tm: &'a M,

    /// Distinct segment contents, keyed by sdbm hash; slots are input indices
    pub unique: HashIndexTable,
    /// Input index of every newly unique segment, pushed by dedup
    pub unique_list: ConcurrentQueue<usize>,
    /// Unique segments committed by dedup regions
    pub inserted: AtomicUsize,
    /// Number of unique segments, published by the census
    pub num_unique: AtomicUsize,

    pub arena: ConstructArena,
    /// `prefix_tables[k - 1]` maps the hash of each entry's first `k`
    /// symbols to its construct entry
    pub prefix_tables: Vec<HashIndexTable>,
    /// Hash of the whole segment to construct entry, one entry per content
    pub full_table: HashIndexTable,

    /// Chain links made by match passes
    pub links: AtomicUsize,
    pub output: Mutex<Option<Assembled>>,

    failed: AtomicBool,
    failure: Mutex<Option<AssemblyError>>,
}

fn index_table(what: &'static str, num_buckets: usize, capacity: usize) -> Result<HashIndexTable> {
    HashIndexTable::try_new(num_buckets, capacity).map_err(|_| AssemblyError::AllocationFailure {
        what,
        requested: num_buckets.max(capacity),
    })
}

impl<'a, S, M> SharedAssemblyState<'a, S, M>
where
    S: AsRef<[u8]> + Sync,
    M: Transaction,
{
    /// Allocate every table and arena for a run over `segments`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        segments: &'a [S],
        segment_length: usize,
        max_unique: usize,
        num_buckets: usize,
        num_workers: usize,
        dedup_chunk: usize,
        probe_window: usize,
        tm: &'a M,
    ) -> Result<Self> {
        let arena = ConstructArena::new(max_unique, segment_length)?;

        let mut prefix_tables = Vec::new();
        prefix_tables
            .try_reserve_exact(segment_length.saturating_sub(1))
            .map_err(|_| AssemblyError::AllocationFailure {
                what: "prefix tables",
                requested: segment_length,
            })?;
        for _ in 1..segment_length {
            prefix_tables.push(index_table("prefix table", num_buckets, max_unique)?);
        }
        let unique = index_table("unique segment set", num_buckets, segments.len())?;
        let unique_list = ConcurrentQueue::try_new(num_buckets).map_err(|_| {
            AssemblyError::AllocationFailure {
                what: "unique segment queue",
                requested: num_buckets,
            }
        })?;
        let full_table = index_table("full-length table", num_buckets, max_unique)?;

        Ok(SharedAssemblyState {
            segments,
            segment_length,
            num_workers: num_workers.max(1),
            dedup_chunk: dedup_chunk.max(1),
            probe_window: probe_window.max(1),
            tm,
            unique,
            unique_list,
            inserted: AtomicUsize::new(0),
            num_unique: AtomicUsize::new(0),
            arena,
            prefix_tables,
            full_table,
            links: AtomicUsize::new(0),
            output: Mutex::new(None),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
        })
    }

    #[inline]
    pub fn segment(&self, index: usize) -> &'a [u8] {
        self.segments[index].as_ref()
    }

    /// Content of the segment claimed by construct entry `entry`.
    ///
    /// An entry's segment is written once when claimed and is published
    /// before the entry appears in any table, so a plain load is enough.
    pub fn entry_segment(&self, entry: usize) -> Result<&'a [u8]> {
        let index = self.arena.entry(entry).segment.load_direct().ok_or_else(|| {
            AssemblyError::invariant(format!("construct entry {entry} was never claimed"))
        })?;
        Ok(self.segment(index))
    }

    #[inline]
    pub fn prefix_table(&self, substring_length: usize) -> &HashIndexTable {
        &self.prefix_tables[substring_length - 1]
    }

    #[inline]
    pub fn num_unique(&self) -> usize {
        self.num_unique.load(Ordering::Acquire)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Keep the first failure; later ones are logged and dropped.
    pub fn record_failure(&self, error: AssemblyError) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            tracing::warn!("assembly failed: {error}");
            *slot = Some(error);
        } else {
            tracing::debug!("additional assembly failure: {error}");
        }
        self.failed.store(true, Ordering::Release);
    }

    pub fn take_failure(&self) -> Option<AssemblyError> {
        self.failure.lock().take()
    }
}

/// Worker thread main loop
///
/// Walks `plan`, executing each phase body the worker is scheduled for, and
/// waits at `barrier` after every phase whether or not it ran the body. Once
/// any worker has recorded a failure the remaining bodies are skipped, but
/// barriers are still honoured so no peer is left waiting.
pub fn worker_thread<S, M>(
    worker_id: usize,
    plan: &[Phase],
    barrier: &Barrier,
    shared: &SharedAssemblyState<'_, S, M>,
) where
    S: AsRef<[u8]> + Sync,
    M: Transaction,
{
    for &phase in plan {
        if phase.runs_on(worker_id) && !shared.has_failed() {
            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                sequencer::run_phase(worker_id, phase, shared)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => shared.record_failure(error),
                Err(_) => shared.record_failure(AssemblyError::WorkerPanicked(worker_id)),
            }
            if worker_id == 0 {
                tracing::debug!(
                    ?phase,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "phase complete"
                );
            }
        }
        barrier.wait();
    }
}

/// Run `plan` on `shared.num_workers` scoped threads and wait for them.
pub fn run_workers<S, M>(plan: &[Phase], shared: &SharedAssemblyState<'_, S, M>) -> Result<()>
where
    S: AsRef<[u8]> + Sync,
    M: Transaction,
{
    let num_workers = shared.num_workers;
    let barrier = Barrier::new(num_workers);

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..num_workers)
            .map(|worker_id| {
                let barrier = &barrier;
                scope.spawn(move || worker_thread(worker_id, plan, barrier, shared))
            })
            .collect();

        for (worker_id, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                shared.record_failure(AssemblyError::WorkerPanicked(worker_id));
            }
        }
    });

    match shared.take_failure() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gasm_common::HybridTm;

    fn shared_state<'a>(
        segments: &'a [&'a [u8]],
        tm: &'a HybridTm,
        num_workers: usize,
    ) -> SharedAssemblyState<'a, &'a [u8], HybridTm> {
        let segment_length = segments[0].len();
        SharedAssemblyState::new(segments, segment_length, 16, 16, num_workers, 2, 4, tm).unwrap()
    }

    #[test]
    fn test_first_failure_wins() {
        let tm = HybridTm::default();
        let segments: [&[u8]; 1] = [b"acgt"];
        let shared = shared_state(&segments, &tm, 1);

        assert!(!shared.has_failed());
        shared.record_failure(AssemblyError::invariant("first"));
        shared.record_failure(AssemblyError::invariant("second"));
        assert!(shared.has_failed());
        assert_eq!(shared.take_failure(), Some(AssemblyError::invariant("first")));
    }

    #[test]
    fn test_pool_runs_full_plan() {
        let tm = HybridTm::default();
        let segments: [&[u8]; 3] = [b"gatc", b"atcg", b"gatc"];
        let shared = shared_state(&segments, &tm, 3);

        run_workers(&crate::task::phase_plan(4), &shared).unwrap();
        assert_eq!(shared.num_unique(), 2);
        let output = shared.output.lock().take().unwrap();
        assert_eq!(output.sequence, b"gatcg".to_vec());
        assert_eq!(output.chains, 1);
    }

    #[test]
    fn test_failure_skips_remaining_phases() {
        let tm = HybridTm::default();
        let segments: [&[u8]; 2] = [b"acgt", b"cgta"];
        let shared = shared_state(&segments, &tm, 2);
        shared.record_failure(AssemblyError::invariant("injected"));

        let err = run_workers(&crate::task::phase_plan(4), &shared).unwrap_err();
        assert_eq!(err, AssemblyError::invariant("injected"));
        assert!(shared.output.lock().is_none());
    }
}
