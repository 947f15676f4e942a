// Assembly phase bodies
// Dedup, census, index build, overlap matching, compaction and finalize

use std::ops::Range;
use std::sync::atomic::Ordering;

use gasm_common::{Access, SdbmHash, Transaction};

use crate::error::{AssemblyError, Result};
use crate::task::Phase;
use crate::worker::{Assembled, SharedAssemblyState};

/// Contiguous slice of `0..total` owned by `worker_id`.
///
/// Slices are `ceil(total / num_workers)` long; the last worker also takes
/// whatever remains, and workers past the end get an empty range.
pub fn partition(total: usize, num_workers: usize, worker_id: usize) -> Range<usize> {
    let num_workers = num_workers.max(1);
    let size = (total + num_workers - 1) / num_workers;
    let start = (worker_id * size).min(total);
    let stop = if worker_id + 1 == num_workers {
        total
    } else {
        (start + size).min(total)
    };
    start..stop
}

pub(crate) fn run_phase<S, M>(
    worker_id: usize,
    phase: Phase,
    shared: &SharedAssemblyState<'_, S, M>,
) -> Result<()>
where
    S: AsRef<[u8]> + Sync,
    M: Transaction,
{
    match phase {
        Phase::Dedup => dedup(worker_id, shared),
        Phase::Census => census(shared),
        Phase::IndexBuild => index_build(worker_id, shared),
        Phase::Match { substring_length } => match_pass(worker_id, substring_length, shared),
        Phase::Compact { substring_length } => compact(substring_length, shared),
        Phase::Finalize => finalize(shared),
    }
}

/// Insert this worker's slice of the input into the unique set, one chunk
/// per region. Each newly unique index is also queued in the same region.
fn dedup<S, M>(worker_id: usize, shared: &SharedAssemblyState<'_, S, M>) -> Result<()>
where
    S: AsRef<[u8]> + Sync,
    M: Transaction,
{
    let range = partition(shared.segments.len(), shared.num_workers, worker_id);
    let mut chunk_start = range.start;

    while chunk_start < range.end {
        let chunk_end = (chunk_start + shared.dedup_chunk).min(range.end);
        let outcome = shared.tm.run(|tx| {
            let mut inserted = 0usize;
            for index in chunk_start..chunk_end {
                let content = shared.segment(index);
                let key = SdbmHash::hash(content);
                let fresh = shared.unique.insert_unique_by(tx, key, index, |other| {
                    shared.segment(other) == content
                })?;
                if fresh {
                    if !shared.unique_list.push(tx, index)? {
                        return Ok(None);
                    }
                    inserted += 1;
                }
            }
            Ok(Some(inserted))
        });

        match outcome {
            Some(inserted) => {
                shared.inserted.fetch_add(inserted, Ordering::Relaxed);
            }
            None => {
                return Err(AssemblyError::AllocationFailure {
                    what: "unique segment queue",
                    requested: shared.segments.len(),
                })
            }
        }
        chunk_start = chunk_end;
    }
    Ok(())
}

/// Count the unique segments and cross-check the dedup result.
fn census<S, M>(shared: &SharedAssemblyState<'_, S, M>) -> Result<()>
where
    S: AsRef<[u8]> + Sync,
    M: Transaction,
{
    let num_unique = shared.unique.len();
    let queued = shared.unique_list.len_plain();
    let committed = shared.inserted.load(Ordering::Relaxed);

    if queued != num_unique || committed != num_unique {
        return Err(AssemblyError::invariant(format!(
            "unique set holds {num_unique} segments but dedup queued {queued} and committed {committed}"
        )));
    }
    if num_unique > shared.arena.len() {
        return Err(AssemblyError::InvalidInput(format!(
            "{num_unique} unique segments exceed the {} windows of the declared gene length",
            shared.arena.len()
        )));
    }

    shared.num_unique.store(num_unique, Ordering::Release);
    tracing::debug!(
        segments = shared.segments.len(),
        unique = num_unique,
        "deduplicated segments"
    );
    Ok(())
}

/// Claim a free construct entry for `segment_index`, starting at `hint`.
///
/// Each region probes at most `probe_window` slots and restarts itself to
/// continue, so claims stay short under contention. Occupied slots never
/// become free again, which makes it safe to keep advancing `hint` across
/// aborted attempts.
fn claim_entry<S, M>(
    shared: &SharedAssemblyState<'_, S, M>,
    hint: &mut usize,
    segment_index: usize,
    end_hash: u64,
) -> Result<usize>
where
    S: AsRef<[u8]> + Sync,
    M: Transaction,
{
    let num_unique = shared.num_unique();
    let mut scanned = 0usize;

    let claimed = shared.tm.run(|tx| {
        for _ in 0..shared.probe_window {
            if scanned >= num_unique {
                return Ok(None);
            }
            let entry = shared.arena.entry(*hint);
            if tx.read(&entry.segment)?.is_none() {
                tx.write(&entry.segment, Some(segment_index))?;
                tx.write(&entry.end_hash, end_hash)?;
                return Ok(Some(*hint));
            }
            *hint = (*hint + 1) % num_unique;
            scanned += 1;
        }
        tx.restart()
    });

    claimed.ok_or_else(|| {
        AssemblyError::invariant(format!("no free construct entry for segment {segment_index}"))
    })
}

/// Give every unique segment in this worker's buckets a construct entry and
/// index its prefixes.
fn index_build<S, M>(worker_id: usize, shared: &SharedAssemblyState<'_, S, M>) -> Result<()>
where
    S: AsRef<[u8]> + Sync,
    M: Transaction,
{
    let num_unique = shared.num_unique();
    if num_unique == 0 {
        return Ok(());
    }
    let segment_length = shared.segment_length;
    let buckets = partition(shared.unique.num_buckets(), shared.num_workers, worker_id);
    let mut hint = partition(num_unique, shared.num_workers, worker_id).start % num_unique;

    for bucket in buckets {
        for segment_index in shared.unique.bucket_slots(bucket) {
            let segment = shared.segment(segment_index);
            let end_hash = SdbmHash::hash(&segment[1..]);
            let entry = claim_entry(shared, &mut hint, segment_index, end_hash)?;

            for (prefix_length, prefix_hash) in (1..).zip(SdbmHash::prefixes(segment)) {
                let inserted = if prefix_length < segment_length {
                    let table = shared.prefix_table(prefix_length);
                    shared.tm.run(|tx| table.insert(tx, prefix_hash, entry))
                } else {
                    shared.tm.run(|tx| {
                        shared.full_table.insert_unique_by(tx, prefix_hash, entry, |other| {
                            matches!(shared.entry_segment(other), Ok(existing) if existing == segment)
                        })
                    })
                };
                if !inserted {
                    return Err(AssemblyError::invariant(format!(
                        "construct entry {entry} rejected by the {prefix_length}-symbol index"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Link the tail `end` to the head `start` when they overlap by
/// `substring_length` symbols. Returns whether the link was made.
fn link<S, M>(
    shared: &SharedAssemblyState<'_, S, M>,
    end: usize,
    start: usize,
    substring_length: usize,
) -> bool
where
    S: AsRef<[u8]> + Sync,
    M: Transaction,
{
    let arena = &shared.arena;
    shared.tm.run(|tx| {
        let start_entry = arena.entry(start);
        if !tx.read(&start_entry.is_start)? {
            return Ok(false);
        }
        let end_entry = arena.entry(end);
        let head = tx.read(&end_entry.start)?;
        if head == start {
            // Same chain: linking would close a cycle
            return Ok(false);
        }
        let tail = tx.read(&start_entry.end)?;

        tx.write(&start_entry.is_start, false)?;
        tx.write(&arena.end_info(end).is_end, false)?;
        tx.write(&arena.entry(tail).start, head)?;
        tx.write(&arena.entry(head).end, tail)?;
        tx.write(&end_entry.next, Some(start))?;
        tx.write(&end_entry.overlap, substring_length)?;

        let head_length = tx.read(&arena.entry(head).length)?;
        let start_length = tx.read(&start_entry.length)?;
        tx.write(
            &arena.entry(head).length,
            head_length + start_length - substring_length,
        )?;
        Ok(true)
    })
}

/// One matching pass over this worker's slice of the construct arena.
///
/// Only this worker clears `is_end` for entries in its slice, and the
/// prefix tables, end hashes and skip-chain are frozen during the pass, so
/// those are read without a transaction.
fn match_pass<S, M>(
    worker_id: usize,
    substring_length: usize,
    shared: &SharedAssemblyState<'_, S, M>,
) -> Result<()>
where
    S: AsRef<[u8]> + Sync,
    M: Transaction,
{
    let num_unique = shared.num_unique();
    let range = partition(num_unique, shared.num_workers, worker_id);
    let table = shared.prefix_table(substring_length);
    let arena = &shared.arena;
    let suffix_start = shared.segment_length - substring_length;
    let mut links = 0usize;

    let mut index = range.start;
    while index < range.end {
        let info = arena.end_info(index);
        if info.is_end.load_direct() {
            let end_hash = arena.entry(index).end_hash.load_direct();
            let suffix = &shared.entry_segment(index)?[suffix_start..];

            for candidate in table.matching(end_hash) {
                if &shared.entry_segment(candidate)?[..substring_length] != suffix {
                    continue;
                }
                if link(shared, index, candidate, substring_length) {
                    tracing::trace!(end = index, start = candidate, substring_length, "linked");
                    links += 1;
                    break;
                }
            }
        }
        index += info.jump_to_next.load_direct();
    }

    shared.links.fetch_add(links, Ordering::Relaxed);
    Ok(())
}

/// Prepare the tails left after a `substring_length` pass for the next,
/// shorter one: rehash their suffixes and rebuild the skip-chain so the walk
/// steps from tail to tail.
fn compact<S, M>(substring_length: usize, shared: &SharedAssemblyState<'_, S, M>) -> Result<()>
where
    S: AsRef<[u8]> + Sync,
    M: Transaction,
{
    let num_unique = shared.num_unique();
    if num_unique == 0 {
        return Ok(());
    }
    let arena = &shared.arena;
    let suffix_start = shared.segment_length - (substring_length - 1);
    let is_end = |index: usize| arena.end_info(index).is_end.load_direct();
    let jump = |index: usize| arena.end_info(index).jump_to_next.load_direct();
    let rehash = |index: usize| -> Result<()> {
        let segment = shared.entry_segment(index)?;
        arena
            .entry(index)
            .end_hash
            .store_direct(SdbmHash::hash(&segment[suffix_start..]));
        Ok(())
    };

    let mut index = 1;
    while index < num_unique && !is_end(index) {
        index += jump(index);
    }
    arena.end_info(0).jump_to_next.store_direct(index);
    if is_end(0) {
        rehash(0)?;
    }

    let mut previous = 0;
    let mut remaining = usize::from(is_end(0));
    while index < num_unique {
        if is_end(index) {
            rehash(index)?;
            arena.end_info(previous).jump_to_next.store_direct(index - previous);
            previous = index;
            remaining += 1;
        }
        index += jump(index);
    }
    arena.end_info(previous).jump_to_next.store_direct(index - previous);

    tracing::debug!(
        substring_length,
        tails = remaining,
        "compacted tails for next pass"
    );
    Ok(())
}

/// Walk every chain from its head and concatenate the non-overlapping part
/// of each entry.
fn finalize<S, M>(shared: &SharedAssemblyState<'_, S, M>) -> Result<()>
where
    S: AsRef<[u8]> + Sync,
    M: Transaction,
{
    let num_unique = shared.num_unique();
    let segment_length = shared.segment_length;
    let arena = &shared.arena;

    let heads: Vec<usize> = (0..num_unique)
        .filter(|&index| arena.entry(index).is_start.load_direct())
        .collect();
    let total: usize = heads
        .iter()
        .map(|&head| arena.entry(head).length.load_direct())
        .sum();

    let mut sequence = Vec::new();
    sequence
        .try_reserve_exact(total)
        .map_err(|_| AssemblyError::AllocationFailure {
            what: "output sequence",
            requested: total,
        })?;

    let mut visited = 0usize;
    for &head in &heads {
        let chain_end = sequence.len() + arena.entry(head).length.load_direct();
        let mut cursor = Some(head);

        while let Some(index) = cursor {
            visited += 1;
            if visited > num_unique {
                return Err(AssemblyError::invariant(format!(
                    "chain starting at entry {head} revisits an entry"
                )));
            }
            let entry = arena.entry(index);
            let overlap = entry.overlap.load_direct();
            if overlap >= segment_length {
                return Err(AssemblyError::invariant(format!(
                    "entry {index} overlaps its successor by {overlap} symbols"
                )));
            }
            let take = segment_length - overlap;
            if sequence.len() + take > chain_end {
                return Err(AssemblyError::invariant(format!(
                    "chain starting at entry {head} is longer than its recorded length"
                )));
            }
            sequence.extend_from_slice(&shared.entry_segment(index)?[..take]);
            cursor = entry.next.load_direct();
        }

        if sequence.len() != chain_end {
            return Err(AssemblyError::invariant(format!(
                "chain starting at entry {head} is shorter than its recorded length"
            )));
        }
    }

    if visited != num_unique {
        return Err(AssemblyError::invariant(format!(
            "{} construct entries are unreachable from any chain head",
            num_unique - visited
        )));
    }

    tracing::debug!(chains = heads.len(), length = sequence.len(), "sequence finalized");
    *shared.output.lock() = Some(Assembled {
        sequence,
        chains: heads.len(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::sliding_windows;
    use crate::task::phase_plan;
    use crate::worker::run_workers;
    use gasm_common::{HybridTm, Segment};

    const GENE: &[u8] = b"gatcggcagc";

    /// State after every phase but finalize, for one chain covering `GENE`.
    fn linked_state<'a>(
        segments: &'a [Segment],
        tm: &'a HybridTm,
    ) -> SharedAssemblyState<'a, Segment, HybridTm> {
        let shared = SharedAssemblyState::new(segments, 4, 7, 7, 2, 2, 4, tm).unwrap();
        let plan = phase_plan(4);
        run_workers(&plan[..plan.len() - 1], &shared).unwrap();
        assert_eq!(shared.num_unique(), 7);
        shared
    }

    /// Single chain head and the entry that ends it.
    fn head_and_tail<S, M>(shared: &SharedAssemblyState<'_, S, M>) -> (usize, usize)
    where
        S: AsRef<[u8]> + Sync,
        M: Transaction,
    {
        let entries = 0..shared.num_unique();
        let heads: Vec<usize> = entries
            .clone()
            .filter(|&index| shared.arena.entry(index).is_start.load_direct())
            .collect();
        let tails: Vec<usize> = entries
            .filter(|&index| shared.arena.entry(index).next.load_direct().is_none())
            .collect();
        assert_eq!(heads.len(), 1);
        assert_eq!(tails.len(), 1);
        (heads[0], tails[0])
    }

    fn violation(result: Result<()>) -> String {
        match result {
            Err(AssemblyError::InvariantViolation(detail)) => detail,
            other => panic!("expected an invariant violation, got {other:?}"),
        }
    }

    #[test]
    fn test_finalize_intact_chain() {
        let segments = sliding_windows(GENE, 4).unwrap();
        let tm = HybridTm::default();
        let shared = linked_state(&segments, &tm);

        finalize(&shared).unwrap();
        let output = shared.output.lock().take().unwrap();
        assert_eq!(output.sequence, GENE);
        assert_eq!(output.chains, 1);
    }

    #[test]
    fn test_finalize_rejects_chain_shorter_than_length() {
        let segments = sliding_windows(GENE, 4).unwrap();
        let tm = HybridTm::default();
        let shared = linked_state(&segments, &tm);
        let (head, _) = head_and_tail(&shared);

        let length = &shared.arena.entry(head).length;
        length.store_direct(length.load_direct() + 1);
        assert!(violation(finalize(&shared)).contains("shorter"));
        assert!(shared.output.lock().is_none());
    }

    #[test]
    fn test_finalize_rejects_chain_longer_than_length() {
        let segments = sliding_windows(GENE, 4).unwrap();
        let tm = HybridTm::default();
        let shared = linked_state(&segments, &tm);
        let (head, _) = head_and_tail(&shared);

        let length = &shared.arena.entry(head).length;
        length.store_direct(length.load_direct() - 1);
        assert!(violation(finalize(&shared)).contains("longer"));
    }

    #[test]
    fn test_finalize_rejects_cycle() {
        let segments = sliding_windows(GENE, 4).unwrap();
        let tm = HybridTm::default();
        let shared = linked_state(&segments, &tm);
        let (head, tail) = head_and_tail(&shared);

        shared.arena.entry(tail).next.store_direct(Some(head));
        assert!(violation(finalize(&shared)).contains("revisits"));
    }

    #[test]
    fn test_finalize_rejects_unreachable_entries() {
        let segments = sliding_windows(GENE, 4).unwrap();
        let tm = HybridTm::default();
        let shared = linked_state(&segments, &tm);
        let (head, _) = head_and_tail(&shared);

        shared.arena.entry(head).is_start.store_direct(false);
        assert!(violation(finalize(&shared)).contains("unreachable"));
    }

    #[test]
    fn test_finalize_rejects_full_overlap() {
        let segments = sliding_windows(GENE, 4).unwrap();
        let tm = HybridTm::default();
        let shared = linked_state(&segments, &tm);
        let (head, _) = head_and_tail(&shared);

        shared.arena.entry(head).overlap.store_direct(4);
        assert!(violation(finalize(&shared)).contains("overlaps"));
    }

    #[test]
    fn test_partition_covers_range() {
        for total in [0, 1, 5, 12, 13] {
            for workers in 1..6 {
                let mut next = 0;
                for worker in 0..workers {
                    let range = partition(total, workers, worker);
                    assert_eq!(range.start, next.min(total));
                    next = range.end;
                }
                assert_eq!(next, total);
            }
        }
    }

    #[test]
    fn test_partition_more_workers_than_items() {
        assert_eq!(partition(2, 4, 0), 0..1);
        assert_eq!(partition(2, 4, 1), 1..2);
        assert_eq!(partition(2, 4, 2), 2..2);
        assert_eq!(partition(2, 4, 3), 2..2);
    }

    #[test]
    fn test_partition_last_worker_takes_remainder() {
        assert_eq!(partition(10, 3, 0), 0..4);
        assert_eq!(partition(10, 3, 1), 4..8);
        assert_eq!(partition(10, 3, 2), 8..10);
    }
}
