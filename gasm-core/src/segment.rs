// Segment generation
// Random genes, covering segment samples and helpers for building test inputs

use ahash::AHashSet;
use gasm_common::{Base, ConcurrentQueue, Segment, Sequence};
use rand::Rng;

use crate::error::{AssemblyError, Result};

/// Random gene over `acgt`.
pub fn random_gene<R: Rng + ?Sized>(length: usize, rng: &mut R) -> Sequence {
    (0..length)
        .map(|_| {
            Base::from_u8(rng.gen_range(0..4u8))
                .map(Base::symbol)
                .unwrap_or(b'a')
        })
        .collect()
}

fn check_lengths(gene: &[u8], segment_length: usize) -> Result<()> {
    if segment_length == 0 {
        return Err(AssemblyError::InvalidInput(
            "segment length must be positive".to_string(),
        ));
    }
    if segment_length > gene.len() {
        return Err(AssemblyError::InvalidInput(format!(
            "segment length {} exceeds gene length {}",
            segment_length,
            gene.len()
        )));
    }
    Ok(())
}

/// Sample segments that cover `gene` end to end.
///
/// Draws `min_segments` windows at random start positions, then adds the
/// window at position 0 if missing and one window at the end of every run
/// of `segment_length - 1` consecutive uncovered start positions. Adjacent
/// chosen windows therefore overlap by at least one symbol and the final
/// window of the gene is always present. Duplicates are expected.
pub fn sample_segments<R: Rng + ?Sized>(
    gene: &[u8],
    segment_length: usize,
    min_segments: usize,
    rng: &mut R,
) -> Result<Vec<Segment>> {
    check_lengths(gene, segment_length)?;

    let num_start = gene.len() - segment_length + 1;
    let window = |start: usize| gene[start..start + segment_length].to_vec();
    let mut covered = vec![false; num_start];
    let mut segments = Vec::with_capacity(min_segments + num_start / segment_length + 1);

    for _ in 0..min_segments {
        let start = rng.gen_range(0..num_start);
        covered[start] = true;
        segments.push(window(start));
    }

    if !covered[0] {
        covered[0] = true;
        segments.push(window(0));
    }

    let max_zero_run = (segment_length - 1).max(1);
    let mut i = 0;
    while i < num_start {
        let stop = (i + max_zero_run).min(num_start);
        while i < stop && !covered[i] {
            i += 1;
        }
        if i == stop {
            // Hole of maximal length: cover its last position
            i -= 1;
            covered[i] = true;
            segments.push(window(i));
        }
        i += 1;
    }

    tracing::debug!(
        gene_length = gene.len(),
        segment_length,
        sampled = segments.len(),
        "sampled segments"
    );
    Ok(segments)
}

/// Every window of `gene` in order (`gene.len() - segment_length + 1` segments).
pub fn sliding_windows(gene: &[u8], segment_length: usize) -> Result<Vec<Segment>> {
    check_lengths(gene, segment_length)?;
    Ok(gene.windows(segment_length).map(<[u8]>::to_vec).collect())
}

/// Distinct windows of length `segment_length`.
pub fn distinct_windows(gene: &[u8], segment_length: usize) -> usize {
    if segment_length == 0 || segment_length > gene.len() {
        return 0;
    }
    gene.windows(segment_length).collect::<AHashSet<_>>().len()
}

/// Whether every `(segment_length - 1)`-mer of `gene` occurs once.
///
/// When it holds, any input containing every window of `gene` reassembles
/// to exactly `gene`, since each tail then matches a single head in the
/// first pass.
pub fn has_unique_overlaps(gene: &[u8], segment_length: usize) -> bool {
    if segment_length < 2 || segment_length > gene.len() {
        return true;
    }
    let k = segment_length - 1;
    distinct_windows(gene, k) == gene.len() - k + 1
}

/// Randomly permute `segments` through a [`ConcurrentQueue`] of indices.
pub fn shuffle_segments<R: Rng + ?Sized>(
    segments: Vec<Segment>,
    rng: &mut R,
) -> Result<Vec<Segment>> {
    let full = || AssemblyError::AllocationFailure {
        what: "segment shuffle queue",
        requested: segments.len(),
    };
    let order = ConcurrentQueue::<usize>::try_new(segments.len()).map_err(|_| full())?;
    for index in 0..segments.len() {
        if !order.push_plain(index) {
            return Err(full());
        }
    }
    order.shuffle_plain(rng);

    let mut slots: Vec<Option<Segment>> = segments.into_iter().map(Some).collect();
    let mut shuffled = Vec::with_capacity(slots.len());
    while let Some(index) = order.pop_plain() {
        let segment = slots[index]
            .take()
            .ok_or_else(|| AssemblyError::invariant(format!("segment {index} dequeued twice")))?;
        shuffled.push(segment);
    }
    Ok(shuffled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_random_gene_alphabet() {
        let mut rng = StdRng::seed_from_u64(3);
        let gene = random_gene(500, &mut rng);
        assert_eq!(gene.len(), 500);
        assert!(gene.iter().all(|symbol| b"acgt".contains(symbol)));
    }

    #[test]
    fn test_sample_covers_gene() {
        let mut rng = StdRng::seed_from_u64(11);
        let gene = random_gene(300, &mut rng);
        let segment_length = 16;
        let segments = sample_segments(&gene, segment_length, 10, &mut rng).unwrap();

        let mut covered = vec![false; gene.len()];
        for segment in &segments {
            assert_eq!(segment.len(), segment_length);
            // Every segment must be a window of the gene
            let start = gene
                .windows(segment_length)
                .position(|w| w == segment.as_slice())
                .unwrap();
            covered[start..start + segment_length].iter_mut().for_each(|c| *c = true);
        }
        assert!(covered.iter().all(|&c| c));
        assert!(segments.contains(&gene[..segment_length].to_vec()));
        assert!(segments.contains(&gene[gene.len() - segment_length..].to_vec()));
    }

    #[test]
    fn test_sample_rejects_bad_lengths() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample_segments(b"acgt", 0, 1, &mut rng).is_err());
        assert!(sample_segments(b"acgt", 5, 1, &mut rng).is_err());
    }

    #[test]
    fn test_sliding_windows() {
        let windows = sliding_windows(b"aaagc", 3).unwrap();
        assert_eq!(windows, vec![b"aaa".to_vec(), b"aag".to_vec(), b"agc".to_vec()]);
    }

    #[test]
    fn test_overlap_uniqueness() {
        assert!(has_unique_overlaps(b"gatcggcagc", 4));
        // "aaa" repeats at every position of a homopolymer
        assert!(!has_unique_overlaps(b"aaaaaa", 4));
        assert_eq!(distinct_windows(b"aaacaaagaaat", 4), 9);
    }

    #[test]
    fn test_shuffle_segments_is_permutation() {
        let mut rng = StdRng::seed_from_u64(5);
        let segments = sliding_windows(b"gatcggcagcttacg", 5).unwrap();
        let mut shuffled = shuffle_segments(segments.clone(), &mut rng).unwrap();
        assert_eq!(shuffled.len(), segments.len());
        shuffled.sort();
        let mut expected = segments;
        expected.sort();
        assert_eq!(shuffled, expected);
    }
}
