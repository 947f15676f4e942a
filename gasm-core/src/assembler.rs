// Public assembler entry point
// Validates input, sizes the shared state and drives the worker pool

use std::time::Instant;

use gasm_common::{HybridTm, Sequence, TmConfig, TmStatsSnapshot, Transaction};

use crate::env_cache;
use crate::error::{AssemblyError, Result};
use crate::task::phase_plan;
use crate::worker::{run_workers, SharedAssemblyState};

/// Configuration for [`Assembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerConfig {
    /// Number of worker threads
    pub num_threads: usize,

    /// Segments inserted per dedup region
    pub dedup_chunk: usize,

    /// Construct entries probed per claim region before it restarts
    pub probe_window: usize,

    /// Buckets per hash table (default: one per possible unique segment)
    pub bucket_count: Option<usize>,

    /// Transaction manager settings
    pub tm: TmConfig,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            num_threads: rayon::current_num_threads(),
            dedup_chunk: 32,
            probe_window: 64,
            bucket_count: None,
            tm: TmConfig::default(),
        }
    }
}

impl AssemblerConfig {
    /// Apply `GASM_TM_MODE` and `GASM_DEDUP_CHUNK` if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(mode) = env_cache::tm_mode_override() {
            self.tm.mode = mode;
        }
        if let Some(chunk) = env_cache::dedup_chunk_override() {
            self.dedup_chunk = chunk;
        }
        self
    }
}

/// Result of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembly {
    /// Concatenation of every chain, in arena order of the chain heads
    pub sequence: Sequence,
    /// Distinct segments after dedup
    pub unique_segments: usize,
    /// Chains the unique segments were joined into
    pub chains: usize,
    /// Overlap links made across all passes
    pub links: usize,
    pub tm_stats: TmStatsSnapshot,
}

impl Assembly {
    fn empty() -> Self {
        Assembly {
            sequence: Vec::new(),
            unique_segments: 0,
            chains: 0,
            links: 0,
            tm_stats: TmStatsSnapshot::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}

/// Parallel overlap assembler.
///
/// # Examples
///
/// ```
/// use gasm_core::{Assembler, AssemblerConfig};
///
/// let assembler = Assembler::new(AssemblerConfig {
///     num_threads: 2,
///     ..Default::default()
/// });
/// let segments = ["tcgg", "gatc", "ggca", "cagc", "gcag", "atcg", "cggc"];
/// let assembly = assembler.assemble(&segments, 10).unwrap();
/// assert_eq!(assembly.sequence, b"gatcggcagc");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Assembler {
    config: AssemblerConfig,
}

impl Assembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Assembler { config }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Assemble `segments` sampled from a gene of `gene_length` symbols,
    /// using a [`HybridTm`] built from the configuration.
    pub fn assemble<S>(&self, segments: &[S], gene_length: usize) -> Result<Assembly>
    where
        S: AsRef<[u8]> + Sync,
    {
        let tm = HybridTm::new(self.config.tm);
        self.assemble_with(&tm, segments, gene_length)
    }

    /// Assemble with a caller-provided transaction manager.
    pub fn assemble_with<S, M>(&self, tm: &M, segments: &[S], gene_length: usize) -> Result<Assembly>
    where
        S: AsRef<[u8]> + Sync,
        M: Transaction,
    {
        let Some(first) = segments.first() else {
            return Ok(Assembly::empty());
        };
        let segment_length = first.as_ref().len();
        if segment_length == 0 {
            return Err(AssemblyError::InvalidInput(
                "segments must not be empty".to_string(),
            ));
        }
        if let Some((index, segment)) = segments
            .iter()
            .enumerate()
            .find(|(_, segment)| segment.as_ref().len() != segment_length)
        {
            return Err(AssemblyError::InvalidInput(format!(
                "segment {index} has length {}, expected {segment_length}",
                segment.as_ref().len()
            )));
        }
        if gene_length < segment_length {
            return Err(AssemblyError::InvalidInput(format!(
                "gene length {gene_length} is shorter than the segment length {segment_length}"
            )));
        }

        let max_unique = gene_length - segment_length + 1;
        let num_buckets = self.config.bucket_count.unwrap_or(max_unique).max(1);
        let num_threads = self.config.num_threads.max(1);

        let started = Instant::now();
        let shared = SharedAssemblyState::new(
            segments,
            segment_length,
            max_unique,
            num_buckets,
            num_threads,
            self.config.dedup_chunk,
            self.config.probe_window,
            tm,
        )?;
        run_workers(&phase_plan(segment_length), &shared)?;

        let assembled = shared.output.lock().take().ok_or_else(|| {
            AssemblyError::invariant("finalize phase produced no sequence")
        })?;
        let assembly = Assembly {
            sequence: assembled.sequence,
            unique_segments: shared.num_unique(),
            chains: assembled.chains,
            links: shared.links.load(std::sync::atomic::Ordering::Relaxed),
            tm_stats: tm.stats(),
        };

        tracing::info!(
            segments = segments.len(),
            unique = assembly.unique_segments,
            chains = assembly.chains,
            length = assembly.len(),
            threads = num_threads,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "assembly complete"
        );
        tracing::debug!(
            commits = assembly.tm_stats.commits(),
            aborts = assembly.tm_stats.aborts(),
            fast_commits = assembly.tm_stats.fast_commits,
            software_commits = assembly.tm_stats.software_commits,
            serial_commits = assembly.tm_stats.serial_commits,
            "transaction statistics"
        );
        Ok(assembly)
    }
}
