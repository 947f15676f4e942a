//! Parallel de novo gene assembly from fixed-length overlapping segments.
//!
//! Segments sampled from one gene are deduplicated, indexed by the sdbm hash
//! of every prefix, and joined into chains by repeatedly matching chain tails
//! to chain heads, longest overlap first. A fixed pool of worker threads
//! runs the phases in lockstep. Mutations made while several workers are
//! active go through the transactional memory in [`gasm_common`].
//!
//! # Examples
//!
//! ```
//! use gasm_core::{shuffle_segments, sliding_windows, Assembler, AssemblerConfig};
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! # fn main() -> anyhow::Result<()> {
//! let gene = b"gatcggcagc";
//! let mut rng = StdRng::seed_from_u64(7);
//! let mut segments = sliding_windows(gene, 4)?;
//! segments.extend(sliding_windows(&gene[2..], 4)?);
//! let segments = shuffle_segments(segments, &mut rng)?;
//!
//! let assembler = Assembler::new(AssemblerConfig::default());
//! let assembly = assembler.assemble(&segments, gene.len())?;
//! assert_eq!(assembly.sequence, gene);
//! # Ok(())
//! # }
//! ```
//!
//! When a `(segment_length - 1)`-mer repeats inside the gene the chains are
//! still a valid overlap-consistent arrangement of the unique segments, but
//! not necessarily the original gene.

pub mod arena;
pub mod assembler;
mod env_cache;
pub mod error;
pub mod segment;
pub mod segment_io;
pub mod sequencer;
pub mod task;
pub mod worker;

pub use assembler::{Assembler, AssemblerConfig, Assembly};
pub use error::{AssemblyError, Result};
pub use segment::{
    distinct_windows, has_unique_overlaps, random_gene, sample_segments, shuffle_segments,
    sliding_windows,
};
pub use segment_io::{
    open_segments, read_segments, write_fasta, write_segments, SegmentReader, FASTA_LINE_WIDTH,
};
pub use task::{phase_plan, Phase};

// Re-export common types
pub use gasm_common::{Segment, Sequence, TmConfig, TmMode, TmStatsSnapshot};
