// Benchmark driver
// Generate -> shuffle -> assemble -> verify, with timings and digests

use std::time::Instant;

use ahash::AHashSet;
use anyhow::{bail, Result};
use gasm_common::gasm_version;
use gasm_core::{
    distinct_windows, has_unique_overlaps, random_gene, sample_segments, shuffle_segments,
    Assembler, AssemblerConfig, Segment,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sha2::{Digest, Sha256};

use crate::GeneArgs;

fn distinct_segments(segments: &[Segment]) -> usize {
    segments.iter().collect::<AHashSet<_>>().len()
}

fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn run(args: &GeneArgs, config: &AssemblerConfig) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(args.seed);

    let started = Instant::now();
    let gene = random_gene(args.gene_length, &mut rng);
    let segments = sample_segments(&gene, args.segment_length, args.min_segments, &mut rng)?;
    let segments = shuffle_segments(segments, &mut rng)?;
    let generate_time = started.elapsed();

    println!("{}", gasm_version());
    println!("Gene length     = {}", gene.len());
    println!("Segment length  = {}", args.segment_length);
    println!("Number segments = {}", segments.len());
    println!("Threads         = {}", config.num_threads);
    println!("TM mode         = {}", config.tm.mode);
    println!("Generated in    = {:.6} s", generate_time.as_secs_f64());

    let started = Instant::now();
    let assembly = Assembler::new(config.clone()).assemble(&segments, gene.len())?;
    let assemble_time = started.elapsed();

    println!("Unique segments = {}", assembly.unique_segments);
    println!("Chains          = {}", assembly.chains);
    println!("Sequence length = {}", assembly.len());
    println!("Assembled in    = {:.6} s", assemble_time.as_secs_f64());
    println!(
        "TM commits      = {} (fast {}, software {}, serial {})",
        assembly.tm_stats.commits(),
        assembly.tm_stats.fast_commits,
        assembly.tm_stats.software_commits,
        assembly.tm_stats.serial_commits
    );
    println!("TM aborts       = {}", assembly.tm_stats.aborts());
    println!("Gene digest     = {}", digest(&gene));
    println!("Output digest   = {}", digest(&assembly.sequence));

    let complete = distinct_segments(&segments) == distinct_windows(&gene, args.segment_length);
    if complete && has_unique_overlaps(&gene, args.segment_length) {
        if assembly.sequence != gene {
            bail!("assembled sequence does not match the generated gene");
        }
        println!("Verification    = passed");
    } else {
        println!("Verification    = skipped (sample admits more than one reconstruction)");
    }
    Ok(())
}
