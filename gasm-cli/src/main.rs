// gasm CLI
// Generate segment files, assemble them, and benchmark the assembler end to end

mod bench;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use gasm_common::{gasm_version, TmMode};
use gasm_core::{
    read_segments, sample_segments, shuffle_segments, write_fasta, write_segments, Assembler,
    AssemblerConfig, FASTA_LINE_WIDTH,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gasm")]
#[command(version, about = "Parallel gene assembler over transactional memory", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Gene and sampling parameters
#[derive(Args, Debug, Clone)]
struct GeneArgs {
    /// Length of the random gene
    #[arg(short = 'g', long, default_value_t = 256)]
    gene_length: usize,

    /// Length of every segment
    #[arg(short = 's', long, default_value_t = 16)]
    segment_length: usize,

    /// Random segments drawn before coverage holes are filled
    #[arg(short = 'n', long, default_value_t = 16384)]
    min_segments: usize,

    /// RNG seed
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

/// Assembler tuning
#[derive(Args, Debug, Clone)]
struct AssemblerArgs {
    /// Worker threads (default: all cores)
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Transaction mode: hybrid, software or serial
    #[arg(long)]
    tm_mode: Option<TmMode>,

    /// Segments inserted per dedup transaction
    #[arg(long)]
    dedup_chunk: Option<usize>,

    /// Buckets per hash table (default: one per possible unique segment)
    #[arg(long)]
    buckets: Option<usize>,
}

impl AssemblerArgs {
    /// Defaults, then `GASM_*` environment overrides, then flags.
    fn config(&self) -> AssemblerConfig {
        let mut config = AssemblerConfig::default().with_env_overrides();
        if let Some(threads) = self.threads {
            config.num_threads = threads;
        }
        if let Some(mode) = self.tm_mode {
            config.tm.mode = mode;
        }
        if let Some(chunk) = self.dedup_chunk {
            config.dedup_chunk = chunk;
        }
        if self.buckets.is_some() {
            config.bucket_count = self.buckets;
        }
        config
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a gene, sample and shuffle segments, assemble and verify
    Bench {
        #[command(flatten)]
        gene: GeneArgs,

        #[command(flatten)]
        assembler: AssemblerArgs,
    },

    /// Write a shuffled segment sample of a random gene
    Generate {
        #[command(flatten)]
        gene: GeneArgs,

        /// Output segment file (default: stdout)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Also write the generated gene as FASTA
        #[arg(long)]
        gene_output: Option<PathBuf>,
    },

    /// Assemble a segment file into a FASTA sequence
    Assemble {
        /// Segment file, one segment per line (plain or gzip)
        input: PathBuf,

        /// Length of the gene the segments were sampled from
        #[arg(short = 'g', long)]
        gene_length: usize,

        #[command(flatten)]
        assembler: AssemblerArgs,

        /// Output FASTA file (default: stdout)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// FASTA record name
        #[arg(long, default_value = "assembled")]
        name: String,

        /// FASTA line width
        #[arg(long, default_value_t = FASTA_LINE_WIDTH)]
        line_width: usize,
    },
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbosity);
    tracing::debug!("{}", gasm_version());

    match cli.command {
        Commands::Bench { gene, assembler } => bench::run(&gene, &assembler.config())?,

        Commands::Generate {
            gene,
            output,
            gene_output,
        } => generate_command(&gene, output.as_deref(), gene_output.as_deref())?,

        Commands::Assemble {
            input,
            gene_length,
            assembler,
            output,
            name,
            line_width,
        } => assemble_command(
            &input,
            gene_length,
            &assembler.config(),
            output.as_deref(),
            &name,
            line_width,
        )?,
    }

    Ok(())
}

/// File at `path`, or stdout when no path is given.
fn create_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    let writer: Box<dyn Write> = match path {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    Ok(writer)
}

fn generate_command(
    args: &GeneArgs,
    output: Option<&Path>,
    gene_output: Option<&Path>,
) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let gene = gasm_core::random_gene(args.gene_length, &mut rng);
    let segments = sample_segments(&gene, args.segment_length, args.min_segments, &mut rng)?;
    let segments = shuffle_segments(segments, &mut rng)?;

    write_segments(create_output(output)?, &segments)?;
    if let Some(path) = gene_output {
        write_fasta(create_output(Some(path))?, "gene", &gene, FASTA_LINE_WIDTH)?;
    }

    tracing::info!(
        gene_length = gene.len(),
        segments = segments.len(),
        seed = args.seed,
        "generated segments"
    );
    Ok(())
}

fn assemble_command(
    input: &Path,
    gene_length: usize,
    config: &AssemblerConfig,
    output: Option<&Path>,
    name: &str,
    line_width: usize,
) -> Result<()> {
    let segments = read_segments(input)?;
    tracing::info!(segments = segments.len(), input = %input.display(), "read segments");

    let assembly = Assembler::new(config.clone())
        .assemble(&segments, gene_length)
        .with_context(|| format!("failed to assemble {}", input.display()))?;
    if assembly.chains > 1 {
        tracing::warn!(
            chains = assembly.chains,
            "segments did not join into a single chain"
        );
    }

    write_fasta(create_output(output)?, name, &assembly.sequence, line_width)
}
