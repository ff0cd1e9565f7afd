// kbit CLI
// generate / query / stream over sharded k-mer bitmap sets

use std::io::{self, BufRead, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use kbit_common::{decode_kmer, KbitError};
use kbit_core::{GeneratorConfig, QueryConfig, StreamConfig};

#[derive(Parser, Debug)]
#[command(name = "kbit")]
#[command(version, about = "Sharded k-mer bitmap toolkit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a dense 4^k-bit vector with an exact target population
    Generate {
        /// K-mer length (1..=31)
        #[arg(long)]
        k: u8,

        /// Population as a percentage of 4^k (0..=100)
        #[arg(long)]
        percent: f64,

        /// Output file path
        #[arg(long)]
        out: PathBuf,

        /// Sampling seed (drawn from entropy when omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// I/O buffer size in bytes
        #[arg(long = "buf", default_value_t = 64 << 20)]
        buf_bytes: usize,

        /// Progress line interval in MiB written
        #[arg(long = "status-step-mib", default_value_t = 128)]
        status_step_mib: u64,
    },

    /// Check k-mer membership against a shard set
    Query {
        /// Shard directory containing index.json
        #[arg(long)]
        shards: PathBuf,

        /// Hard-require this k (must match the index)
        #[arg(long)]
        k: Option<u8>,

        /// File of k-mers, one per line (default: stdin)
        #[arg(long)]
        kmers: Option<PathBuf>,

        /// Output file (default: stdout)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Worker threads
        #[arg(long, default_value_t = 4)]
        threads: usize,
    },

    /// Stream k-mers absent from a shard set, paginated via a cursor
    Stream {
        /// Shard directory containing index.json
        #[arg(long)]
        shards: PathBuf,

        /// Per-shard GC histogram JSON (enables shard skipping)
        #[arg(long = "gc-hist")]
        gc_hist: Option<PathBuf>,

        /// Output length; above the base k, flanking bases are appended
        #[arg(long = "construct_k")]
        construct_k: Option<u8>,

        /// Only emit k-mers containing this substring
        #[arg(long)]
        substring: Option<String>,

        /// Also match the substring's reverse complement
        #[arg(long = "reverse_complement")]
        reverse_complement: bool,

        /// Minimum GC percentage
        #[arg(long = "gc-min", default_value_t = 0)]
        gc_min: u8,

        /// Maximum GC percentage
        #[arg(long = "gc-max", default_value_t = 100)]
        gc_max: u8,

        /// Page size
        #[arg(long, default_value_t = 200)]
        limit: u64,

        /// Refill threads
        #[arg(long, default_value_t = 4)]
        threads: usize,

        /// Number of shards open concurrently
        #[arg(long, default_value_t = 16)]
        window: u16,

        /// Ids drawn per lane per round-robin visit
        #[arg(long, default_value_t = 1)]
        burst: u16,

        /// Resume cursor from a previous page
        #[arg(long)]
        cursor: Option<String>,

        /// Randomize the shard schedule
        #[arg(long = "random_access")]
        random_access: bool,

        /// Permutation seed for --random_access
        #[arg(long = "ra_seed")]
        ra_seed: Option<u64>,

        /// Ids produced per lane refill
        #[arg(long = "refill_chunk", default_value_t = 256)]
        refill_chunk: u32,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// 1 = argument or input error, 2 = index/shard error, 3 = bad k-mer input.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<KbitError>() {
        Some(KbitError::InvalidBase(_)) | Some(KbitError::LengthMismatch { .. }) => 3,
        Some(KbitError::BadCursor)
        | Some(KbitError::CursorMismatch(_))
        | Some(KbitError::UnsupportedExpansion(_)) => 1,
        Some(_) => 2,
        None => 1,
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Generate {
            k,
            percent,
            out,
            seed,
            buf_bytes,
            status_step_mib,
        } => generate_command(k, percent, out, seed, buf_bytes, status_step_mib),

        Commands::Query {
            shards,
            k,
            kmers,
            out,
            threads,
        } => query_command(shards, k, kmers, out, threads),

        Commands::Stream {
            shards,
            gc_hist,
            construct_k,
            substring,
            reverse_complement,
            gc_min,
            gc_max,
            limit,
            threads,
            window,
            burst,
            cursor,
            random_access,
            ra_seed,
            refill_chunk,
        } => {
            if gc_min > 100 || gc_max > 100 || gc_min > gc_max {
                bail!("GC range must satisfy 0 <= gc-min <= gc-max <= 100");
            }
            if limit < 1 {
                bail!("--limit must be at least 1");
            }
            let config = StreamConfig {
                shards_dir: shards,
                gc_hist_path: gc_hist,
                construct_k,
                substring,
                reverse_complement,
                gc_min,
                gc_max,
                limit,
                threads: threads.max(1),
                window: window.max(1),
                burst: burst.max(1),
                cursor,
                random_access,
                ra_seed,
                refill_chunk: refill_chunk.max(16),
            };
            stream_command(&config)
        }
    }
}

fn generate_command(
    k: u8,
    percent: f64,
    out: PathBuf,
    seed: Option<u64>,
    buf_bytes: usize,
    status_step_mib: u64,
) -> Result<()> {
    if !(1..=31).contains(&k) {
        bail!("--k must be in [1, 31]");
    }
    if !(0.0..=100.0).contains(&percent) {
        bail!("--percent must be in [0, 100]");
    }

    let report = kbit_core::generate(&GeneratorConfig {
        k,
        percent,
        out,
        seed,
        buf_bytes,
        status_step_mib,
    })?;

    tracing::info!(
        total_bits = report.total_bits,
        ones = report.ones,
        payload_len = report.payload_len,
        seed = report.seed,
        "bitmap generated"
    );
    Ok(())
}

fn query_command(
    shards: PathBuf,
    k: Option<u8>,
    kmers_path: Option<PathBuf>,
    out: Option<PathBuf>,
    threads: usize,
) -> Result<()> {
    let kmers = read_kmer_lines(kmers_path.as_deref())?;

    let hits = kbit_core::run_point_query(
        &QueryConfig {
            shards_dir: shards,
            k,
            threads: threads.max(1),
        },
        &kmers,
    )?;

    let mut writer = open_output(out.as_deref())?;
    for (kmer, hit) in kmers.iter().zip(&hits) {
        writeln!(writer, "{kmer}\t{}", if *hit { '1' } else { '0' })?;
    }
    writer.flush()?;
    Ok(())
}

fn stream_command(config: &StreamConfig) -> Result<()> {
    let page = kbit_core::run_stream(config)?;

    // The META line carries everything a caller needs to continue paging;
    // nothing is written until the page is complete.
    let stdout = io::stdout().lock();
    let mut writer = BufWriter::new(stdout);
    writeln!(
        writer,
        "__META__\t{}\t{}\t{}\t{}",
        page.cursor.as_deref().unwrap_or(""),
        if page.has_more { 1 } else { 0 },
        page.values.len(),
        page.kout
    )?;
    for &v in &page.values {
        writeln!(writer, "{}", decode_kmer(v, page.kout as usize))?;
    }
    writer.flush()?;
    Ok(())
}

fn read_kmer_lines(path: Option<&std::path::Path>) -> Result<Vec<String>> {
    let reader: Box<dyn BufRead> = match path {
        Some(p) => Box::new(io::BufReader::new(
            std::fs::File::open(p).with_context(|| format!("open {}", p.display()))?,
        )),
        None => Box::new(io::BufReader::new(io::stdin())),
    };

    let mut kmers = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim_end_matches('\r');
        if !trimmed.is_empty() {
            kmers.push(trimmed.to_string());
        }
    }
    Ok(kmers)
}

fn open_output(path: Option<&std::path::Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(p) => Box::new(BufWriter::new(
            std::fs::File::create(p).with_context(|| format!("create {}", p.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    })
}
