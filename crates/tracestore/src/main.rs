//! Command-line front end for tracestore.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracestore::store::{Compression, StoreConfig, SyncMode, DEFAULT_GZIP_LEVEL};
use tracestore::{ingest, IngestConfig, MalformedPolicy, StoreReader};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Ingest packet-trace JSON lines into a columnar store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read input files in parallel and write a new store
    Ingest(IngestArgs),
    /// Print a store's summary and its first rows as JSON lines
    Inspect(InspectArgs),
}

#[derive(clap::Args, Debug)]
struct IngestArgs {
    /// Store file to create (overwritten if it exists)
    store: PathBuf,

    /// Newline-delimited JSON inputs, one reader thread each (.gz accepted)
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Records per chunk
    #[arg(long, default_value_t = tracestore::ingest::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Chunks buffered between readers and the writer
    #[arg(long, default_value_t = tracestore::ingest::DEFAULT_QUEUE_SIZE)]
    queue_size: usize,

    /// Gzip level for dataset blocks
    #[arg(long, default_value_t = DEFAULT_GZIP_LEVEL, value_parser = clap::value_parser!(u32).range(0..=9))]
    compression_level: u32,

    /// Store dataset blocks uncompressed
    #[arg(long, conflicts_with = "compression_level")]
    no_compression: bool,

    /// What to do with a line that is not a valid trace
    #[arg(long, value_enum, default_value_t = OnMalformed::Abort)]
    on_malformed: OnMalformed,

    /// Fail if no reader makes progress for this many seconds
    #[arg(long)]
    stall_timeout: Option<u64>,

    /// Durability of each committed chunk
    #[arg(long, value_enum, default_value_t = SyncArg::None)]
    sync: SyncArg,
}

#[derive(clap::Args, Debug)]
struct InspectArgs {
    /// Store file to read
    store: PathBuf,

    /// Rows to print
    #[arg(long, default_value_t = 0)]
    rows: usize,

    /// Checksum and decode every block
    #[arg(long)]
    verify: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OnMalformed {
    Abort,
    Skip,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SyncArg {
    Fsync,
    Fdatasync,
    None,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Ingest(args) => run_ingest(args),
        Command::Inspect(args) => run_inspect(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_ingest(args: IngestArgs) -> Result<()> {
    let compression = if args.no_compression {
        Compression::None
    } else {
        Compression::Gzip(args.compression_level)
    };
    let sync_mode = match args.sync {
        SyncArg::Fsync => SyncMode::Fsync,
        SyncArg::Fdatasync => SyncMode::Fdatasync,
        SyncArg::None => SyncMode::None,
    };
    let policy = match args.on_malformed {
        OnMalformed::Abort => MalformedPolicy::Abort,
        OnMalformed::Skip => MalformedPolicy::Skip,
    };

    let mut config = IngestConfig::new(&args.store, args.inputs)
        .with_chunk_size(args.chunk_size)
        .with_queue_size(args.queue_size)
        .with_malformed_policy(policy)
        .with_store_config(
            StoreConfig::default()
                .with_compression(compression)
                .with_sync_mode(sync_mode),
        );
    if let Some(seconds) = args.stall_timeout {
        config = config.with_stall_timeout(Duration::from_secs(seconds));
    }

    let report = ingest(&config)
        .with_context(|| format!("ingestion into {} failed", args.store.display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(
        out,
        "{}: {} rows, {} chunks, {} bytes, {} skipped, {:.2}s",
        report.store.path.display(),
        report.rows,
        report.chunks,
        report.store.bytes,
        report.skipped(),
        report.elapsed.as_secs_f64()
    )?;
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let store = StoreReader::open(&args.store)
        .with_context(|| format!("cannot open store {}", args.store.display()))?;

    if args.verify {
        store
            .verify()
            .with_context(|| format!("store {} failed verification", args.store.display()))?;
    }

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let header = store.header();
    writeln!(
        out,
        "{}: status {}, {} rows, {} chunks, compression {:?}, label widths {}/{}/{}",
        store.path().display(),
        store.status(),
        store.len(),
        store.chunk_count(),
        header.compression,
        header.label_layout.url,
        header.label_layout.protocol,
        header.label_layout.region
    )?;
    if args.verify {
        writeln!(out, "verified")?;
    }

    if args.rows > 0 {
        for row in store.read_rows()?.iter().take(args.rows) {
            serde_json::to_writer(&mut out, row)?;
            writeln!(out)?;
        }
    }
    out.flush()?;
    Ok(())
}
