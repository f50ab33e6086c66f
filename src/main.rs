use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parallel_blockzip::{CodecKind, Mode, Pipeline, PipelineConfig};
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod tuner;
mod writer;
use writer::{OutputWriter, PartialOutput};

const ARCHIVE_EXTENSION: &str = "bkz";

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Compress,
    Decompress,
}

impl From<Command> for Mode {
    fn from(command: Command) -> Self {
        match command {
            Command::Compress => Mode::Compress,
            Command::Decompress => Mode::Decompress,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Whether to compress or decompress INPUT
    #[arg(value_enum)]
    command: Command,

    /// Input file
    input: PathBuf,

    /// Output file (defaults to INPUT.bkz, or INPUT without .bkz when decompressing)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Block codec: gzip, zstd, bzip2 or store. Must match when decompressing
    #[arg(short, long, default_value_t = CodecKind::Gzip)]
    codec: CodecKind,

    /// Codec compression level (codec default if omitted)
    #[arg(short, long, allow_negative_numbers = true)]
    level: Option<i32>,

    /// Uncompressed block size, with optional K/M/G suffix
    #[arg(short, long, default_value = "4M", value_parser = tuner::parse_size)]
    block_size: usize,

    /// Worker threads (default = available parallelism)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Spawn extra workers when all are busy
    #[arg(long)]
    grow: bool,

    /// Upper bound on workers when growing
    #[arg(long, requires = "grow")]
    max_workers: Option<usize>,

    /// Maximum blocks buffered at once (default = 2 x jobs)
    #[arg(long, conflicts_with = "memory_limit")]
    max_in_flight: Option<usize>,

    /// Memory budget for buffered blocks, with optional K/M/G suffix
    #[arg(long, value_parser = tuner::parse_size)]
    memory_limit: Option<usize>,

    /// Overwrite the output file if it exists
    #[arg(short, long)]
    force: bool,

    /// Hide the progress bar
    #[arg(short, long)]
    quiet: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let started = Instant::now();
    let result = run(&args);
    if let Err(err) = &result {
        eprintln!("Error: {err:?}");
    }
    println!("RunTime {}", format_run_time(started.elapsed()));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn run(args: &Args) -> Result<()> {
    let mode = Mode::from(args.command);
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.input, mode));
    ensure_distinct(&args.input, &output_path)?;

    let input = File::open(&args.input)
        .with_context(|| format!("Failed to open input file {}", args.input.display()))?;
    let config = pipeline_config(args);
    config.validate().context("Invalid settings")?;

    let output = OutputWriter::create(&output_path, args.force)
        .with_context(|| format!("Failed to create output file {}", output_path.display()))?;
    let partial = PartialOutput::new(output_path.clone());
    debug!(
        input = %args.input.display(),
        output = %output_path.display(),
        codec = %args.codec,
        ?config,
        "starting"
    );

    let pb = progress_bar(args.quiet)?;
    let observer = pb.clone();
    let pipeline = Pipeline::new(config, args.codec.build(args.level)).on_progress(move |p| {
        observer.set_length(p.total);
        observer.set_position(p.completed);
    });

    let outcome = pipeline.execute(mode, input, output);
    pb.finish_and_clear();
    let outcome =
        outcome.with_context(|| format!("Failed to {mode} {}", args.input.display()))?;
    outcome
        .output
        .finish()
        .with_context(|| format!("Failed to write output file {}", output_path.display()))?;
    partial.commit();

    let summary = outcome.summary;
    info!(blocks = summary.blocks, "done");
    println!(
        "{} -> {}: {} -> {} bytes in {} blocks",
        args.input.display(),
        output_path.display(),
        summary.bytes_in,
        summary.bytes_out,
        summary.blocks
    );
    Ok(())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn pipeline_config(args: &Args) -> PipelineConfig {
    let mut config = PipelineConfig::default().block_size(args.block_size);
    if let Some(jobs) = args.jobs {
        config = config.workers(jobs);
    }
    if args.grow {
        config = config.grow_on_demand(args.max_workers);
    }
    if let Some(limit) = args.max_in_flight {
        config = config.max_in_flight(limit);
    }
    if let Some(budget) = args.memory_limit {
        config = config.memory_budget(budget);
    }
    config
}

fn progress_bar(quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(0);
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} blocks ({eta})",
        )
        .context("Invalid progress bar template")?,
    );
    Ok(pb)
}

fn default_output(input: &Path, mode: Mode) -> PathBuf {
    let with_suffix = |suffix: &str| {
        let mut name: OsString = input.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    };
    match mode {
        Mode::Compress => with_suffix(".bkz"),
        Mode::Decompress => {
            if input.extension().is_some_and(|ext| ext == ARCHIVE_EXTENSION) {
                input.with_extension("")
            } else {
                with_suffix(".out")
            }
        }
    }
}

fn ensure_distinct(input: &Path, output: &Path) -> Result<()> {
    let input = fs::canonicalize(input)
        .with_context(|| format!("Failed to open input file {}", input.display()))?;
    if let Ok(output) = fs::canonicalize(output) {
        if input == output {
            bail!("Input and output are the same file: {}", input.display());
        }
    }
    Ok(())
}

/// Formats a duration as `HH:MM:SS.cc`.
fn format_run_time(elapsed: Duration) -> String {
    let centis = elapsed.as_millis() / 10;
    format!(
        "{:02}:{:02}:{:02}.{:02}",
        centis / 360_000,
        centis / 6_000 % 60,
        centis / 100 % 60,
        centis % 100
    )
}
