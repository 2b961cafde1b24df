use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand};
use icph_core::processor::ERRORS_DIR;
use icph_core::{CancellationToken, ProcessControl, ProcessOptions, ProcessResult, RunMode};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "icph",
    version,
    about = "iCloud Photos export helper - restore capture dates from the export's CSV/JSON sidecars"
)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process the export from scratch, discarding any previous ledger
    Start(RunArgs),
    /// Continue an interrupted run; files already done are skipped
    Resume(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Export folders, e.g. "iCloud Photos Part 1 of 3"
    inputs: Vec<PathBuf>,

    /// Use every folder in DIR whose name contains "iCloud Photos"
    #[arg(long, value_name = "DIR", conflicts_with = "inputs")]
    discover: Option<PathBuf>,

    /// Output directory (IMAGES/, ERRORS/ and the ledger go here)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Read options from a JSON file; command-line values win
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Files processed in parallel
    #[arg(short, long)]
    workers: Option<usize>,

    /// Path to the exiftool binary
    #[arg(long, value_name = "PATH")]
    exiftool: Option<PathBuf>,

    /// Keep exiftool running between files (-stay_open)
    #[arg(long)]
    stay_open: bool,

    /// Attempts per step for transient failures
    #[arg(long)]
    retries: Option<u32>,

    /// Read the timestamp back from each image after writing it
    #[arg(long)]
    verify: bool,

    /// Set file modification times to the capture time
    #[arg(long)]
    set_mtime: bool,
}

impl RunArgs {
    fn into_options(self) -> anyhow::Result<ProcessOptions> {
        let mut options = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str::<ProcessOptions>(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => ProcessOptions::new(Vec::new(), PathBuf::new()),
        };

        if let Some(dir) = &self.discover {
            options.inputs = icph_core::scan::discover_inputs(dir)?;
        } else if !self.inputs.is_empty() {
            options.inputs = self.inputs;
        }
        if let Some(output) = self.output {
            options.output = output;
        }
        if let Some(workers) = self.workers {
            options.workers = workers.max(1);
        }
        if let Some(exiftool) = self.exiftool {
            options.exiftool = exiftool;
        }
        if let Some(retries) = self.retries {
            options.retries = retries;
        }
        options.stay_open |= self.stay_open;
        options.verify |= self.verify;
        options.set_mtime |= self.set_mtime;

        if options.inputs.is_empty() {
            bail!("no input folders: pass them as arguments, with --discover, or in --config");
        }
        if options.output.as_os_str().is_empty() {
            bail!("no output folder: pass --output or set it in --config");
        }
        Ok(options)
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_summary(result: &ProcessResult, output: &std::path::Path, started: Instant) {
    eprintln!(
        "Done! {} files: {} patched, {} failed, {} skipped as already done ({:.2}s)",
        result.discovered,
        result.patched,
        result.failed,
        result.skipped_done,
        started.elapsed().as_secs_f64()
    );
    for (reason, count) in &result.failed_by_reason {
        eprintln!("  {:<22} {}", reason, count);
    }
    eprintln!(
        "Records: {} read, {} malformed, {} not used by any file",
        result.records, result.malformed_records, result.unmatched_records
    );
    if result.duplicate_names > 0 {
        eprintln!(
            "{} file name(s) appear in more than one folder, see DUPLICATES.csv",
            result.duplicate_names
        );
    }
    if result.failed > 0 || result.unmatched_records > 0 {
        eprintln!("Reports: {}", output.join(ERRORS_DIR).display());
    }
}

/// Progress bar plus a callback that drives it from the worker threads.
fn progress_bar() -> anyhow::Result<(ProgressBar, impl Fn(&str, u64, u64, &str) + Send + Sync)> {
    let pb = ProgressBar::new(0);
    pb.set_style(ProgressStyle::default_bar().template("[{bar:40}] {pos}/{len} {prefix} {wide_msg}")?);
    let bar = pb.clone();
    let on_progress = move |stage: &str, current: u64, total: u64, message: &str| {
        bar.set_prefix(stage.to_string());
        bar.set_length(total);
        bar.set_position((current + 1).min(total));
        bar.set_message(message.to_string());
    };
    Ok((pb, on_progress))
}

fn execute(cli: Cli) -> anyhow::Result<()> {
    let started = Instant::now();
    let (mode, args) = match cli.command {
        Command::Start(args) => (RunMode::Start, args),
        Command::Resume(args) => (RunMode::Resume, args),
    };
    let options = args.into_options()?;

    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, finishing files in flight...");
        handler_token.cancel();
    })
    .context("installing Ctrl-C handler")?;

    let (pb, on_progress) = progress_bar()?;

    let control = ProcessControl::new()
        .with_mode(mode)
        .with_cancel_token(token);
    let result = icph_core::process(&options, &control, &on_progress);
    pb.finish_and_clear();

    let result = result?;
    print_summary(&result, &options.output, started);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(icph_core::Error::Cancelled) = err.downcast_ref::<icph_core::Error>() {
                eprintln!("Cancelled. Run `icph resume` with the same folders to continue.");
                return ExitCode::from(130);
            }
            eprintln!("Error: {:#}", err);
            ExitCode::from(1)
        }
    }
}
