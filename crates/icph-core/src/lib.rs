pub mod control;
pub mod error;
pub mod exif;
pub mod ledger;
pub mod matcher;
pub mod media;
pub mod patcher;
pub mod processor;
pub mod report;
pub mod scan;
pub mod sidecar;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::ledger::{Ledger, LedgerStatus, Outcome, LEDGER_FILENAME, LEDGER_VERSION};
use crate::matcher::NameCollisions;
use crate::media::MediaFile;
use crate::processor::{OutputLayout, Processor, RetryPolicy};
use crate::sidecar::SidecarIndex;

pub use control::{CancellationToken, CancelledError};
pub use error::{Error, FailureReason, ProcessFailure, Result};
pub use patcher::{ExifTool, MetadataPatcher, PatchError};

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(4)
}

fn default_exiftool() -> PathBuf {
    PathBuf::from("exiftool")
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOptions {
    /// Export folders to read; their union is the library
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub output: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// ExifTool binary
    #[serde(default = "default_exiftool")]
    pub exiftool: PathBuf,
    /// Keep ExifTool processes running between files
    #[serde(default)]
    pub stay_open: bool,
    /// Attempts per step, including the first
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Read image timestamps back after patching
    #[serde(default)]
    pub verify: bool,
    /// Set output modification times to the capture instant
    #[serde(default)]
    pub set_mtime: bool,
}

impl ProcessOptions {
    pub fn new(inputs: Vec<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            inputs,
            output: output.into(),
            workers: default_workers(),
            exiftool: default_exiftool(),
            stay_open: false,
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            verify: false,
            set_mtime: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Fresh run; any previous ledger is discarded.
    #[default]
    Start,
    /// Continue from the ledger in the output folder.
    Resume,
}

/// Control options for process execution (mode, cancellation).
#[derive(Debug, Clone, Default)]
pub struct ProcessControl {
    pub mode: RunMode,
    /// Cancellation token for pause/cancel support.
    pub cancel_token: Option<CancellationToken>,
}

impl ProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

/// Run summary, also written to `summary.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub mode: RunMode,
    /// Media files found under the inputs
    pub discovered: u64,
    /// Files already Done in the ledger and not touched this run
    pub skipped_done: u64,
    pub matched: u64,
    pub patched: u64,
    pub failed: u64,
    pub failed_by_reason: BTreeMap<FailureReason, u64>,
    pub records: u64,
    pub malformed_records: u64,
    pub unmatched_records: u64,
    pub duplicate_names: u64,
    pub unreadable_entries: u64,
    pub stale_temps_removed: u64,
    pub ledger_done: u64,
    pub ledger_failed: u64,
    pub ledger_pending: u64,
}

/// Type alias for progress callback
pub type ProgressCallback = dyn Fn(&str, u64, u64, &str) + Send + Sync;

/// Throttled progress reporter, emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback,
    last_emit: Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback) -> Self {
        let now = Instant::now();
        Self {
            inner,
            last_emit: Mutex::new(now.checked_sub(Duration::from_secs(1)).unwrap_or(now)),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock().unwrap_or_else(PoisonError::into_inner);
            if last.elapsed().as_millis() < 200 {
                return;
            }
            *last = Instant::now();
        }
        (self.inner)(stage, current, total, message);
    }
}

/// Per-run counters shared by the workers.
#[derive(Default)]
struct Tally {
    matched: AtomicU64,
    patched: AtomicU64,
    finished: AtomicU64,
    failed: Mutex<BTreeMap<FailureReason, u64>>,
}

impl Tally {
    fn fail(&self, reason: FailureReason) {
        *self
            .failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(reason)
            .or_insert(0) += 1;
    }
}

/// Run with the ExifTool patcher described by `options`.
///
/// ExifTool is checked with `-ver` before anything is touched.
pub fn process(
    options: &ProcessOptions,
    control: &ProcessControl,
    progress_callback: &ProgressCallback,
) -> Result<ProcessResult> {
    let tool = ExifTool::new(&options.exiftool).stay_open(options.stay_open);
    let version = tool.version().map_err(|e| Error::ToolUnavailable(e.message))?;
    info!(%version, program = %options.exiftool.display(), "exiftool available");
    run(options, control, &tool, progress_callback)
}

fn open_for_resume(output: &std::path::Path, options_hash: &str) -> Result<Ledger> {
    let path = output.join(LEDGER_FILENAME);
    let ledger = Ledger::open(output)?.ok_or_else(|| Error::LedgerMissing(path.clone()))?;
    if ledger.header().version != LEDGER_VERSION {
        return Err(Error::LedgerIncompatible {
            path,
            why: "unsupported ledger version",
        });
    }
    if ledger.header().options_hash != options_hash {
        return Err(Error::LedgerIncompatible {
            path,
            why: "input folders differ from the original run",
        });
    }
    let recovery = ledger.recovery();
    info!(
        entries = recovery.entries,
        torn_bytes = recovery.torn_bytes,
        corrupt_lines = recovery.corrupt_lines,
        "resuming from ledger"
    );
    Ok(ledger)
}

/// Run the pipeline with any patcher.
pub fn run(
    options: &ProcessOptions,
    control: &ProcessControl,
    patcher: &dyn MetadataPatcher,
    progress_callback: &ProgressCallback,
) -> Result<ProcessResult> {
    let tp = ThrottledProgress::new(progress_callback);
    let token = control.cancel_token.clone().unwrap_or_default();
    token.check()?;

    let roots = scan::resolve_roots(&options.inputs)?;
    if options.output.as_os_str().is_empty() {
        return Err(Error::InvalidInput("no output folder given".into()));
    }
    fs::create_dir_all(&options.output)
        .map_err(|e| Error::io("create output directory", &options.output, e))?;
    let output = fs::canonicalize(&options.output)
        .map_err(|e| Error::io("resolve output directory", &options.output, e))?;
    if let Some(root) = roots.iter().find(|r| r.path == output) {
        return Err(Error::InvalidInput(format!(
            "output folder {} is also an input folder",
            root.path.display()
        )));
    }

    let options_hash = ledger::options_hash(&roots);
    let resumed = match control.mode {
        RunMode::Resume => Some(open_for_resume(&output, &options_hash)?),
        RunMode::Start => None,
    };

    info!(mode = ?control.mode, inputs = roots.len(), output = %output.display(), "run starting");
    let scan = scan::scan_inputs(&roots, &output, &tp)?;
    let index = SidecarIndex::build(&scan.sidecars, &tp)?;
    token.check()?;

    let ledger = match resumed {
        Some(ledger) => ledger,
        None => Ledger::create(&output, &options_hash)?,
    };

    let retry = RetryPolicy {
        attempts: options.retries.max(1),
        backoff: Duration::from_millis(options.retry_backoff_ms),
    };
    let processor = Processor::new(OutputLayout::new(&output), patcher, retry)
        .verify(options.verify)
        .set_mtime(options.set_mtime);
    let stale = processor.cleanup_stale_temps();
    if stale > 0 {
        info!(removed = stale, "removed stale temporaries");
    }

    let pending: Vec<&MediaFile> = scan
        .media
        .iter()
        .filter(|m| ledger.status(&m.key) != LedgerStatus::Done)
        .collect();
    let skipped_done = (scan.media.len() - pending.len()) as u64;
    info!(
        discovered = scan.media.len(),
        skipped = skipped_done,
        todo = pending.len(),
        "processing files"
    );

    let collisions = NameCollisions::build(&scan.media);
    if !collisions.is_empty() {
        info!(names = collisions.len(), "file names shared by several files");
    }

    let work = Work {
        index: &index,
        collisions: &collisions,
        processor: &processor,
        ledger: &ledger,
        token: &token,
        progress: &tp,
    };
    let tally = work.run_all(&pending, options.workers)?;

    let entries = ledger.snapshot();
    let errors_dir = processor.layout().errors_dir();
    report::write_failures(&errors_dir.join(report::FAILURES_CSV), &entries)?;
    let unmatched = report::unmatched_records(&index, &entries);
    report::write_unmatched(&errors_dir.join(report::UNMATCHED_CSV), &unmatched)?;
    let duplicates = report::find_duplicates(&scan.media);
    report::write_duplicates(&errors_dir.join(report::DUPLICATES_CSV), &duplicates)?;

    let failed_by_reason = tally
        .failed
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner);
    let counts = ledger.counts();
    let stats = index.stats();
    let result = ProcessResult {
        mode: control.mode,
        discovered: scan.media.len() as u64,
        skipped_done,
        matched: tally.matched.into_inner(),
        patched: tally.patched.into_inner(),
        failed: failed_by_reason.values().sum(),
        failed_by_reason,
        records: stats.records,
        malformed_records: stats.malformed_records,
        unmatched_records: unmatched.len() as u64,
        duplicate_names: duplicates.len() as u64,
        unreadable_entries: scan.unreadable,
        stale_temps_removed: stale as u64,
        ledger_done: counts.done,
        ledger_failed: counts.failed,
        ledger_pending: counts.pending,
    };
    report::write_summary(&output.join(report::SUMMARY_JSON), &result)?;

    info!(
        patched = result.patched,
        failed = result.failed,
        skipped = result.skipped_done,
        unmatched_records = result.unmatched_records,
        "run complete"
    );
    Ok(result)
}

/// Everything the workers share while processing files.
struct Work<'a> {
    index: &'a SidecarIndex,
    collisions: &'a NameCollisions,
    processor: &'a Processor<'a>,
    ledger: &'a Ledger,
    token: &'a CancellationToken,
    progress: &'a ThrottledProgress<'a>,
}

impl Work<'_> {
    /// Process `files` on `workers` threads. Stops at the first run-level
    /// error; per-file failures only end up in the ledger.
    fn run_all(&self, files: &[&MediaFile], workers: usize) -> Result<Tally> {
        let tally = Tally::default();
        let total = files.len() as u64;
        let handle = |file: &MediaFile| -> Result<()> {
            self.token.check()?;
            self.handle_file(file, &tally)?;
            let finished = tally.finished.fetch_add(1, Ordering::Relaxed);
            self.progress.report("process", finished, total, &file.key);
            Ok(())
        };

        let looped = if workers <= 1 {
            files.iter().try_for_each(|&file| handle(file))
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()?;
            pool.install(|| files.par_iter().try_for_each(|&file| handle(file)))
        };
        if let Err(err) = looped {
            if matches!(err, Error::Cancelled) {
                warn!("run cancelled; resume to continue");
            } else {
                error!(error = %err, "run halted");
            }
            return Err(err);
        }
        Ok(tally)
    }

    /// Pending, then match, then place or quarantine, then the final status.
    fn handle_file(&self, file: &MediaFile, tally: &Tally) -> Result<()> {
        let persist = |outcome: &Outcome| {
            self.ledger
                .record(&file.key, outcome)
                .map_err(|source| Error::LedgerWrite {
                    key: file.key.clone(),
                    source,
                })
        };
        persist(&Outcome::Pending)?;

        let selection = matcher::match_file(file, self.index, self.collisions).selection();
        let (failure, captured) = match selection {
            Ok((record, captured)) => {
                tally.matched.fetch_add(1, Ordering::Relaxed);
                match self.processor.process(file, captured) {
                    Ok(_) => {
                        tally.patched.fetch_add(1, Ordering::Relaxed);
                        return persist(&Outcome::Done {
                            applied: captured,
                            record: record.source.reference(),
                        });
                    }
                    Err(failure) => (failure, Some(captured)),
                }
            }
            Err(failure) => (failure, None),
        };

        let failure = match self.processor.quarantine(file, &failure, captured) {
            Ok(_) => failure,
            Err(extra) => {
                error!(key = %file.key, error = %extra, "could not place file in error tree");
                failure.with_context(&extra)
            }
        };
        warn!(key = %file.key, reason = %failure.reason, detail = %failure.detail, "file failed");
        debug!(key = %file.key, transient = failure.transient, "failure classified");
        tally.fail(failure.reason);
        persist(&Outcome::Failed(failure))
    }
}
