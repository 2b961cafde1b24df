//! Per-file pipeline: stage a copy, patch it, then move it into place.
//!
//! A file is only ever visible under its final name once it is complete.
//! Everything before the rename happens on a hidden temporary next to the
//! destination, so a crash leaves at most a stale temporary behind.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Timelike};
use filetime::FileTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{FailureReason, ProcessFailure};
use crate::media::{MediaFile, MediaKind};
use crate::patcher::MetadataPatcher;

pub const IMAGES_DIR: &str = "IMAGES";
pub const ERRORS_DIR: &str = "ERRORS";
/// Marks in-progress temporaries; always inside a dot-prefixed name.
pub const TEMP_MARKER: &str = ".icph-tmp";
pub const REASON_SUFFIX: &str = ".reason.txt";

/// Where things go under the output root.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    pub fn errors_dir(&self) -> PathBuf {
        self.root.join(ERRORS_DIR)
    }

    pub fn image_path(&self, file: &MediaFile) -> PathBuf {
        self.images_dir().join(file.relative_path())
    }

    pub fn error_path(&self, file: &MediaFile) -> PathBuf {
        self.errors_dir().join(file.relative_path())
    }

    pub fn reason_path(&self, file: &MediaFile) -> PathBuf {
        let mut name = file.filename.clone();
        name.push_str(REASON_SUFFIX);
        self.error_path(file).with_file_name(name)
    }
}

/// Hidden temporary for `dest`: `IMG_0001.JPG` becomes `.IMG_0001.icph-tmp.JPG`.
/// The extension is kept so format detection still works on the temporary.
pub fn temp_path(dest: &Path) -> PathBuf {
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match dest.extension() {
        Some(ext) => format!(".{}{}.{}", stem, TEMP_MARKER, ext.to_string_lossy()),
        None => format!(".{}{}", stem, TEMP_MARKER),
    };
    dest.with_file_name(name)
}

/// Names ending in the reason-note suffix would land on another file's note.
pub fn is_reserved_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(REASON_SUFFIX)
}

pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

/// fsync a directory so a rename inside it is durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove file"),
    }
}

/// Bounded retry with exponential backoff for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn run<T>(
        &self,
        step: &str,
        mut op: impl FnMut() -> Result<T, ProcessFailure>,
    ) -> Result<T, ProcessFailure> {
        let attempts = self.attempts.max(1);
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(failure) if failure.transient && attempt < attempts => {
                    debug!(step, attempt, error = %failure, "transient failure, retrying");
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(failure) => return Err(failure),
            }
        }
    }
}

/// Copy `src` to a new file at `dest` and fsync it.
fn copy_durable(src: &Path, dest: &Path, expected_size: u64) -> Result<(), ProcessFailure> {
    let mut input = File::open(src).map_err(|e| ProcessFailure::copy("open source", &e))?;
    let mut output =
        File::create(dest).map_err(|e| ProcessFailure::copy("create temporary file", &e))?;
    let copied = io::copy(&mut input, &mut output)
        .map_err(|e| ProcessFailure::copy("copy to temporary file", &e))?;
    output
        .sync_all()
        .map_err(|e| ProcessFailure::copy("sync temporary file", &e))?;
    if copied != expected_size {
        return Err(ProcessFailure::new(
            FailureReason::CopyFailure,
            format!("copied {} bytes but source had {} when scanned", copied, expected_size),
        ));
    }
    Ok(())
}

fn create_parent(dest: &Path) -> Result<&Path, ProcessFailure> {
    let dir = dest.parent().ok_or_else(|| {
        ProcessFailure::new(FailureReason::CopyFailure, "destination has no parent directory")
    })?;
    fs::create_dir_all(dir).map_err(|e| ProcessFailure::copy("create directory", &e))?;
    Ok(dir)
}

/// fsync the finished temporary, rename it over `dest` and fsync the directory.
fn commit(temp: &Path, dest: &Path, dir: &Path) -> Result<(), ProcessFailure> {
    File::open(temp)
        .and_then(|f| f.sync_all())
        .map_err(|e| ProcessFailure::copy("sync temporary file", &e))?;
    fs::rename(temp, dest).map_err(|e| ProcessFailure::copy("rename into place", &e))?;
    sync_dir(dir).map_err(|e| ProcessFailure::copy("sync directory", &e))
}

/// Runs the per-file pipeline against one output layout.
pub struct Processor<'a> {
    layout: OutputLayout,
    patcher: &'a dyn MetadataPatcher,
    retry: RetryPolicy,
    verify: bool,
    set_mtime: bool,
}

impl<'a> Processor<'a> {
    pub fn new(layout: OutputLayout, patcher: &'a dyn MetadataPatcher, retry: RetryPolicy) -> Self {
        Self {
            layout,
            patcher,
            retry,
            verify: false,
            set_mtime: false,
        }
    }

    /// Read the capture time back from images after patching.
    pub fn verify(mut self, enabled: bool) -> Self {
        self.verify = enabled;
        self
    }

    /// Set the modification time of placed files to the capture instant.
    pub fn set_mtime(mut self, enabled: bool) -> Self {
        self.set_mtime = enabled;
        self
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Place a patched copy of `file` in the success tree.
    ///
    /// On success the file exists under its final name and nothing of it is
    /// left in the error tree. On failure no temporary and no final file
    /// remain in the success tree.
    pub fn process(
        &self,
        file: &MediaFile,
        captured: DateTime<FixedOffset>,
    ) -> Result<PathBuf, ProcessFailure> {
        if file.kind == MediaKind::Other {
            return Err(ProcessFailure::new(
                FailureReason::UnsupportedKind,
                format!("{} is neither an image nor a video", file.filename),
            ));
        }

        let dest = self.layout.image_path(file);
        let temp = temp_path(&dest);
        if let Err(failure) = self.stage_and_commit(file, captured, &dest, &temp) {
            remove_quietly(&temp);
            return Err(failure);
        }

        remove_quietly(&self.layout.error_path(file));
        remove_quietly(&self.layout.reason_path(file));
        debug!(key = %file.key, dest = %dest.display(), "placed");
        Ok(dest)
    }

    fn stage_and_commit(
        &self,
        file: &MediaFile,
        captured: DateTime<FixedOffset>,
        dest: &Path,
        temp: &Path,
    ) -> Result<(), ProcessFailure> {
        let dir = self.retry.run("create directory", || create_parent(dest))?;
        self.retry
            .run("copy", || copy_durable(&file.path, temp, file.size))?;
        self.retry.run("patch", || {
            self.patcher
                .patch(temp, file.kind, captured)
                .map_err(|e| ProcessFailure {
                    reason: FailureReason::PatchFailure,
                    transient: e.transient,
                    detail: e.message,
                })
        })?;

        if self.verify {
            self.check_written(file.kind, temp, captured)?;
        }
        if self.set_mtime {
            let mtime = FileTime::from_unix_time(captured.timestamp(), 0);
            filetime::set_file_mtime(temp, mtime)
                .map_err(|e| ProcessFailure::copy("set modification time", &e))?;
        }

        self.retry.run("rename", || commit(temp, dest, dir))
    }

    /// Compare the embedded wall-clock time with the target, to the second.
    fn check_written(
        &self,
        kind: MediaKind,
        temp: &Path,
        captured: DateTime<FixedOffset>,
    ) -> Result<(), ProcessFailure> {
        let found = self.patcher.read_capture_time(temp, kind).map_err(|e| {
            ProcessFailure::new(FailureReason::VerifyMismatch, format!("read back: {}", e))
        })?;
        let expected = captured.naive_local().with_nanosecond(0);
        match found {
            None if kind == MediaKind::Image => Err(ProcessFailure::new(
                FailureReason::VerifyMismatch,
                "no capture time found after patching",
            )),
            None => Ok(()),
            Some(found) if found.with_nanosecond(0) == expected => Ok(()),
            Some(found) => Err(ProcessFailure::new(
                FailureReason::VerifyMismatch,
                format!("expected {}, file has {}", captured.naive_local(), found),
            )),
        }
    }

    /// Copy the untouched original into the error tree with a reason note.
    pub fn quarantine(
        &self,
        file: &MediaFile,
        failure: &ProcessFailure,
        captured: Option<DateTime<FixedOffset>>,
    ) -> Result<PathBuf, ProcessFailure> {
        remove_quietly(&self.layout.image_path(file));
        if is_reserved_name(&file.filename) {
            return Err(ProcessFailure::new(
                FailureReason::UnsupportedKind,
                format!(
                    "not copied: names ending in {} are kept for failure notes",
                    REASON_SUFFIX
                ),
            ));
        }

        let dest = self.layout.error_path(file);
        let temp = temp_path(&dest);
        let placed = self.retry.run("quarantine", || {
            let dir = create_parent(&dest)?;
            copy_durable(&file.path, &temp, file.size)?;
            commit(&temp, &dest, dir)
        });
        if let Err(err) = placed {
            remove_quietly(&temp);
            return Err(err);
        }

        self.write_reason(file, failure, captured)?;
        debug!(key = %file.key, reason = %failure.reason, "quarantined");
        Ok(dest)
    }

    fn write_reason(
        &self,
        file: &MediaFile,
        failure: &ProcessFailure,
        captured: Option<DateTime<FixedOffset>>,
    ) -> Result<(), ProcessFailure> {
        let mut note = format!(
            "key: {}\nsource: {}\nreason: {}\ndetail: {}\n",
            file.key,
            file.path.display(),
            failure.reason,
            failure.detail
        );
        if let Some(ts) = captured {
            note.push_str(&format!("timestamp: {}\n", ts.to_rfc3339()));
        }
        let path = self.layout.reason_path(file);
        File::create(&path)
            .and_then(|mut f| {
                f.write_all(note.as_bytes())?;
                f.sync_all()
            })
            .map_err(|e| ProcessFailure::copy("write reason note", &e))
    }

    /// Remove temporaries left behind by an interrupted run. Returns how many
    /// were removed.
    pub fn cleanup_stale_temps(&self) -> usize {
        let mut removed = 0;
        for tree in [self.layout.images_dir(), self.layout.errors_dir()] {
            if !tree.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&tree).into_iter().filter_map(|e| e.ok()) {
                let is_temp = entry.file_type().is_file()
                    && entry.file_name().to_str().is_some_and(is_temp_name);
                if !is_temp {
                    continue;
                }
                match fs::remove_file(entry.path()) {
                    Ok(()) => {
                        debug!(path = %entry.path().display(), "removed stale temporary");
                        removed += 1;
                    }
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "could not remove stale temporary")
                    }
                }
            }
        }
        removed
    }
}
