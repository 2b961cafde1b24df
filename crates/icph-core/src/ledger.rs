//! Run ledger: the durable, append-only log of per-file outcomes.
//!
//! The file is JSON Lines. The first line is a header; every later line is
//! one status change. Later lines for a key supersede earlier ones. Each
//! append is fsynced before `record` returns.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{FailureReason, ProcessFailure};
use crate::processor::sync_dir;
use crate::scan::InputRoot;

/// Current ledger format version
pub const LEDGER_VERSION: u32 = 1;

/// Ledger filename, placed in the output root
pub const LEDGER_FILENAME: &str = ".icph-ledger.jsonl";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io failure on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger entry could not be encoded")]
    Encode(#[from] serde_json::Error),
    #[error("ledger {0} does not start with a header line")]
    MissingHeader(PathBuf),
    #[error("ledger {0} refuses appends after a failed write")]
    Closed(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Done,
    Failed,
}

/// Status of a key as seen by readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerStatus {
    Pending,
    Done,
    Failed,
    Unknown,
}

impl From<EntryStatus> for LedgerStatus {
    fn from(s: EntryStatus) -> Self {
        match s {
            EntryStatus::Pending => LedgerStatus::Pending,
            EntryStatus::Done => LedgerStatus::Done,
            EntryStatus::Failed => LedgerStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeader {
    pub version: u32,
    pub created: DateTime<Utc>,
    pub options_hash: String,
}

/// One status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub key: String,
    pub status: EntryStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Timestamp written into the file, for Done entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<DateTime<FixedOffset>>,
    /// Sidecar record the timestamp came from, for Done entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line {
    Header(LedgerHeader),
    Entry(LedgerEntry),
}

/// What a status change says about a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pending,
    Done {
        applied: DateTime<FixedOffset>,
        record: String,
    },
    Failed(ProcessFailure),
}

/// What `open` had to repair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    pub entries: usize,
    /// Bytes of a torn trailing line that were cut off
    pub torn_bytes: u64,
    /// Complete lines that could not be decoded and were skipped
    pub corrupt_lines: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub pending: u64,
    pub done: u64,
    pub failed: u64,
}

struct Inner {
    file: File,
    latest: HashMap<String, LedgerEntry>,
    /// Set once a write fails; the tail of the file is no longer trusted.
    closed: bool,
}

impl Inner {
    /// Append one line. A failed write is cut back off the file and closes
    /// the ledger for further appends.
    fn append(&mut self, bytes: &[u8], path: &Path) -> Result<(), LedgerError> {
        if self.closed {
            return Err(LedgerError::Closed(path.to_path_buf()));
        }
        let before = self.file.metadata().map_err(io_err(path))?.len();
        let written = self
            .file
            .write_all(bytes)
            .and_then(|()| self.file.sync_data());
        if let Err(err) = written {
            self.closed = true;
            if let Err(trunc) = self.file.set_len(before).and_then(|()| self.file.sync_data()) {
                warn!(path = %path.display(), error = %trunc, "could not cut off partial ledger line");
            }
            return Err(io_err(path)(err));
        }
        Ok(())
    }
}

pub struct Ledger {
    path: PathBuf,
    header: LedgerHeader,
    recovery: Recovery,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("recovery", &self.recovery)
            .finish()
    }
}

/// Hash of the input folder names, which form the key namespace.
/// Absolute paths are left out so a moved export still resumes.
pub fn options_hash(roots: &[InputRoot]) -> String {
    let mut names: Vec<&str> = roots.iter().map(|r| r.name.as_str()).collect();
    names.sort_unstable();
    let mut hasher = Sha256::new();
    for name in names {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn encode_line(line: &Line) -> Result<Vec<u8>, LedgerError> {
    let mut bytes = serde_json::to_vec(line)?;
    bytes.push(b'\n');
    Ok(bytes)
}

impl Ledger {
    /// Start a fresh ledger, discarding any previous one.
    pub fn create(output_dir: &Path, options_hash: &str) -> Result<Self, LedgerError> {
        let path = output_dir.join(LEDGER_FILENAME);
        let header = LedgerHeader {
            version: LEDGER_VERSION,
            created: Utc::now(),
            options_hash: options_hash.to_string(),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(io_err(&path))?;
        file.write_all(&encode_line(&Line::Header(header.clone()))?)
            .and_then(|()| file.sync_data())
            .map_err(io_err(&path))?;
        sync_dir(output_dir).map_err(io_err(output_dir))?;

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        Ok(Self {
            path,
            header,
            recovery: Recovery::default(),
            inner: Mutex::new(Inner {
                file,
                latest: HashMap::new(),
                closed: false,
            }),
        })
    }

    /// Load an existing ledger. Returns `None` when there is none.
    ///
    /// A torn trailing line left by a crash is cut off before new entries
    /// are appended; undecodable complete lines are skipped.
    pub fn open(output_dir: &Path) -> Result<Option<Self>, LedgerError> {
        let path = output_dir.join(LEDGER_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(io_err(&path))?;

        let mut header: Option<LedgerHeader> = None;
        let mut latest: HashMap<String, LedgerEntry> = HashMap::new();
        let mut recovery = Recovery::default();
        let mut valid_len = 0usize;
        let mut needs_newline = false;
        let mut start = 0usize;

        while start < bytes.len() {
            let (end, complete) = match bytes[start..].iter().position(|&b| b == b'\n') {
                Some(pos) => (start + pos, true),
                None => (bytes.len(), false),
            };
            let segment = &bytes[start..end];
            let parsed = if segment.iter().all(u8::is_ascii_whitespace) {
                None
            } else {
                serde_json::from_slice::<Line>(segment).ok()
            };

            match parsed {
                Some(Line::Header(h)) if header.is_none() => header = Some(h),
                Some(Line::Entry(entry)) if header.is_some() => {
                    recovery.entries += 1;
                    latest.insert(entry.key.clone(), entry);
                }
                Some(_) => recovery.corrupt_lines += 1,
                None if !complete => {
                    recovery.torn_bytes = (end - start) as u64;
                    break;
                }
                None => {
                    if !segment.iter().all(u8::is_ascii_whitespace) {
                        recovery.corrupt_lines += 1;
                    }
                }
            }

            if complete {
                valid_len = end + 1;
            } else {
                // Decoded fine but the newline never made it to disk.
                valid_len = end;
                needs_newline = true;
            }
            start = end + 1;
        }

        let header = header.ok_or_else(|| LedgerError::MissingHeader(path.clone()))?;

        if recovery.torn_bytes > 0 {
            warn!(
                path = %path.display(),
                bytes = recovery.torn_bytes,
                "discarding torn trailing ledger line"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(io_err(&path))?;
            file.set_len(valid_len as u64).map_err(io_err(&path))?;
            file.sync_all().map_err(io_err(&path))?;
        }
        if recovery.corrupt_lines > 0 {
            warn!(path = %path.display(), lines = recovery.corrupt_lines, "skipped undecodable ledger lines");
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        if needs_newline {
            file.write_all(b"\n").map_err(io_err(&path))?;
            file.sync_data().map_err(io_err(&path))?;
        }

        debug!(path = %path.display(), entries = recovery.entries, keys = latest.len(), "ledger loaded");
        Ok(Some(Self {
            path,
            header,
            recovery,
            inner: Mutex::new(Inner {
                file,
                latest,
                closed: false,
            }),
        }))
    }

    /// Swap the append handle for a read-only one so every write fails.
    #[cfg(test)]
    pub(crate) fn read_only(mut self) -> Self {
        let file = File::open(&self.path).unwrap();
        self.inner.get_mut().unwrap_or_else(PoisonError::into_inner).file = file;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn header(&self) -> &LedgerHeader {
        &self.header
    }

    pub fn recovery(&self) -> Recovery {
        self.recovery
    }

    pub fn status(&self, key: &str) -> LedgerStatus {
        self.lock()
            .latest
            .get(key)
            .map_or(LedgerStatus::Unknown, |e| e.status.into())
    }

    /// Append a status change and fsync it before returning.
    ///
    /// Appends are serialized; the in-memory view only changes once the line
    /// is durable.
    pub fn record(&self, key: &str, outcome: &Outcome) -> Result<(), LedgerError> {
        let mut entry = LedgerEntry {
            key: key.to_string(),
            status: EntryStatus::Pending,
            at: Utc::now(),
            reason: None,
            detail: None,
            applied: None,
            record: None,
        };
        match outcome {
            Outcome::Pending => {}
            Outcome::Done { applied, record } => {
                entry.status = EntryStatus::Done;
                entry.applied = Some(*applied);
                entry.record = Some(record.clone());
            }
            Outcome::Failed(failure) => {
                entry.status = EntryStatus::Failed;
                entry.reason = Some(failure.reason);
                entry.detail = Some(failure.detail.clone());
            }
        }

        let line = Line::Entry(entry);
        let bytes = encode_line(&line)?;
        let mut inner = self.lock();
        inner.append(&bytes, &self.path)?;
        if let Line::Entry(entry) = line {
            inner.latest.insert(entry.key.clone(), entry);
        }
        Ok(())
    }

    /// Latest entry per key, sorted by key.
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self.lock().latest.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn counts(&self) -> LedgerCounts {
        let inner = self.lock();
        let mut counts = LedgerCounts::default();
        for entry in inner.latest.values() {
            match entry.status {
                EntryStatus::Pending => counts.pending += 1,
                EntryStatus::Done => counts.done += 1,
                EntryStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn entry_of(ledger: &Ledger, key: &str) -> LedgerEntry {
        ledger.snapshot().into_iter().find(|e| e.key == key).unwrap()
    }

    fn done() -> Outcome {
        Outcome::Done {
            applied: FixedOffset::east_opt(3600)
                .unwrap()
                .with_ymd_and_hms(2023, 1, 2, 15, 45, 0)
                .unwrap(),
            record: "root/Photo Details.csv#1".into(),
        }
    }

    #[test]
    fn test_failed_write_closes_ledger() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::create(dir.path(), "hash").unwrap();
        ledger.record("a", &done()).unwrap();
        let ledger = ledger.read_only();

        assert!(matches!(
            ledger.record("b", &Outcome::Pending),
            Err(LedgerError::Io { .. })
        ));
        assert!(matches!(
            ledger.record("c", &done()),
            Err(LedgerError::Closed(_))
        ));
        assert_eq!(ledger.status("b"), LedgerStatus::Unknown);

        let reopened = Ledger::open(dir.path()).unwrap().unwrap();
        assert_eq!(reopened.recovery().corrupt_lines, 0);
        assert_eq!(reopened.recovery().torn_bytes, 0);
        assert_eq!(reopened.status("a"), LedgerStatus::Done);
        assert_eq!(reopened.status("c"), LedgerStatus::Unknown);
    }

    #[test]
    fn test_record_and_reopen() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::create(dir.path(), "hash").unwrap();
        assert_eq!(ledger.status("a"), LedgerStatus::Unknown);

        ledger.record("a", &Outcome::Pending).unwrap();
        assert_eq!(ledger.status("a"), LedgerStatus::Pending);
        ledger.record("a", &done()).unwrap();
        ledger.record("b", &Outcome::Pending).unwrap();
        ledger
            .record(
                "c",
                &Outcome::Failed(ProcessFailure::new(FailureReason::NoRecord, "none")),
            )
            .unwrap();
        drop(ledger);

        let reopened = Ledger::open(dir.path()).unwrap().unwrap();
        assert_eq!(reopened.header().options_hash, "hash");
        assert_eq!(reopened.status("a"), LedgerStatus::Done);
        assert_eq!(reopened.status("b"), LedgerStatus::Pending);
        assert_eq!(reopened.status("c"), LedgerStatus::Failed);
        assert_eq!(reopened.recovery().entries, 4);
        assert_eq!(
            reopened.counts(),
            LedgerCounts {
                pending: 1,
                done: 1,
                failed: 1
            }
        );
        let a = entry_of(&reopened, "a");
        assert_eq!(a.record.as_deref(), Some("root/Photo Details.csv#1"));
        assert_eq!(a.applied.unwrap().offset().local_minus_utc(), 3600);
        let c = entry_of(&reopened, "c");
        assert_eq!(c.reason, Some(FailureReason::NoRecord));
    }

    #[test]
    fn test_open_missing() {
        let dir = tempdir().unwrap();
        assert!(Ledger::open(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::create(dir.path(), "hash").unwrap();
        ledger.record("a", &done()).unwrap();
        ledger.record("b", &Outcome::Pending).unwrap();
        drop(ledger);

        let path = dir.path().join(LEDGER_FILENAME);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"type":"entry","key":"b","status":"do"#).unwrap();
        drop(file);

        let reopened = Ledger::open(dir.path()).unwrap().unwrap();
        assert_eq!(reopened.recovery().torn_bytes, 38);
        assert_eq!(reopened.status("a"), LedgerStatus::Done);
        assert_eq!(reopened.status("b"), LedgerStatus::Pending);

        // New appends land on a clean line boundary.
        reopened.record("b", &done()).unwrap();
        drop(reopened);
        let again = Ledger::open(dir.path()).unwrap().unwrap();
        assert_eq!(again.status("b"), LedgerStatus::Done);
        assert_eq!(again.recovery().torn_bytes, 0);
        assert_eq!(again.recovery().corrupt_lines, 0);
    }

    #[test]
    fn test_complete_entry_without_newline_is_kept() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::create(dir.path(), "hash").unwrap();
        drop(ledger);

        let path = dir.path().join(LEDGER_FILENAME);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"type":"entry","key":"x","status":"failed","at":"2024-01-01T00:00:00Z","reason":"copy_failure"}"#)
            .unwrap();
        drop(file);

        let reopened = Ledger::open(dir.path()).unwrap().unwrap();
        assert_eq!(reopened.status("x"), LedgerStatus::Failed);
        reopened.record("y", &Outcome::Pending).unwrap();
        drop(reopened);

        let again = Ledger::open(dir.path()).unwrap().unwrap();
        assert_eq!(again.status("x"), LedgerStatus::Failed);
        assert_eq!(again.status("y"), LedgerStatus::Pending);
    }

    #[test]
    fn test_corrupt_middle_line_is_skipped() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::create(dir.path(), "hash").unwrap();
        drop(ledger);
        let path = dir.path().join(LEDGER_FILENAME);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"garbage\n").unwrap();
        drop(file);

        let reopened = Ledger::open(dir.path()).unwrap().unwrap();
        reopened.record("k", &Outcome::Pending).unwrap();
        assert_eq!(reopened.recovery().corrupt_lines, 1);
        drop(reopened);
        assert_eq!(
            Ledger::open(dir.path()).unwrap().unwrap().status("k"),
            LedgerStatus::Pending
        );
    }

    #[test]
    fn test_missing_header() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(LEDGER_FILENAME), b"").unwrap();
        assert!(matches!(
            Ledger::open(dir.path()),
            Err(LedgerError::MissingHeader(_))
        ));
    }

    #[test]
    fn test_create_discards_previous() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::create(dir.path(), "hash").unwrap();
        ledger.record("a", &done()).unwrap();
        drop(ledger);

        let fresh = Ledger::create(dir.path(), "other").unwrap();
        assert_eq!(fresh.status("a"), LedgerStatus::Unknown);
        drop(fresh);
        let reopened = Ledger::open(dir.path()).unwrap().unwrap();
        assert_eq!(reopened.status("a"), LedgerStatus::Unknown);
        assert_eq!(reopened.header().options_hash, "other");
    }

    #[test]
    fn test_options_hash_ignores_paths_and_order() {
        let a = InputRoot {
            path: PathBuf::from("/mnt/a/Part 1"),
            name: "Part 1".into(),
        };
        let b = InputRoot {
            path: PathBuf::from("/mnt/a/Part 2"),
            name: "Part 2".into(),
        };
        let moved = InputRoot {
            path: PathBuf::from("/media/usb/Part 1"),
            name: "Part 1".into(),
        };
        assert_eq!(
            options_hash(&[a.clone(), b.clone()]),
            options_hash(&[b.clone(), moved])
        );
        assert_ne!(options_hash(&[a.clone()]), options_hash(&[a, b]));
    }

    #[test]
    fn test_concurrent_records() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::create(dir.path(), "hash").unwrap();
        std::thread::scope(|s| {
            for t in 0..4 {
                let ledger = &ledger;
                s.spawn(move || {
                    for i in 0..25 {
                        ledger.record(&format!("{}-{}", t, i), &Outcome::Pending).unwrap();
                    }
                });
            }
        });
        drop(ledger);
        let reopened = Ledger::open(dir.path()).unwrap().unwrap();
        assert_eq!(reopened.counts().pending, 100);
        assert_eq!(reopened.recovery().corrupt_lines, 0);
    }
}
