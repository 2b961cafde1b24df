//! Sidecar store: every metadata record from the export's CSV/JSON files,
//! indexed by exact and by normalized file name, and by original identifier
//! where the export recorded one.

pub mod csv;
pub mod date;
pub mod json;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset};
use encoding_rs::WINDOWS_1252;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::scan::{nfc, SidecarFile};
use crate::ThrottledProgress;

/// Disambiguation suffix the export appends before the extension: `IMG_0001(1).JPG`.
static SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<base>.*?)\((?P<index>\d+)\)(?P<ext>\.[^.()]*)?$").unwrap());

/// Split the export's disambiguation suffix off a file name.
///
/// Returns the lower-cased, NFC name without the suffix, and the suffix index
/// (`0` when the name has none).
pub fn normalize_name(name: &str) -> (String, u32) {
    let lowered = nfc(name).to_lowercase();
    if let Some(caps) = SUFFIX_RE.captures(&lowered) {
        let base = caps.name("base").map_or("", |m| m.as_str());
        if let (false, Ok(index)) = (base.is_empty(), caps["index"].parse::<u32>()) {
            let ext = caps.name("ext").map_or("", |m| m.as_str());
            return (format!("{}{}", base, ext), index);
        }
    }
    (lowered, 0)
}

/// Capture time of a record. The sidecar's own text is always kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTime {
    Present {
        instant: DateTime<FixedOffset>,
        raw: String,
    },
    Absent {
        raw: String,
    },
}

impl CaptureTime {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.to_string();
        match date::parse_capture_time(&raw) {
            Some(instant) => CaptureTime::Present { instant, raw },
            None => CaptureTime::Absent { raw },
        }
    }

    pub fn instant(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            CaptureTime::Present { instant, .. } => Some(*instant),
            CaptureTime::Absent { .. } => None,
        }
    }

    /// The value exactly as it appeared in the sidecar.
    pub fn raw(&self) -> &str {
        match self {
            CaptureTime::Present { raw, .. } | CaptureTime::Absent { raw } => raw,
        }
    }
}

/// Where a record came from: sidecar key and 1-based row/element number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSource {
    pub sidecar: String,
    pub row: usize,
    pub root_index: usize,
}

impl RecordSource {
    /// Stable reference stored in the ledger for Done entries.
    pub fn reference(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.sidecar, self.row)
    }
}

/// One sidecar entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Name as written by the export, NFC
    pub file_name: String,
    /// Lower-cased name without disambiguation suffix
    pub normalized: String,
    /// Disambiguation suffix index, 0 when absent
    pub suffix_index: u32,
    pub captured: CaptureTime,
    pub original_id: Option<String>,
    pub source: RecordSource,
}

impl MetadataRecord {
    pub fn new(
        file_name: &str,
        raw_timestamp: &str,
        original_id: Option<String>,
        source: RecordSource,
    ) -> Self {
        let file_name = nfc(file_name);
        let (normalized, suffix_index) = normalize_name(&file_name);
        Self {
            file_name,
            normalized,
            suffix_index,
            captured: CaptureTime::parse(raw_timestamp),
            original_id,
            source,
        }
    }
}

/// A record as read from a sidecar, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub row: usize,
    pub file_name: String,
    pub timestamp: String,
    pub original_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSidecar {
    /// The file follows one of the known record layouts.
    Recognized { records: Vec<RawRecord>, malformed: u64 },
    /// Some other CSV/JSON that happens to live in the export.
    Unrecognized,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SidecarStats {
    pub sidecar_files: u64,
    pub ignored_files: u64,
    pub unreadable_files: u64,
    pub records: u64,
    pub malformed_records: u64,
    pub absent_timestamps: u64,
}

/// Read a sidecar as text: UTF-8 (BOM stripped), else Windows-1252.
pub fn read_text(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
    match std::str::from_utf8(body) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => {
            let (decoded, _, _) = WINDOWS_1252.decode(body);
            Ok(decoded.into_owned())
        }
    }
}

fn parse_sidecar(path: &Path) -> std::result::Result<ParsedSidecar, String> {
    let text = read_text(path).map_err(|e| e.to_string())?;
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    if is_csv {
        csv::parse_csv(&text).map_err(|e| e.to_string())
    } else {
        json::parse_json(&text).map_err(|e| e.to_string())
    }
}

/// In-memory index over all records. Built once, read-only afterwards.
#[derive(Debug, Default)]
pub struct SidecarIndex {
    records: Vec<MetadataRecord>,
    by_exact: HashMap<String, Vec<usize>>,
    by_normalized: HashMap<String, Vec<usize>>,
    by_identifier: HashMap<String, Vec<usize>>,
    stats: SidecarStats,
}

impl SidecarIndex {
    /// Parse every sidecar and index its records, preserving sidecar order
    /// and row order. Fails only when no sidecar has a recognised layout.
    pub fn build(sidecars: &[SidecarFile], progress: &ThrottledProgress) -> Result<Self> {
        let mut stats = SidecarStats::default();
        let mut records = Vec::new();
        let total = sidecars.len() as u64;

        for (i, sidecar) in sidecars.iter().enumerate() {
            progress.report("sidecars", i as u64, total, "Reading sidecars");
            match parse_sidecar(&sidecar.path) {
                Err(err) => {
                    warn!(sidecar = %sidecar.key, error = %err, "unreadable sidecar");
                    stats.unreadable_files += 1;
                }
                Ok(ParsedSidecar::Unrecognized) => {
                    debug!(sidecar = %sidecar.key, "ignoring sidecar with unknown layout");
                    stats.ignored_files += 1;
                }
                Ok(ParsedSidecar::Recognized { records: raw, malformed }) => {
                    if malformed > 0 {
                        warn!(sidecar = %sidecar.key, malformed, "skipped malformed records");
                    }
                    stats.sidecar_files += 1;
                    stats.malformed_records += malformed;
                    records.extend(raw.into_iter().map(|r| {
                        MetadataRecord::new(
                            &r.file_name,
                            &r.timestamp,
                            r.original_id,
                            RecordSource {
                                sidecar: sidecar.key.clone(),
                                row: r.row,
                                root_index: sidecar.root_index,
                            },
                        )
                    }));
                }
            }
        }
        progress.report("sidecars", total, total, "Sidecars read");

        if stats.sidecar_files == 0 {
            return Err(Error::EmptyLibrary);
        }

        let index = Self::with_stats(records, stats);
        info!(
            sidecars = index.stats.sidecar_files,
            records = index.stats.records,
            malformed = index.stats.malformed_records,
            absent_timestamps = index.stats.absent_timestamps,
            "sidecar index built"
        );
        Ok(index)
    }

    /// Index records directly, in the given order.
    pub fn from_records(records: Vec<MetadataRecord>) -> Self {
        Self::with_stats(records, SidecarStats::default())
    }

    fn with_stats(records: Vec<MetadataRecord>, mut stats: SidecarStats) -> Self {
        let mut by_exact: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_normalized: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_identifier: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, r) in records.iter().enumerate() {
            by_exact.entry(r.file_name.clone()).or_default().push(i);
            by_normalized.entry(r.normalized.clone()).or_default().push(i);
            if let Some(id) = &r.original_id {
                by_identifier.entry(id.clone()).or_default().push(i);
            }
        }
        stats.records = records.len() as u64;
        stats.absent_timestamps = records
            .iter()
            .filter(|r| r.captured.instant().is_none())
            .count() as u64;
        Self {
            records,
            by_exact,
            by_normalized,
            by_identifier,
            stats,
        }
    }

    fn lookup<'a>(&'a self, map: &HashMap<String, Vec<usize>>, key: &str) -> Vec<&'a MetadataRecord> {
        map.get(key)
            .map(|ids| ids.iter().map(|&i| &self.records[i]).collect())
            .unwrap_or_default()
    }

    /// Records whose recorded name equals `name` exactly, in insertion order.
    pub fn exact(&self, name: &str) -> Vec<&MetadataRecord> {
        self.lookup(&self.by_exact, name)
    }

    /// Records sharing a normalized name, in insertion order.
    pub fn normalized(&self, normalized: &str) -> Vec<&MetadataRecord> {
        self.lookup(&self.by_normalized, normalized)
    }

    /// Records carrying the same original identifier, in insertion order.
    pub fn identified(&self, id: &str) -> Vec<&MetadataRecord> {
        self.lookup(&self.by_identifier, id)
    }

    pub fn records(&self) -> &[MetadataRecord] {
        &self.records
    }

    pub fn stats(&self) -> &SidecarStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn sidecar(path: PathBuf, key: &str) -> SidecarFile {
        SidecarFile {
            path,
            key: key.to_string(),
            root_index: 0,
        }
    }

    fn no_progress() -> impl Fn(&str, u64, u64, &str) + Send + Sync {
        |_: &str, _: u64, _: u64, _: &str| {}
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("IMG_0001.JPG"), ("img_0001.jpg".into(), 0));
        assert_eq!(normalize_name("IMG_0001(1).JPG"), ("img_0001.jpg".into(), 1));
        assert_eq!(normalize_name("IMG_0001(12).heic"), ("img_0001.heic".into(), 12));
        assert_eq!(normalize_name("scan(3)"), ("scan".into(), 3));
        // Only a suffix directly before the extension counts.
        assert_eq!(normalize_name("a(1)b.jpg"), ("a(1)b.jpg".into(), 0));
        assert_eq!(normalize_name("(1).jpg"), ("(1).jpg".into(), 0));
    }

    #[test]
    fn test_build_index() {
        let dir = tempdir().unwrap();
        let csv_path = dir.path().join("Photo Details.csv");
        File::create(&csv_path)
            .unwrap()
            .write_all(
                b"\xEF\xBB\xBFimgName,originalCreationDate\n\
                  IMG_0001.JPG,\"Monday January 2,2023 3:45 PM GMT\"\n\
                  IMG_0001(1).JPG,\"Monday January 2,2023 3:46 PM GMT\"\n\
                  IMG_0002.JPG,\n",
            )
            .unwrap();
        let albums = dir.path().join("Albums.csv");
        File::create(&albums).unwrap().write_all(b"album,names\n").unwrap();
        let broken = dir.path().join("broken.json");
        File::create(&broken).unwrap().write_all(b"{nope").unwrap();

        let cb = no_progress();
        let tp = ThrottledProgress::new(&cb);
        let index = SidecarIndex::build(
            &[
                sidecar(csv_path, "r/Photo Details.csv"),
                sidecar(albums, "r/Albums.csv"),
                sidecar(broken, "r/broken.json"),
            ],
            &tp,
        )
        .unwrap();

        assert_eq!(index.records().len(), 3);
        assert_eq!(index.stats().sidecar_files, 1);
        assert_eq!(index.stats().ignored_files, 1);
        assert_eq!(index.stats().unreadable_files, 1);
        assert_eq!(index.stats().absent_timestamps, 1);

        assert_eq!(index.exact("IMG_0001.JPG").len(), 1);
        let family = index.normalized("img_0001.jpg");
        assert_eq!(family.len(), 2);
        assert_eq!(family[1].suffix_index, 1);
        assert_eq!(family[1].source.reference(), "r/Photo Details.csv#2");
    }

    #[test]
    fn test_identifier_index_and_raw_timestamp() {
        let source = |row| RecordSource {
            sidecar: "r/Photo Details.csv".into(),
            row,
            root_index: 0,
        };
        let index = SidecarIndex::from_records(vec![
            MetadataRecord::new(
                "IMG_0001.JPG",
                "Monday January 2,2023 3:45 PM GMT",
                Some("abc".into()),
                source(1),
            ),
            MetadataRecord::new("IMG_0002.JPG", "", None, source(2)),
            MetadataRecord::new("IMG_0001(1).JPG", "", Some("abc".into()), source(3)),
        ]);

        let same = index.identified("abc");
        assert_eq!(same.len(), 2);
        assert_eq!(same[1].source.row, 3);
        assert!(index.identified("zzz").is_empty());

        let first = &index.records()[0].captured;
        assert_eq!(first.raw(), "Monday January 2,2023 3:45 PM GMT");
        assert!(first.instant().is_some());
    }

    #[test]
    fn test_empty_library() {
        let dir = tempdir().unwrap();
        let albums = dir.path().join("Albums.csv");
        File::create(&albums).unwrap().write_all(b"album,names\n").unwrap();
        let cb = no_progress();
        let tp = ThrottledProgress::new(&cb);
        assert!(matches!(
            SidecarIndex::build(&[sidecar(albums, "r/Albums.csv")], &tp),
            Err(Error::EmptyLibrary)
        ));
        assert!(matches!(SidecarIndex::build(&[], &tp), Err(Error::EmptyLibrary)));
    }

    #[test]
    fn test_windows_1252_fallback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latin.csv");
        File::create(&path).unwrap().write_all(b"caf\xe9").unwrap();
        assert_eq!(read_text(&path).unwrap(), "caf\u{e9}");
    }
}
