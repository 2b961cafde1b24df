use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ledger::{EntryStatus, LedgerEntry};
use crate::media::MediaFile;
use crate::sidecar::{MetadataRecord, SidecarIndex};

pub const FAILURES_CSV: &str = "FAILURES.csv";
pub const UNMATCHED_CSV: &str = "UNMATCHED_RECORDS.csv";
pub const DUPLICATES_CSV: &str = "DUPLICATES.csv";
pub const SUMMARY_JSON: &str = "summary.json";

/// One file name seen at several input paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateName {
    pub filename: String,
    /// (key, checksum) per occurrence, in key order
    pub files: Vec<(String, String)>,
}

fn csv_writer(path: &Path) -> Result<::csv::Writer<File>> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| Error::io("create report directory", dir, e))?;
    }
    ::csv::Writer::from_path(path).map_err(|source| Error::Report {
        path: path.to_path_buf(),
        source,
    })
}

fn write_rows<I, R>(path: &Path, header: &[&str], rows: I) -> Result<usize>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator,
    R::Item: AsRef<[u8]>,
{
    let report_err = |source: ::csv::Error| Error::Report {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv_writer(path)?;
    writer.write_record(header).map_err(report_err)?;
    let mut count = 0;
    for row in rows {
        writer.write_record(row).map_err(report_err)?;
        count += 1;
    }
    writer
        .flush()
        .map_err(|e| report_err(::csv::Error::from(e)))?;
    Ok(count)
}

/// Every key whose latest status is Failed.
pub fn write_failures(path: &Path, entries: &[LedgerEntry]) -> Result<usize> {
    let rows = entries
        .iter()
        .filter(|e| e.status == EntryStatus::Failed)
        .map(|e| {
            [
                e.key.clone(),
                e.reason.map(|r| r.to_string()).unwrap_or_default(),
                e.detail.clone().unwrap_or_default(),
                e.at.to_rfc3339(),
            ]
        });
    write_rows(path, &["key", "reason", "detail", "updated_at"], rows)
}

/// Records no Done file took its timestamp from, in index order.
///
/// A record sharing its original identifier with a consumed record describes
/// the same asset and counts as consumed too.
pub fn unmatched_records<'a>(
    index: &'a SidecarIndex,
    entries: &[LedgerEntry],
) -> Vec<&'a MetadataRecord> {
    let mut consumed: HashSet<String> = entries
        .iter()
        .filter(|e| e.status == EntryStatus::Done)
        .filter_map(|e| e.record.clone())
        .collect();
    let same_asset: Vec<String> = index
        .records()
        .iter()
        .filter(|r| consumed.contains(&r.source.reference()))
        .filter_map(|r| r.original_id.as_deref())
        .flat_map(|id| index.identified(id))
        .map(|r| r.source.reference())
        .collect();
    consumed.extend(same_asset);

    index
        .records()
        .iter()
        .filter(|r| !consumed.contains(&r.source.reference()))
        .collect()
}

pub fn write_unmatched(path: &Path, records: &[&MetadataRecord]) -> Result<usize> {
    let rows = records.iter().map(|r| {
        [
            r.source.sidecar.clone(),
            r.source.row.to_string(),
            r.file_name.clone(),
            r.captured.raw().to_string(),
        ]
    });
    write_rows(path, &["sidecar", "row", "file_name", "timestamp"], rows)
}

/// File names present at more than one input path.
///
/// Checksums tell true copies apart from different files sharing a name.
pub fn find_duplicates(media: &[MediaFile]) -> Vec<DuplicateName> {
    let mut by_name: BTreeMap<&str, Vec<&MediaFile>> = BTreeMap::new();
    for file in media {
        by_name.entry(file.filename.as_str()).or_default().push(file);
    }

    by_name
        .into_iter()
        .filter(|(_, files)| files.len() > 1)
        .map(|(name, mut files)| {
            files.sort_by(|a, b| a.key.cmp(&b.key));
            let files = files
                .into_iter()
                .map(|f| {
                    let checksum = match f.checksum() {
                        Ok(hash) => hash.to_string(),
                        Err(err) => {
                            warn!(key = %f.key, error = %err, "could not checksum file");
                            String::new()
                        }
                    };
                    (f.key.clone(), checksum)
                })
                .collect();
            DuplicateName {
                filename: name.to_string(),
                files,
            }
        })
        .collect()
}

pub fn write_duplicates(path: &Path, duplicates: &[DuplicateName]) -> Result<usize> {
    let rows = duplicates.iter().flat_map(|d| {
        d.files
            .iter()
            .map(move |(key, checksum)| [d.filename.clone(), key.clone(), checksum.clone()])
    });
    write_rows(path, &["filename", "key", "sha256"], rows)
}

/// Pretty-printed JSON summary of a run.
pub fn write_summary<T: Serialize>(path: &Path, summary: &T) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io("create summary", path, e))?;
    serde_json::to_writer_pretty(file, summary).map_err(|source| Error::Summary {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "summary written");
    Ok(())
}
