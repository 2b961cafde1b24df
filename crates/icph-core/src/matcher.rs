//! File-to-record matching.
//!
//! Matching is a pure function of the file, the sidecar index and the set of
//! file names that occur more than once: the same inputs resolve the same way
//! in every run.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, FixedOffset};
use tracing::warn;

use crate::error::{FailureReason, ProcessFailure};
use crate::media::MediaFile;
use crate::sidecar::{normalize_name, CaptureTime, MetadataRecord, SidecarIndex};

/// Outcome of matching one file.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult<'a> {
    Matched {
        record: &'a MetadataRecord,
        captured: DateTime<FixedOffset>,
    },
    NoRecord,
    /// More than one record could apply and nothing singles one out.
    AmbiguousRecord { candidates: Vec<&'a MetadataRecord> },
    /// The record also fits other files of the same name with different
    /// content, and nothing ties it to this one.
    AmbiguousFile {
        record: &'a MetadataRecord,
        rivals: Vec<String>,
    },
    /// The selected record has no usable timestamp.
    UnparsableTimestamp { record: &'a MetadataRecord },
}

impl<'a> MatchResult<'a> {
    /// The chosen record and its instant, or the failure to record.
    pub fn selection(&self) -> Result<(&'a MetadataRecord, DateTime<FixedOffset>), ProcessFailure> {
        match self {
            MatchResult::Matched { record, captured } => Ok((*record, *captured)),
            MatchResult::NoRecord => Err(ProcessFailure::new(
                FailureReason::NoRecord,
                "no sidecar record for this file name",
            )),
            MatchResult::AmbiguousRecord { candidates } => {
                let refs: Vec<String> = candidates.iter().map(|r| r.source.reference()).collect();
                Err(ProcessFailure::new(
                    FailureReason::AmbiguousRecord,
                    format!("{} candidate records: {}", refs.len(), refs.join(", ")),
                ))
            }
            MatchResult::AmbiguousFile { record, rivals } => Err(ProcessFailure::new(
                FailureReason::AmbiguousRecord,
                format!(
                    "record {} also fits {} with different content",
                    record.source.reference(),
                    rivals.join(", ")
                ),
            )),
            MatchResult::UnparsableTimestamp { record } => Err(ProcessFailure::new(
                FailureReason::UnparsableTimestamp,
                format!(
                    "record {} has timestamp {:?}",
                    record.source.reference(),
                    record.captured.raw()
                ),
            )),
        }
    }
}

#[derive(Debug, Clone)]
struct Peer {
    key: String,
    root_index: usize,
    /// `None` when the content could not be read
    checksum: Option<String>,
}

/// Files whose name occurs at more than one path, with their content hashes.
#[derive(Debug, Default)]
pub struct NameCollisions {
    by_name: HashMap<String, Vec<Peer>>,
}

impl NameCollisions {
    /// Group `media` by file name and hash every file whose name repeats.
    pub fn build(media: &[MediaFile]) -> Self {
        let mut grouped: HashMap<&str, Vec<&MediaFile>> = HashMap::new();
        for file in media {
            grouped.entry(file.filename.as_str()).or_default().push(file);
        }

        let by_name = grouped
            .into_iter()
            .filter(|(_, files)| files.len() > 1)
            .map(|(name, files)| {
                let peers = files
                    .into_iter()
                    .map(|f| {
                        let checksum = match f.checksum() {
                            Ok(hash) => Some(hash.to_string()),
                            Err(err) => {
                                warn!(key = %f.key, error = %err, "could not checksum file");
                                None
                            }
                        };
                        Peer {
                            key: f.key.clone(),
                            root_index: f.root_index,
                            checksum,
                        }
                    })
                    .collect();
                (name.to_string(), peers)
            })
            .collect();
        Self { by_name }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Other files with the same name whose content differs from `file`.
    /// Unreadable content never counts as identical.
    fn rivals(&self, file: &MediaFile) -> Vec<&Peer> {
        let Some(peers) = self.by_name.get(&file.filename) else {
            return Vec::new();
        };
        let own = peers
            .iter()
            .find(|p| p.key == file.key)
            .and_then(|p| p.checksum.as_deref());
        peers
            .iter()
            .filter(|p| p.key != file.key)
            .filter(|p| own.is_none() || p.checksum.as_deref() != own)
            .collect()
    }
}

fn accept(record: &MetadataRecord) -> MatchResult<'_> {
    match &record.captured {
        CaptureTime::Present { instant, .. } => MatchResult::Matched {
            record,
            captured: *instant,
        },
        CaptureTime::Absent { .. } => MatchResult::UnparsableTimestamp { record },
    }
}

/// Keep the first record per original identifier. Records without one are
/// all kept.
fn collapse_identified(pool: Vec<&MetadataRecord>) -> Vec<&MetadataRecord> {
    let mut seen = HashSet::new();
    pool.into_iter()
        .filter(|r| r.original_id.as_deref().map_or(true, |id| seen.insert(id)))
        .collect()
}

/// Pick one record out of several that all name this file.
///
/// Records from the same export folder as the file win. Records sharing an
/// original identifier describe the same asset and count once. Otherwise
/// several records agreeing on the instant are interchangeable. Anything else
/// is ambiguous.
fn settle<'a>(file: &MediaFile, candidates: Vec<&'a MetadataRecord>) -> MatchResult<'a> {
    match candidates.as_slice() {
        [] => return MatchResult::NoRecord,
        [only] => return accept(*only),
        _ => {}
    }

    let local: Vec<&MetadataRecord> = candidates
        .iter()
        .copied()
        .filter(|r| r.source.root_index == file.root_index)
        .collect();
    if let [only] = local.as_slice() {
        return accept(*only);
    }
    let pool = collapse_identified(if local.is_empty() { candidates } else { local });

    let first = pool[0];
    if pool
        .iter()
        .all(|r| r.captured.instant() == first.captured.instant())
    {
        return accept(first);
    }
    MatchResult::AmbiguousRecord { candidates: pool }
}

fn select<'a>(file: &MediaFile, index: &'a SidecarIndex) -> MatchResult<'a> {
    let exact = index.exact(&file.filename);
    if !exact.is_empty() {
        return settle(file, exact);
    }

    let (normalized, file_index) = normalize_name(&file.filename);
    let mut candidates = index.normalized(&normalized);
    match candidates.len() {
        0 => MatchResult::NoRecord,
        1 => accept(candidates[0]),
        _ => {
            // Stable: ties keep insertion order.
            candidates.sort_by_key(|r| r.suffix_index);
            let corresponding: Vec<&MetadataRecord> = candidates
                .iter()
                .copied()
                .filter(|r| r.suffix_index == file_index)
                .collect();
            if corresponding.is_empty() {
                return MatchResult::AmbiguousRecord { candidates };
            }
            settle(file, corresponding)
        }
    }
}

/// Resolve the single record for `file`.
///
/// When other files share this file's name but not its content, the record
/// is only accepted if it comes from this file's export folder and no such
/// rival lives in that folder too.
pub fn match_file<'a>(
    file: &MediaFile,
    index: &'a SidecarIndex,
    collisions: &NameCollisions,
) -> MatchResult<'a> {
    let (record, captured) = match select(file, index) {
        MatchResult::Matched { record, captured } => (record, captured),
        other => return other,
    };
    let rivals = collisions.rivals(file);
    let tied_here = record.source.root_index == file.root_index
        && rivals.iter().all(|p| p.root_index != file.root_index);
    if rivals.is_empty() || tied_here {
        return MatchResult::Matched { record, captured };
    }
    MatchResult::AmbiguousFile {
        record,
        rivals: rivals.iter().map(|p| p.key.clone()).collect(),
    }
}
