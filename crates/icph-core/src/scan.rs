use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::media::MediaFile;
use crate::ThrottledProgress;

/// Export folders carry this in their name ("iCloud Photos Part 1 of 4", ...).
pub const EXPORT_FOLDER_SUBSTRING: &str = "iCloud Photos";

const SIDECAR_EXTS: &[&str] = &["csv", "json"];

/// One input folder. Its name prefixes every key found beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRoot {
    pub path: PathBuf,
    pub name: String,
}

/// A sidecar file found while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarFile {
    pub path: PathBuf,
    pub key: String,
    pub root_index: usize,
}

/// Result of scanning all input folders
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Media candidates, sorted by key
    pub media: Vec<MediaFile>,
    /// Sidecars, in root order then key order
    pub sidecars: Vec<SidecarFile>,
    /// Entries that could not be read during traversal
    pub unreadable: u64,
}

/// NFC-normalise a name so keys compare equal however the filesystem stored them.
pub fn nfc(s: &str) -> String {
    s.nfc().collect()
}

/// Find export folders directly below `dir`.
pub fn discover_inputs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io("read directory", dir, e))?;
    let mut found: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(EXPORT_FOLDER_SUBSTRING))
        })
        .collect();
    found.sort();
    if found.is_empty() {
        return Err(Error::InvalidInput(format!(
            "no folders containing '{}' in {}",
            EXPORT_FOLDER_SUBSTRING,
            dir.display()
        )));
    }
    Ok(found)
}

/// Validate input folders and derive their key prefixes.
pub fn resolve_roots(inputs: &[PathBuf]) -> Result<Vec<InputRoot>> {
    if inputs.is_empty() {
        return Err(Error::InvalidInput("no input folders given".into()));
    }
    let mut names = HashSet::new();
    let mut roots = Vec::with_capacity(inputs.len());
    for input in inputs {
        let path = fs::canonicalize(input).map_err(|e| Error::io("resolve input", input, e))?;
        if !path.is_dir() {
            return Err(Error::InvalidInput(format!("{} is not a directory", input.display())));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(nfc)
            .ok_or_else(|| {
                Error::InvalidInput(format!("{} has no usable folder name", input.display()))
            })?;
        if !names.insert(name.clone()) {
            return Err(Error::InvalidInput(format!(
                "two input folders are named '{}'; folder names must be unique",
                name
            )));
        }
        roots.push(InputRoot { path, name });
    }
    Ok(roots)
}

/// Stable key for `path` found under `root`.
pub fn relative_key(root: &InputRoot, path: &Path) -> Option<String> {
    let rel = pathdiff::diff_paths(path, &root.path)?;
    let mut key = root.name.clone();
    for component in rel.components() {
        key.push('/');
        key.push_str(&nfc(component.as_os_str().to_str()?));
    }
    Some(key)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn is_sidecar(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SIDECAR_EXTS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Walk all input folders, splitting files into media candidates and sidecars.
/// Anything under `exclude` (the output tree) is ignored.
pub fn scan_inputs(
    roots: &[InputRoot],
    exclude: &Path,
    progress: &ThrottledProgress,
) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    let total = roots.len() as u64;

    for (root_index, root) in roots.iter().enumerate() {
        progress.report("scan", root_index as u64, total, &format!("Scanning {}", root.name));

        let walker = WalkDir::new(&root.path)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.path() != exclude
                    && (e.depth() == 0
                        || !e.file_name().to_str().is_some_and(is_hidden))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(root = %root.name, error = %err, "skipping unreadable entry");
                    result.unreadable += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = relative_key(root, entry.path()) else {
                warn!(path = %entry.path().display(), "skipping file with non UTF-8 name");
                result.unreadable += 1;
                continue;
            };
            let filename = nfc(&entry.file_name().to_string_lossy());

            if is_sidecar(&filename) {
                result.sidecars.push(SidecarFile {
                    path: entry.path().to_path_buf(),
                    key,
                    root_index,
                });
                continue;
            }

            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(err) => {
                    warn!(%key, error = %err, "skipping file without metadata");
                    result.unreadable += 1;
                    continue;
                }
            };
            result.media.push(MediaFile::new(
                entry.path().to_path_buf(),
                key,
                root_index,
                filename,
                size,
            ));
        }
        debug!(root = %root.name, "scan finished");
    }

    result.media.sort_by(|a, b| a.key.cmp(&b.key));
    progress.report("scan", total, total, "Scan complete");
    Ok(result)
}
