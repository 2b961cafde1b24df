use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Extensions ExifTool treats as QuickTime/video containers.
const VIDEO_EXTS: &[&str] = &["mov", "mp4", "m4v", "avi", "mts", "m2ts", "3gp", "3gpp"];

/// Still-image formats mime_guess does not know about.
const EXTRA_IMAGE_EXTS: &[&str] = &["heic", "heif", "dng"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

impl MediaKind {
    pub fn from_name(filename: &str) -> Self {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if VIDEO_EXTS.contains(&ext.as_str()) {
            return MediaKind::Video;
        }
        if EXTRA_IMAGE_EXTS.contains(&ext.as_str()) {
            return MediaKind::Image;
        }
        match mime_guess::from_path(filename).first() {
            Some(m) if m.type_() == mime_guess::mime::IMAGE => MediaKind::Image,
            Some(m) if m.type_() == mime_guess::mime::VIDEO => MediaKind::Video,
            _ => MediaKind::Other,
        }
    }
}

/// A file discovered under one of the input folders.
#[derive(Debug, Clone)]
pub struct MediaFile {
    /// Absolute source path
    pub path: PathBuf,
    /// Stable identity: input folder name + path below it, `/`-separated, NFC
    pub key: String,
    /// Index of the input folder in the run's root list
    pub root_index: usize,
    /// Just the filename, NFC
    pub filename: String,
    pub kind: MediaKind,
    /// File size in bytes
    pub size: u64,
    /// SHA-256 hex, computed on first request
    checksum: OnceLock<String>,
}

impl MediaFile {
    pub fn new(path: PathBuf, key: String, root_index: usize, filename: String, size: u64) -> Self {
        let kind = MediaKind::from_name(&filename);
        Self {
            path,
            key,
            root_index,
            filename,
            kind,
            size,
            checksum: OnceLock::new(),
        }
    }

    /// Key as a relative filesystem path, used for output placement.
    pub fn relative_path(&self) -> PathBuf {
        self.key.split('/').collect()
    }

    /// Content checksum. Read once and cached.
    pub fn checksum(&self) -> io::Result<&str> {
        if let Some(hash) = self.checksum.get() {
            return Ok(hash);
        }
        let hash = hash_file(&self.path)?;
        Ok(self.checksum.get_or_init(|| hash))
    }
}

/// SHA-256 of a file's content, hex encoded.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_kind_from_name() {
        assert_eq!(MediaKind::from_name("IMG_0001.JPG"), MediaKind::Image);
        assert_eq!(MediaKind::from_name("IMG_0002.HEIC"), MediaKind::Image);
        assert_eq!(MediaKind::from_name("IMG_0003.png"), MediaKind::Image);
        assert_eq!(MediaKind::from_name("IMG_0004.MOV"), MediaKind::Video);
        assert_eq!(MediaKind::from_name("clip.mts"), MediaKind::Video);
        assert_eq!(MediaKind::from_name("notes.txt"), MediaKind::Other);
        assert_eq!(MediaKind::from_name("no_extension"), MediaKind::Other);
    }

    #[test]
    fn test_checksum_is_cached() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        File::create(&path).unwrap().write_all(b"abc").unwrap();

        let m = MediaFile::new(path.clone(), "root/a.jpg".into(), 0, "a.jpg".into(), 3);
        let first = m.checksum().unwrap().to_string();
        assert_eq!(
            first,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        // Cached value survives the file changing underneath.
        File::create(&path).unwrap().write_all(b"changed").unwrap();
        assert_eq!(m.checksum().unwrap(), first);
    }

    #[test]
    fn test_relative_path() {
        let m = MediaFile::new(
            PathBuf::from("/x/iCloud Photos/sub/a.jpg"),
            "iCloud Photos/sub/a.jpg".into(),
            0,
            "a.jpg".into(),
            0,
        );
        assert_eq!(
            m.relative_path(),
            Path::new("iCloud Photos").join("sub").join("a.jpg")
        );
    }
}
