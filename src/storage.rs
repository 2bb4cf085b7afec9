//! Scratch-file housekeeping: extension allow-lists, request-scoped temp
//! files and age-based cleanup of the upload and output directories.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rand::RngCore;

use crate::error::{DetectError, Result};

pub const IMAGE_FORMATS: &[&str] = &[".jpg", ".jpeg", ".png", ".bmp", ".webp"];
pub const VIDEO_FORMATS: &[&str] = &[".mp4", ".avi", ".mov", ".mkv", ".wmv"];

/// Default age after which scratch files are swept.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn formats(self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => IMAGE_FORMATS,
            MediaKind::Video => VIDEO_FORMATS,
        }
    }
}

/// Lowercased extension of `filename` including the dot, or "" if none.
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Validate `filename` against the allow-list for `kind` and return its
/// normalized extension. Touches nothing on disk.
pub fn check_extension(filename: &str, kind: MediaKind) -> Result<String> {
    let ext = extension_of(filename);
    if kind.formats().contains(&ext.as_str()) {
        return Ok(ext);
    }
    Err(DetectError::UnsupportedFormat {
        extension: if ext.is_empty() {
            "(none)".to_string()
        } else {
            ext
        },
        supported: kind.formats().join(", "),
    })
}

/// Random 128-bit identifier, hex encoded.
pub fn new_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A file that is removed when the guard drops, unless `persist` is called.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    armed: bool,
}

impl ScratchFile {
    /// Write `bytes` to `path`.
    pub fn create(path: PathBuf, bytes: &[u8]) -> Result<Self> {
        let guard = Self::reserve(path);
        fs::write(&guard.path, bytes)?;
        Ok(guard)
    }

    /// Guard a path that something else will write.
    pub fn reserve(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file and hand back its path.
    pub fn persist(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("removed scratch file {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to remove {}: {e}", self.path.display()),
        }
    }
}

/// Remove files older than `retention` from `dirs`. Missing directories count
/// as empty.
pub fn cleanup<P: AsRef<Path>>(dirs: &[P], retention: Duration) -> Result<usize> {
    cleanup_at(dirs, retention, SystemTime::now())
}

pub fn cleanup_at<P: AsRef<Path>>(dirs: &[P], retention: Duration, now: SystemTime) -> Result<usize> {
    let mut removed = 0;
    for dir in dirs {
        let dir = dir.as_ref();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("cleanup: skipping {}: {e}", entry.path().display());
                    continue;
                }
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or_default();
            if age <= retention {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => log::warn!("cleanup: failed to remove {}: {e}", entry.path().display()),
            }
        }
    }
    if removed > 0 {
        log::info!("cleanup removed {removed} file(s)");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_check_is_case_insensitive() {
        assert_eq!(check_extension("Road.JPG", MediaKind::Image).unwrap(), ".jpg");
        assert_eq!(check_extension("clip.MkV", MediaKind::Video).unwrap(), ".mkv");
    }

    #[test]
    fn rejects_unlisted_and_missing_extensions() {
        let err = check_extension("notes.txt", MediaKind::Image).unwrap_err();
        match err {
            DetectError::UnsupportedFormat {
                extension,
                supported,
            } => {
                assert_eq!(extension, ".txt");
                assert!(supported.contains(".webp"));
            }
            other => panic!("unexpected: {other}"),
        }
        assert!(check_extension("README", MediaKind::Video).is_err());
        assert!(check_extension("frame.png", MediaKind::Video).is_err());
    }

    #[test]
    fn scratch_file_removed_on_drop_unless_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let dropped = ScratchFile::create(dir.path().join("a.png"), b"abc").unwrap();
        let dropped_path = dropped.path().to_path_buf();
        assert!(dropped_path.exists());
        drop(dropped);
        assert!(!dropped_path.exists());

        let kept = ScratchFile::create(dir.path().join("b.png"), b"abc").unwrap();
        let kept_path = kept.persist();
        assert!(kept_path.exists());
    }

    #[test]
    fn reserved_path_never_written_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        drop(ScratchFile::reserve(dir.path().join("never.mp4")));
    }

    #[test]
    fn ids_are_unique_hex() {
        let a = new_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, new_id());
    }
}
