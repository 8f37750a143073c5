//! In-progress markers
//!
//! A marker is written right before risky generation work begins and
//! deleted immediately after, success or failure. Its presence classifies a
//! cache directory as partial/unsafe after an unclean shutdown: the
//! directory may match its signature file while the contents were killed
//! mid-write. The marker is a diagnostic aid — both writing and clearing
//! are best-effort and never fail the stage.

use crate::cache::CacheClass;
use crate::error::best_effort;
use crate::jsonio;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Contents of a marker file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerInfo {
    pub owner_pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Handle returned by `mark`, consumed by `clear`
#[derive(Debug)]
pub struct MarkerHandle {
    path: PathBuf,
}

/// Marker store over the marker directory
#[derive(Debug, Clone)]
pub struct InProgressMarker {
    dir: PathBuf,
}

impl InProgressMarker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn marker_path(&self, class: CacheClass) -> PathBuf {
        self.dir.join(format!("{}.json", class.name()))
    }

    /// Write the marker for `class`; failure is logged and ignored
    pub fn mark(&self, class: CacheClass, started_at: DateTime<Utc>) -> MarkerHandle {
        let path = self.marker_path(class);
        let info = MarkerInfo {
            owner_pid: std::process::id(),
            started_at,
        };
        best_effort(
            "writing in-progress marker",
            jsonio::atomic_write_json(&path, &info),
        );
        MarkerHandle { path }
    }

    /// Delete the marker; failure is logged and ignored
    pub fn clear(&self, handle: MarkerHandle) {
        if let Err(e) = std::fs::remove_file(&handle.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "failed to clear in-progress marker {}: {}",
                    handle.path.display(),
                    e
                );
            }
        }
    }

    /// Whether a marker exists for `class`
    pub fn exists(&self, class: CacheClass) -> bool {
        self.marker_path(class).exists()
    }

    /// Read the marker's contents if present and parseable
    pub fn read(&self, class: CacheClass) -> Option<MarkerInfo> {
        let path = self.marker_path(class);
        if !path.exists() {
            return None;
        }
        read_marker(&path)
    }
}

fn read_marker(path: &Path) -> Option<MarkerInfo> {
    let value = jsonio::read_json_value(path).ok()?;
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn mark_and_clear() {
        let temp = TempDir::new().unwrap();
        let markers = InProgressMarker::new(temp.path());

        let handle = markers.mark(CacheClass::DeepGemm, Utc::now());
        assert!(markers.exists(CacheClass::DeepGemm));

        let info = markers.read(CacheClass::DeepGemm).unwrap();
        assert_eq!(info.owner_pid, std::process::id());

        markers.clear(handle);
        assert!(!markers.exists(CacheClass::DeepGemm));
    }

    #[test]
    fn mark_in_unwritable_dir_is_silent() {
        // A path that cannot exist as a directory: parent is a file.
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("not_a_dir");
        std::fs::write(&file, b"x").unwrap();

        let markers = InProgressMarker::new(file.join("markers"));
        let handle = markers.mark(CacheClass::MoeTune, Utc::now());
        assert!(!markers.exists(CacheClass::MoeTune));
        markers.clear(handle);
    }

    #[test]
    fn clear_missing_marker_is_silent() {
        let temp = TempDir::new().unwrap();
        let markers = InProgressMarker::new(temp.path());

        let handle = markers.mark(CacheClass::Inductor, Utc::now());
        std::fs::remove_file(temp.path().join("inductor.json")).unwrap();
        markers.clear(handle);
    }

    #[test]
    fn unparseable_marker_reads_none_but_exists() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("flashinfer.json"), b"{ broken").unwrap();

        let markers = InProgressMarker::new(temp.path());
        assert!(markers.exists(CacheClass::Flashinfer));
        assert!(markers.read(CacheClass::Flashinfer).is_none());
    }
}
