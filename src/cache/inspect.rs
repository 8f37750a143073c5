//! Artifact directory inspection
//!
//! Size/count/freshness of a cache directory without assuming anything
//! about its internal layout. Used for noop decisions (non-empty check) and
//! for reporting. Never fails: a missing directory is a zeroed result and
//! per-entry IO errors are skipped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::SystemTime;

/// Aggregate stats for one directory tree
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirStats {
    pub exists: bool,
    pub size_bytes: u64,
    pub file_count: u64,
    pub latest_mtime: Option<DateTime<Utc>>,
}

impl DirStats {
    /// Walk `path` recursively, accumulating file sizes and mtimes
    pub fn scan(path: &Path) -> Self {
        if !path.is_dir() {
            return Self::default();
        }

        let mut stats = Self {
            exists: true,
            ..Self::default()
        };
        walk(path, &mut stats);
        stats
    }

    /// Whether the directory holds at least one file
    pub fn is_populated(&self) -> bool {
        self.exists && self.file_count > 0
    }

    /// Newest mtime formatted for JSON reports
    pub fn latest_mtime_iso(&self) -> Option<String> {
        self.latest_mtime
            .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
    }
}

fn walk(dir: &Path, stats: &mut DirStats) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };

        if meta.is_dir() {
            walk(&path, stats);
        } else if meta.is_file() {
            stats.size_bytes += meta.len();
            stats.file_count += 1;
            if let Ok(modified) = meta.modified() {
                let mtime = system_time_to_utc(modified);
                if stats.latest_mtime.is_none_or(|cur| mtime > cur) {
                    stats.latest_mtime = Some(mtime);
                }
            }
        }
    }
}

fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
