//! Durable JSON file helpers
//!
//! Signature files, markers, the aggregated tuning table and the run record
//! all go through the same atomic replace: write a temp file, flush, fsync,
//! rename over the target, fsync the containing directory. A reader never
//! observes a half-written file; an interrupted write leaves the original
//! intact.

use crate::error::{KilnError, KilnResult};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Atomically replace `path` with pretty-printed JSON of `value`.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> KilnResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| KilnError::Internal(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(parent)
        .map_err(|e| KilnError::io(format!("creating directory {}", parent.display()), e))?;

    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');

    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|e| KilnError::io(format!("creating temp file {}", tmp.display()), e))?;
    file.write_all(&body)
        .map_err(|e| KilnError::io(format!("writing temp file {}", tmp.display()), e))?;
    file.flush()
        .map_err(|e| KilnError::io(format!("flushing temp file {}", tmp.display()), e))?;
    file.sync_all()
        .map_err(|e| KilnError::io(format!("syncing temp file {}", tmp.display()), e))?;
    drop(file);

    fs::rename(&tmp, path)
        .map_err(|e| KilnError::io(format!("renaming {} over {}", tmp.display(), path.display()), e))?;

    // fsync the directory so the rename itself is durable
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| KilnError::io(format!("syncing directory {}", parent.display()), e))?;

    Ok(())
}

/// Read and parse a JSON file into a value.
pub fn read_json_value(path: &Path) -> KilnResult<serde_json::Value> {
    let content = fs::read_to_string(path)
        .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_and_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("record.json");

        atomic_write_json(&path, &serde_json::json!({"status": "ok"})).unwrap();
        let value = read_json_value(&path).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn replaces_existing_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("record.json");

        atomic_write_json(&path, &serde_json::json!({"v": 1})).unwrap();
        atomic_write_json(&path, &serde_json::json!({"v": 2})).unwrap();

        let value = read_json_value(&path).unwrap();
        assert_eq!(value["v"], 2);
    }

    #[test]
    fn creates_missing_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a/b/record.json");

        atomic_write_json(&path, &serde_json::json!([])).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn stale_temp_file_does_not_clobber_target() {
        // A temp file left behind by an interrupted writer must not affect
        // the original until a complete write renames over it.
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("record.json");
        atomic_write_json(&path, &serde_json::json!({"v": 1})).unwrap();

        fs::write(path.with_extension("json.tmp"), b"{ partial").unwrap();
        let value = read_json_value(&path).unwrap();
        assert_eq!(value["v"], 1);
    }
}
