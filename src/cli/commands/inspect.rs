//! Inspect command - live snapshot of the cache directories

use crate::cache::{CacheClass, CacheLayout, DirStats, InProgressMarker};
use crate::cli::args::InspectArgs;
use crate::config::Config;
use crate::error::KilnResult;
use serde_json::{Map, Value};

/// Execute the inspect command
pub async fn execute(args: InspectArgs, config: &Config) -> KilnResult<()> {
    let root = args
        .cache_root
        .unwrap_or_else(|| config.paths.cache_root.clone());
    let layout = CacheLayout::new(root);
    let markers = InProgressMarker::new(layout.marker_dir());

    let mut snapshot = Map::new();
    snapshot.insert("schema_version".to_string(), Value::from("1"));

    for class in CacheClass::all() {
        let dir = layout.class_dir(*class);
        let stats = DirStats::scan(&dir);
        let partial = markers.exists(*class);

        let mut entry = Map::new();
        entry.insert("path".to_string(), Value::from(dir.display().to_string()));
        entry.insert("exists".to_string(), Value::from(stats.exists));
        entry.insert("size_bytes".to_string(), Value::from(stats.size_bytes));
        entry.insert("file_count".to_string(), Value::from(stats.file_count));
        entry.insert(
            "latest_mtime_iso".to_string(),
            stats
                .latest_mtime_iso()
                .map(Value::from)
                .unwrap_or(Value::Null),
        );
        entry.insert(
            "valid".to_string(),
            Value::from(stats.is_populated() && !partial),
        );
        entry.insert("partial".to_string(), Value::from(partial));
        if partial {
            entry.insert(
                "reason".to_string(),
                Value::from("in_progress_or_aborted"),
            );
            let info = markers
                .read(*class)
                .and_then(|info| serde_json::to_value(info).ok())
                .unwrap_or(Value::Null);
            entry.insert("partial_info".to_string(), info);
        }

        snapshot.insert(class.name().to_string(), Value::Object(entry));
    }

    println!("{}", serde_json::to_string_pretty(&Value::Object(snapshot))?);
    Ok(())
}
