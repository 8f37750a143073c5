//! Fused-MoE autotuning stage
//!
//! The unit of work here is a batch size, not the whole class: batch sizes
//! already present in the aggregated configuration table are skipped
//! individually, the tuner only runs for the missing ones, and the merged
//! table is written back sorted by numeric key. A run where every requested
//! batch was already tuned is a noop.

use crate::cache::signature::SIGNATURE_FILE;
use crate::cache::CacheClass;
use crate::error::best_effort;
use crate::exec::{run_logged, CommandSpec};
use crate::jsonio;
use crate::pipeline::report::{FailureKind, StageResult, StageStatus};
use crate::pipeline::{StageContext, StageMode};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::time::Instant;

/// Requested batch-size selection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BatchSpec {
    /// Use the configured batch list (or one untargeted tuner run)
    #[default]
    Default,
    /// One untargeted tuner run covering the tuner's full sweep
    All,
    /// Explicit batch sizes
    List(Vec<u32>),
}

impl BatchSpec {
    /// String recorded in the run settings
    pub fn recorded(&self) -> String {
        match self {
            Self::Default => "default".to_string(),
            Self::All => "all".to_string(),
            Self::List(batches) => batches
                .iter()
                .map(|b| b.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Parse a --moe-batch-sizes value: a comma list of positive integers or
/// the word `all`. An empty string means the configured default.
pub fn parse_batch_spec(spec: &str) -> Result<BatchSpec, String> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(BatchSpec::Default);
    }
    if spec.eq_ignore_ascii_case("all") {
        return Ok(BatchSpec::All);
    }

    let mut batches = vec![];
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let value: u32 = part
            .parse()
            .map_err(|_| format!("invalid batch size '{}'; use integers or 'all'", part))?;
        if value == 0 {
            return Err("batch sizes must be positive integers".to_string());
        }
        batches.push(value);
    }

    if batches.is_empty() {
        Ok(BatchSpec::Default)
    } else {
        Ok(BatchSpec::List(batches))
    }
}

pub(crate) async fn run_stage(ctx: &StageContext, mode: StageMode) -> StageResult {
    let class = CacheClass::MoeTune;

    if ctx.layout.check_writable(class).is_err() {
        return StageResult::failed(
            class,
            FailureKind::CacheUnwritable,
            0.0,
            Map::new(),
            vec![format!(
                "not writable: {}",
                ctx.layout.class_dir(class).display()
            )],
        );
    }

    if !dependency_available(ctx).await {
        return StageResult::failed(
            class,
            FailureKind::DependencyMissing,
            0.0,
            Map::new(),
            vec!["tuner dependency probe failed (distributed tuning library unavailable)".to_string()],
        );
    }

    let dtype = ctx.moe_dtype.clone();
    let out_dir = table_dir(ctx);
    if std::fs::create_dir_all(&out_dir).is_err() {
        return StageResult::failed(
            class,
            FailureKind::CacheUnwritable,
            0.0,
            Map::new(),
            vec![format!("not writable: {}", out_dir.display())],
        );
    }

    let signature = ctx.signature(class);
    let sig_path = ctx.layout.class_dir(class).join(SIGNATURE_FILE);

    // Batch targets: an explicit list runs per batch, otherwise one
    // untargeted tuner invocation covers the tuner's own sweep.
    let targets: Vec<Option<u32>> = match resolved_batches(ctx) {
        Some(batches) => batches.into_iter().map(Some).collect(),
        None => vec![None],
    };

    let mut aggregated = match newest_table(&out_dir, dtype.as_deref()) {
        Some(path) => load_table(&path),
        None => Map::new(),
    };
    if mode == StageMode::Rebuild {
        aggregated = Map::new();
    }

    if mode == StageMode::Ensure
        && signature.matches_persisted(&sig_path)
        && !ctx.markers.exists(class)
        && all_present(&targets, &aggregated)
    {
        let skipped: Vec<u32> = targets.iter().flatten().copied().collect();
        return StageResult::noop(table_artifacts(
            &aggregated,
            None,
            &[],
            &skipped,
            dtype.as_deref(),
            &ctx.env.triton_version,
        ));
    }

    let stage_cfg = &ctx.config.stages.moe;
    if !ctx
        .lock
        .acquire(class, Duration::from_secs(stage_cfg.lock_timeout_s))
        .await
    {
        return StageResult::failed(
            class,
            FailureKind::LockTimeout,
            0.0,
            Map::new(),
            vec!["tuner lock held too long".to_string()],
        );
    }

    let marker = ctx.markers.mark(class, ctx.started_at);
    let result = tune_batches(ctx, mode, &out_dir, targets, aggregated, dtype.as_deref()).await;

    if matches!(result.status, StageStatus::Ok | StageStatus::Noop) {
        best_effort("persisting tuning signature", signature.persist(&sig_path));
    }

    ctx.markers.clear(marker);
    ctx.lock.release(class);
    result
}

async fn tune_batches(
    ctx: &StageContext,
    mode: StageMode,
    out_dir: &Path,
    targets: Vec<Option<u32>>,
    mut aggregated: Map<String, Value>,
    dtype: Option<&str>,
) -> StageResult {
    let class = CacheClass::MoeTune;
    let mut completed: Vec<u32> = vec![];
    let mut skipped: Vec<u32> = vec![];
    let mut table_path: Option<PathBuf> = None;
    let t0 = Instant::now();

    for target in targets {
        if let Some(batch) = target {
            let present = mode != StageMode::Rebuild && aggregated.contains_key(&batch.to_string());
            if present {
                skipped.push(batch);
                continue;
            }
        }

        let spec = match tuner_command(ctx, out_dir, target, dtype) {
            Ok(spec) => spec,
            Err(e) => {
                return StageResult::failed(
                    class,
                    FailureKind::ConfigMissing,
                    t0.elapsed().as_secs_f64(),
                    Map::new(),
                    vec![e.to_string()],
                )
            }
        };

        let code = match run_logged(&spec, ctx.log_file.as_deref(), class.name()).await {
            Ok(code) => code,
            Err(e) => {
                return StageResult::failed(
                    class,
                    FailureKind::ExecutionError,
                    t0.elapsed().as_secs_f64(),
                    Map::new(),
                    vec![e.to_string()],
                )
            }
        };
        if code != 0 {
            return StageResult::failed(
                class,
                FailureKind::ExecutionError,
                t0.elapsed().as_secs_f64(),
                Map::new(),
                vec![format!("tuner exited with code {}", code)],
            );
        }

        let Some(newest) = newest_table(out_dir, None) else {
            return StageResult::failed(
                class,
                FailureKind::ConfigMissing,
                t0.elapsed().as_secs_f64(),
                Map::new(),
                vec!["tuner produced no configuration file".to_string()],
            );
        };

        let entries = match jsonio::read_json_value(&newest) {
            Ok(Value::Object(entries)) => entries,
            Ok(_) => {
                return StageResult::failed(
                    class,
                    FailureKind::ConfigParseError,
                    t0.elapsed().as_secs_f64(),
                    Map::new(),
                    vec![format!("{} is not a JSON object", newest.display())],
                )
            }
            Err(e) => {
                return StageResult::failed(
                    class,
                    FailureKind::ConfigParseError,
                    t0.elapsed().as_secs_f64(),
                    Map::new(),
                    vec![e.to_string()],
                )
            }
        };

        completed.extend(
            entries
                .keys()
                .filter_map(|k| k.parse::<u32>().ok()),
        );
        aggregated = merge_sorted(aggregated, entries);
        if let Err(e) = jsonio::atomic_write_json(&newest, &Value::Object(aggregated.clone())) {
            return StageResult::failed(
                class,
                FailureKind::ExecutionError,
                t0.elapsed().as_secs_f64(),
                Map::new(),
                vec![format!("writing merged table: {}", e)],
            );
        }
        table_path = Some(newest);
    }

    completed.sort_unstable();
    completed.dedup();
    skipped.sort_unstable();
    skipped.dedup();

    let artifacts = table_artifacts(
        &aggregated,
        table_path.as_deref(),
        &completed,
        &skipped,
        dtype,
        &ctx.env.triton_version,
    );

    if completed.is_empty() {
        StageResult::noop(artifacts)
    } else {
        StageResult::ok(t0.elapsed().as_secs_f64(), artifacts)
    }
}

/// Merge new entries over existing ones, sorted by numeric key.
///
/// Non-numeric keys sort after numeric ones, by string.
pub fn merge_sorted(
    existing: Map<String, Value>,
    new_entries: Map<String, Value>,
) -> Map<String, Value> {
    let mut merged: Vec<(String, Value)> = existing.into_iter().collect();
    for (key, value) in new_entries {
        if let Some(slot) = merged.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            merged.push((key, value));
        }
    }

    merged.sort_by(|(a, _), (b, _)| sort_key(a).cmp(&sort_key(b)));
    merged.into_iter().collect()
}

fn sort_key(key: &str) -> (u8, u64, String) {
    match key.parse::<u64>() {
        Ok(n) => (0, n, String::new()),
        Err(_) => (1, 0, key.to_string()),
    }
}

fn all_present(targets: &[Option<u32>], aggregated: &Map<String, Value>) -> bool {
    targets.iter().all(|target| match target {
        Some(batch) => aggregated.contains_key(&batch.to_string()),
        // untargeted runs reuse any non-empty table
        None => !aggregated.is_empty(),
    })
}

fn resolved_batches(ctx: &StageContext) -> Option<Vec<u32>> {
    match &ctx.batch_spec {
        BatchSpec::List(batches) => Some(batches.clone()),
        BatchSpec::All => None,
        BatchSpec::Default => {
            let configured = &ctx.config.stages.moe.batch_sizes;
            if configured.is_empty() {
                None
            } else {
                Some(configured.clone())
            }
        }
    }
}

/// Table directory versioned by the Triton release that produced it
fn table_dir(ctx: &StageContext) -> PathBuf {
    let triton = ctx.env.triton_version.replace('.', "_");
    ctx.layout
        .class_dir(CacheClass::MoeTune)
        .join("configs")
        .join(format!("triton_{}", triton))
}

/// Newest configuration table in the directory, optionally filtered by the
/// dtype marker embedded in tuner output file names
fn newest_table(dir: &Path, dtype: Option<&str>) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                return None;
            }
            if let Some(dtype) = dtype {
                let name = path.file_name()?.to_string_lossy().to_string();
                if !name.contains(&format!("dtype={}", dtype)) {
                    return None;
                }
            }
            let mtime = entry.metadata().ok()?.modified().ok()?;
            Some((mtime, path))
        })
        .collect();

    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.into_iter().next().map(|(_, path)| path)
}

fn load_table(path: &Path) -> Map<String, Value> {
    match jsonio::read_json_value(path) {
        Ok(Value::Object(entries)) => entries,
        _ => {
            tracing::warn!("ignoring unparseable tuning table {}", path.display());
            Map::new()
        }
    }
}

fn table_artifacts(
    aggregated: &Map<String, Value>,
    table_path: Option<&Path>,
    completed: &[u32],
    skipped: &[u32],
    dtype: Option<&str>,
    triton_version: &str,
) -> Map<String, Value> {
    let mut available: Vec<u64> = aggregated
        .keys()
        .filter_map(|k| k.parse::<u64>().ok())
        .collect();
    available.sort_unstable();

    let mut artifacts = Map::new();
    if let Some(path) = table_path {
        artifacts.insert(
            "config_file".to_string(),
            Value::from(path.display().to_string()),
        );
        artifacts.insert("config_hash".to_string(), file_hash(path));
    }
    artifacts.insert("triton_version".to_string(), Value::from(triton_version));
    artifacts.insert("verified_in_log".to_string(), Value::from(false));
    artifacts.insert("available_batch_sizes".to_string(), Value::from(available));
    artifacts.insert(
        "new_batch_sizes".to_string(),
        Value::from(completed.to_vec()),
    );
    artifacts.insert(
        "skipped_batch_sizes".to_string(),
        Value::from(skipped.to_vec()),
    );
    artifacts.insert("dtype".to_string(), Value::from(dtype.unwrap_or("")));
    artifacts
}

/// sha256 of the merged table file
fn file_hash(path: &Path) -> Value {
    match std::fs::read(path) {
        Ok(bytes) => {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            Value::from(hex::encode(hasher.finalize()))
        }
        Err(_) => Value::Null,
    }
}

async fn dependency_available(ctx: &StageContext) -> bool {
    let probe = &ctx.config.stages.moe.dependency_probe;
    let Some((program, args)) = probe.split_first() else {
        // no probe configured means no dependency requirement
        return true;
    };
    tokio::process::Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

fn tuner_command(
    ctx: &StageContext,
    out_dir: &Path,
    batch: Option<u32>,
    dtype: Option<&str>,
) -> crate::error::KilnResult<CommandSpec> {
    let mut argv = ctx.config.stages.moe.tuner.clone();
    argv.push("--model".to_string());
    argv.push(ctx.model.clone());
    argv.push("--tp".to_string());
    argv.push(ctx.tp.to_string());
    argv.push("--tune".to_string());
    if let Some(dtype) = dtype {
        argv.push("--dtype".to_string());
        argv.push(dtype.to_string());
    }
    if let Some(batch) = batch {
        argv.push("--batch-size".to_string());
        argv.push(batch.to_string());
    }

    Ok(CommandSpec::new(argv)?
        .env(ctx.subprocess_env())
        .cwd(out_dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_spec_variants() {
        assert_eq!(parse_batch_spec("").unwrap(), BatchSpec::Default);
        assert_eq!(parse_batch_spec("  all ").unwrap(), BatchSpec::All);
        assert_eq!(
            parse_batch_spec("512,4096").unwrap(),
            BatchSpec::List(vec![512, 4096])
        );
        assert_eq!(parse_batch_spec(" 1, ,2 ").unwrap(), BatchSpec::List(vec![1, 2]));
    }

    #[test]
    fn parse_spec_rejects_garbage() {
        assert!(parse_batch_spec("12,foo").is_err());
        assert!(parse_batch_spec("0").is_err());
        assert!(parse_batch_spec("-4").is_err());
    }

    #[test]
    fn recorded_spec_strings() {
        assert_eq!(BatchSpec::Default.recorded(), "default");
        assert_eq!(BatchSpec::All.recorded(), "all");
        assert_eq!(BatchSpec::List(vec![512, 4096]).recorded(), "512,4096");
    }

    fn table(entries: &[(&str, u64)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn merge_sorts_numerically() {
        let existing = table(&[("512", 1), ("64", 2)]);
        let new_entries = table(&[("4096", 3), ("8", 4)]);

        let merged = merge_sorted(existing, new_entries);
        let keys: Vec<&String> = merged.keys().collect();
        assert_eq!(keys, ["8", "64", "512", "4096"]);
    }

    #[test]
    fn merge_overwrites_existing_keys() {
        let existing = table(&[("512", 1)]);
        let new_entries = table(&[("512", 9)]);

        let merged = merge_sorted(existing, new_entries);
        assert_eq!(merged["512"], 9);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn merge_puts_non_numeric_keys_last() {
        let merged = merge_sorted(table(&[("note", 0)]), table(&[("16", 1)]));
        let keys: Vec<&String> = merged.keys().collect();
        assert_eq!(keys, ["16", "note"]);
    }

    #[test]
    fn all_present_logic() {
        let aggregated = table(&[("512", 1)]);
        assert!(all_present(&[Some(512)], &aggregated));
        assert!(!all_present(&[Some(512), Some(4096)], &aggregated));
        // untargeted: any non-empty table counts
        assert!(all_present(&[None], &aggregated));
        assert!(!all_present(&[None], &Map::new()));
    }

    #[test]
    fn newest_table_filters_by_dtype() {
        let temp = tempfile::TempDir::new().unwrap();
        let old = temp.path().join("E=8,N=7168,dtype=fp8_w8a8.json");
        let other = temp.path().join("E=8,N=7168.json");
        std::fs::write(&old, "{}").unwrap();
        std::fs::write(&other, "{}").unwrap();

        let found = newest_table(temp.path(), Some("fp8_w8a8")).unwrap();
        assert_eq!(found, old);
        assert!(newest_table(temp.path(), Some("int8_w8a16")).is_none());
        assert!(newest_table(temp.path(), None).is_some());
    }
}
