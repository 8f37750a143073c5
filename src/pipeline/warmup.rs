//! Warm-up stages
//!
//! FlashInfer and TorchInductor caches only materialize as a side effect of
//! serving real requests, so these stages briefly run the serving process
//! on the pre-checked private port, require readiness AND one successful
//! probe request, and then tear the server down. The two failure modes get
//! distinct classifications so operators can tell capacity problems from
//! protocol problems.

use crate::cache::signature::SIGNATURE_FILE;
use crate::cache::{CacheClass, DirStats};
use crate::error::best_effort;
use crate::exec::{ServerSpec, ServingBackend};
use crate::pipeline::report::{FailureKind, StageResult, StageStatus};
use crate::pipeline::{StageContext, StageMode};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

/// Marker line the serving process logs when it consumes a tuned table
const CONSUMING_MARKER: &str = "Using MoE kernel config from ";

pub(crate) async fn run_stage(
    ctx: &StageContext,
    class: CacheClass,
    mode: StageMode,
    backend: &dyn ServingBackend,
    port: u16,
) -> StageResult {
    debug_assert!(matches!(
        class,
        CacheClass::Flashinfer | CacheClass::Inductor
    ));

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

    let cache_dir = ctx.layout.class_dir(class);
    let signature = ctx.signature(class);
    let sig_path = cache_dir.join(SIGNATURE_FILE);

    if mode == StageMode::Ensure {
        if let Some(stats) = ctx.noop_stats(class, &signature, &sig_path, &cache_dir) {
            return StageResult::noop(dir_artifacts(&cache_dir, &stats, None));
        }
    }

    let stage_cfg = match class {
        CacheClass::Inductor => &ctx.config.stages.inductor,
        _ => &ctx.config.stages.flashinfer,
    };

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
            vec!["lock held too long".to_string()],
        );
    }

    let marker = ctx.markers.mark(class, ctx.started_at);
    let t0 = Instant::now();

    let spec = ServerSpec {
        model: ctx.model.clone(),
        tp: ctx.tp,
        port,
        enable_compile: matches!(class, CacheClass::Inductor),
        trust_remote_code: ctx.config.model.trust_remote_code,
        server: ctx.config.server.clone(),
        env: ctx.subprocess_env(),
        log_path: ctx.log_file.clone(),
    };

    let result = match backend.start(&spec).await {
        Ok(mut handle) => {
            let ready = backend
                .wait_ready(
                    &mut handle,
                    Duration::from_secs(stage_cfg.warmup_timeout_s),
                )
                .await;
            let probed = ready && backend.send_probe(&handle).await;
            let cleanup = backend
                .stop(handle, Duration::from_secs(ctx.config.server.stop_timeout_s))
                .await;
            let duration = t0.elapsed().as_secs_f64();

            if ready && probed {
                best_effort("persisting warm-up signature", signature.persist(&sig_path));
                let stats = DirStats::scan(&cache_dir);
                let cleanup_value = serde_json::to_value(&cleanup).unwrap_or(Value::Null);
                StageResult::ok(duration, dir_artifacts(&cache_dir, &stats, Some(cleanup_value)))
            } else {
                let (kind, message) = if ready {
                    (FailureKind::RequestFailed, "warm-up probe request failed")
                } else {
                    (FailureKind::WarmupTimeout, "server did not become ready")
                };
                let mut artifacts = Map::new();
                if let Ok(value) = serde_json::to_value(&cleanup) {
                    artifacts.insert("cleanup".to_string(), value);
                }
                StageResult::failed(class, kind, duration, artifacts, vec![message.to_string()])
            }
        }
        Err(e) => StageResult::failed(
            class,
            FailureKind::ExecutionError,
            t0.elapsed().as_secs_f64(),
            Map::new(),
            vec![e.to_string()],
        ),
    };

    ctx.markers.clear(marker);
    ctx.lock.release(class);
    result
}

fn dir_artifacts(cache_dir: &Path, stats: &DirStats, cleanup: Option<Value>) -> Map<String, Value> {
    let mut artifacts = Map::new();
    artifacts.insert(
        "cache_dir".to_string(),
        Value::from(cache_dir.display().to_string()),
    );
    artifacts.insert(
        "files".to_string(),
        serde_json::json!({
            "count": stats.file_count,
            "bytes": stats.size_bytes,
            "latest_mtime_iso": stats.latest_mtime_iso(),
        }),
    );
    if let Some(cleanup) = cleanup {
        artifacts.insert("cleanup".to_string(), cleanup);
    }
    artifacts
}

/// Post-hoc verification: if a warm-up server ran and its session log shows
/// the tuned table being consumed, annotate the tuning stage's result.
///
/// Additive only — the ok/error classification never changes here.
pub fn verify_moe_consumption(
    log_file: Option<&Path>,
    results: &mut [(CacheClass, StageResult)],
) -> bool {
    let Some(log_file) = log_file else {
        return false;
    };
    let Ok(text) = std::fs::read_to_string(log_file) else {
        return false;
    };

    let warm_ok = results.iter().any(|(class, result)| {
        matches!(class, CacheClass::Flashinfer | CacheClass::Inductor)
            && result.status == StageStatus::Ok
    });
    if !warm_ok {
        return false;
    }

    let Some(basename) = parse_consuming_line(&text) else {
        return false;
    };

    let Some((_, moe)) = results
        .iter_mut()
        .find(|(class, _)| *class == CacheClass::MoeTune)
    else {
        return false;
    };
    if moe.status != StageStatus::Ok {
        return false;
    }

    moe.artifacts
        .insert("verified_in_log".to_string(), Value::from(true));
    moe.artifacts.insert(
        "consuming_config_basename".to_string(),
        Value::from(basename),
    );
    moe.artifacts
        .entry("verify_log".to_string())
        .or_insert_with(|| Value::from(log_file.display().to_string()));
    true
}

/// Extract the consumed table's basename from the last marker line
fn parse_consuming_line(text: &str) -> Option<String> {
    let line = text
        .lines()
        .rev()
        .find(|line| line.contains(CONSUMING_MARKER))?;
    let idx = line.find(CONSUMING_MARKER)?;
    let path = line[idx + CONSUMING_MARKER.len()..]
        .trim()
        .trim_end_matches('.');
    if path.is_empty() {
        return None;
    }
    let basename = path.rsplit('/').next().unwrap_or(path);
    Some(basename.to_string())
}
