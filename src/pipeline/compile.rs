//! Ahead-of-time kernel compilation stage
//!
//! Runs the external kernel compiler under lock+marker protection, streams
//! its output to a per-model compile log and persists the reuse signature
//! on success. The compiler is a black box; the exit code decides success,
//! and the log tail is only mined for operator hints.

use crate::cache::signature::SIGNATURE_FILE;
use crate::cache::CacheClass;
use crate::error::best_effort;
use crate::exec::{run_logged, tail_lines, CommandSpec};
use crate::pipeline::report::{FailureKind, StageResult};
use crate::pipeline::{StageContext, StageMode};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

const LOG_TAIL_LINES: usize = 20;

pub(crate) async fn run_stage(ctx: &StageContext, mode: StageMode) -> StageResult {
    let class = CacheClass::DeepGemm;

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

    let signature = ctx.signature(class);
    let cache_dir = ctx.layout.class_dir(class);
    let sig_dir = cache_dir.join(&ctx.model_slug);
    let sig_path = sig_dir.join(SIGNATURE_FILE);

    if mode == StageMode::Ensure {
        if let Some(stats) = ctx.noop_stats(class, &signature, &sig_path, &cache_dir) {
            let mut artifacts = Map::new();
            artifacts.insert("signature".to_string(), signature.as_value());
            artifacts.insert(
                "files".to_string(),
                serde_json::json!({
                    "count": stats.file_count,
                    "bytes": stats.size_bytes,
                    "latest_mtime_iso": stats.latest_mtime_iso(),
                }),
            );
            return StageResult::noop(artifacts);
        }
    }

    let stage_cfg = &ctx.config.stages.deep_gemm;
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
    let _ = std::fs::create_dir_all(&sig_dir);
    let compile_log = sig_dir.join("compile.log");

    let result = match compiler_command(ctx) {
        Ok(spec) => {
            let t0 = Instant::now();
            match run_logged(&spec, Some(&compile_log), class.name()).await {
                Ok(0) => {
                    let duration = t0.elapsed().as_secs_f64();
                    best_effort("persisting compile signature", signature.persist(&sig_path));

                    let warnings = scan_compile_log(&compile_log, &ctx.config.server.kv_cache_dtype);
                    let mut artifacts = Map::new();
                    artifacts.insert(
                        "cache_dir".to_string(),
                        Value::from(cache_dir.display().to_string()),
                    );
                    artifacts.insert(
                        "compile_log".to_string(),
                        Value::from(compile_log.display().to_string()),
                    );
                    artifacts.insert("signature".to_string(), signature.as_value());
                    StageResult::ok(duration, artifacts).with_warnings(warnings)
                }
                Ok(code) => {
                    let duration = t0.elapsed().as_secs_f64();
                    let tail = tail_lines(&compile_log, LOG_TAIL_LINES);
                    let mut errors = vec![format!("kernel compiler exited with code {}", code)];
                    if let Some(hint) = classify_tail(&tail) {
                        errors.push(hint.to_string());
                    }

                    let mut artifacts = Map::new();
                    artifacts.insert(
                        "compile_log".to_string(),
                        Value::from(compile_log.display().to_string()),
                    );
                    artifacts.insert(
                        "compile_log_tail".to_string(),
                        Value::from(tail),
                    );
                    StageResult::failed(class, FailureKind::ExecutionError, duration, artifacts, errors)
                }
                Err(e) => StageResult::failed(
                    class,
                    FailureKind::ExecutionError,
                    t0.elapsed().as_secs_f64(),
                    Map::new(),
                    vec![e.to_string()],
                ),
            }
        }
        Err(e) => StageResult::failed(
            class,
            FailureKind::ConfigMissing,
            0.0,
            Map::new(),
            vec![e.to_string()],
        ),
    };

    ctx.markers.clear(marker);
    ctx.lock.release(class);
    result
}

/// Assemble the compiler invocation from config
fn compiler_command(ctx: &StageContext) -> crate::error::KilnResult<CommandSpec> {
    let stage_cfg = &ctx.config.stages.deep_gemm;
    let server = &ctx.config.server;

    let mut argv = stage_cfg.compiler.clone();
    let mut push_kv = |flag: &str, value: String| {
        argv.push(flag.to_string());
        argv.push(value);
    };

    push_kv("--model-path", ctx.model.clone());
    push_kv("--tp", ctx.tp.to_string());
    push_kv("--timeout", stage_cfg.compile_timeout_s.to_string());
    push_kv("--kv-cache-dtype", server.kv_cache_dtype.clone());
    push_kv(
        "--mem-fraction-static",
        stage_cfg.mem_fraction_static.to_string(),
    );
    push_kv(
        "--chunked-prefill-size",
        server.chunked_prefill_size.to_string(),
    );
    push_kv("--context-length", server.context_length.to_string());
    push_kv("--max-prefill-tokens", server.max_prefill_tokens.to_string());
    push_kv("--max-total-tokens", server.max_total_tokens.to_string());
    push_kv(
        "--max-mamba-cache-size",
        server.max_mamba_cache_size.to_string(),
    );
    if ctx.config.model.trust_remote_code {
        argv.push("--trust-remote-code".to_string());
    } else {
        argv.push("--no-trust-remote-code".to_string());
    }

    let mem_fraction = stage_cfg.mem_fraction_static.to_string();
    let mut env = ctx.subprocess_env();
    env.push(("SGL_COMPILE_MEM_FRACTION".to_string(), mem_fraction.clone()));
    env.push(("SGLANG_COMPILE_MEM_FRACTION".to_string(), mem_fraction));

    Ok(CommandSpec::new(argv)?.env(env))
}

/// Mine the compile log for configuration drift worth warning about
fn scan_compile_log(path: &Path, expected_dtype: &str) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return vec!["failed to read compile log for validation".to_string()];
    };
    let lower = text.to_lowercase();
    let mut warnings = vec![];

    if !lower.contains(&expected_dtype.to_lowercase()) {
        warnings.push(format!(
            "compile log does not mention '{}', kv cache dtype may not have been applied",
            expected_dtype
        ));
    }
    if lower.contains("not enough memory") && lower.contains("mem-fraction-static") {
        warnings.push("compile log reports memory pressure, check mem_fraction_static".to_string());
    }
    warnings
}

/// Map well-known failure fingerprints in the log tail to a hint
fn classify_tail(tail: &[String]) -> Option<&'static str> {
    if tail.iter().any(|l| l.to_lowercase().contains("libcuda")) {
        Some("libcuda not found, driver libraries missing from the environment")
    } else if tail.iter().any(|l| l.to_lowercase().contains("nvrtc")) {
        Some("nvrtc failure, CUDA toolkit install is incomplete")
    } else {
        None
    }
}
