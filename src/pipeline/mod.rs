//! Cache staging pipeline
//!
//! Drives the four artifact classes in fixed order: kernel compilation,
//! MoE autotuning, then the two warm-up classes sharing one ephemeral
//! server port. Stage failures are isolated — one class's error never
//! prevents the next class from being attempted — and everything ends in
//! one durable, atomically-written run record.

pub mod compile;
pub mod report;
pub mod tune;
pub mod warmup;

use crate::cache::{CacheClass, CacheLayout, DirStats, InProgressMarker, Signature, StageLock};
use crate::config::Config;
use crate::environment::EnvSnapshot;
use crate::error::{best_effort, KilnError, KilnResult};
use crate::exec::ServingBackend;
use crate::manifest::RunManifest;
use crate::telemetry::{self, TelemetryProbe};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use report::{FailureKind, RunRecord, RunReporter, StageResult};
use serde_json::{Map, Value};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use tracing::info;
use tune::BatchSpec;

/// Per-class processing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StageMode {
    /// Reuse the cache when its signature still matches
    Ensure,
    /// Regenerate even if the signature matches
    Rebuild,
    /// Do not touch this class at all
    Skip,
}

impl StageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ensure => "ensure",
            Self::Rebuild => "rebuild",
            Self::Skip => "skip",
        }
    }
}

/// Mode per artifact class
#[derive(Debug, Clone, Copy)]
pub struct StageModes {
    pub deep_gemm: StageMode,
    pub moe: StageMode,
    pub flashinfer: StageMode,
    pub inductor: StageMode,
}

impl Default for StageModes {
    fn default() -> Self {
        Self {
            deep_gemm: StageMode::Ensure,
            moe: StageMode::Ensure,
            flashinfer: StageMode::Ensure,
            inductor: StageMode::Ensure,
        }
    }
}

/// Caller-facing pipeline inputs
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub model: Option<String>,
    pub tp: u32,
    pub modes: StageModes,
    pub batch_spec: BatchSpec,
    pub moe_dtype: Option<String>,
    pub telemetry_ping: bool,
}

/// Shared per-run state handed to each stage
pub(crate) struct StageContext {
    pub config: Config,
    pub layout: CacheLayout,
    pub lock: StageLock,
    pub markers: InProgressMarker,
    pub env: EnvSnapshot,
    pub model: String,
    pub model_slug: String,
    pub tp: u32,
    pub batch_spec: BatchSpec,
    pub moe_dtype: Option<String>,
    pub log_file: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

impl StageContext {
    pub(crate) fn signature(&self, class: CacheClass) -> Signature {
        Signature::compute(
            class,
            &self.env,
            &self.model_slug,
            self.tp,
            &self.config.server,
            self.moe_dtype.as_deref(),
        )
    }

    /// Reuse gate: signature match AND populated directory AND no live
    /// marker. A marker makes the directory unsafe regardless of signature.
    pub(crate) fn noop_stats(
        &self,
        class: CacheClass,
        signature: &Signature,
        sig_path: &Path,
        dir: &Path,
    ) -> Option<DirStats> {
        if self.markers.exists(class) {
            return None;
        }
        if !signature.matches_persisted(sig_path) {
            return None;
        }
        let stats = DirStats::scan(dir);
        stats.is_populated().then_some(stats)
    }

    pub(crate) fn subprocess_env(&self) -> Vec<(String, String)> {
        self.layout
            .env_map()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

/// Outcome of one pipeline run
#[derive(Debug)]
pub struct RunOutcome {
    pub record_path: PathBuf,
    pub record: RunRecord,
}

impl RunOutcome {
    /// `class:status` pairs in stage order, for the status summary line
    pub fn summary(&self) -> String {
        CacheClass::all()
            .iter()
            .filter_map(|class| {
                self.record
                    .stages
                    .get(class.name())
                    .map(|stage| format!("{}:{}", class.name(), stage["status"].as_str().unwrap_or("?")))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One run of the staging pipeline
pub struct Pipeline {
    ctx: StageContext,
    modes: StageModes,
    telemetry_ping: bool,
    manifest: RunManifest,
    reporter: RunReporter,
    run_id: String,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("telemetry_ping", &self.telemetry_ping)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Resolve inputs and probe the environment (fatal on missing model)
    pub async fn prepare(
        config: Config,
        options: PipelineOptions,
        manifest: RunManifest,
    ) -> KilnResult<Self> {
        let env = EnvSnapshot::collect(&config.paths.source_tree, manifest.git_revision()).await;
        Self::with_env(config, options, manifest, env)
    }

    /// Assemble a pipeline with an already-collected snapshot
    pub fn with_env(
        config: Config,
        options: PipelineOptions,
        manifest: RunManifest,
        env: EnvSnapshot,
    ) -> KilnResult<Self> {
        let model = options
            .model
            .filter(|m| !m.trim().is_empty())
            .or_else(|| {
                config
                    .model
                    .default_path
                    .clone()
                    .filter(|m| !m.trim().is_empty())
            })
            .ok_or(KilnError::ModelUnresolved)?;
        let model_slug = model_slug(&model);

        let run_id = manifest.run_id();
        let out_dir = manifest.run_dir().join(&run_id);
        let reporter = RunReporter::new(out_dir);

        let layout = CacheLayout::new(&config.paths.cache_root);
        let lock = StageLock::new(layout.lock_dir());
        let markers = InProgressMarker::new(layout.marker_dir());
        let moe_dtype = options
            .moe_dtype
            .filter(|d| !d.trim().is_empty())
            .or_else(|| config.stages.moe.dtype.clone());

        let ctx = StageContext {
            log_file: manifest.log_file(),
            layout,
            lock,
            markers,
            env,
            model,
            model_slug,
            tp: options.tp.max(1),
            batch_spec: options.batch_spec,
            moe_dtype,
            started_at: Utc::now(),
            config,
        };

        Ok(Self {
            ctx,
            modes: options.modes,
            telemetry_ping: options.telemetry_ping,
            manifest,
            reporter,
            run_id,
        })
    }

    /// Run every configured stage and write the run record.
    pub async fn run(self, backend: &dyn ServingBackend) -> KilnResult<RunOutcome> {
        self.ctx.layout.ensure_dirs()?;

        let t0 = Instant::now();
        let mut run_value = self.run_metadata();
        let mut results: Vec<(CacheClass, StageResult)> = vec![];

        // Kernel compilation
        let result = match self.modes.deep_gemm {
            StageMode::Skip => StageResult::skipped(CacheClass::DeepGemm),
            mode => compile::run_stage(&self.ctx, mode).await,
        };
        self.finish_stage(CacheClass::DeepGemm, result, &mut results);

        // MoE autotuning
        let result = match self.modes.moe {
            StageMode::Skip => StageResult::skipped(CacheClass::MoeTune),
            mode => tune::run_stage(&self.ctx, mode).await,
        };
        self.finish_stage(CacheClass::MoeTune, result, &mut results);

        // Warm-up classes share one pre-checked port; a busy port
        // short-circuits both without attempting either server start.
        let port = self.ctx.config.server.warmup_port;
        let warmup_wanted =
            self.modes.flashinfer != StageMode::Skip || self.modes.inductor != StageMode::Skip;
        let port_ok = !warmup_wanted || port_is_free(port);

        for (class, mode) in [
            (CacheClass::Flashinfer, self.modes.flashinfer),
            (CacheClass::Inductor, self.modes.inductor),
        ] {
            let result = if mode == StageMode::Skip {
                StageResult::skipped(class)
            } else if !port_ok {
                StageResult::failed(
                    class,
                    FailureKind::PortBusy,
                    0.0,
                    Map::new(),
                    vec![format!("port {} is busy", port)],
                )
            } else {
                warmup::run_stage(&self.ctx, class, mode, backend, port).await
            };
            self.finish_stage(class, result, &mut results);
        }

        // Post-hoc verification is additive; re-persist the annotated stage
        if warmup::verify_moe_consumption(self.ctx.log_file.as_deref(), &mut results) {
            if let Some((_, moe)) = results
                .iter()
                .find(|(class, _)| *class == CacheClass::MoeTune)
            {
                self.reporter.record_stage(CacheClass::MoeTune, moe);
            }
        }

        let probe = self.telemetry_probe().await;

        run_value["finished_at"] = Value::from(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        run_value["duration_s"] =
            Value::from((t0.elapsed().as_secs_f64() * 1000.0).round() / 1000.0);

        let record = RunRecord::new(run_value, serde_json::to_value(&probe)?);
        let (record_path, record) = self.reporter.finalize(record, &results)?;

        best_effort(
            "updating run manifest with prep_result",
            self.manifest.annotate_prep_result(&record_path, &self.run_id),
        );

        Ok(RunOutcome {
            record_path,
            record,
        })
    }

    fn finish_stage(
        &self,
        class: CacheClass,
        result: StageResult,
        results: &mut Vec<(CacheClass, StageResult)>,
    ) {
        info!("stage {} finished: {}", class, result.status);
        self.reporter.record_stage(class, &result);
        results.push((class, result));
    }

    async fn telemetry_probe(&self) -> TelemetryProbe {
        if !self.telemetry_ping {
            return TelemetryProbe::pending(&self.run_id);
        }
        let run_id = self.run_id.clone();
        tokio::task::spawn_blocking(move || telemetry::probe(&run_id))
            .await
            .unwrap_or_else(|_| TelemetryProbe::pending(&self.run_id))
    }

    /// Run-level metadata snapshot recorded before any stage runs
    fn run_metadata(&self) -> Value {
        let env = &self.ctx.env;
        let config = &self.ctx.config;

        let env_roles: Map<String, Value> = self
            .ctx
            .layout
            .env_map()
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::from(v)))
            .collect();

        serde_json::json!({
            "run_id": self.run_id,
            "model_slug": self.ctx.model_slug,
            "tp": self.ctx.tp,
            "device_name": env.device_name,
            "compute_capability": env.compute_capability,
            "cuda": env.cuda,
            "driver_version": env.driver_version,
            "torch_version": env.torch_version,
            "triton_version": env.triton_version,
            "flashinfer_version": env.flashinfer_version,
            "source_revision": env.source_revision,
            "started_at": self.ctx.started_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "finished_at": Value::Null,
            "duration_s": Value::Null,
            "settings": {
                "source": "flags",
                "tp": self.ctx.tp,
                "warmup_port": config.server.warmup_port,
                "mem_fraction": config.server.mem_fraction_static,
                "write_mode": "atomic",
                "env": env_roles,
                "server_defaults": serde_json::to_value(&config.server).unwrap_or(Value::Null),
                "moe": {
                    "mode": self.modes.moe.as_str(),
                    "batch_spec": self.ctx.batch_spec.recorded(),
                    "dtype": self.ctx.moe_dtype.clone().unwrap_or_default(),
                },
            },
        })
    }
}

/// Whether the warm-up port can be bound right now
fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

fn model_slug(model: &str) -> String {
    let trimmed = model.trim_end_matches('/');
    trimmed
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(trimmed)
        .to_string()
}
