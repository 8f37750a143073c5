//! Stage results and the durable run record
//!
//! Each stage's outcome is written to its own file the moment it
//! finalizes, so a crashed run leaves per-class evidence behind. The final
//! record is rebuilt from those files (tolerating unparseable ones) and
//! written exactly once with the atomic replace.

use crate::cache::CacheClass;
use crate::error::best_effort;
use crate::jsonio;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use tracing::warn;

/// Outcome class of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Ok,
    Noop,
    Skipped,
    Error,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Noop => "noop",
            Self::Skipped => "skipped",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Coarse error classification for operator triage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    LockTimeout,
    ExecutionError,
    ConfigMissing,
    ConfigParseError,
    DependencyMissing,
    PortBusy,
    WarmupTimeout,
    RequestFailed,
    CacheUnwritable,
}

/// Result of processing one artifact class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Whether generation work actually ran
    pub ran: bool,
    pub status: StageStatus,
    pub status_code: i32,
    pub duration_s: f64,
    /// Free-form artifact-location map
    pub artifacts: Map<String, Value>,
    pub error_type: Option<FailureKind>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl StageResult {
    pub fn ok(duration_s: f64, artifacts: Map<String, Value>) -> Self {
        Self {
            ran: true,
            status: StageStatus::Ok,
            status_code: 0,
            duration_s: round3(duration_s),
            artifacts,
            error_type: None,
            warnings: vec![],
            errors: vec![],
        }
    }

    pub fn noop(artifacts: Map<String, Value>) -> Self {
        Self {
            ran: false,
            status: StageStatus::Noop,
            status_code: 0,
            duration_s: 0.0,
            artifacts,
            error_type: None,
            warnings: vec![],
            errors: vec![],
        }
    }

    pub fn skipped(class: CacheClass) -> Self {
        Self {
            ran: false,
            status: StageStatus::Skipped,
            status_code: class.status_code(),
            duration_s: 0.0,
            artifacts: Map::new(),
            error_type: None,
            warnings: vec![],
            errors: vec![],
        }
    }

    pub fn failed(
        class: CacheClass,
        kind: FailureKind,
        duration_s: f64,
        artifacts: Map<String, Value>,
        errors: Vec<String>,
    ) -> Self {
        Self {
            ran: true,
            status: StageStatus::Error,
            status_code: class.status_code(),
            duration_s: round3(duration_s),
            artifacts,
            error_type: Some(kind),
            warnings: vec![],
            errors,
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// The aggregate run record written as `prep_result.json`
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub schema_version: u32,
    pub status: String,
    pub run: Value,
    pub stages: Map<String, Value>,
    pub telemetry_probe: Value,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl RunRecord {
    pub fn new(run: Value, telemetry_probe: Value) -> Self {
        Self {
            schema_version: 1,
            status: "partial".to_string(),
            run,
            stages: Map::new(),
            telemetry_probe,
            errors: vec![],
            warnings: vec![],
        }
    }
}

/// Writes per-stage files and the final record for one run
#[derive(Debug, Clone)]
pub struct RunReporter {
    out_dir: PathBuf,
}

impl RunReporter {
    /// Reporter over a run-scoped output directory
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    /// Path of the final run record
    pub fn record_path(&self) -> PathBuf {
        self.out_dir.join("prep_result.json")
    }

    fn stages_dir(&self) -> PathBuf {
        self.out_dir.join("stages")
    }

    /// Durably persist one finalized stage result (crash-visibility).
    ///
    /// Best-effort: a stage whose file cannot be written still lands in the
    /// final record through the in-memory fallback.
    pub fn record_stage(&self, class: CacheClass, result: &StageResult) {
        let path = self.stages_dir().join(format!("{}.json", class.name()));
        best_effort(
            "writing stage result file",
            jsonio::atomic_write_json(&path, result),
        );
    }

    /// Rebuild the stage map from the per-class files, preferring them over
    /// the in-memory results; unparseable files are skipped with a warning.
    pub fn collect_stages(
        &self,
        inline: &[(CacheClass, StageResult)],
    ) -> (Map<String, Value>, Vec<String>) {
        let mut stages = Map::new();
        let mut warnings = vec![];

        for (class, result) in inline {
            match serde_json::to_value(result) {
                Ok(value) => {
                    stages.insert(class.name().to_string(), value);
                }
                Err(e) => warnings.push(format!("serializing {} result: {}", class, e)),
            }
        }

        for (class, _) in inline {
            let path = self.stages_dir().join(format!("{}.json", class.name()));
            if !path.exists() {
                continue;
            }
            match jsonio::read_json_value(&path) {
                Ok(value) => {
                    stages.insert(class.name().to_string(), value);
                }
                Err(e) => {
                    warn!("failed to parse stage file {}: {}", path.display(), e);
                    warnings.push(format!("unparseable stage file {}", path.display()));
                }
            }
        }

        (stages, warnings)
    }

    /// Derive the final status, fill the record and write it atomically.
    pub fn finalize(
        &self,
        mut record: RunRecord,
        inline: &[(CacheClass, StageResult)],
    ) -> crate::error::KilnResult<(PathBuf, RunRecord)> {
        let (stages, mut warnings) = self.collect_stages(inline);
        record.stages = stages;
        record.warnings.append(&mut warnings);

        let failures: Vec<String> = record
            .stages
            .iter()
            .filter(|(_, v)| v["status"] == "error")
            .map(|(name, _)| name.clone())
            .collect();

        record.status = if failures.is_empty() {
            "ok".to_string()
        } else {
            "partial".to_string()
        };
        record.errors = failures;

        let path = self.record_path();
        jsonio::atomic_write_json(&path, &record)?;
        Ok((path, record))
    }
}
