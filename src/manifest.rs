//! Run manifest consumption
//!
//! The container-lifecycle tool writes a pointer file whose lines name the
//! run manifest JSON (container path, and optionally the host-visible
//! path). The pipeline consumes the manifest for the run identity and log
//! location, and annotates it with the run record's location when done.

use crate::error::{KilnError, KilnResult};
use crate::jsonio;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Environment variable overriding the pointer file location
pub const POINTER_ENV: &str = "RUN_META_FILE";

/// Default pointer file written by the lifecycle tool
pub const DEFAULT_POINTER: &str = "/telemetry/container_run_meta.env";

const CONTAINER_KEY: &str = "CONTAINER_RUN_META_JSON=";
const HOST_KEY: &str = "CONTAINER_RUN_META_JSON_HOST=";

/// Resolve the pointer file path from the environment
pub fn pointer_path() -> PathBuf {
    std::env::var(POINTER_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_POINTER))
}

/// The run manifest document plus where it lives
#[derive(Debug, Clone)]
pub struct RunManifest {
    pub path: PathBuf,
    pub host_path: Option<PathBuf>,
    pub document: Value,
}

impl RunManifest {
    /// Load the manifest named by the pointer file
    pub async fn load(pointer: &Path) -> KilnResult<Self> {
        let (path, host_path) = read_pointer(pointer).await?;

        if !path.exists() {
            return Err(KilnError::ManifestMissing(path));
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| KilnError::io(format!("reading manifest {}", path.display()), e))?;
        let document: Value =
            serde_json::from_str(&content).map_err(|e| KilnError::ManifestInvalid {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            path,
            host_path,
            document,
        })
    }

    /// Run identifier assigned by the lifecycle tool
    pub fn run_id(&self) -> String {
        self.document["container_run_id"]
            .as_str()
            .unwrap_or("unknown")
            .to_string()
    }

    /// Source revision recorded by the lifecycle tool, if any
    pub fn git_revision(&self) -> Option<&str> {
        self.document["git_revision"].as_str()
    }

    /// Session log file (container path) all generation output streams into
    pub fn log_file(&self) -> Option<PathBuf> {
        self.document["storage"]["log_file"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    /// Directory the manifest lives in; run outputs nest under it
    pub fn run_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Record the run record's location in the manifest.
    ///
    /// Re-reads the manifest first so concurrent lifecycle-tool updates are
    /// not clobbered. The host-side pointer mirrors the run-scoped layout
    /// under the host manifest directory when one is known.
    pub fn annotate_prep_result(&self, prep_path: &Path, run_id: &str) -> KilnResult<()> {
        let mut document = jsonio::read_json_value(&self.path)?;

        let paths = document
            .as_object_mut()
            .ok_or_else(|| KilnError::ManifestInvalid {
                path: self.path.clone(),
                reason: "manifest root is not an object".to_string(),
            })?
            .entry("paths")
            .or_insert_with(|| Value::Object(Default::default()));

        set_nested(paths, "container", "prep_result", prep_path.display().to_string())?;

        if let Some(host_manifest) = &self.host_path {
            if let Some(host_dir) = host_manifest.parent() {
                let host_prep = host_dir.join(run_id).join("prep_result.json");
                set_nested(paths, "host", "prep_result", host_prep.display().to_string())?;
            }
        }

        jsonio::atomic_write_json(&self.path, &document)
    }
}

fn set_nested(paths: &mut Value, realm: &str, key: &str, value: String) -> KilnResult<()> {
    let map = paths
        .as_object_mut()
        .ok_or_else(|| KilnError::Internal("manifest paths is not an object".to_string()))?
        .entry(realm)
        .or_insert_with(|| Value::Object(Default::default()));
    map.as_object_mut()
        .ok_or_else(|| KilnError::Internal(format!("manifest paths.{} is not an object", realm)))?
        .insert(key.to_string(), Value::from(value));
    Ok(())
}

/// Parse the pointer file into (container manifest path, host manifest path)
async fn read_pointer(pointer: &Path) -> KilnResult<(PathBuf, Option<PathBuf>)> {
    let ready = match fs::metadata(pointer).await {
        Ok(meta) => meta.len() > 0,
        Err(_) => false,
    };
    if !ready {
        return Err(KilnError::ManifestPointerNotReady(pointer.to_path_buf()));
    }

    let content = fs::read_to_string(pointer)
        .await
        .map_err(|e| KilnError::io(format!("reading pointer {}", pointer.display()), e))?;

    let mut container = None;
    let mut host = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix(HOST_KEY) {
            host = Some(PathBuf::from(rest.trim()));
        } else if let Some(rest) = line.strip_prefix(CONTAINER_KEY) {
            container = Some(PathBuf::from(rest.trim()));
        }
    }

    match container {
        Some(path) => Ok((path, host)),
        None => Err(KilnError::ManifestPointerIncomplete(pointer.to_path_buf())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_fixture(temp: &TempDir) -> PathBuf {
        let manifest_path = temp.path().join("run_meta.json");
        jsonio::atomic_write_json(
            &manifest_path,
            &serde_json::json!({
                "container_run_id": "run-42",
                "git_revision": "deadbeef",
                "storage": {"log_file": "/logs/session.log"},
                "paths": {"container": {"log_file": "/logs/session.log"}}
            }),
        )
        .unwrap();

        let pointer = temp.path().join("pointer.env");
        fs::write(
            &pointer,
            format!(
                "CONTAINER_RUN_META_JSON={}\nCONTAINER_RUN_META_JSON_HOST=/host/run_meta.json\n",
                manifest_path.display()
            ),
        )
        .await
        .unwrap();
        pointer
    }

    #[tokio::test]
    async fn load_parses_pointer_and_manifest() {
        let temp = TempDir::new().unwrap();
        let pointer = write_fixture(&temp).await;

        let manifest = RunManifest::load(&pointer).await.unwrap();
        assert_eq!(manifest.run_id(), "run-42");
        assert_eq!(manifest.git_revision(), Some("deadbeef"));
        assert_eq!(manifest.log_file(), Some(PathBuf::from("/logs/session.log")));
        assert_eq!(
            manifest.host_path,
            Some(PathBuf::from("/host/run_meta.json"))
        );
    }

    #[test]
    #[serial_test::serial]
    fn pointer_path_honors_env() {
        std::env::set_var(POINTER_ENV, "/custom/pointer.env");
        assert_eq!(pointer_path(), PathBuf::from("/custom/pointer.env"));

        std::env::remove_var(POINTER_ENV);
        assert_eq!(pointer_path(), PathBuf::from(DEFAULT_POINTER));
    }

    #[tokio::test]
    async fn missing_pointer_is_not_ready() {
        let temp = TempDir::new().unwrap();
        let err = RunManifest::load(&temp.path().join("absent.env"))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::ManifestPointerNotReady(_)));
    }

    #[tokio::test]
    async fn empty_pointer_is_not_ready() {
        let temp = TempDir::new().unwrap();
        let pointer = temp.path().join("pointer.env");
        fs::write(&pointer, "").await.unwrap();

        let err = RunManifest::load(&pointer).await.unwrap_err();
        assert!(matches!(err, KilnError::ManifestPointerNotReady(_)));
    }

    #[tokio::test]
    async fn pointer_without_manifest_key_is_incomplete() {
        let temp = TempDir::new().unwrap();
        let pointer = temp.path().join("pointer.env");
        fs::write(&pointer, "SOMETHING_ELSE=/x\n").await.unwrap();

        let err = RunManifest::load(&pointer).await.unwrap_err();
        assert!(matches!(err, KilnError::ManifestPointerIncomplete(_)));
    }

    #[tokio::test]
    async fn annotate_adds_prep_result_paths() {
        let temp = TempDir::new().unwrap();
        let pointer = write_fixture(&temp).await;
        let manifest = RunManifest::load(&pointer).await.unwrap();

        manifest
            .annotate_prep_result(Path::new("/runs/run-42/prep_result.json"), "run-42")
            .unwrap();

        let updated = jsonio::read_json_value(&manifest.path).unwrap();
        assert_eq!(
            updated["paths"]["container"]["prep_result"],
            "/runs/run-42/prep_result.json"
        );
        assert_eq!(
            updated["paths"]["host"]["prep_result"],
            "/host/run-42/prep_result.json"
        );
        // existing keys untouched
        assert_eq!(updated["paths"]["container"]["log_file"], "/logs/session.log");
    }
}
