//! Environment snapshot
//!
//! Collects the hardware and software identity that feeds reuse signatures:
//! device name, compute capability, driver and toolkit versions, the
//! versions of the serving stack's Python components, and the serving
//! source revision. All probes shell out to external tools and degrade to
//! "unknown" — a partially-introspectable machine still gets a usable
//! (conservative) signature.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Snapshot of the environment a cache was (or would be) generated under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSnapshot {
    pub device_name: String,
    pub compute_capability: String,
    pub cuda: String,
    pub driver_version: String,
    pub torch_version: String,
    pub triton_version: String,
    pub flashinfer_version: String,
    pub source_revision: String,
}

impl EnvSnapshot {
    /// Probe the current machine.
    ///
    /// `source_tree` is the serving source checkout; `manifest_revision` is
    /// the revision recorded by the lifecycle tool, preferred when present.
    pub async fn collect(source_tree: &Path, manifest_revision: Option<&str>) -> Self {
        let device_name = query_gpu("name").await;
        let compute_capability = match query_gpu("compute_cap").await.as_str() {
            "unknown" => "unknown".to_string(),
            cap => format!("sm_{}", cap.replace('.', "")),
        };
        let driver_version = query_gpu("driver_version").await;
        let cuda = cuda_toolkit_version().await;

        let torch_version = module_version("torch").await;
        let triton_version = module_version("triton").await;
        let flashinfer_version = module_version("flashinfer").await;

        let source_revision = match manifest_revision {
            Some(rev) if rev != "unknown" && !rev.is_empty() => rev.to_string(),
            _ => git_revision(source_tree).await,
        };

        Self {
            device_name,
            compute_capability,
            cuda,
            driver_version,
            torch_version,
            triton_version,
            flashinfer_version,
            source_revision,
        }
    }

    /// A fully-unknown snapshot, for contexts that never probe (tests)
    pub fn unknown() -> Self {
        Self {
            device_name: "unknown".to_string(),
            compute_capability: "unknown".to_string(),
            cuda: "unknown".to_string(),
            driver_version: "unknown".to_string(),
            torch_version: "unknown".to_string(),
            triton_version: "unknown".to_string(),
            flashinfer_version: "unknown".to_string(),
            source_revision: "unknown".to_string(),
        }
    }
}

/// Run a probe command, returning trimmed stdout on success
async fn probe(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next()?.trim().to_string();
    if first.is_empty() {
        None
    } else {
        Some(first)
    }
}

async fn query_gpu(field: &str) -> String {
    probe(
        "nvidia-smi",
        &[
            &format!("--query-gpu={}", field),
            "--format=csv,noheader",
        ],
    )
    .await
    .unwrap_or_else(|| "unknown".to_string())
}

/// Parse `CUDA Version: X.Y` out of the nvidia-smi banner
async fn cuda_toolkit_version() -> String {
    let output = Command::new("nvidia-smi")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    if let Ok(output) = output {
        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            if let Some(version) = parse_cuda_version(&text) {
                return version;
            }
        }
    }
    "unknown".to_string()
}

/// Extract the version following a `CUDA Version:` marker
fn parse_cuda_version(banner: &str) -> Option<String> {
    let idx = banner.find("CUDA Version:")?;
    let rest = banner[idx + "CUDA Version:".len()..].trim_start();
    let version: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

/// Version of an installed Python component, "unknown" if absent
async fn module_version(module: &str) -> String {
    let snippet = format!("import {m}; print({m}.__version__)", m = module);
    match probe("python3", &["-c", &snippet]).await {
        Some(version) => version,
        None => {
            debug!("version probe failed for module {}", module);
            "unknown".to_string()
        }
    }
}

async fn git_revision(source_tree: &Path) -> String {
    probe(
        "git",
        &[
            "-C",
            &source_tree.display().to_string(),
            "rev-parse",
            "HEAD",
        ],
    )
    .await
    .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cuda_version_from_banner() {
        let banner = "| NVIDIA-SMI 550.54.14    Driver Version: 550.54.14    CUDA Version: 12.4 |";
        assert_eq!(parse_cuda_version(banner), Some("12.4".to_string()));
    }

    #[test]
    fn parse_cuda_version_missing() {
        assert_eq!(parse_cuda_version("no gpus here"), None);
        assert_eq!(parse_cuda_version("CUDA Version: "), None);
    }

    #[test]
    fn unknown_snapshot_is_all_unknown() {
        let snap = EnvSnapshot::unknown();
        assert_eq!(snap.device_name, "unknown");
        assert_eq!(snap.source_revision, "unknown");
    }

    #[tokio::test]
    async fn collect_survives_missing_tools() {
        // On a machine without nvidia-smi or the Python stack every probe
        // degrades to "unknown" instead of failing.
        let snap = EnvSnapshot::collect(Path::new("/nonexistent"), None).await;
        assert!(!snap.device_name.is_empty());
        assert!(!snap.source_revision.is_empty());
    }

    #[tokio::test]
    async fn manifest_revision_preferred() {
        let snap = EnvSnapshot::collect(Path::new("/nonexistent"), Some("abc123")).await;
        assert_eq!(snap.source_revision, "abc123");
    }
}
