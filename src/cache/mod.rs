//! Artifact cache model
//!
//! The four GPU cache classes the pipeline stages, and the fixed on-disk
//! layout they live in under the cache root.

pub mod inspect;
pub mod lock;
pub mod marker;
pub mod signature;

pub use inspect::DirStats;
pub use lock::StageLock;
pub use marker::{InProgressMarker, MarkerHandle};
pub use signature::Signature;

use crate::error::{KilnError, KilnResult};
use std::fmt;
use std::path::{Path, PathBuf};

/// The artifact classes the pipeline knows about
///
/// This is a fixed, small set, not an arbitrary dependency graph. Order of
/// `all()` is the stage execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheClass {
    /// Ahead-of-time compiled kernel cache
    DeepGemm,
    /// Autotuned fused-MoE kernel configuration table
    MoeTune,
    /// FlashInfer JIT workspace, populated by serving real requests
    Flashinfer,
    /// TorchInductor compile cache, populated by serving with torch.compile
    Inductor,
}

impl CacheClass {
    /// Stable class name used in records, lock files and result maps
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeepGemm => "deep_gemm",
            Self::MoeTune => "moe_tune",
            Self::Flashinfer => "flashinfer",
            Self::Inductor => "inductor",
        }
    }

    /// Directory name under the cache root
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::DeepGemm => "deep_gemm",
            Self::MoeTune => "moe_configs",
            Self::Flashinfer => "flashinfer",
            Self::Inductor => "torchinductor",
        }
    }

    /// Status code attached to skipped/error stage results
    pub fn status_code(&self) -> i32 {
        match self {
            Self::DeepGemm => 10,
            Self::MoeTune => 11,
            Self::Flashinfer => 12,
            Self::Inductor => 13,
        }
    }

    /// All classes in stage execution order
    pub fn all() -> &'static [Self] {
        &[
            Self::DeepGemm,
            Self::MoeTune,
            Self::Flashinfer,
            Self::Inductor,
        ]
    }
}

impl fmt::Display for CacheClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Fixed on-disk layout under the cache root
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache directory for one class
    pub fn class_dir(&self, class: CacheClass) -> PathBuf {
        self.root.join(class.dir_name())
    }

    /// Directory holding per-class lock files
    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(".locks")
    }

    /// Directory holding per-class in-progress markers
    pub fn marker_dir(&self) -> PathBuf {
        self.root.join(".in_progress")
    }

    /// Environment variables exported to generation subprocesses so the
    /// external tools write into this layout
    pub fn env_map(&self) -> Vec<(&'static str, String)> {
        let dir = |name: &str| self.root.join(name).display().to_string();
        vec![
            ("XDG_CACHE_HOME", self.root.display().to_string()),
            ("TRITON_CACHE_DIR", dir("triton")),
            ("FLASHINFER_WORKSPACE_DIR", dir("flashinfer")),
            ("TORCHINDUCTOR_CACHE_DIR", dir("torchinductor")),
            ("SGL_DG_CACHE_DIR", dir("deep_gemm")),
            ("SGLANG_MOE_CONFIG_DIR", dir("moe_configs")),
        ]
    }

    /// Create every directory the pipeline writes into.
    ///
    /// Fails fast: an uncreatable cache root means no stage can run safely.
    pub fn ensure_dirs(&self) -> KilnResult<()> {
        let mut dirs: Vec<PathBuf> = CacheClass::all()
            .iter()
            .map(|c| self.class_dir(*c))
            .collect();
        dirs.push(self.root.join("triton"));
        dirs.push(self.lock_dir());
        dirs.push(self.marker_dir());

        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .map_err(|e| KilnError::io(format!("creating directory {}", dir.display()), e))?;
        }
        Ok(())
    }

    /// Check that a class's cache directory accepts writes
    pub fn check_writable(&self, class: CacheClass) -> KilnResult<()> {
        let dir = self.class_dir(class);
        std::fs::create_dir_all(&dir)
            .map_err(|_| KilnError::CacheUnwritable(dir.clone()))?;

        let probe = dir.join(".write_test");
        std::fs::write(&probe, b"ok").map_err(|_| KilnError::CacheUnwritable(dir.clone()))?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn class_names_and_codes() {
        assert_eq!(CacheClass::DeepGemm.name(), "deep_gemm");
        assert_eq!(CacheClass::MoeTune.dir_name(), "moe_configs");
        assert_eq!(CacheClass::Inductor.status_code(), 13);
        assert_eq!(CacheClass::all().len(), 4);
    }

    #[test]
    fn class_order_is_stage_order() {
        let names: Vec<_> = CacheClass::all().iter().map(|c| c.name()).collect();
        assert_eq!(names, ["deep_gemm", "moe_tune", "flashinfer", "inductor"]);
    }

    #[test]
    fn layout_paths() {
        let layout = CacheLayout::new("/profiles");
        assert_eq!(
            layout.class_dir(CacheClass::Inductor),
            PathBuf::from("/profiles/torchinductor")
        );
        assert_eq!(layout.lock_dir(), PathBuf::from("/profiles/.locks"));
    }

    #[test]
    fn env_map_covers_roles() {
        let layout = CacheLayout::new("/profiles");
        let env = layout.env_map();
        let keys: Vec<_> = env.iter().map(|(k, _)| *k).collect();
        assert!(keys.contains(&"SGL_DG_CACHE_DIR"));
        assert!(keys.contains(&"SGLANG_MOE_CONFIG_DIR"));
        assert!(keys.contains(&"TORCHINDUCTOR_CACHE_DIR"));
    }

    #[test]
    fn ensure_dirs_creates_layout() {
        let temp = TempDir::new().unwrap();
        let layout = CacheLayout::new(temp.path().join("profiles"));
        layout.ensure_dirs().unwrap();

        assert!(layout.class_dir(CacheClass::DeepGemm).is_dir());
        assert!(layout.lock_dir().is_dir());
        assert!(layout.marker_dir().is_dir());
    }

    #[test]
    fn check_writable_ok_on_tempdir() {
        let temp = TempDir::new().unwrap();
        let layout = CacheLayout::new(temp.path());
        layout.ensure_dirs().unwrap();
        layout.check_writable(CacheClass::DeepGemm).unwrap();
    }
}
