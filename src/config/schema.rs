//! Configuration schema for Kiln
//!
//! Configuration is stored at `~/.config/kiln/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Directory-role paths
    pub paths: PathsConfig,

    /// Model defaults
    pub model: ModelConfig,

    /// Warm-up server settings
    pub server: ServerConfig,

    /// Per-artifact-class stage settings
    pub stages: StagesConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Directory roles consumed by the pipeline and exported to generation
/// subprocesses. Everything under `cache_root` follows a fixed layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the persisted cache directories
    pub cache_root: PathBuf,

    /// Serving source checkout, used for the revision in signatures
    pub source_tree: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("/profiles"),
            source_tree: PathBuf::from("/workspaces/sglang"),
        }
    }
}

/// Model defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model path used when --model is not given
    pub default_path: Option<String>,

    /// Pass --trust-remote-code to the serving process
    pub trust_remote_code: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_path: None,
            trust_remote_code: true,
        }
    }
}

/// Warm-up server settings
///
/// These are also the serving parameters that shape kernels, so most of
/// them feed the per-class reuse signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Private port claimed for the warm-up server
    pub warmup_port: u16,

    /// Launcher command prefix for the serving process
    pub launcher: Vec<String>,

    /// Seconds to wait for graceful shutdown before a forced kill
    pub stop_timeout_s: u64,

    /// Fraction of device memory reserved for static allocations
    pub mem_fraction_static: f64,

    /// KV cache dtype passed to the server
    pub kv_cache_dtype: String,

    /// Chunked prefill size
    pub chunked_prefill_size: u32,

    /// Context length
    pub context_length: u32,

    /// Maximum prefill tokens
    pub max_prefill_tokens: u32,

    /// Maximum total tokens
    pub max_total_tokens: u32,

    /// Mamba cache slots
    pub max_mamba_cache_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            warmup_port: 30000,
            launcher: vec![
                "python3".to_string(),
                "-m".to_string(),
                "sglang.launch_server".to_string(),
            ],
            stop_timeout_s: 10,
            mem_fraction_static: 0.85,
            kv_cache_dtype: "auto".to_string(),
            chunked_prefill_size: 8192,
            context_length: 8192,
            max_prefill_tokens: 16384,
            max_total_tokens: 32768,
            max_mamba_cache_size: 1,
        }
    }
}

/// Per-class stage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    /// Ahead-of-time kernel compilation
    pub deep_gemm: DeepGemmConfig,

    /// Fused-MoE kernel autotuning
    pub moe: MoeConfig,

    /// FlashInfer JIT warm-up
    pub flashinfer: WarmupStageConfig,

    /// TorchInductor compile warm-up
    pub inductor: WarmupStageConfig,
}

/// Kernel compilation stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepGemmConfig {
    /// Seconds before an abandoned lock is reclaimed / a waiter gives up
    pub lock_timeout_s: u64,

    /// Timeout passed to the compiler subprocess
    pub compile_timeout_s: u64,

    /// Memory fraction used during compilation (lower than serving)
    pub mem_fraction_static: f64,

    /// Compiler command prefix
    pub compiler: Vec<String>,
}

impl Default for DeepGemmConfig {
    fn default() -> Self {
        Self {
            lock_timeout_s: 600,
            compile_timeout_s: 3600,
            mem_fraction_static: 0.6,
            compiler: vec![
                "python3".to_string(),
                "-m".to_string(),
                "sglang.compile_deep_gemm".to_string(),
            ],
        }
    }
}

/// MoE autotuning stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MoeConfig {
    /// Seconds before an abandoned lock is reclaimed / a waiter gives up
    pub lock_timeout_s: u64,

    /// Batch sizes to tune when --moe-batch-sizes is not given
    pub batch_sizes: Vec<u32>,

    /// Tuner dtype used when --moe-dtype is not given
    pub dtype: Option<String>,

    /// Tuner command prefix
    pub tuner: Vec<String>,

    /// Probe command that must succeed for the tuner to be usable
    pub dependency_probe: Vec<String>,
}

impl Default for MoeConfig {
    fn default() -> Self {
        Self {
            lock_timeout_s: 600,
            batch_sizes: vec![],
            dtype: None,
            tuner: vec![
                "python3".to_string(),
                "-m".to_string(),
                "sglang.tune_fused_moe".to_string(),
            ],
            dependency_probe: vec![
                "python3".to_string(),
                "-c".to_string(),
                "import ray".to_string(),
            ],
        }
    }
}

/// Warm-up stage settings (FlashInfer and TorchInductor)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupStageConfig {
    /// Seconds before an abandoned lock is reclaimed / a waiter gives up
    pub lock_timeout_s: u64,

    /// Seconds to wait for the warm-up server to become ready
    pub warmup_timeout_s: u64,
}

impl Default for WarmupStageConfig {
    fn default() -> Self {
        Self {
            lock_timeout_s: 600,
            warmup_timeout_s: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[paths]"));
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[stages.deep_gemm]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.warmup_port, 30000);
        assert_eq!(config.paths.cache_root, PathBuf::from("/profiles"));
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [server]
            warmup_port = 31000

            [stages.moe]
            batch_sizes = [512, 4096]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.warmup_port, 31000);
        assert_eq!(config.stages.moe.batch_sizes, vec![512, 4096]);
        // defaults preserved
        assert_eq!(config.stages.deep_gemm.lock_timeout_s, 600);
        assert_eq!(config.server.kv_cache_dtype, "auto");
    }

    #[test]
    fn launcher_defaults_to_sglang() {
        let config = Config::default();
        assert_eq!(config.server.launcher[0], "python3");
        assert!(config.stages.deep_gemm.compiler.iter().any(|a| a.contains("compile_deep_gemm")));
    }
}
