//! CLI argument definitions using clap derive

use crate::pipeline::tune::{parse_batch_spec, BatchSpec};
use crate::pipeline::StageMode;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Kiln - GPU inference cache staging
///
/// Validates and regenerates the expensive machine-specific caches an
/// inference server needs: compiled kernels, autotuned kernel tables and
/// warm-up-populated JIT caches.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate caches and regenerate the stale ones
    Ensure(EnsureArgs),

    /// Emit a JSON snapshot of the cache directories
    Inspect(InspectArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the ensure command
#[derive(Parser, Debug)]
pub struct EnsureArgs {
    /// Model ID or path (defaults to model.default_path from config)
    #[arg(long)]
    pub model: Option<String>,

    /// Tensor parallel degree
    #[arg(long, default_value = "1")]
    pub tp: u32,

    /// Compiled-kernel cache mode
    #[arg(long, value_enum, default_value = "ensure")]
    pub deep_gemm: StageMode,

    /// Autotuned MoE table mode
    #[arg(long, value_enum, default_value = "ensure")]
    pub moe: StageMode,

    /// FlashInfer warm-up cache mode
    #[arg(long, value_enum, default_value = "ensure")]
    pub flashinfer: StageMode,

    /// TorchInductor warm-up cache mode
    #[arg(long, value_enum, default_value = "ensure")]
    pub inductor: StageMode,

    /// Batch sizes to tune: comma list (e.g. '512,4096') or 'all'
    #[arg(long, value_parser = parse_batch_spec)]
    pub moe_batch_sizes: Option<BatchSpec>,

    /// Dtype override passed to the tuner (e.g. fp8_w8a8)
    #[arg(long)]
    pub moe_dtype: Option<String>,

    /// Query the local telemetry stack after prep
    #[arg(long)]
    pub telemetry_ping: bool,
}

/// Arguments for the inspect command
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Cache root to inspect (defaults to paths.cache_root from config)
    #[arg(long)]
    pub cache_root: Option<PathBuf>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g. server.warmup_port)
        key: String,
        /// Value to set
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_ensure_defaults() {
        let cli = Cli::parse_from(["kiln", "ensure", "--model", "/models/m"]);
        match cli.command {
            Commands::Ensure(args) => {
                assert_eq!(args.model.as_deref(), Some("/models/m"));
                assert_eq!(args.tp, 1);
                assert_eq!(args.deep_gemm, StageMode::Ensure);
                assert_eq!(args.moe, StageMode::Ensure);
                assert!(args.moe_batch_sizes.is_none());
                assert!(!args.telemetry_ping);
            }
            _ => panic!("expected Ensure command"),
        }
    }

    #[test]
    fn cli_parses_stage_modes() {
        let cli = Cli::parse_from([
            "kiln",
            "ensure",
            "--deep-gemm",
            "rebuild",
            "--moe",
            "skip",
            "--flashinfer",
            "ensure",
            "--inductor",
            "skip",
        ]);
        match cli.command {
            Commands::Ensure(args) => {
                assert_eq!(args.deep_gemm, StageMode::Rebuild);
                assert_eq!(args.moe, StageMode::Skip);
                assert_eq!(args.flashinfer, StageMode::Ensure);
                assert_eq!(args.inductor, StageMode::Skip);
            }
            _ => panic!("expected Ensure command"),
        }
    }

    #[test]
    fn cli_parses_batch_sizes() {
        let cli = Cli::parse_from(["kiln", "ensure", "--moe-batch-sizes", "512,4096"]);
        match cli.command {
            Commands::Ensure(args) => {
                assert_eq!(args.moe_batch_sizes, Some(BatchSpec::List(vec![512, 4096])));
            }
            _ => panic!("expected Ensure command"),
        }

        let cli = Cli::parse_from(["kiln", "ensure", "--moe-batch-sizes", "all"]);
        match cli.command {
            Commands::Ensure(args) => {
                assert_eq!(args.moe_batch_sizes, Some(BatchSpec::All));
            }
            _ => panic!("expected Ensure command"),
        }
    }

    #[test]
    fn cli_rejects_bad_batch_sizes() {
        let result = Cli::try_parse_from(["kiln", "ensure", "--moe-batch-sizes", "12,nope"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_parses_inspect() {
        let cli = Cli::parse_from(["kiln", "inspect", "--cache-root", "/tmp/profiles"]);
        match cli.command {
            Commands::Inspect(args) => {
                assert_eq!(args.cache_root, Some(PathBuf::from("/tmp/profiles")));
            }
            _ => panic!("expected Inspect command"),
        }
    }

    #[test]
    fn cli_parses_config_set() {
        let cli = Cli::parse_from(["kiln", "config", "set", "server.warmup_port", "31000"]);
        match cli.command {
            Commands::Config(args) => match args.action {
                Some(ConfigAction::Set { key, value }) => {
                    assert_eq!(key, "server.warmup_port");
                    assert_eq!(value, "31000");
                }
                _ => panic!("expected Set action"),
            },
            _ => panic!("expected Config command"),
        }
    }

    #[test]
    fn cli_verbose_levels() {
        let cli = Cli::parse_from(["kiln", "inspect"]);
        assert_eq!(cli.verbose, 0);

        let cli = Cli::parse_from(["kiln", "-vv", "inspect"]);
        assert_eq!(cli.verbose, 2);
    }
}
