//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{KilnError, KilnResult};
use console::style;

/// Execute the config command
pub async fn execute(args: ConfigArgs, config: &Config, manager: &ConfigManager) -> KilnResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config),
        Some(ConfigAction::Path) => show_path(manager),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => set_value(manager, config, &key, &value).await?,
    }

    Ok(())
}

fn show_config(config: &Config) {
    let toml =
        toml::to_string_pretty(config).unwrap_or_else(|_| "Error serializing config".to_string());
    println!("{}", toml);
}

fn show_path(manager: &ConfigManager) {
    println!("{}", manager.path().display());
}

async fn init_config(manager: &ConfigManager, force: bool) -> KilnResult<()> {
    let path = manager.path();

    if path.exists() && !force {
        println!(
            "{} Config already exists at {} (use --force to overwrite)",
            style("[WARN]").yellow(),
            path.display()
        );
        return Ok(());
    }

    let config = Config::default();
    manager.save(&config).await?;
    println!(
        "{} Configuration initialized at {}",
        style("[OK]").green(),
        path.display()
    );

    Ok(())
}

async fn set_value(
    manager: &ConfigManager,
    config: &Config,
    key: &str,
    value: &str,
) -> KilnResult<()> {
    let mut config = config.clone();

    let parts: Vec<&str> = key.split('.').collect();
    match parts.as_slice() {
        ["general", "log_format"] => config.general.log_format = value.to_string(),

        ["paths", "cache_root"] => config.paths.cache_root = value.into(),
        ["paths", "source_tree"] => config.paths.source_tree = value.into(),

        ["model", "default_path"] => config.model.default_path = Some(value.to_string()),
        ["model", "trust_remote_code"] => config.model.trust_remote_code = parse_bool(value)?,

        ["server", "warmup_port"] => config.server.warmup_port = parse_num(value)?,
        ["server", "kv_cache_dtype"] => config.server.kv_cache_dtype = value.to_string(),
        ["server", "mem_fraction_static"] => {
            config.server.mem_fraction_static = parse_float(value)?
        }
        ["server", "context_length"] => config.server.context_length = parse_num(value)?,
        ["server", "chunked_prefill_size"] => {
            config.server.chunked_prefill_size = parse_num(value)?
        }
        ["server", "max_prefill_tokens"] => config.server.max_prefill_tokens = parse_num(value)?,
        ["server", "max_total_tokens"] => config.server.max_total_tokens = parse_num(value)?,

        ["stages", "deep_gemm", "lock_timeout_s"] => {
            config.stages.deep_gemm.lock_timeout_s = parse_num(value)?
        }
        ["stages", "deep_gemm", "compile_timeout_s"] => {
            config.stages.deep_gemm.compile_timeout_s = parse_num(value)?
        }
        ["stages", "moe", "lock_timeout_s"] => {
            config.stages.moe.lock_timeout_s = parse_num(value)?
        }
        ["stages", "moe", "batch_sizes"] => {
            config.stages.moe.batch_sizes = parse_batch_list(value)?
        }
        ["stages", "moe", "dtype"] => config.stages.moe.dtype = Some(value.to_string()),
        ["stages", "flashinfer", "warmup_timeout_s"] => {
            config.stages.flashinfer.warmup_timeout_s = parse_num(value)?
        }
        ["stages", "inductor", "warmup_timeout_s"] => {
            config.stages.inductor.warmup_timeout_s = parse_num(value)?
        }

        _ => {
            println!("{} Unknown config key: {}", style("[FAIL]").red(), key);
            println!("Valid keys:");
            print_valid_keys();
            return Ok(());
        }
    }

    manager.save(&config).await?;
    println!("{} Set {} = {}", style("[OK]").green(), key, value);

    Ok(())
}

fn parse_bool(value: &str) -> KilnResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(KilnError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(value: &str) -> KilnResult<T> {
    value
        .parse()
        .map_err(|_| KilnError::User(format!("Invalid number: {}", value)))
}

fn parse_float(value: &str) -> KilnResult<f64> {
    value
        .parse()
        .map_err(|_| KilnError::User(format!("Invalid number: {}", value)))
}

fn parse_batch_list(value: &str) -> KilnResult<Vec<u32>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| KilnError::User(format!("Invalid batch size: {}", s)))
        })
        .collect()
}

fn print_valid_keys() {
    let keys = [
        "general.log_format",
        "paths.cache_root",
        "paths.source_tree",
        "model.default_path",
        "model.trust_remote_code",
        "server.warmup_port",
        "server.kv_cache_dtype",
        "server.mem_fraction_static",
        "server.context_length",
        "server.chunked_prefill_size",
        "server.max_prefill_tokens",
        "server.max_total_tokens",
        "stages.deep_gemm.lock_timeout_s",
        "stages.deep_gemm.compile_timeout_s",
        "stages.moe.lock_timeout_s",
        "stages.moe.batch_sizes",
        "stages.moe.dtype",
        "stages.flashinfer.warmup_timeout_s",
        "stages.inductor.warmup_timeout_s",
    ];

    for key in keys {
        eprintln!("  {}", key);
    }
}
