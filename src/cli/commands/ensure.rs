//! Ensure command - run the staging pipeline

use crate::cli::args::EnsureArgs;
use crate::config::Config;
use crate::error::KilnResult;
use crate::exec::LaunchServerBackend;
use crate::manifest::{self, RunManifest};
use crate::pipeline::tune::BatchSpec;
use crate::pipeline::{Pipeline, PipelineOptions, RunOutcome, StageModes};
use console::style;

/// Execute the ensure command
pub async fn execute(args: EnsureArgs, config: &Config) -> KilnResult<()> {
    let pointer = manifest::pointer_path();
    let manifest = RunManifest::load(&pointer).await?;

    let options = PipelineOptions {
        model: args.model,
        tp: args.tp,
        modes: StageModes {
            deep_gemm: args.deep_gemm,
            moe: args.moe,
            flashinfer: args.flashinfer,
            inductor: args.inductor,
        },
        batch_spec: args.moe_batch_sizes.unwrap_or(BatchSpec::Default),
        moe_dtype: args.moe_dtype,
        telemetry_ping: args.telemetry_ping,
    };

    let pipeline = Pipeline::prepare(config.clone(), options, manifest).await?;
    let backend = LaunchServerBackend::new();
    let outcome = pipeline.run(&backend).await?;

    print_summary(&outcome);

    // machine-parseable result lines, last so they are easy to tail
    println!("RESULT_JSON {}", outcome.record_path.display());
    println!("RESULT_STATUS {} {}", outcome.record.status, outcome.summary());

    Ok(())
}

fn print_summary(outcome: &RunOutcome) {
    println!();
    for (name, stage) in &outcome.record.stages {
        let status = stage["status"].as_str().unwrap_or("?");
        let styled = match status {
            "ok" => style(status).green().to_string(),
            "noop" | "skipped" => style(status).dim().to_string(),
            _ => style(status).red().to_string(),
        };

        let duration = stage["duration_s"].as_f64().unwrap_or(0.0);
        let detail = match status {
            "error" => stage["error_type"]
                .as_str()
                .map(|k| format!(" ({})", k))
                .unwrap_or_default(),
            "ok" => format!(" ({:.1}s)", duration),
            _ => String::new(),
        };

        println!("  {:<12} {}{}", name, styled, detail);
    }
    println!();

    let status = &outcome.record.status;
    if status == "ok" {
        println!("{} caches ready", style("[OK]").green());
    } else {
        println!(
            "{} some caches failed: {}",
            style("[WARN]").yellow(),
            outcome.record.errors.join(", ")
        );
    }
}
