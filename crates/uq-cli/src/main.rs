use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};
use uq_runner::{
    describe_campaign, merge, run_single, Campaign, CampaignConfig, CampaignError,
    CampaignOptions, CampaignReport, CampaignState, CampaignSummary, CancellationToken,
    CommandSolver, ConfigurationError, MergeError, MergeSummary, Mode, RunFailure,
    CONFIG_TEMPLATE, DEFAULT_ARTIFACT_PATTERN,
};

#[derive(Parser)]
#[command(
    name = "mckenna-uq",
    version = "0.3.0",
    about = "Epistemic/aleatory UQ campaigns for McKenna burner flames"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a UQ campaign, or one simulation for `mode: single`.
    Run {
        config: PathBuf,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        timeout_seconds: Option<u64>,
        /// Merge the artifacts into this file once the campaign completes.
        #[arg(long)]
        merge_into: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Consolidate per-run artifacts into one dataset.
    Merge {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = DEFAULT_ARTIFACT_PATTERN)]
        pattern: String,
        #[arg(long)]
        json: bool,
    },
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a starter configuration.
    Init {
        #[arg(long, default_value = "config.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let (code, details) = error_code_and_details(&err);
                emit_json(&json_error(code, err.to_string(), details));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            output_dir,
            workers,
            seed,
            timeout_seconds,
            merge_into,
            json,
        } => {
            let cfg = CampaignConfig::load(&config)?;
            let output_dir = output_dir.unwrap_or_else(|| cfg.settings.output_dir.clone());
            let timeout = timeout_seconds
                .or_else(|| cfg.uq().and_then(|uq| uq.run_timeout_seconds))
                .map(Duration::from_secs);

            let token = CancellationToken::new();
            let handler_token = token.clone();
            ctrlc::set_handler(move || {
                warn!("interrupt received; cancelling remaining runs");
                handler_token.cancel();
            })?;
            let solver = CommandSolver::new(&cfg.solver.command)?
                .with_timeout(timeout)
                .with_cancellation(token.clone());

            if cfg.mode == Mode::Single {
                let handle = run_single(&cfg, &solver, &output_dir)?;
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "run",
                        "mode": "single",
                        "artifact": handle.path.display().to_string()
                    })));
                }
                println!("mode: single");
                println!("artifact: {}", handle.path.display());
                return Ok(None);
            }

            let summary = describe_campaign(&cfg)?;
            let options = CampaignOptions {
                workers,
                seed,
                cancellation: token,
            };
            let mut campaign = Campaign::new(&cfg, &solver, &output_dir, options);
            let report = campaign.run()?;
            let report_path = report.write_to(&output_dir)?;

            let merged = match merge_into {
                Some(out) if report.state == CampaignState::Completed => {
                    Some(merge(&output_dir, &out, DEFAULT_ARTIFACT_PATTERN)?)
                }
                Some(out) => {
                    warn!(output = %out.display(), "campaign aborted; skipping merge");
                    None
                }
                None => None,
            };

            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "mode": "uq",
                    "summary": summary_to_json(&summary),
                    "campaign": report_to_json(&report, &report_path),
                    "merge": merged.as_ref().map(merge_summary_to_json)
                })));
            }
            print_summary(&summary);
            print_report(&report, &report_path);
            if let Some(merged) = &merged {
                print_merge_summary(merged);
            }
        }
        Commands::Merge {
            dir,
            out,
            pattern,
            json,
        } => {
            let summary = merge(&dir, &out, &pattern)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "merge",
                    "merge": merge_summary_to_json(&summary)
                })));
            }
            print_merge_summary(&summary);
        }
        Commands::Describe { config, json } => {
            let cfg = CampaignConfig::load(&config)?;
            let summary = describe_campaign(&cfg)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary)
                })));
            }
            print_summary(&summary);
        }
        Commands::Init { path, force } => {
            write_template(&path, force)?;
            println!("wrote: {}", path.display());
            println!("next: mckenna-uq describe {}", path.display());
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code_and_details(err: &anyhow::Error) -> (&'static str, Value) {
    if let Some(e) = err.downcast_ref::<ConfigurationError>() {
        let details = match e {
            ConfigurationError::Invalid { problems } => json!({ "problems": problems }),
            ConfigurationError::UnresolvedDistribution { pointers } => {
                json!({ "pointers": pointers })
            }
            _ => json!({}),
        };
        return ("configuration_error", details);
    }
    if let Some(e) = err.downcast_ref::<MergeError>() {
        return match e {
            MergeError::OutputExists { path } => {
                ("merge_output_exists", json!({ "path": path.display().to_string() }))
            }
            MergeError::NoInput { directory, pattern } => (
                "merge_no_input",
                json!({ "directory": directory.display().to_string(), "pattern": pattern }),
            ),
            MergeError::DuplicateGroup { group, first, second } => (
                "merge_duplicate_group",
                json!({ "group": group, "files": [first, second] }),
            ),
            MergeError::Cleanup { output, failures } => (
                "merge_cleanup_failed",
                json!({
                    "output": output.display().to_string(),
                    "files": failures
                        .iter()
                        .map(|f| f.path.display().to_string())
                        .collect::<Vec<_>>()
                }),
            ),
            _ => ("merge_failed", json!({})),
        };
    }
    if let Some(e) = err.downcast_ref::<RunFailure>() {
        return ("run_failed", json!({ "kind": e.kind() }));
    }
    if err.downcast_ref::<CampaignError>().is_some() {
        return ("campaign_failed", json!({}));
    }
    ("command_failed", json!({}))
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Merge { json, .. }
        | Commands::Describe { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn summary_to_json(summary: &CampaignSummary) -> Value {
    serde_json::to_value(summary).unwrap_or_else(|_| json!({}))
}

fn report_to_json(report: &CampaignReport, report_path: &Path) -> Value {
    json!({
        "state": report.state.to_string(),
        "seed": report.seed,
        "workers": report.workers,
        "succeeded": report.succeeded,
        "failed": report.failed,
        "cancelled": report.cancelled,
        "output_dir": report.output_dir.display().to_string(),
        "report": report_path.display().to_string()
    })
}

fn merge_summary_to_json(summary: &MergeSummary) -> Value {
    json!({
        "output": summary.output.display().to_string(),
        "groups": summary.groups,
        "removed": summary.removed,
        "skipped": summary.skipped
    })
}

fn print_summary(summary: &CampaignSummary) {
    println!("mode: {}", summary.mode);
    println!("mechanism: {}", summary.mechanism);
    println!("geometry: {}", summary.geometry);
    println!("output_dir: {}", summary.output_dir.display());
    println!("epistemic_samples: {}", summary.epistemic_samples);
    println!("aleatory_samples: {}", summary.aleatory_samples);
    println!("total_runs: {}", summary.total_runs);
    println!("workers: {}", summary.workers);
    if let Some(seed) = summary.seed {
        println!("seed: {}", seed);
    }
    if let Some(timeout) = summary.run_timeout_seconds {
        println!("run_timeout_seconds: {}", timeout);
    }
    for (name, grid) in &summary.epistemic_grid {
        println!("epistemic {}: {:?}", name, grid);
    }
    for parameter in &summary.aleatory_parameters {
        println!(
            "aleatory {}: {:?}",
            parameter.name, parameter.distribution
        );
    }
    println!("solver: {:?}", summary.solver_command);
    println!("config_digest: {}", summary.config_digest);
}

fn print_report(report: &CampaignReport, report_path: &Path) {
    println!("state: {}", report.state);
    println!("seed: {}", report.seed);
    println!(
        "runs: {} succeeded, {} failed, {} cancelled",
        report.succeeded, report.failed, report.cancelled
    );
    println!("report: {}", report_path.display());
}

fn print_merge_summary(summary: &MergeSummary) {
    println!("merged: {}", summary.output.display());
    println!("groups: {}", summary.groups);
    println!("removed: {}", summary.removed);
    for name in &summary.skipped {
        println!("skipped: {}", name);
    }
}

fn write_template(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, CONFIG_TEMPLATE)?;
    Ok(())
}
