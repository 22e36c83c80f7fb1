//! Epistemic/aleatory Monte Carlo campaigns over an external McKenna burner
//! flame solver: sampling, input resolution, fan-out on a worker pool and
//! consolidation of the per-run artifacts.

pub mod artifact;
pub mod campaign;
pub mod cancel;
pub mod config;
pub mod distribution;
pub mod error;
pub mod fsutil;
pub mod invoke;
pub mod merge;
pub mod resolve;
pub mod solver;

#[cfg(test)]
mod testing;

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub use artifact::{
    artifact_file_name, parse_artifact_file_name, ArtifactName, RunIdentity,
    DEFAULT_ARTIFACT_PATTERN,
};
pub use campaign::{
    plan_campaign, resolve_worker_count, Campaign, CampaignOptions, CampaignPlan, CampaignReport,
    CampaignState, EpistemicTask, RunOutcome, RunStatus, REPORT_FILE_NAME,
};
pub use cancel::CancellationToken;
pub use config::{CampaignConfig, GeometryKind, Mode, UncertainParameter, CONFIG_TEMPLATE};
pub use distribution::{stratified_points, Distribution, Param, ScalarSampler};
pub use error::{
    CampaignError, ConfigurationError, MergeError, RunFailure, SimulationFailure,
};
pub use invoke::{invoke, run_single, ArtifactHandle};
pub use merge::{merge, ConsolidatedDataset, DatasetGroup, GroupAttributes, MergeSummary};
pub use resolve::{deep_merge, resolve, OverrideSet, ResolvedInput};
pub use solver::{CommandSolver, FlameSolver, SolverError, SolverRequest};

/// What a configuration would do, without running anything.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignSummary {
    pub mode: &'static str,
    pub mechanism: String,
    pub geometry: &'static str,
    pub output_dir: PathBuf,
    pub epistemic_samples: usize,
    pub aleatory_samples: usize,
    pub total_runs: usize,
    pub workers: usize,
    pub seed: Option<u64>,
    pub run_timeout_seconds: Option<u64>,
    /// Stratified values per epistemic parameter, by epistemic index.
    pub epistemic_grid: BTreeMap<String, Vec<f64>>,
    pub aleatory_parameters: Vec<UncertainParameter>,
    pub solver_command: Vec<String>,
    pub config_digest: String,
}

pub fn describe_campaign(config: &CampaignConfig) -> Result<CampaignSummary, ConfigurationError> {
    let mut summary = CampaignSummary {
        mode: config.mode.as_str(),
        mechanism: config.mechanism.clone(),
        geometry: config.geometry.kind.as_str(),
        output_dir: config.settings.output_dir.clone(),
        epistemic_samples: 0,
        aleatory_samples: 0,
        total_runs: 1,
        workers: 1,
        seed: None,
        run_timeout_seconds: None,
        epistemic_grid: BTreeMap::new(),
        aleatory_parameters: Vec::new(),
        solver_command: config.solver.command.clone(),
        config_digest: config.digest(),
    };
    let Some(uq) = config.uq().filter(|_| config.mode == Mode::Uq) else {
        return Ok(summary);
    };

    let options = CampaignOptions {
        seed: Some(uq.seed.unwrap_or_default()),
        ..CampaignOptions::default()
    };
    let plan = plan_campaign(config, &options)?;
    for parameter in &plan.epistemic_parameters {
        if let Distribution::Uniform { min, max } = parameter.distribution {
            summary.epistemic_grid.insert(
                parameter.name.clone(),
                stratified_points(min, max, plan.epistemic_samples()),
            );
        }
    }
    summary.epistemic_samples = plan.epistemic_samples();
    summary.aleatory_samples = plan.aleatory_samples();
    summary.total_runs = plan.total_runs();
    summary.workers = plan.workers;
    summary.seed = uq.seed;
    summary.run_timeout_seconds = uq.run_timeout_seconds;
    summary.aleatory_parameters = plan.aleatory_parameters;
    Ok(summary)
}
