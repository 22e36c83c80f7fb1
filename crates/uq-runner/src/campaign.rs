//! Nested Monte Carlo driver.
//!
//! One [`EpistemicTask`] per epistemic index runs on a bounded rayon pool.
//! Inside a task the aleatory runs go strictly in order, each drawing its
//! overrides from the task's own seeded generator, so a campaign seed
//! reproduces every draw no matter how tasks are scheduled.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};

use crate::artifact::RunIdentity;
use crate::cancel::CancellationToken;
use crate::config::{CampaignConfig, Mode, UncertainParameter};
use crate::distribution::{stratified_points, Distribution};
use crate::error::{CampaignError, ConfigurationError, RunFailure};
use crate::fsutil::{atomic_write_json_pretty, ensure_dir};
use crate::invoke::{invoke, ArtifactHandle};
use crate::resolve::{resolve, sample_overrides, OverrideSet};
use crate::solver::{FlameSolver, SolverError};

pub const REPORT_SCHEMA: &str = "campaign_report_v1";
pub const REPORT_FILE_NAME: &str = "campaign_report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignState {
    Idle,
    Running,
    Completed,
    Aborted,
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CampaignState::Idle => "idle",
            CampaignState::Running => "running",
            CampaignState::Completed => "completed",
            CampaignState::Aborted => "aborted",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CampaignOptions {
    /// Overrides `settings.uq.workers`.
    pub workers: Option<usize>,
    /// Overrides `settings.uq.seed`; without either a random seed is drawn.
    pub seed: Option<u64>,
    pub cancellation: CancellationToken,
}

/// All aleatory runs of one epistemic index.
#[derive(Debug, Clone, Serialize)]
pub struct EpistemicTask {
    pub epistemic_index: usize,
    pub aleatory_samples: usize,
    pub seed: u64,
    pub overrides: OverrideSet,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignPlan {
    pub seed: u64,
    pub workers: usize,
    pub epistemic_parameters: Vec<UncertainParameter>,
    pub aleatory_parameters: Vec<UncertainParameter>,
    pub tasks: Vec<EpistemicTask>,
}

impl CampaignPlan {
    pub fn epistemic_samples(&self) -> usize {
        self.tasks.len()
    }

    pub fn aleatory_samples(&self) -> usize {
        self.tasks.first().map_or(0, |t| t.aleatory_samples)
    }

    pub fn total_runs(&self) -> usize {
        self.tasks.iter().map(|t| t.aleatory_samples).sum()
    }
}

pub fn plan_campaign(
    config: &CampaignConfig,
    options: &CampaignOptions,
) -> Result<CampaignPlan, ConfigurationError> {
    if config.mode != Mode::Uq {
        return Err(ConfigurationError::invalid(format!(
            "campaigns need mode 'uq', got '{}'",
            config.mode.as_str()
        )));
    }
    let uq = config
        .uq()
        .ok_or_else(|| ConfigurationError::invalid("'settings.uq' is required in 'uq' mode"))?;
    let (epistemic, aleatory) = config.partition_parameters()?;

    let grids = epistemic
        .iter()
        .map(|p| match p.distribution {
            Distribution::Uniform { min, max } => {
                Ok(stratified_points(min, max, uq.epistemic_samples))
            }
            other => Err(ConfigurationError::invalid(format!(
                "epistemic parameter '{}' must be uniform, got {}",
                p.name,
                other.name()
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let seed = options
        .seed
        .or(uq.seed)
        .unwrap_or_else(|| rand::rng().random());

    let mut tasks = Vec::with_capacity(uq.epistemic_samples);
    for i in 0..uq.epistemic_samples {
        let mut overrides = OverrideSet::new();
        for (parameter, grid) in epistemic.iter().zip(&grids) {
            overrides.set(&parameter.pointer, grid[i])?;
        }
        tasks.push(EpistemicTask {
            epistemic_index: i,
            aleatory_samples: uq.aleatory_samples,
            seed: seed.wrapping_add(i as u64),
            overrides,
        });
    }

    Ok(CampaignPlan {
        seed,
        workers: resolve_worker_count(options.workers.or(uq.workers), uq.epistemic_samples),
        epistemic_parameters: epistemic,
        aleatory_parameters: aleatory,
        tasks,
    })
}

/// Pool size: the request capped by the machine and by the number of tasks.
pub fn resolve_worker_count(requested: Option<usize>, epistemic_samples: usize) -> usize {
    let available = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    requested
        .unwrap_or(available)
        .min(available)
        .min(epistemic_samples)
        .max(1)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded { artifact: PathBuf },
    Failed { kind: String, message: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    #[serde(flatten)]
    pub identity: RunIdentity,
    /// Epistemic and aleatory values this run was given. Absent when the run
    /// was cancelled before sampling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides: Option<OverrideSet>,
    #[serde(flatten)]
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub schema_version: &'static str,
    pub state: CampaignState,
    pub seed: u64,
    pub workers: usize,
    pub epistemic_samples: usize,
    pub aleatory_samples: usize,
    pub config_digest: String,
    pub output_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub outcomes: Vec<RunOutcome>,
}

impl CampaignReport {
    pub fn artifacts(&self) -> impl Iterator<Item = &Path> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            RunStatus::Succeeded { artifact } => Some(artifact.as_path()),
            _ => None,
        })
    }

    /// Writes `campaign_report.json` into `dir`.
    pub fn write_to(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join(REPORT_FILE_NAME);
        atomic_write_json_pretty(&path, self)?;
        Ok(path)
    }
}

pub struct Campaign<'a, S: FlameSolver + ?Sized> {
    config: &'a CampaignConfig,
    solver: &'a S,
    output_dir: PathBuf,
    options: CampaignOptions,
    state: CampaignState,
}

impl<'a, S: FlameSolver + ?Sized> Campaign<'a, S> {
    pub fn new(
        config: &'a CampaignConfig,
        solver: &'a S,
        output_dir: impl Into<PathBuf>,
        options: CampaignOptions,
    ) -> Self {
        Self {
            config,
            solver,
            output_dir: output_dir.into(),
            options,
            state: CampaignState::Idle,
        }
    }

    pub fn state(&self) -> CampaignState {
        self.state
    }

    pub fn plan(&self) -> Result<CampaignPlan, ConfigurationError> {
        plan_campaign(self.config, &self.options)
    }

    /// Runs every `(epistemic, aleatory)` pair once. Per-run failures end up
    /// in the report; only setup problems are returned as errors.
    pub fn run(&mut self) -> Result<CampaignReport, CampaignError> {
        if self.state != CampaignState::Idle {
            return Err(CampaignError::NotIdle(self.state));
        }
        let plan = self.plan()?;
        let base = self.config.to_tree()?;
        ensure_dir(&self.output_dir).map_err(|source| CampaignError::OutputDir {
            path: self.output_dir.clone(),
            source,
        })?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(plan.workers)
            .thread_name(|i| format!("uq-worker-{}", i))
            .build()?;

        self.state = CampaignState::Running;
        let started_at = Utc::now();
        info!(
            epistemic_samples = plan.epistemic_samples(),
            aleatory_samples = plan.aleatory_samples(),
            total_runs = plan.total_runs(),
            workers = plan.workers,
            seed = plan.seed,
            directory = %self.output_dir.display(),
            "campaign started"
        );

        let ctx = BatchContext {
            base: &base,
            aleatory: &plan.aleatory_parameters,
            solver: self.solver,
            output_dir: &self.output_dir,
            cancellation: &self.options.cancellation,
        };
        let batches: Vec<Vec<RunOutcome>> = pool.install(|| {
            plan.tasks
                .par_iter()
                .map(|task| run_epistemic_batch(&ctx, task))
                .collect()
        });
        let mut outcomes: Vec<RunOutcome> = batches.into_iter().flatten().collect();
        outcomes.sort_by_key(|o| o.identity);

        self.state = if self.options.cancellation.is_cancelled() {
            CampaignState::Aborted
        } else {
            CampaignState::Completed
        };
        let (mut succeeded, mut failed, mut cancelled) = (0, 0, 0);
        for outcome in &outcomes {
            match outcome.status {
                RunStatus::Succeeded { .. } => succeeded += 1,
                RunStatus::Failed { .. } => failed += 1,
                RunStatus::Cancelled => cancelled += 1,
            }
        }
        info!(
            state = %self.state,
            succeeded,
            failed,
            cancelled,
            "campaign finished"
        );

        Ok(CampaignReport {
            schema_version: REPORT_SCHEMA,
            state: self.state,
            seed: plan.seed,
            workers: plan.workers,
            epistemic_samples: plan.epistemic_samples(),
            aleatory_samples: plan.aleatory_samples(),
            config_digest: self.config.digest(),
            output_dir: self.output_dir.clone(),
            started_at,
            finished_at: Utc::now(),
            succeeded,
            failed,
            cancelled,
            outcomes,
        })
    }
}

struct BatchContext<'a, S: FlameSolver + ?Sized> {
    base: &'a Value,
    aleatory: &'a [UncertainParameter],
    solver: &'a S,
    output_dir: &'a Path,
    cancellation: &'a CancellationToken,
}

fn run_epistemic_batch<S: FlameSolver + ?Sized>(
    ctx: &BatchContext<'_, S>,
    task: &EpistemicTask,
) -> Vec<RunOutcome> {
    let mut rng = StdRng::seed_from_u64(task.seed);
    let mut outcomes = Vec::with_capacity(task.aleatory_samples);
    debug!(epistemic_index = task.epistemic_index, "batch started");

    for j in 0..task.aleatory_samples {
        let identity = RunIdentity::new(task.epistemic_index, j);
        if ctx.cancellation.is_cancelled() {
            outcomes.push(RunOutcome {
                identity,
                overrides: None,
                status: RunStatus::Cancelled,
            });
            continue;
        }

        let (overrides, result) = match sample_overrides(ctx.aleatory, &mut rng) {
            Ok(aleatory) => {
                let overrides = task.overrides.merged_with(&aleatory);
                let result = run_one(ctx, identity, &overrides);
                (Some(overrides), result)
            }
            Err(e) => (None, Err(RunFailure::from(e))),
        };
        let status = match result {
            Ok(handle) => {
                debug!(
                    epistemic_index = identity.epistemic_index,
                    aleatory_index = identity.aleatory_index,
                    artifact = %handle.path.display(),
                    "run succeeded"
                );
                RunStatus::Succeeded {
                    artifact: handle.path,
                }
            }
            Err(RunFailure::Simulation(failure))
                if matches!(failure.cause, SolverError::Cancelled) =>
            {
                RunStatus::Cancelled
            }
            Err(e) => {
                warn!(
                    epistemic_index = identity.epistemic_index,
                    aleatory_index = identity.aleatory_index,
                    kind = e.kind(),
                    error = %e,
                    "run failed"
                );
                RunStatus::Failed {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }
            }
        };
        outcomes.push(RunOutcome {
            identity,
            overrides,
            status,
        });
    }

    info!(
        epistemic_index = task.epistemic_index,
        succeeded = outcomes
            .iter()
            .filter(|o| matches!(o.status, RunStatus::Succeeded { .. }))
            .count(),
        runs = outcomes.len(),
        "batch finished"
    );
    outcomes
}

fn run_one<S: FlameSolver + ?Sized>(
    ctx: &BatchContext<'_, S>,
    identity: RunIdentity,
    overrides: &OverrideSet,
) -> Result<ArtifactHandle, RunFailure> {
    let input = resolve(ctx.base, overrides)?;
    Ok(invoke(ctx.solver, &input, Some(identity), ctx.output_dir)?)
}
