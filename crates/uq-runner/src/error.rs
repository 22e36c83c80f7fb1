use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::artifact::RunIdentity;
use crate::campaign::CampaignState;
use crate::solver::SolverError;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {}", .problems.join("; "))]
    Invalid { problems: Vec<String> },
    #[error("distribution-valued field(s) left after resolution: {}", .pointers.join(", "))]
    UnresolvedDistribution { pointers: Vec<String> },
    #[error("invalid composition '{composition}': {reason}")]
    Composition { composition: String, reason: String },
    #[error("resolved input is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{0}")]
    Resolution(String),
}

impl ConfigurationError {
    pub(crate) fn invalid(problem: impl Into<String>) -> Self {
        ConfigurationError::Invalid {
            problems: vec![problem.into()],
        }
    }
}

/// A solver call that did not produce an artifact.
#[derive(Debug, Error)]
#[error("simulation {} failed: {}", run_label(.identity), .cause)]
pub struct SimulationFailure {
    pub identity: Option<RunIdentity>,
    #[source]
    pub cause: SolverError,
}

fn run_label(identity: &Option<RunIdentity>) -> String {
    match identity {
        Some(id) => id.to_string(),
        None => "single run".to_string(),
    }
}

/// Why one run of a campaign did not succeed.
#[derive(Debug, Error)]
pub enum RunFailure {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Simulation(#[from] SimulationFailure),
}

impl RunFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            RunFailure::Configuration(_) => "configuration",
            RunFailure::Simulation(failure) => failure.cause.kind(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CampaignError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error("campaign cannot start from state {0}")]
    NotIdle(CampaignState),
}

#[derive(Debug)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge output {path} already exists; refusing to overwrite")]
    OutputExists { path: PathBuf },
    #[error("no artifacts matching '{pattern}' found in {directory}")]
    NoInput { directory: PathBuf, pattern: String },
    #[error("invalid filename pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("failed to scan {directory}: {source}")]
    Scan {
        directory: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("artifacts {first} and {second} both map to group '{group}'")]
    DuplicateGroup {
        group: String,
        first: String,
        second: String,
    },
    #[error("failed to read artifact {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("artifact {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write merged dataset {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "merged dataset written to {output}, but {} input file(s) could not be removed: {}",
        .failures.len(),
        cleanup_list(.failures)
    )]
    Cleanup {
        output: PathBuf,
        failures: Vec<CleanupFailure>,
    },
}

fn cleanup_list(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.path.display(), f.source))
        .collect::<Vec<_>>()
        .join(", ")
}
