use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::artifact::{artifact_file_name, check_solution_tree, RunIdentity};
use crate::config::CampaignConfig;
use crate::error::{RunFailure, SimulationFailure};
use crate::fsutil::ensure_dir;
use crate::resolve::{resolve, OverrideSet, ResolvedInput};
use crate::solver::{FlameSolver, SolverError};

/// A successfully written artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactHandle {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<RunIdentity>,
}

/// Calls the solver once. On success exactly one artifact exists at the
/// returned path; on failure nothing is left behind for this run.
pub fn invoke<S: FlameSolver + ?Sized>(
    solver: &S,
    input: &ResolvedInput,
    identity: Option<RunIdentity>,
    output_dir: &Path,
) -> Result<ArtifactHandle, SimulationFailure> {
    let fail = |cause: SolverError| SimulationFailure { identity, cause };

    let file_name = artifact_file_name(input.geometry.kind, identity);
    let final_path = output_dir.join(&file_name);
    let staging = output_dir.join(format!(".{}.partial", file_name));
    discard(&staging);

    let solved = panic::catch_unwind(AssertUnwindSafe(|| solver.solve(input, &staging)))
        .unwrap_or_else(|payload| Err(SolverError::Panicked(panic_message(payload.as_ref()))));
    if let Err(cause) = solved.and_then(|()| check_staged(&staging, &final_path)) {
        discard(&staging);
        return Err(fail(cause));
    }

    if final_path.exists() {
        warn!(artifact = %final_path.display(), "overwriting existing artifact");
    }
    if let Err(e) = fs::rename(&staging, &final_path) {
        discard(&staging);
        return Err(fail(SolverError::Io(e)));
    }
    Ok(ArtifactHandle {
        path: final_path,
        identity,
    })
}

fn check_staged(staging: &Path, final_path: &Path) -> Result<(), SolverError> {
    let bytes = match fs::read(staging) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SolverError::MissingArtifact {
                path: final_path.to_path_buf(),
            })
        }
        Err(e) => return Err(SolverError::Io(e)),
    };
    let artifact: Value =
        serde_json::from_slice(&bytes).map_err(|e| SolverError::MalformedArtifact {
            path: final_path.to_path_buf(),
            reason: e.to_string(),
        })?;
    check_solution_tree(&artifact).map_err(|reason| SolverError::MalformedArtifact {
        path: final_path.to_path_buf(),
        reason,
    })
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove staging file");
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs one simulation from a `single`-mode configuration.
pub fn run_single<S: FlameSolver + ?Sized>(
    config: &CampaignConfig,
    solver: &S,
    output_dir: &Path,
) -> Result<ArtifactHandle, RunFailure> {
    let input = resolve(&config.to_tree()?, &OverrideSet::new())?;
    ensure_dir(output_dir).map_err(|e| SimulationFailure {
        identity: None,
        cause: SolverError::Io(e),
    })?;
    info!(
        geometry = input.geometry.kind.as_str(),
        directory = %output_dir.display(),
        "starting single run"
    );
    let handle = invoke(solver, &input, None, output_dir)?;
    info!(artifact = %handle.path.display(), "single run complete");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_single_yaml, single_input, temp_dir, write_solution};

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .expect("list")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn successful_call_leaves_exactly_one_artifact() {
        let dir = temp_dir("invoke_ok");
        let solver = |_: &ResolvedInput, path: &Path| -> Result<(), SolverError> {
            Ok(write_solution(path, 1800.0)?)
        };
        let id = RunIdentity::new(1, 4);
        let handle = invoke(&solver, &single_input(), Some(id), &dir).expect("invoke");
        assert_eq!(handle.identity, Some(id));
        assert_eq!(handle.path, dir.join("free_flame_ep01_al004.json"));
        assert_eq!(listing(&dir), vec!["free_flame_ep01_al004.json"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn solver_error_leaves_nothing_behind() {
        let dir = temp_dir("invoke_err");
        let solver = |_: &ResolvedInput, path: &Path| -> Result<(), SolverError> {
            fs::write(path, b"partial")?;
            Err(SolverError::Rejected("did not converge".to_string()))
        };
        let failure = invoke(&solver, &single_input(), Some(RunIdentity::new(0, 2)), &dir)
            .expect_err("rejected");
        assert_eq!(failure.identity, Some(RunIdentity::new(0, 2)));
        assert_eq!(failure.cause.kind(), "rejected");
        assert!(failure.to_string().contains("ep00/al002"), "{}", failure);
        assert!(listing(&dir).is_empty(), "{:?}", listing(&dir));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_and_malformed_artifacts_are_failures() {
        let dir = temp_dir("invoke_bad");
        let silent = |_: &ResolvedInput, _: &Path| -> Result<(), SolverError> { Ok(()) };
        let err = invoke(&silent, &single_input(), Some(RunIdentity::new(0, 0)), &dir)
            .expect_err("missing");
        assert_eq!(err.cause.kind(), "missing_artifact");

        let garbage = |_: &ResolvedInput, path: &Path| -> Result<(), SolverError> {
            Ok(fs::write(path, br#"{"solution": {"grid": [0, 1], "T": [300]}}"#)?)
        };
        let err = invoke(&garbage, &single_input(), Some(RunIdentity::new(0, 1)), &dir)
            .expect_err("malformed");
        assert_eq!(err.cause.kind(), "malformed_artifact");
        assert!(listing(&dir).is_empty(), "{:?}", listing(&dir));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn panicking_solver_becomes_a_failure() {
        let dir = temp_dir("invoke_panic");
        let solver = |_: &ResolvedInput, _: &Path| -> Result<(), SolverError> {
            panic!("newton iteration diverged")
        };
        let err = invoke(&solver, &single_input(), Some(RunIdentity::new(3, 7)), &dir)
            .expect_err("panic");
        match err.cause {
            SolverError::Panicked(message) => assert!(message.contains("diverged"), "{}", message),
            other => panic!("unexpected cause {:?}", other),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn single_run_writes_a_token_named_artifact() {
        let dir = temp_dir("invoke_single");
        let out = dir.join("results");
        let config = CampaignConfig::from_yaml_str(&sample_single_yaml()).expect("valid");
        let solver = |input: &ResolvedInput, path: &Path| -> Result<(), SolverError> {
            Ok(write_solution(path, input.boundary_conditions.burner_temperature + 1500.0)?)
        };
        let handle = run_single(&config, &solver, &out).expect("single run");
        assert_eq!(handle.identity, None);
        let name = handle
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("file name")
            .to_string();
        assert!(name.starts_with("free_flame_") && name.ends_with(".json"), "{}", name);
        assert_eq!(listing(&out), vec![name]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn single_run_rejects_configs_with_open_distributions() {
        let dir = temp_dir("invoke_single_uq");
        let config =
            CampaignConfig::from_yaml_str(&crate::testing::sample_uq_yaml()).expect("valid");
        let solver = |_: &ResolvedInput, _: &Path| -> Result<(), SolverError> { Ok(()) };
        let err = run_single(&config, &solver, &dir).expect_err("unresolved");
        assert_eq!(err.kind(), "configuration");
        let _ = fs::remove_dir_all(dir);
    }
}
