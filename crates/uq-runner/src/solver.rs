//! The flame solver seam.
//!
//! The orchestration never looks inside a solver: it hands over a
//! [`ResolvedInput`] and a path, and expects an artifact at that path when the
//! call returns `Ok`. [`CommandSolver`] runs an external program per call.

use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::ConfigurationError;
use crate::resolve::ResolvedInput;

pub const SOLVER_REQUEST_SCHEMA: &str = "solver_request_v1";

const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub trait FlameSolver: Send + Sync {
    /// Solves one flame and writes the artifact to `output_path`.
    fn solve(&self, input: &ResolvedInput, output_path: &Path) -> Result<(), SolverError>;
}

impl<F> FlameSolver for F
where
    F: Fn(&ResolvedInput, &Path) -> Result<(), SolverError> + Send + Sync,
{
    fn solve(&self, input: &ResolvedInput, output_path: &Path) -> Result<(), SolverError> {
        self(input, output_path)
    }
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("failed to launch solver '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("solver i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("solver exited with status {status}: {stderr_tail}")]
    Exited { status: String, stderr_tail: String },
    #[error("solver rejected the run: {0}")]
    Rejected(String),
    #[error("solver exceeded its {}s time limit", .0.as_secs_f64())]
    TimedOut(Duration),
    #[error("solver call cancelled")]
    Cancelled,
    #[error("solver returned without writing {path}")]
    MissingArtifact { path: PathBuf },
    #[error("artifact {path} is malformed: {reason}")]
    MalformedArtifact { path: PathBuf, reason: String },
    #[error("solver panicked: {0}")]
    Panicked(String),
}

impl SolverError {
    pub fn kind(&self) -> &'static str {
        match self {
            SolverError::Launch { .. } => "launch",
            SolverError::Io(_) => "io",
            SolverError::Exited { .. } => "exit",
            SolverError::Rejected(_) => "rejected",
            SolverError::TimedOut(_) => "timeout",
            SolverError::Cancelled => "cancelled",
            SolverError::MissingArtifact { .. } => "missing_artifact",
            SolverError::MalformedArtifact { .. } => "malformed_artifact",
            SolverError::Panicked(_) => "panic",
        }
    }
}

/// What an external solver reads on stdin.
#[derive(Debug, Serialize)]
pub struct SolverRequest<'a> {
    pub schema_version: &'static str,
    pub input: &'a ResolvedInput,
    pub output_path: &'a Path,
}

/// Runs `program args... <output_path>` once per call, with the request
/// JSON piped to stdin.
#[derive(Debug, Clone)]
pub struct CommandSolver {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
}

impl CommandSolver {
    pub fn new(command: &[String]) -> Result<Self, ConfigurationError> {
        let (program, args) = command
            .split_first()
            .filter(|(program, _)| !program.trim().is_empty())
            .ok_or_else(|| ConfigurationError::invalid("'solver.command' must name a program"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: None,
            cancellation: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

impl FlameSolver for CommandSolver {
    fn solve(&self, input: &ResolvedInput, output_path: &Path) -> Result<(), SolverError> {
        let request = SolverRequest {
            schema_version: SOLVER_REQUEST_SCHEMA,
            input,
            output_path,
        };
        let payload = serde_json::to_vec(&request).map_err(io::Error::from)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        own_process_group(&mut cmd);
        debug!(command = %self.command_line(), output = %output_path.display(), "launching solver");
        let mut child = cmd.spawn().map_err(|source| SolverError::Launch {
            program: self.program.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A solver may exit without reading its input.
            let _ = stdin.write_all(&payload);
        }
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });

        let waited = self.wait(&mut child);
        let stderr = stderr_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        let status = waited?;
        if !status.success() {
            return Err(SolverError::Exited {
                status: exit_label(status),
                stderr_tail: stderr_tail(&stderr),
            });
        }
        Ok(())
    }
}

impl CommandSolver {
    fn wait(&self, child: &mut Child) -> Result<ExitStatus, SolverError> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if self.cancelled() {
                kill(child);
                return Err(SolverError::Cancelled);
            }
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    kill(child);
                    return Err(SolverError::TimedOut(limit));
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Kills the solver's whole process group, then reaps the direct child.
fn kill(child: &mut Child) {
    kill_process_group(child);
    let _ = child.kill();
    let _ = child.wait();
}

/// Wrapper scripts fork the real solve; its own group lets one signal reach
/// every process it started.
#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: kill(2) takes no pointers; a negative pid names the group
        // created for this child at spawn.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

fn exit_label(status: ExitStatus) -> String {
    status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn stderr_tail(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("solver exited without stderr output")
        .trim()
        .to_string()
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{single_input, temp_dir};

    fn sh(script: &str) -> CommandSolver {
        CommandSolver::new(&["sh".to_string(), "-c".to_string(), script.to_string()])
            .expect("command")
    }

    #[test]
    fn empty_command_is_a_configuration_error() {
        assert!(CommandSolver::new(&[]).is_err());
        assert!(CommandSolver::new(&[" ".to_string()]).is_err());
    }

    #[test]
    fn command_line_quotes_awkward_arguments() {
        let solver = CommandSolver::new(&[
            "python".to_string(),
            "flame solver.py".to_string(),
            "--mode=it's".to_string(),
        ])
        .expect("command");
        assert_eq!(
            solver.command_line(),
            "python 'flame solver.py' '--mode=it'\"'\"'s'"
        );
    }

    #[test]
    fn closures_are_solvers() {
        let dir = temp_dir("solver_closure");
        let out = dir.join("a.json");
        let solver = |_: &ResolvedInput, path: &Path| -> Result<(), SolverError> {
            std::fs::write(path, b"{}").map_err(SolverError::from)
        };
        solver.solve(&single_input(), &out).expect("solve");
        assert!(out.exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn command_receives_request_on_stdin_and_path_as_last_argument() {
        let dir = temp_dir("solver_stdin");
        let out = dir.join("run.json");
        // `sh -c script arg` binds the appended path to $0.
        sh("cat > \"$0\"").solve(&single_input(), &out).expect("solve");
        let request: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&out).expect("read")).expect("json");
        assert_eq!(request["schema_version"], SOLVER_REQUEST_SCHEMA);
        assert_eq!(request["input"]["mechanism"], "gri30.yaml");
        assert_eq!(request["output_path"], out.to_str().expect("utf-8 path"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_carries_the_stderr_tail() {
        let dir = temp_dir("solver_exit");
        let err = sh("echo starting >&2; echo 'flame did not converge' >&2; exit 3")
            .solve(&single_input(), &dir.join("run.json"))
            .expect_err("exit 3");
        match err {
            SolverError::Exited { status, stderr_tail } => {
                assert_eq!(status, "3");
                assert_eq!(stderr_tail, "flame did not converge");
            }
            other => panic!("unexpected error {:?}", other),
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn slow_solver_is_killed_at_the_time_limit() {
        let dir = temp_dir("solver_timeout");
        let started = Instant::now();
        let err = sh("exec sleep 5")
            .with_timeout(Some(Duration::from_millis(200)))
            .solve(&single_input(), &dir.join("run.json"))
            .expect_err("timeout");
        assert_eq!(err.kind(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(4));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_also_kills_processes_forked_by_a_wrapper() {
        let dir = temp_dir("solver_wrapper");
        let out = dir.join("run.json");
        let pid_file = dir.join("run.json.pid");
        // No `exec`: the shell stays the direct child and `sleep` is its
        // child, holding the stderr pipe open.
        let started = Instant::now();
        let err = sh("sleep 30 & echo $! > \"$0.pid\"; wait")
            .with_timeout(Some(Duration::from_millis(300)))
            .solve(&single_input(), &out)
            .expect_err("timeout");
        assert_eq!(err.kind(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        let deadline = Instant::now() + Duration::from_secs(5);
        while process_is_running(pid) {
            assert!(Instant::now() < deadline, "forked solver {} survived the kill", pid);
            thread::sleep(Duration::from_millis(20));
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    /// A reaped or zombie process no longer runs.
    #[cfg(unix)]
    fn process_is_running(pid: i32) -> bool {
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            return !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z'));
        }
        // SAFETY: signal 0 only probes for existence.
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[cfg(unix)]
    #[test]
    fn cancelled_token_stops_the_call() {
        let dir = temp_dir("solver_cancel");
        let token = CancellationToken::new();
        token.cancel();
        let err = sh("exec sleep 5")
            .with_cancellation(token)
            .solve(&single_input(), &dir.join("run.json"))
            .expect_err("cancelled");
        assert!(matches!(err, SolverError::Cancelled), "{:?}", err);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_program_fails_to_launch() {
        let dir = temp_dir("solver_launch");
        let solver =
            CommandSolver::new(&["/nonexistent/mckenna-flame-solver".to_string()]).expect("command");
        let err = solver
            .solve(&single_input(), &dir.join("run.json"))
            .expect_err("launch");
        assert_eq!(err.kind(), "launch");
        let _ = std::fs::remove_dir_all(dir);
    }
}
