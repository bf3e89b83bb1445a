//! Shell-stage executor for the `start`/`reset`/`stop` lifecycle hooks.
//!
//! The [`StageRunner`] trait decouples dispatch from actually spawning shells.
//! Tests use scripted runners that return predetermined outcomes.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::session::SessionState;
use crate::io::config::ScriptConfig;
use crate::io::process::run_bounded;
use crate::io::snapshot::{EnvSnapshot, shell_quote};

/// Budget for one stage command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const OUTPUT_LIMIT_BYTES: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Stage {
    Start,
    Reset,
    Stop,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Reset => "reset",
            Stage::Stop => "stop",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running every command of a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutcome {
    pub elapsed_micros: u64,
    /// Reason of the first failing command; later commands were skipped.
    pub failure: Option<String>,
}

impl StageOutcome {
    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Abstraction over stage execution backends.
#[allow(async_fn_in_trait)]
pub trait StageRunner {
    /// Run all commands configured for `stage`. `Err` means the runner itself
    /// broke; a failing command is a normal outcome.
    async fn run_stage(&self, stage: Stage) -> Result<StageOutcome>;
}

/// Stage runner that spawns `bash` once per configured command.
#[derive(Debug, Clone)]
pub struct ShellStages {
    script: ScriptConfig,
    snapshot: EnvSnapshot,
    workdir: PathBuf,
    command_timeout: Duration,
}

impl ShellStages {
    pub fn new(script: ScriptConfig, snapshot: EnvSnapshot, workdir: impl Into<PathBuf>) -> Self {
        Self {
            script,
            snapshot,
            workdir: workdir.into(),
            command_timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn commands(&self, stage: Stage) -> &[String] {
        match stage {
            Stage::Start => &self.script.start,
            Stage::Reset => &self.script.reset,
            Stage::Stop => &self.script.stop,
        }
    }
}

impl StageRunner for ShellStages {
    #[instrument(skip_all, fields(stage = %stage))]
    async fn run_stage(&self, stage: Stage) -> Result<StageOutcome> {
        let commands = self.commands(stage).to_vec();
        if commands.is_empty() {
            debug!("no commands configured");
            return Ok(StageOutcome::default());
        }
        let runner = self.clone();
        tokio::task::spawn_blocking(move || runner.run_commands(stage, &commands))
            .await
            .context("join stage runner")?
    }
}

impl ShellStages {
    fn run_commands(&self, stage: Stage, commands: &[String]) -> Result<StageOutcome> {
        let start = Instant::now();
        let mut failure = None;
        for (index, command) in commands.iter().enumerate() {
            info!(stage = %stage, step = index + 1, command = %command, "running stage command");
            if let Some(reason) = self.run_one(command)? {
                warn!(stage = %stage, step = index + 1, reason = %reason, "stage command failed");
                failure = Some(format!("{stage} step {} failed: {reason}", index + 1));
                break;
            }
        }
        Ok(StageOutcome {
            elapsed_micros: elapsed_micros(start),
            failure,
        })
    }

    /// Run one command; `Some(reason)` on failure.
    fn run_one(&self, command: &str) -> Result<Option<String>> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(micro_script(command, &self.snapshot))
            .current_dir(&self.workdir);

        let timed_out = format!("timed out after {}s", self.command_timeout.as_secs());
        let Some(output) = run_bounded(cmd, self.command_timeout, OUTPUT_LIMIT_BYTES)
            .context("run stage command")?
        else {
            return Ok(Some(timed_out));
        };
        if !output.stdout.bytes.is_empty() {
            debug!(stdout = %output.stdout.lossy(), "stage command output");
        }
        if output.timed_out {
            return Ok(Some(timed_out));
        }
        if !output.status.success() {
            let mut reason = output.stderr_text();
            reason.push('\n');
            reason.push_str(&output.status.to_string());
            return Ok(Some(reason));
        }
        Ok(None)
    }
}

/// Script for one command with environment continuity through the snapshot.
///
/// Sourcing is allowed to fail (first run, readonly variables); the command
/// itself runs in strict mode with tracing on.
pub fn micro_script(command: &str, snapshot: &EnvSnapshot) -> String {
    let path = shell_quote(snapshot.path());
    let mut script = String::new();
    script.push_str(&format!("source {path} >/dev/null 2>&1 || true\n"));
    script.push_str(
        "set -o errexit\nset -o errtrace\nset -o nounset\nset -o pipefail\nset -o xtrace\n",
    );
    script.push_str(command);
    script.push('\n');
    script.push_str(
        "set +o xtrace\nset +o pipefail\nset +o nounset\nset +o errtrace\nset +o errexit\n",
    );
    script.push_str(&format!("declare -p > {path}\n"));
    script
}

fn elapsed_micros(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}

/// Run a stage and remember any failure for the final exit status.
pub async fn run_tracked<R: StageRunner>(
    runner: &R,
    stage: Stage,
    state: &mut SessionState,
) -> Result<StageOutcome> {
    let outcome = runner.run_stage(stage).await?;
    if outcome.failed() {
        state.had_exec_error = true;
    }
    Ok(outcome)
}

/// Run `start` unless it already ran in this session.
pub async fn start_once<R: StageRunner>(
    runner: &R,
    state: &mut SessionState,
) -> Result<Option<StageOutcome>> {
    if state.pre_started {
        return Ok(None);
    }
    state.pre_started = true;
    run_tracked(runner, Stage::Start, state).await.map(Some)
}

/// Run `stop` unless a stop already happened in this session.
pub async fn stop_once<R: StageRunner>(
    runner: &R,
    state: &mut SessionState,
) -> Result<Option<StageOutcome>> {
    if state.stopped {
        return Ok(None);
    }
    state.stopped = true;
    run_tracked(runner, Stage::Stop, state).await.map(Some)
}
