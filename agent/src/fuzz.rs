//! The `fuzz` command: one session from dial to verdict.
//!
//! The loop alternates between performing a directive locally
//! ([`exec_directive`]) and sending its report back ([`Transport::call`]) until
//! the service pushes a terminal progress. The user stream `out` receives
//! progress glyphs followed by the run summary.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::action::{OpenSession, Progress};
use crate::core::session::SessionState;
use crate::core::summary::{Summary, final_exit_code, summarize};
use crate::io::config::AgentConfig;
use crate::io::http::{AGENT_IDENTITY, CallRunner, HttpCalls};
use crate::io::script::{ShellStages, StageRunner, stop_once};
use crate::io::snapshot::EnvSnapshot;
use crate::io::spec::{OpenApiCompiler, compile_file};
use crate::io::transport::{Transport, TransportConfig};
use crate::start::{Dial, open_session};
use crate::step::{Executors, Step, Targets, exec_directive, show_progress};

/// Outcome of a session that reached a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzOutcome {
    pub summary: Summary,
    /// Verdict status with stage failures folded in.
    pub exit_code: i32,
    pub state: SessionState,
}

/// Run `fuzz` with the real executors.
pub async fn run_fuzz<W: Write>(
    cfg: &AgentConfig,
    workdir: &Path,
    snapshot: EnvSnapshot,
    endpoint: Option<String>,
    out: &mut W,
) -> Result<FuzzOutcome> {
    let compiled = compile_file(&OpenApiCompiler, &workdir.join(&cfg.spec))?;
    info!(operations = compiled.operations, "spec compiled");
    let dial = Dial {
        endpoint: endpoint.unwrap_or_else(|| cfg.endpoint.clone()),
        auth_token: cfg.resolve_auth_token()?,
        transport: TransportConfig::default(),
    };
    let open = OpenSession {
        config: cfg.session_config(),
        spec: compiled.blob,
        agent: AGENT_IDENTITY.to_string(),
    };

    let stages = ShellStages::new(cfg.script.clone(), snapshot.clone(), workdir);
    let calls = HttpCalls::new()?;
    let targets = Targets::new(&cfg.host, &cfg.port, snapshot);
    let execs = Executors {
        stages: &stages,
        calls: &calls,
        targets: &targets,
    };
    run_session(&dial, open, &execs, out).await
}

/// Drive one session with the given executors.
///
/// `stop` runs at most once: after the verdict, or best-effort when a session
/// that already ran `start` aborts.
#[instrument(skip_all, fields(endpoint = %dial.endpoint))]
pub async fn run_session<S, C, W>(
    dial: &Dial,
    open: OpenSession,
    execs: &Executors<'_, S, C>,
    out: &mut W,
) -> Result<FuzzOutcome>
where
    S: StageRunner,
    C: CallRunner,
    W: Write,
{
    let mut state = SessionState::new();
    let driven = drive(dial, open, execs, &mut state, out).await;

    let (mut transport, done) = match driven {
        Ok(finished) => finished,
        Err(err) => {
            if state.pre_started {
                stop_best_effort(execs.stages, &mut state).await;
            }
            return Err(err);
        }
    };

    stop_best_effort(execs.stages, &mut state).await;
    let summary = summarize(&done, &state);
    let summary = match summary {
        Ok(summary) => summary,
        Err(err) => {
            transport.close().await;
            return Err(err.into());
        }
    };
    writeln!(out).context("write summary")?;
    for line in &summary.lines {
        writeln!(out, "{line}").context("write summary")?;
    }
    out.flush().context("flush summary")?;
    transport.close().await;

    let exit_code = final_exit_code(&summary, &state);
    info!(
        tests_run = state.last_lane.tests_run,
        total_requests = state.total_requests,
        exit_code,
        "session finished"
    );
    Ok(FuzzOutcome {
        summary,
        exit_code,
        state,
    })
}

async fn drive<S, C, W>(
    dial: &Dial,
    open: OpenSession,
    execs: &Executors<'_, S, C>,
    state: &mut SessionState,
    out: &mut W,
) -> Result<(Transport, Progress)>
where
    S: StageRunner,
    C: CallRunner,
    W: Write,
{
    let (mut transport, mut next) = open_session(dial, open, state, out).await?;
    loop {
        let step = match exec_directive(next, execs, state).await {
            Ok(step) => step,
            Err(err) => {
                transport.escalate(format!("{err:#}")).await;
                return Err(err);
            }
        };
        let report = match step {
            Step::Finished(done) => {
                show_progress(state, out, &done);
                return Ok((transport, done));
            }
            Step::Send(report) => report,
        };
        next = match transport
            .call(report, |progress| show_progress(state, out, progress))
            .await
        {
            Ok(directive) => directive,
            Err(err) => {
                transport.close().await;
                return Err(err.into());
            }
        };
    }
}

async fn stop_best_effort<S: StageRunner>(stages: &S, state: &mut SessionState) {
    match stop_once(stages, state).await {
        Ok(Some(outcome)) if outcome.failed() => {
            warn!(reason = ?outcome.failure, "stop stage failed");
        }
        Ok(_) => {}
        Err(err) => warn!(err = %format!("{err:#}"), "stop stage could not run"),
    }
}
