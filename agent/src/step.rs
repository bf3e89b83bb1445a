//! Dispatch of one server directive to a local effect.
//!
//! Each directive maps to exactly one local effect and at most one report:
//!
//! | directive            | local effect                               | report        |
//! |----------------------|--------------------------------------------|---------------|
//! | `Reset`              | `start` once per session, then `reset`     | `ResetDone`   |
//! | `Call`               | replay against the resolved target         | `CallDone`    |
//! | terminal `Progress`  | none                                       | session ends  |
//!
//! Non-terminal progress never reaches this point: `Transport::call` consumes
//! it while waiting for the real reply.

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::core::action::{Directive, Progress, Report, ResetReport};
use crate::core::error::SessionError;
use crate::core::session::{RuntimeConfig, SessionState};
use crate::io::http::CallRunner;
use crate::io::script::{Stage, StageRunner, run_tracked, start_once};
use crate::io::snapshot::{EnvSnapshot, SNAPSHOT_TIMEOUT};
use crate::io::template::resolve_runtime;

/// Host/port templates and the snapshot they read from.
#[derive(Debug, Clone)]
pub struct Targets {
    pub host: String,
    pub port: String,
    pub snapshot: EnvSnapshot,
    pub read_timeout: Duration,
}

impl Targets {
    pub fn new(host: impl Into<String>, port: impl Into<String>, snapshot: EnvSnapshot) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
            snapshot,
            read_timeout: SNAPSHOT_TIMEOUT,
        }
    }

    pub async fn resolve(&self) -> Result<RuntimeConfig> {
        resolve_runtime(&self.host, &self.port, &self.snapshot, self.read_timeout).await
    }
}

/// Local executors a session drives.
pub struct Executors<'a, S, C> {
    pub stages: &'a S,
    pub calls: &'a C,
    pub targets: &'a Targets,
}

/// What the driving loop does next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Send(Report),
    Finished(Progress),
}

/// Perform the local effect of `directive` and produce the next step.
#[instrument(skip_all, fields(directive = directive.kind()))]
pub async fn exec_directive<S: StageRunner, C: CallRunner>(
    directive: Directive,
    execs: &Executors<'_, S, C>,
    state: &mut SessionState,
) -> Result<Step> {
    match directive {
        Directive::Reset => {
            let started = Instant::now();
            let mut failure = None;
            if let Some(outcome) = start_once(execs.stages, state).await? {
                failure = outcome.failure;
            }
            if failure.is_none() {
                failure = run_tracked(execs.stages, Stage::Reset, state).await?.failure;
            }
            if failure.is_none() {
                let runtime = execs.targets.resolve().await?;
                info!(authority = %runtime.authority(), "target resolved");
                state.runtime = Some(runtime);
            }
            Ok(Step::Send(Report::ResetDone(ResetReport {
                elapsed_micros: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
                failure,
            })))
        }
        Directive::Call(request) => {
            let runtime = match &state.runtime {
                Some(runtime) => runtime.clone(),
                None => {
                    let runtime = execs.targets.resolve().await?;
                    state.runtime = Some(runtime.clone());
                    runtime
                }
            };
            let report = execs
                .calls
                .replay(&request, &runtime)
                .await
                .map_err(|err| SessionError::Protocol(format!("cannot replay call: {err:#}")))?;
            state.total_requests += 1;
            debug!(
                total_requests = state.total_requests,
                failed = report.failed(),
                "call replayed"
            );
            Ok(Step::Send(Report::CallDone(report)))
        }
        Directive::Progress(progress) if progress.is_terminal() => Ok(Step::Finished(progress)),
        Directive::Progress(_) => Err(SessionError::Protocol(
            "non-terminal progress outside of a pending call".to_string(),
        )
        .into()),
    }
}

/// Record a progress push and echo its glyph on the user stream.
pub fn show_progress<W: Write>(state: &mut SessionState, out: &mut W, progress: &Progress) {
    let text = state.record_progress(progress);
    let _ = write!(out, "{text}");
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::{CallOutcome, Lane, RecordedRequest};
    use crate::io::script::StageOutcome;
    use crate::test_support::{ScriptedCalls, ScriptedStages, literal_targets};

    fn execs<'a>(
        stages: &'a ScriptedStages,
        calls: &'a ScriptedCalls,
        targets: &'a Targets,
    ) -> Executors<'a, ScriptedStages, ScriptedCalls> {
        Executors {
            stages,
            calls,
            targets,
        }
    }

    #[tokio::test]
    async fn first_reset_runs_start_then_reset() {
        let stages = ScriptedStages::new(vec![StageOutcome::default(), StageOutcome::default()]);
        let calls = ScriptedCalls::ok(200);
        let targets = literal_targets("h", "9");
        let mut state = SessionState::new();

        let step = exec_directive(Directive::Reset, &execs(&stages, &calls, &targets), &mut state)
            .await
            .expect("step");
        assert!(matches!(step, Step::Send(Report::ResetDone(ResetReport { failure: None, .. }))));
        assert_eq!(stages.ran(), vec![Stage::Start, Stage::Reset]);
        assert!(state.pre_started);
        assert_eq!(state.runtime.as_ref().map(RuntimeConfig::authority), Some("h:9".to_string()));

        exec_directive(Directive::Reset, &execs(&stages, &calls, &targets), &mut state)
            .await
            .expect("step");
        assert_eq!(stages.ran(), vec![Stage::Start, Stage::Reset, Stage::Reset]);
    }

    #[tokio::test]
    async fn failed_start_is_reported_and_remembered() {
        let stages = ScriptedStages::new(vec![StageOutcome {
            elapsed_micros: 5,
            failure: Some("start step 1 failed: exit status: 1".to_string()),
        }]);
        let calls = ScriptedCalls::ok(200);
        let targets = literal_targets("h", "9");
        let mut state = SessionState::new();

        let step = exec_directive(Directive::Reset, &execs(&stages, &calls, &targets), &mut state)
            .await
            .expect("step");
        let Step::Send(Report::ResetDone(report)) = step else {
            panic!("expected reset report, got {step:?}");
        };
        assert!(report.failure.expect("failure").contains("start step 1"));
        assert_eq!(stages.ran(), vec![Stage::Start]);
        assert!(state.had_exec_error);
        assert!(state.runtime.is_none());
    }

    #[tokio::test]
    async fn call_counts_requests_and_uses_runtime() {
        let stages = ScriptedStages::new(Vec::new());
        let calls = ScriptedCalls::ok(200);
        let targets = literal_targets("h", "9");
        let mut state = SessionState::new();
        let request = RecordedRequest {
            method: "GET".to_string(),
            url: "http://old.example:1/a?b=c".to_string(),
            ..RecordedRequest::default()
        };

        let step = exec_directive(
            Directive::Call(request.clone()),
            &execs(&stages, &calls, &targets),
            &mut state,
        )
        .await
        .expect("step");
        let Step::Send(Report::CallDone(report)) = step else {
            panic!("expected call report, got {step:?}");
        };
        assert!(matches!(report.outcome, CallOutcome::Response(ref rep) if rep.code == 200));
        assert_eq!(state.total_requests, 1);
        assert_eq!(calls.seen(), vec![(request, "h:9".to_string())]);
    }

    #[tokio::test]
    async fn terminal_progress_finishes() {
        let stages = ScriptedStages::new(Vec::new());
        let calls = ScriptedCalls::ok(200);
        let targets = literal_targets("h", "9");
        let mut state = SessionState::new();
        let done = Progress {
            lane: Lane {
                tests_run: 3,
                requests_run: 7,
            },
            success: true,
            ..Progress::default()
        };
        let step = exec_directive(
            Directive::Progress(done.clone()),
            &execs(&stages, &calls, &targets),
            &mut state,
        )
        .await
        .expect("step");
        assert_eq!(step, Step::Finished(done));
    }

    #[tokio::test]
    async fn stray_progress_is_a_protocol_error() {
        let stages = ScriptedStages::new(Vec::new());
        let calls = ScriptedCalls::ok(200);
        let targets = literal_targets("h", "9");
        let mut state = SessionState::new();
        let err = exec_directive(
            Directive::Progress(Progress::default()),
            &execs(&stages, &calls, &targets),
            &mut state,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn unbuildable_call_is_a_protocol_error() {
        let stages = ScriptedStages::new(Vec::new());
        let calls = ScriptedCalls::broken();
        let targets = literal_targets("h", "9");
        let mut state = SessionState::new();
        let request = RecordedRequest {
            method: "GET".to_string(),
            url: "not a url".to_string(),
            ..RecordedRequest::default()
        };
        let err = exec_directive(
            Directive::Call(request),
            &execs(&stages, &calls, &targets),
            &mut state,
        )
        .await
        .unwrap_err();
        let Some(SessionError::Protocol(reason)) = err.downcast_ref::<SessionError>() else {
            panic!("expected a protocol error, got {err:#}");
        };
        assert!(reason.starts_with("cannot replay call"), "{reason}");
        assert!(reason.contains("not a url"), "{reason}");
        assert_eq!(state.total_requests, 0);
        assert!(calls.seen().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_target_aborts() {
        let stages = ScriptedStages::new(Vec::new());
        let calls = ScriptedCalls::ok(200);
        let targets = literal_targets("h", "not-a-port");
        let mut state = SessionState::new();
        let err = exec_directive(
            Directive::Call(RecordedRequest::default()),
            &execs(&stages, &calls, &targets),
            &mut state,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Config(_))
        ));
        assert_eq!(state.total_requests, 0);
    }

    #[test]
    fn progress_glyphs_reach_the_stream() {
        let mut state = SessionState::new();
        let mut out = Vec::new();
        let push = Progress {
            lane: Lane {
                tests_run: 1,
                requests_run: 1,
            },
            ..Progress::default()
        };
        show_progress(&mut state, &mut out, &push);
        assert_eq!(String::from_utf8(out).expect("utf8"), "●");
        assert_eq!(state.last_lane.requests_run, 1);
    }
}
