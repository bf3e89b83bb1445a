//! Test-only executors with predetermined outcomes.

use std::collections::VecDeque;
use std::fs;
use std::sync::Mutex;

use anyhow::{Result, anyhow};

use crate::core::action::{CallOutcome, CallReport, RecordedRequest, RecordedResponse};
use crate::core::session::RuntimeConfig;
use crate::io::http::CallRunner;
use crate::io::script::{Stage, StageOutcome, StageRunner};
use crate::io::snapshot::EnvSnapshot;
use crate::step::Targets;

/// Stage runner returning queued outcomes in order and recording each stage run.
///
/// Once the queue is empty every stage succeeds.
#[derive(Debug, Default)]
pub struct ScriptedStages {
    outcomes: Mutex<VecDeque<StageOutcome>>,
    ran: Mutex<Vec<Stage>>,
}

impl ScriptedStages {
    pub fn new(outcomes: Vec<StageOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            ran: Mutex::new(Vec::new()),
        }
    }

    pub fn ran(&self) -> Vec<Stage> {
        self.ran.lock().expect("stages lock").clone()
    }
}

impl StageRunner for ScriptedStages {
    async fn run_stage(&self, stage: Stage) -> Result<StageOutcome> {
        self.ran.lock().expect("stages lock").push(stage);
        Ok(self
            .outcomes
            .lock()
            .expect("stages lock")
            .pop_front()
            .unwrap_or_default())
    }
}

/// Call runner answering every request with the same status.
#[derive(Debug, Default)]
pub struct ScriptedCalls {
    code: Option<u16>,
    seen: Mutex<Vec<(RecordedRequest, String)>>,
}

impl ScriptedCalls {
    /// Every call gets an empty response with `code`.
    pub fn ok(code: u16) -> Self {
        Self {
            code: Some(code),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Every call cannot be built and returns `Err`.
    pub fn broken() -> Self {
        Self::default()
    }

    /// Requests replayed so far, with the authority they targeted.
    pub fn seen(&self) -> Vec<(RecordedRequest, String)> {
        self.seen.lock().expect("calls lock").clone()
    }
}

impl CallRunner for ScriptedCalls {
    async fn replay(
        &self,
        request: &RecordedRequest,
        runtime: &RuntimeConfig,
    ) -> Result<CallReport> {
        let code = self
            .code
            .ok_or_else(|| anyhow!("malformed request '{}'", request.url))?;
        self.seen
            .lock()
            .expect("calls lock")
            .push((request.clone(), runtime.authority()));
        Ok(CallReport {
            elapsed_micros: 1,
            request: request.clone(),
            outcome: CallOutcome::Response(RecordedResponse {
                code,
                ..RecordedResponse::default()
            }),
        })
    }
}

/// Targets with literal host/port; the snapshot is never read.
pub fn literal_targets(host: &str, port: &str) -> Targets {
    Targets::new(host, port, EnvSnapshot::at("/nonexistent/fuzz-agent-test.env"))
}

/// Minimal OpenAPI 3.0 document with one operation.
pub const MINIMAL_SPEC: &str =
    r#"{"openapi": "3.0.3", "info": {"title": "t", "version": "1"}, "paths": {"/": {"get": {}}}}"#;

/// Scratch working directory holding `openapi.json`.
pub fn workdir_with_spec(spec: &str) -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("openapi.json"), spec).expect("write spec");
    temp
}
