//! Per-session counters and idempotency flags.
//!
//! One [`SessionState`] is created per session and passed by reference through
//! bootstrap, dispatch and the executors. Only the main control flow touches it.

use crate::core::action::{Lane, Progress};

/// Glyph printed for a progress push while the service is still exploring.
pub const GLYPH_PASS: char = '●';
/// Glyph printed for a progress push once minimization of a failure started.
pub const GLYPH_FAIL: char = '×';

/// Target of replayed calls, resolved from the host/port templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub final_host: String,
    pub final_port: u16,
}

impl RuntimeConfig {
    /// `host:port` authority used for the URL and the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.final_host, self.final_port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub last_lane: Lane,
    /// Lane at which shrinking began; set once.
    pub shrinking_from: Option<Lane>,
    /// Completed `DoCall` directives.
    pub total_requests: u64,
    pub pre_started: bool,
    pub stopped: bool,
    pub had_exec_error: bool,
    /// `None` until the templates are first resolved.
    pub runtime: Option<RuntimeConfig>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a progress push and return the text to show on the user stream.
    ///
    /// A new line starts whenever the tests-run counter advances.
    pub fn record_progress(&mut self, progress: &Progress) -> String {
        let advanced = progress.lane.tests_run > self.last_lane.tests_run;
        self.last_lane = progress.lane;
        if self.shrinking_from.is_none() {
            self.shrinking_from = progress.shrinking_from;
        }

        let glyph = if self.shrinking_from.is_some() {
            GLYPH_FAIL
        } else {
            GLYPH_PASS
        };
        if advanced && progress.lane.tests_run > 1 {
            format!("\n{glyph}")
        } else {
            glyph.to_string()
        }
    }
}
