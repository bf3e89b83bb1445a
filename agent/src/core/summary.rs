//! Run summary printed when the service ends the session.

use crate::core::action::Progress;
use crate::core::error::SessionError;
use crate::core::session::SessionState;
use crate::exit_codes;

/// Final verdict of a fuzz session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub lines: Vec<String>,
    pub exit_code: i32,
}

/// Build the summary for a terminal progress.
///
/// A bug is reported with the number of tests before shrinking began and the
/// number of shrink steps after it. Without a shrink origin every test counts
/// as a shrink step. A progress that is neither success nor failure is a
/// protocol violation.
pub fn summarize(done: &Progress, state: &SessionState) -> Result<Summary, SessionError> {
    let mut lines = vec![format!(
        "Ran {} tests totalling {} requests",
        state.last_lane.tests_run, state.total_requests
    )];

    if done.failure {
        let found_after = state.shrinking_from.map_or(0, |lane| lane.tests_run);
        let shrunk = state.last_lane.tests_run.saturating_sub(found_after);
        lines.push(if shrunk == 1 {
            format!("A bug was detected after {found_after} tests then shrunk once!")
        } else {
            format!("A bug was detected after {found_after} tests then shrunk {shrunk} times!")
        });
        return Ok(Summary {
            lines,
            exit_code: exit_codes::BUG_FOUND,
        });
    }

    if !done.success {
        return Err(SessionError::Protocol(
            "terminal progress is neither success nor failure".to_string(),
        ));
    }
    lines.push("No bugs found... yet.".to_string());
    Ok(Summary {
        lines,
        exit_code: exit_codes::OK,
    })
}

/// Fold the shell-stage failure flag into the verdict exit status.
///
/// A found bug keeps its status; an otherwise clean run is elevated.
pub fn final_exit_code(summary: &Summary, state: &SessionState) -> i32 {
    if summary.exit_code == exit_codes::OK && state.had_exec_error {
        exit_codes::EXEC_FAILED
    } else {
        summary.exit_code
    }
}
