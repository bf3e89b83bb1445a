//! Child processes with a deadline and capped output capture.

use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Extra wait after the kill deadline before giving up on a child's output pipes.
const REAP_GRACE: Duration = Duration::from_millis(500);

/// One output stream, capped at the capture limit.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// Bytes drained from the pipe but not kept.
    pub dropped: u64,
}

impl Captured {
    pub fn lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Trimmed stderr, with a marker when part of it was dropped.
    pub fn stderr_text(&self) -> String {
        let mut text = self.stderr.lossy().trim().to_string();
        if self.stderr.dropped > 0 {
            text.push_str(&format!(" [{} more bytes]", self.stderr.dropped));
        }
        text
    }
}

/// Run `cmd` with null stdin, killing it once `timeout` elapses.
///
/// Both pipes are drained on their own threads while the child runs; at most
/// `limit` bytes of each are kept.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
pub fn run_captured(mut cmd: Command, timeout: Duration, limit: usize) -> Result<CommandOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn command")?;
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr not piped"))?;
    let stdout = thread::spawn(move || capture(stdout, limit));
    let stderr = thread::spawn(move || capture(stderr, limit));

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!("command exceeded its deadline, killing");
            child.kill().context("kill command")?;
            (child.wait().context("reap killed command")?, true)
        }
    };

    let stdout = joined(stdout).context("capture stdout")?;
    let stderr = joined(stderr).context("capture stderr")?;
    debug!(code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

/// [`run_captured`] raced against the deadline on a helper thread.
///
/// Killing the child does not reach grandchildren that inherited its pipes,
/// so the capture threads can outlive the deadline. `Ok(None)` means the
/// deadline won and the run was abandoned.
pub fn run_bounded(cmd: Command, timeout: Duration, limit: usize) -> Result<Option<CommandOutput>> {
    let (tx, rx) = mpsc::sync_channel(1);
    thread::spawn(move || {
        let _ = tx.send(run_captured(cmd, timeout, limit));
    });
    match rx.recv_timeout(timeout + REAP_GRACE) {
        Ok(result) => result.map(Some),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!("output pipes still open past the deadline, abandoning command");
            Ok(None)
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(anyhow!("command thread died")),
    }
}

fn capture<R: Read>(mut pipe: R, limit: usize) -> io::Result<Captured> {
    let mut bytes = Vec::new();
    (&mut pipe).take(limit as u64).read_to_end(&mut bytes)?;
    let dropped = io::copy(&mut pipe, &mut io::sink())?;
    Ok(Captured { bytes, dropped })
}

fn joined(handle: thread::JoinHandle<io::Result<Captured>>) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("capture thread panicked"))?
        .map_err(Into::into)
}
