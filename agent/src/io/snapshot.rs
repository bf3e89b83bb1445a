//! Shell environment snapshot shared by stages and templates.
//!
//! Each stage command sources the snapshot before it runs and dumps
//! `declare -p` back into it afterwards, so variables set by one command are
//! visible to the next command, to later stages, and to config templates.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::io::process::run_captured;

/// Budget for snapshot reads and writes.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_millis(200);

const VALUE_LIMIT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSnapshot {
    path: PathBuf,
}

impl EnvSnapshot {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot location for a working directory: `<tmp>/.fuzz-agent_<hash>.env`.
    pub fn for_workdir(workdir: &Path) -> Result<Self> {
        let real = workdir
            .canonicalize()
            .with_context(|| format!("canonicalize {}", workdir.display()))?;
        let digest = Sha256::digest(real.as_os_str().as_encoded_bytes());
        let id = hex::encode(&digest[..8]);
        Ok(Self::at(
            std::env::temp_dir().join(format!(".fuzz-agent_{id}.env")),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dump the current environment into the snapshot unless it already exists.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn seed(&self, timeout: Duration) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(format!("declare -p > {}", shell_quote(&self.path)));
        let out = run_captured(cmd, timeout, VALUE_LIMIT_BYTES)
            .context("seed env snapshot")?;
        if out.timed_out || !out.status.success() {
            return Err(anyhow!(
                "seed env snapshot {} failed: {}",
                self.path.display(),
                out.stderr_text()
            ));
        }
        debug!("env snapshot seeded");
        Ok(())
    }

    /// Discard exports of earlier sessions and dump the current environment.
    pub fn refresh(&self, timeout: Duration) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "stale env snapshot removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("remove env snapshot {}", self.path.display()));
            }
        }
        self.seed(timeout)
    }

    /// Read one variable as seen after sourcing the snapshot.
    ///
    /// Returns `None` when the variable is unset or empty. A missing snapshot
    /// file reads like an empty environment.
    #[instrument(skip_all, fields(path = %self.path.display(), name))]
    pub fn read_var(&self, name: &str, timeout: Duration) -> Result<Option<String>> {
        if !is_var_name(name) {
            return Err(anyhow!("invalid variable name '{name}'"));
        }
        let script = format!(
            "source {} >/dev/null 2>&1; printf '%s' \"${{{name}:-}}\"",
            shell_quote(&self.path)
        );
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(script);
        let out = run_captured(cmd, timeout, VALUE_LIMIT_BYTES)
            .with_context(|| format!("read ${name} from env snapshot"))?;
        if out.timed_out {
            return Err(anyhow!(
                "reading ${name} from env snapshot timed out after {}ms",
                timeout.as_millis()
            ));
        }
        let value = String::from_utf8(out.stdout.bytes).context("env value is not utf-8")?;
        debug!(found = !value.is_empty(), "env snapshot read");
        Ok(Some(value).filter(|v| !v.is_empty()))
    }
}

pub fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Single-quote a path for `bash`.
pub fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}
