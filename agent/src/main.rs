//! Client agent for a remote API fuzzing service.
//!
//! `fuzz` runs a session against the orchestration service, `lint` checks the
//! API description and config offline, and `exec` runs one lifecycle stage by
//! hand.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use fuzz_agent::core::error::SessionError;
use fuzz_agent::exit_codes;
use fuzz_agent::fuzz::run_fuzz;
use fuzz_agent::io::config::{AgentConfig, DEFAULT_CONFIG_PATH, load_config};
use fuzz_agent::io::script::{ShellStages, Stage, StageRunner};
use fuzz_agent::io::snapshot::{EnvSnapshot, SNAPSHOT_TIMEOUT};
use fuzz_agent::lint::lint;
use fuzz_agent::logging;

#[derive(Parser)]
#[command(
    name = "fuzz-agent",
    version,
    about = "Drive a remote fuzzing session against a local API"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a fuzzing session until the service reaches a verdict.
    Fuzz {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Override the service endpoint from the config.
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Validate the API description and the host/port templates.
    Lint {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Print the compiled document to stderr.
        #[arg(long)]
        show_spec: bool,
    },
    /// Run one lifecycle stage outside a session.
    Exec {
        #[arg(value_enum)]
        stage: Stage,
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let workdir = std::env::current_dir().context("resolve working directory")?;
    match cli.command {
        Command::Fuzz { config, endpoint } => cmd_fuzz(&workdir, &config, endpoint).await,
        Command::Lint { config, show_spec } => cmd_lint(&workdir, &config, show_spec),
        Command::Exec { stage, config } => cmd_exec(&workdir, &config, stage).await,
    }
}

async fn cmd_fuzz(workdir: &Path, config: &Path, endpoint: Option<String>) -> Result<i32> {
    let cfg = load_agent_config(config)?;
    let snapshot = EnvSnapshot::for_workdir(workdir)?;
    if let Err(err) = snapshot.refresh(SNAPSHOT_TIMEOUT) {
        warn!(err = %format!("{err:#}"), "could not seed env snapshot");
    }
    let mut stdout = io::stdout().lock();
    let outcome = run_fuzz(&cfg, workdir, snapshot, endpoint, &mut stdout).await?;
    Ok(outcome.exit_code)
}

fn cmd_lint(workdir: &Path, config: &Path, show_spec: bool) -> Result<i32> {
    let cfg = load_agent_config(config)?;
    let report = lint(&cfg, workdir, show_spec, &mut io::stderr().lock())?;
    println!(
        "{}: {} operations",
        report.spec_path.display(),
        report.operations
    );
    if !report.template_vars.is_empty() {
        println!("templates read: {}", report.template_vars.join(", "));
    }
    Ok(exit_codes::OK)
}

async fn cmd_exec(workdir: &Path, config: &Path, stage: Stage) -> Result<i32> {
    let cfg = load_agent_config(config)?;
    let snapshot = EnvSnapshot::for_workdir(workdir)?;
    snapshot.seed(SNAPSHOT_TIMEOUT)?;
    let stages = ShellStages::new(cfg.script, snapshot, workdir);
    let outcome = stages.run_stage(stage).await?;
    match outcome.failure {
        Some(reason) => {
            let mut stderr = io::stderr().lock();
            writeln!(stderr, "{reason}").context("write stage failure")?;
            Ok(exit_codes::EXEC_FAILED)
        }
        None => Ok(exit_codes::OK),
    }
}

fn load_agent_config(path: &Path) -> Result<AgentConfig> {
    load_config(path).map_err(|err| SessionError::Config(format!("{err:#}")).into())
}

/// Exit status for an error that ended the command.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.chain().find_map(|cause| cause.downcast_ref::<SessionError>()) {
        Some(SessionError::Transport(_)) => exit_codes::TRANSPORT,
        Some(SessionError::Protocol(_)) => exit_codes::PROTOCOL,
        Some(SessionError::Rejected(_)) => exit_codes::REJECTED,
        Some(SessionError::Config(_)) | None => exit_codes::INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzz_agent::core::error::{ServerRejection, TransportError};
    use std::time::Duration;

    #[test]
    fn parse_fuzz_defaults() {
        let cli = Cli::parse_from(["fuzz-agent", "fuzz"]);
        let Command::Fuzz { config, endpoint } = cli.command else {
            panic!("expected fuzz");
        };
        assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(endpoint.is_none());
    }

    #[test]
    fn parse_fuzz_endpoint_override() {
        let cli = Cli::parse_from(["fuzz-agent", "fuzz", "--endpoint", "ws://127.0.0.1:9/1/fuzz"]);
        assert!(matches!(
            cli.command,
            Command::Fuzz { endpoint: Some(ref url), .. } if url == "ws://127.0.0.1:9/1/fuzz"
        ));
    }

    #[test]
    fn parse_exec_stage() {
        let cli = Cli::parse_from(["fuzz-agent", "exec", "reset", "-c", "agent.toml"]);
        assert!(matches!(
            cli.command,
            Command::Exec { stage: Stage::Reset, ref config } if config == Path::new("agent.toml")
        ));
    }

    #[test]
    fn parse_lint_show_spec() {
        let cli = Cli::parse_from(["fuzz-agent", "lint", "--show-spec"]);
        assert!(matches!(cli.command, Command::Lint { show_spec: true, .. }));
    }

    #[test]
    fn rejects_unknown_stage() {
        assert!(Cli::try_parse_from(["fuzz-agent", "exec", "restart"]).is_err());
    }

    #[test]
    fn session_errors_map_to_exit_codes() {
        let transport: anyhow::Error =
            SessionError::Transport(TransportError::Idle(Duration::from_secs(15))).into();
        assert_eq!(exit_code_for(&transport), exit_codes::TRANSPORT);

        let rejected: anyhow::Error = SessionError::Rejected(ServerRejection::Unauthorized).into();
        assert_eq!(exit_code_for(&rejected), exit_codes::REJECTED);

        let protocol = anyhow::Error::from(SessionError::Protocol("bad".to_string()))
            .context("while driving session");
        assert_eq!(exit_code_for(&protocol), exit_codes::PROTOCOL);

        assert_eq!(exit_code_for(&anyhow::anyhow!("disk full")), exit_codes::INVALID);
    }
}
