//! Host/port templates resolved against the environment snapshot.
//!
//! A field is either a literal (`"8080"`) or a template reading a variable
//! captured by the shell stages (`{{ env "PORT" }}`). Templates are rendered
//! with minijinja; the Go-template call style is rewritten to minijinja's
//! `env("PORT")` before rendering.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, Error, ErrorKind};
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::error::SessionError;
use crate::core::session::RuntimeConfig;
use crate::io::snapshot::EnvSnapshot;

static GO_STYLE_ENV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\benv\s+"([A-Za-z_][A-Za-z0-9_]*)""#).expect("valid env call regex")
});
static ENV_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\benv\(\s*"([A-Za-z_][A-Za-z0-9_]*)"\s*\)"#).expect("valid env call regex")
});

/// Rewrite `env "NAME"` to `env("NAME")`.
pub fn normalize(template: &str) -> String {
    GO_STYLE_ENV
        .replace_all(template, r#"env("$1")"#)
        .into_owned()
}

/// Variable names referenced by a normalized template, deduplicated.
pub fn referenced_vars(template: &str) -> Vec<String> {
    let mut names: Vec<String> = ENV_CALL
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Render a normalized template against already-read variable values.
///
/// `env(NAME)` fails when `NAME` is missing from `vars` or empty.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let lookup = vars.clone();
    let mut env = Environment::new();
    env.add_function("env", move |name: String| -> Result<String, Error> {
        match lookup.get(&name) {
            Some(value) if !value.is_empty() => Ok(value.clone()),
            _ => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("environment variable ${name} is unset or empty"),
            )),
        }
    });
    let rendered = env
        .render_str(template, ())
        .map_err(|err| anyhow!("{}", render_error_message(&err)))?;
    Ok(rendered.trim().to_string())
}

fn render_error_message(err: &Error) -> String {
    err.detail()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string())
}

/// Resolve one field: literal fast path, else read the referenced variables and render.
#[instrument(skip_all, fields(template = %template))]
pub fn resolve_field(template: &str, snapshot: &EnvSnapshot, timeout: Duration) -> Result<String> {
    if !template.contains("{{") {
        return Ok(template.trim().to_string());
    }
    let normalized = normalize(template);
    let mut vars = BTreeMap::new();
    for name in referenced_vars(&normalized) {
        if let Some(value) = snapshot.read_var(&name, timeout)? {
            vars.insert(name, value);
        }
    }
    let value = render(&normalized, &vars)?;
    debug!(value = %value, "template resolved");
    Ok(value)
}

/// Resolve host and port concurrently and join both before returning.
///
/// Any failure is a [`SessionError::Config`]: the session cannot target the
/// system under test without both values.
pub async fn resolve_runtime(
    host_template: &str,
    port_template: &str,
    snapshot: &EnvSnapshot,
    timeout: Duration,
) -> Result<RuntimeConfig> {
    let host_job = {
        let (template, snapshot) = (host_template.to_string(), snapshot.clone());
        tokio::task::spawn_blocking(move || resolve_field(&template, &snapshot, timeout))
    };
    let port_job = {
        let (template, snapshot) = (port_template.to_string(), snapshot.clone());
        tokio::task::spawn_blocking(move || resolve_field(&template, &snapshot, timeout))
    };
    let (host, port) = tokio::join!(host_job, port_job);
    let host = host.context("join host resolution")?.map_err(config_error("host"))?;
    let port = port.context("join port resolution")?.map_err(config_error("port"))?;

    if host.is_empty() {
        return Err(SessionError::Config("host resolved to an empty value".to_string()).into());
    }
    let final_port = port.parse::<u16>().map_err(|_| {
        SessionError::Config(format!("port resolved to '{port}', not a valid port"))
    })?;
    Ok(RuntimeConfig {
        final_host: host,
        final_port,
    })
}

fn config_error(field: &'static str) -> impl Fn(anyhow::Error) -> anyhow::Error {
    move |err| SessionError::Config(format!("{field}: {err:#}")).into()
}
