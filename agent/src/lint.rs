//! The `lint` command: check what a session would send before dialing.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::io::config::AgentConfig;
use crate::io::spec::{OpenApiCompiler, SpecCompiler, compile_file};
use crate::io::template::{normalize, referenced_vars, render};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintReport {
    pub spec_path: PathBuf,
    pub operations: usize,
    /// Snapshot variables the host and port templates read.
    pub template_vars: Vec<String>,
}

/// Compile the API description and check the host/port templates.
///
/// With `show_spec` the compiled document is pretty-printed to `diag`.
#[instrument(skip_all, fields(spec = %cfg.spec.display()))]
pub fn lint<W: Write>(
    cfg: &AgentConfig,
    workdir: &Path,
    show_spec: bool,
    diag: &mut W,
) -> Result<LintReport> {
    lint_with(&OpenApiCompiler, cfg, workdir, show_spec, diag)
}

pub fn lint_with<C: SpecCompiler, W: Write>(
    compiler: &C,
    cfg: &AgentConfig,
    workdir: &Path,
    show_spec: bool,
    diag: &mut W,
) -> Result<LintReport> {
    let spec_path = workdir.join(&cfg.spec);
    let compiled = compile_file(compiler, &spec_path)
        .with_context(|| format!("documentation validation failed for '{}'", spec_path.display()))?;
    if show_spec {
        let doc: serde_json::Value =
            serde_json::from_slice(&compiled.blob).context("decode compiled spec")?;
        let pretty = serde_json::to_string_pretty(&doc).context("format compiled spec")?;
        writeln!(diag, "{pretty}").context("write compiled spec")?;
    }

    let mut template_vars = check_template("host", &cfg.host)?;
    template_vars.extend(check_template("port", &cfg.port)?);
    template_vars.sort();
    template_vars.dedup();
    if template_vars.is_empty() {
        cfg.port
            .trim()
            .parse::<u16>()
            .map_err(|_| anyhow!("port '{}' is not a valid port", cfg.port))?;
    }
    debug!(operations = compiled.operations, vars = ?template_vars, "lint passed");

    Ok(LintReport {
        spec_path,
        operations: compiled.operations,
        template_vars,
    })
}

/// Render a template with placeholder values to surface syntax errors.
fn check_template(field: &str, template: &str) -> Result<Vec<String>> {
    if !template.contains("{{") {
        return Ok(Vec::new());
    }
    let normalized = normalize(template);
    let vars = referenced_vars(&normalized);
    let placeholders: BTreeMap<String, String> = vars
        .iter()
        .map(|name| (name.clone(), "placeholder".to_string()))
        .collect();
    render(&normalized, &placeholders).with_context(|| format!("invalid {field} template"))?;
    Ok(vars)
}
