//! API description compiler.
//!
//! The session engine only carries the compiled blob inside `OpenSession`; it
//! never inspects it. [`OpenApiCompiler`] checks the document is an OpenAPI
//! 3.0 description and normalises it to JSON.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tracing::{debug, instrument};

/// Compiled API description, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSpec {
    pub blob: Vec<u8>,
    /// Number of `(path, method)` operations found.
    pub operations: usize,
}

pub trait SpecCompiler {
    fn compile(&self, origin: &Path, document: &[u8]) -> Result<CompiledSpec>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenApiCompiler;

const METHODS: [&str; 8] = [
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

impl SpecCompiler for OpenApiCompiler {
    #[instrument(skip_all, fields(origin = %origin.display(), bytes = document.len()))]
    fn compile(&self, origin: &Path, document: &[u8]) -> Result<CompiledSpec> {
        let doc = parse_document(document)
            .with_context(|| format!("parse {}", origin.display()))?;
        let version = doc
            .get("openapi")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("format:unknown (no openapi version field)"))?;
        if !version.starts_with("3.0") {
            bail!("format:unsupported (openapi {version}, expected 3.0.x)");
        }
        let paths = doc
            .get("paths")
            .and_then(Value::as_object)
            .ok_or_else(|| anyhow!("missing 'paths' object"))?;

        let mut operations = 0;
        for (path, item) in paths {
            if !path.starts_with('/') {
                bail!("path '{path}' must start with '/'");
            }
            let item = item
                .as_object()
                .ok_or_else(|| anyhow!("path '{path}' is not an object"))?;
            operations += item
                .keys()
                .filter(|key| METHODS.contains(&key.as_str()))
                .count();
        }
        debug!(version, operations, "spec compiled");

        let blob = serde_json::to_vec(&doc).context("serialize compiled spec")?;
        Ok(CompiledSpec { blob, operations })
    }
}

/// JSON is valid YAML, so one YAML parse covers both formats.
fn parse_document(document: &[u8]) -> Result<Value> {
    let doc: Value = serde_yaml_ng::from_slice(document).context("not JSON or YAML")?;
    if !doc.is_object() {
        bail!("document root must be a mapping");
    }
    Ok(doc)
}

/// Read and compile the document at `path`.
pub fn compile_file<C: SpecCompiler>(compiler: &C, path: &Path) -> Result<CompiledSpec> {
    let document = fs::read(path).with_context(|| format!("could not read '{}'", path.display()))?;
    compiler.compile(path, &document)
}
