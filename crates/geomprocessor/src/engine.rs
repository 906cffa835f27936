//! Geometry engines run by the processor for each request.

use crate::config::EngineKind;
use anyhow::{Context, Result, bail, ensure};
use geomipc::GeometryEngine;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Exchange structure tags that open and close every ISO-10303-21 file.
const STEP_OPEN: &str = "ISO-10303-21;";
const STEP_CLOSE: &str = "END-ISO-10303-21;";

/// Where the result for `input` is written: next to it, as `<stem>_result.stp`.
pub fn result_path_for(input: &Path) -> Result<PathBuf> {
    let stem = input
        .file_stem()
        .with_context(|| format!("input path {} has no file name", input.display()))?;
    let mut name = stem.to_os_string();
    name.push("_result.stp");
    Ok(input.with_file_name(name))
}

/// Check that `text` carries a complete STEP exchange structure.
fn check_step_envelope(text: &str) -> Result<()> {
    let body = text.trim_start_matches('\u{feff}').trim();

    ensure!(
        body.starts_with(STEP_OPEN),
        "not a STEP file: missing {STEP_OPEN} header"
    );
    ensure!(
        body.ends_with(STEP_CLOSE),
        "truncated STEP file: missing {STEP_CLOSE} trailer"
    );
    ensure!(body.contains("HEADER;"), "STEP file has no HEADER section");
    ensure!(body.contains("DATA;"), "STEP file has no DATA section");

    let entities = body.lines().filter(|l| l.trim_start().starts_with('#')).count();
    ensure!(entities > 0, "STEP file contains no entities");
    Ok(())
}

/// Validates the STEP envelope and publishes an unchanged copy as the result.
#[derive(Debug, Default)]
pub struct PassthroughEngine {
    processed: u64,
}

impl PassthroughEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }
}

impl GeometryEngine for PassthroughEngine {
    fn process(&mut self, input: &Path) -> Result<PathBuf> {
        let bytes = fs::read(input).with_context(|| format!("cannot read {}", input.display()))?;
        let text = String::from_utf8_lossy(&bytes);
        check_step_envelope(&text).context("STEP load failed")?;

        let output = result_path_for(input)?;
        fs::write(&output, &bytes)
            .with_context(|| format!("cannot write result {}", output.display()))?;

        self.processed += 1;
        tracing::debug!(input = %input.display(), output = %output.display(), "Passthrough done");
        Ok(output)
    }
}

/// Runs an external converter for every job.
///
/// The template is split on whitespace; `{input}` and `{output}` are replaced
/// inside each argument. No shell is involved.
#[derive(Debug)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(template: &str) -> Result<Self> {
        let mut words = template.split_whitespace().map(str::to_string);
        let program = words.next().context("empty engine command")?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }

    fn expand(arg: &str, input: &Path, output: &Path) -> String {
        arg.replace("{input}", &input.to_string_lossy())
            .replace("{output}", &output.to_string_lossy())
    }
}

impl GeometryEngine for CommandEngine {
    fn process(&mut self, input: &Path) -> Result<PathBuf> {
        let output = result_path_for(input)?;
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| Self::expand(arg, input, &output))
            .collect();

        tracing::debug!(program = %self.program, ?args, "Running engine command");
        let run = Command::new(&self.program)
            .args(&args)
            .output()
            .with_context(|| format!("cannot start {}", self.program))?;

        if !run.status.success() {
            let stderr = String::from_utf8_lossy(&run.stderr);
            let detail = stderr.trim();
            if detail.is_empty() {
                bail!("{} exited with {}", self.program, run.status);
            }
            bail!("{} exited with {}: {}", self.program, run.status, detail);
        }

        ensure!(
            output.is_file(),
            "{} finished without writing {}",
            self.program,
            output.display()
        );
        Ok(output)
    }
}

/// Engine selected at startup.
#[derive(Debug)]
pub enum Engine {
    Passthrough(PassthroughEngine),
    Command(CommandEngine),
}

impl Engine {
    pub fn from_kind(kind: &EngineKind) -> Result<Self> {
        Ok(match kind {
            EngineKind::Passthrough => Engine::Passthrough(PassthroughEngine::new()),
            EngineKind::Command(template) => Engine::Command(CommandEngine::new(template)?),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Engine::Passthrough(_) => "passthrough",
            Engine::Command(_) => "command",
        }
    }
}

impl GeometryEngine for Engine {
    fn process(&mut self, input: &Path) -> Result<PathBuf> {
        match self {
            Engine::Passthrough(engine) => engine.process(input),
            Engine::Command(engine) => engine.process(input),
        }
    }
}
