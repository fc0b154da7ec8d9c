//! Helpers used by more than one phase.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::context::RunContext;
use crate::core::schedule::{NameSet, Schedule};
use crate::core::types::same_formula;
use crate::io::brew::{FormulaQuery, QueryError};
use crate::io::store::DownloadRequest;
use crate::report::Report;
use crate::step::StepRequest;

/// One tap attempt, then the query is retried once.
const QUERY_ATTEMPTS: u32 = 2;

pub fn header(phase: &str, argument: &str) {
    println!();
    println!("### {phase} ({argument})");
}

/// Run a metadata query; a missing tap is tapped (as a step) and the query
/// retried once. The second failure is returned.
pub fn query_with_tap_retry<T>(
    ctx: &RunContext<'_>,
    report: &mut Report,
    mut query: impl FnMut(&dyn FormulaQuery) -> Result<T, QueryError>,
) -> Result<T> {
    let mut attempt = 1;
    loop {
        match query(ctx.query) {
            Ok(value) => return Ok(value),
            Err(QueryError::TapUnavailable { tap, formula }) if attempt < QUERY_ATTEMPTS => {
                info!(%tap, %formula, attempt, "tapping missing tap");
                report.record(ctx, StepRequest::new(ctx.brew_command(&["tap", &tap])))?;
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// The platform tag: configured override first, then the package manager.
pub fn bottle_tag(ctx: &RunContext<'_>) -> Result<String> {
    if let Some(tag) = &ctx.settings.bottle_tag {
        return Ok(tag.clone());
    }
    Ok(ctx.query.bottle_tag()?)
}

/// Compare the ledger with the output directory; any difference becomes a
/// failing `tapci verify-artifacts` step and is reconciled.
pub fn verify_artifacts(ctx: &mut RunContext<'_>, report: &mut Report) -> Result<()> {
    let verification = ctx.ledger.verify()?;
    if verification.is_clean() {
        return Ok(());
    }
    let description = verification.describe();
    ctx.ledger.reconcile(&verification)?;
    report.record_check(ctx, "verify-artifacts", Err(description))?;
    Ok(())
}

pub fn set_contains(set: &NameSet, name: &str) -> bool {
    set.iter().any(|entry| same_formula(entry, name))
}

/// A dependency is available when it was built in this run or has an
/// artifact for the current platform.
pub fn available(ctx: &RunContext<'_>, schedule: &Schedule, dep: &str) -> bool {
    if set_contains(&schedule.built, dep) {
        return true;
    }
    ctx.query
        .formula(dep)
        .map(|formula| formula.bottled)
        .unwrap_or(false)
}

/// Fetch artifacts of the previous CI run matching `pattern` into the
/// artifact cache. Returns the previous commit when it is known.
///
/// Downloads are best-effort: failures are logged and the run continues.
pub fn download_previous(ctx: &RunContext<'_>, pattern: &str) -> Result<Option<String>> {
    if ctx.options.dry_run || !ctx.github.actions {
        return Ok(None);
    }
    let Some(repository) = ctx.github.repository.clone() else {
        return Ok(None);
    };
    let Some(previous) = ctx.git.previous_commit()? else {
        return Ok(None);
    };
    let dest = ctx.paths.artifact_cache.clone();
    fs::create_dir_all(&dest).with_context(|| format!("create {}", dest.display()))?;
    let request = DownloadRequest {
        repository,
        commit: previous.clone(),
        pattern: pattern.to_string(),
        dest,
    };
    match ctx.store.download(&request) {
        Ok(count) => info!(pattern, count, commit = %previous, "downloaded previous artifacts"),
        Err(err) => warn!(pattern, err = %format!("{err:#}"), "could not download previous artifacts"),
    }
    Ok(Some(previous))
}

/// Find `file_name` anywhere below `dir`.
pub fn find_file(dir: &Path, file_name: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && entry.file_name() == file_name)
        .map(|entry| entry.into_path())
}

pub fn append_text(path: &Path, text: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    if !text.ends_with('\n') {
        file.write_all(b"\n")
            .with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

/// Append a step's output (when there is any) to a log file.
pub fn append_output(path: &Path, output: Option<&str>) -> Result<()> {
    match output {
        Some(text) => append_text(path, text),
        None => Ok(()),
    }
}

pub fn print_skip(name: &str, reason: &str) {
    info!(formula = name, reason, "skipping");
    println!("SKIPPED: {name} ({reason})");
}
