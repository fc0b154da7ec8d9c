//! Repository and output-directory cleanup around a run.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::context::RunContext;
use crate::io::artifacts::bottle_files;
use crate::report::Report;
use crate::step::StepRequest;

/// Artifacts in the repository survive `git clean`.
const KEEP_ARTIFACTS: &str = "--exclude=/*.bottle*.*";

pub fn cleanup_before(ctx: &mut RunContext<'_>, report: &mut Report) -> Result<()> {
    if !ctx.options.dry_run {
        remove_stale_artifacts(&ctx.paths.output_dir)?;
    }
    if ctx.options.cleanup {
        restore_repository(ctx, report)?;
    }
    Ok(())
}

pub fn cleanup_after(ctx: &mut RunContext<'_>, report: &mut Report) -> Result<()> {
    if !ctx.options.cleanup {
        debug!("cleanup not requested");
        return Ok(());
    }
    restore_repository(ctx, report)?;
    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["cleanup", "--prune=3"])),
    )?;
    Ok(())
}

/// Artifacts left in the output directory by an earlier run.
fn remove_stale_artifacts(output_dir: &Path) -> Result<()> {
    for path in bottle_files(output_dir)? {
        info!(file = %path.display(), "removing stale artifact");
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

/// Reset tracked files to the default origin ref and remove untracked ones.
fn restore_repository(ctx: &mut RunContext<'_>, report: &mut Report) -> Result<()> {
    if !ctx.git.is_repository() {
        debug!(repository = %ctx.repository().display(), "not a git repository");
        return Ok(());
    }
    let origin = ctx.settings.default_origin_ref.clone();
    if ctx.git.resolve(&origin)?.is_some() && ctx.git.differs_from(&origin)? {
        report.record(
            ctx,
            StepRequest::new(ctx.git_command(&["reset", "--hard", &origin])),
        )?;
    }

    let mut clean_args = vec!["-ff".to_string(), "-dx".to_string(), KEEP_ARTIFACTS.to_string()];
    if let Ok(relative) = ctx.paths.output_dir.strip_prefix(ctx.repository()) {
        clean_args.push(format!("--exclude=/{}", relative.display()));
    }
    let refs: Vec<&str> = clean_args.iter().map(String::as_str).collect();
    if ctx.git.clean_candidates(&refs)?.is_empty() {
        return Ok(());
    }
    let mut command = vec!["clean"];
    command.extend(refs.iter().copied());
    report.record(ctx, StepRequest::new(ctx.git_command(&command)))?;
    Ok(())
}
