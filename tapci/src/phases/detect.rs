//! Works out which formulae a run tests.
//!
//! A `HEAD` argument is resolved against the CI context into a revision
//! range whose diff names the changed formulae; any other argument must be a
//! formula name and is tested on its own.

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::context::{RunContext, UsageError};
use crate::core::diff::{FormulaChanges, parse_name_status};
use crate::core::schedule::Schedule;
use crate::io::brew::QueryError;
use crate::phases::shared::query_with_tap_retry;
use crate::report::Report;
use crate::step::StepRequest;

/// The revision range a run compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revisions {
    pub start: String,
    pub end: String,
}

#[instrument(skip(ctx, schedule, report))]
pub fn run(
    ctx: &mut RunContext<'_>,
    argument: &str,
    schedule: &mut Schedule,
    report: &mut Report,
) -> Result<()> {
    let mut named = None;
    let revisions = if argument == "HEAD" {
        ci_revisions(ctx, report)?
    } else {
        let full_name = named_formula(ctx, argument, report)?;
        named = Some(full_name);
        let head = resolve_or_head(ctx, "HEAD")?;
        Revisions {
            start: head.clone(),
            end: head,
        }
    };

    let mut changes = if revisions.start == revisions.end {
        FormulaChanges::default()
    } else {
        let formula_dir = ctx.settings.formula_dir.clone();
        let output =
            ctx.git
                .diff_tree_name_status(&revisions.start, &revisions.end, &formula_dir)?;
        let entries = parse_name_status(&output)?;
        let tap = ctx.options.qualifying_tap();
        FormulaChanges::classify(&entries, &formula_dir, tap.as_deref())
    };
    if ctx.options.test_default_formula {
        let default = ctx.settings.default_test_formula.clone();
        if !changes.modified.contains(&default) {
            changes.modified.push(default);
        }
    }
    debug!(?changes, "classified changes");

    schedule.testing.extend(changes.added.iter().cloned());
    schedule.testing.extend(changes.modified.iter().cloned());
    if let Some(name) = &named {
        schedule.testing.push(name.clone());
    }
    schedule.added.extend(changes.added.iter().cloned());
    schedule.deleted.extend(changes.deleted.iter().cloned());

    if schedule.testing.is_empty()
        && schedule.deleted.is_empty()
        && revisions.start == revisions.end
        && !ctx.github.is_push()
    {
        return Err(UsageError::new("Did not find any formulae or commits to test!").into());
    }

    print_summary(ctx, &revisions, schedule);
    ctx.set_output("testing_formulae", schedule.testing.join(","));
    ctx.set_output("added_formulae", schedule.added.join(","));
    ctx.set_output("deleted_formulae", schedule.deleted.join(","));
    Ok(())
}

/// Resolve the revision range from the GitHub Actions environment.
fn ci_revisions(ctx: &mut RunContext<'_>, report: &mut Report) -> Result<Revisions> {
    ctx.github.require_complete()?;
    let github = ctx.github.clone();

    let (start, end) = match (github.actions, github.sha.clone()) {
        (true, Some(sha)) => {
            if let Some(base) = &github.base_ref {
                let refspec = format!("+refs/heads/{base}:refs/remotes/origin/{base}");
                report.record(
                    ctx,
                    StepRequest::new(ctx.git_command(&["fetch", "origin", &refspec])),
                )?;
                (format!("origin/{base}"), sha)
            } else if github.is_merge_group() {
                (ctx.settings.default_origin_ref.clone(), sha)
            } else {
                (sha.clone(), sha)
            }
        }
        _ => ("HEAD".to_string(), "HEAD".to_string()),
    };

    let start = resolve_or_head(ctx, &start)?;
    let end = resolve_or_head(ctx, &end)?;
    let start = match ctx.git.merge_base(&start, &end)? {
        Some(base) => base,
        None => start,
    };
    info!(%start, %end, "resolved revisions");
    Ok(Revisions { start, end })
}

/// Resolve `rev` to a commit sha, falling back to `HEAD`.
fn resolve_or_head(ctx: &RunContext<'_>, rev: &str) -> Result<String> {
    if let Some(sha) = ctx.git.resolve(rev)? {
        return Ok(sha);
    }
    debug!(rev, "unresolved revision, using HEAD");
    Ok(ctx.git.resolve("HEAD")?.unwrap_or_else(|| "HEAD".to_string()))
}

/// Canonical name of an explicitly named formula.
fn named_formula(ctx: &mut RunContext<'_>, argument: &str, report: &mut Report) -> Result<String> {
    let formula = match query_with_tap_retry(ctx, report, |query| query.formula(argument)) {
        Ok(formula) => formula,
        Err(err) => {
            if let Some(QueryError::NotFound(_)) = err.downcast_ref::<QueryError>() {
                return Err(UsageError::new(format!(
                    "{argument} is neither a revision nor a formula"
                ))
                .into());
            }
            return Err(err);
        }
    };
    // Core formulae are installed from the local checkout, not the API.
    if !formula.full_name.contains('/') {
        ctx.signals.no_install_from_api = true;
    }
    Ok(formula.full_name)
}

fn print_summary(ctx: &RunContext<'_>, revisions: &Revisions, schedule: &Schedule) {
    let rows = [
        ("url", ctx.github.repository.clone().unwrap_or_default()),
        ("ref", ctx.github.git_ref.clone().unwrap_or_default()),
        ("start", revisions.start.clone()),
        ("end", revisions.end.clone()),
        ("testing", schedule.testing.join(" ")),
        ("added", schedule.added.join(" ")),
        ("deleted", schedule.deleted.join(" ")),
    ];
    for (key, value) in rows {
        if value.is_empty() {
            continue;
        }
        println!("{key:>10}: {value}");
    }
}
