//! Multi-phase orchestration for one invocation.
//!
//! Each target argument runs its planned phases in order, each into its own
//! [`Report`]. `cleanup_after` runs even when a phase returned an error, and
//! the result files are always written before an error is propagated.

use std::fs;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::context::RunContext;
use crate::core::plan::{ArgumentPosition, Phase, PhaseSelection, plan_phases, runs_cleanup_after};
use crate::core::schedule::Schedule;
use crate::junit::{write_junit, write_steps_summary};
use crate::phases::run_phase;
use crate::report::Report;

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub reports: Vec<Report>,
    /// No step in any report failed.
    pub success: bool,
}

/// Run every target through its phases and write the result files.
///
/// Invalid option combinations are rejected before anything runs.
#[instrument(skip_all)]
pub fn run(ctx: &mut RunContext<'_>) -> Result<RunOutcome> {
    ctx.options.validate()?;
    let selection = ctx.options.selection();
    let targets = ctx.options.targets.clone();

    let mut reports = Vec::new();
    let mut outcome = Ok(());
    for (index, argument) in targets.iter().enumerate() {
        let position = ArgumentPosition::new(index, targets.len());
        info!(argument = %argument, "testing argument");
        if let Err(err) = run_argument(ctx, argument, selection, position, &mut reports) {
            outcome = Err(err);
            break;
        }
    }

    let written = write_results(ctx, &reports);
    outcome?;
    written?;
    let success = reports.iter().all(Report::is_success);
    Ok(RunOutcome { reports, success })
}

fn run_argument(
    ctx: &mut RunContext<'_>,
    argument: &str,
    selection: PhaseSelection,
    position: ArgumentPosition,
    reports: &mut Vec<Report>,
) -> Result<()> {
    let mut schedule = initial_schedule(ctx);
    let mut outcome = Ok(());
    for phase in plan_phases(selection, position) {
        let mut report = Report::new(phase.name(), ctx.repository());
        let result = run_phase(phase, ctx, argument, &mut schedule, &mut report);
        reports.push(report);
        if let Err(err) = result {
            warn!(phase = %phase, err = %format!("{err:#}"), "phase aborted");
            outcome = Err(err);
            break;
        }
    }

    // An aborted argument is the last one, so it still gets its cleanup.
    let cleanup_position = ArgumentPosition {
        first: position.first,
        last: position.last || outcome.is_err(),
    };
    if runs_cleanup_after(selection, cleanup_position) {
        let mut report = Report::new(Phase::CleanupAfter.name(), ctx.repository());
        let result = run_phase(Phase::CleanupAfter, ctx, argument, &mut schedule, &mut report);
        reports.push(report);
        if let Err(err) = result {
            if outcome.is_ok() {
                outcome = Err(err);
            } else {
                warn!(err = %format!("{err:#}"), "cleanup after abort failed");
            }
        }
    }
    outcome
}

/// Explicit formula lists seed the schedule when detection is skipped.
fn initial_schedule(ctx: &RunContext<'_>) -> Schedule {
    let options = &ctx.options;
    let mut schedule = Schedule::from_lists(
        &options.testing_formulae,
        &options.added_formulae,
        &options.deleted_formulae,
    );
    schedule
        .skipped_or_failed
        .extend(options.skipped_or_failed_formulae.iter().cloned());
    schedule
}

fn write_results(ctx: &RunContext<'_>, reports: &[Report]) -> Result<()> {
    let paths = &ctx.paths;
    fs::create_dir_all(&paths.output_dir)
        .with_context(|| format!("create {}", paths.output_dir.display()))?;
    write_junit(&paths.junit, reports, &ctx.settings)?;
    write_steps_summary(&paths.steps_output, reports)?;
    for (key, value) in &ctx.outputs {
        ctx.github.write_output(key, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::FailFast;
    use crate::test_support::{ContextFixture, ScriptedRunner, formula};

    #[test]
    fn explicit_lists_run_formulae_and_dependents() {
        let runner = ScriptedRunner::new();
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.options.dry_run = true;
        fixture.options.only = Some(Phase::Formulae);
        fixture.options.testing_formulae = vec!["foo".to_string()];
        fixture.catalog.insert(formula("foo"));
        let mut ctx = fixture.context(&runner);

        let outcome = run(&mut ctx).expect("run");
        let names: Vec<&str> = outcome.reports.iter().map(Report::name).collect();
        assert_eq!(names, vec!["formulae", "formulae_dependents"]);
        assert!(outcome.success);
        assert!(ctx.paths.junit.exists());
        assert!(ctx.paths.steps_output.exists());
    }

    #[test]
    fn fail_fast_still_cleans_up_and_writes_results() {
        let runner = ScriptedRunner::new();
        runner.respond("brew config", false, "Error: broken\n");
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.options.fail_fast = true;
        fixture.options.cleanup = true;
        fixture.options.targets = vec!["foo".to_string(), "bar".to_string()];
        let mut ctx = fixture.context(&runner);

        let err = run(&mut ctx).expect_err("fail fast");
        assert!(err.downcast_ref::<FailFast>().is_some());
        assert_eq!(
            runner.commands(),
            vec!["brew config", "brew cleanup --prune=3"]
        );
        let summary = fs::read_to_string(&ctx.paths.steps_output).expect("summary");
        assert!(summary.starts_with("Error: 1 failed step!"));
    }

    #[test]
    fn usage_errors_stop_before_any_phase() {
        let runner = ScriptedRunner::new();
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.options.skipped_or_failed_formulae = vec!["foo".to_string()];
        let mut ctx = fixture.context(&runner);
        let err = run(&mut ctx).expect_err("usage");
        assert!(err.downcast_ref::<crate::context::UsageError>().is_some());
        assert!(runner.commands().is_empty());
        assert!(!ctx.paths.junit.exists());
    }
}
