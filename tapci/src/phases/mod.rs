//! Phase bodies, dispatched over the closed [`Phase`] enum.
//!
//! Every phase shares one contract: it reads and mutates the run context and
//! the schedule, and appends steps to its own report.

pub mod cleanup;
pub mod dependents;
pub mod detect;
pub mod formulae;
pub mod setup;
pub mod shared;
pub mod tap_syntax;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::context::RunContext;
use crate::core::plan::Phase;
use crate::core::schedule::Schedule;
use crate::report::Report;

/// Run one phase for `argument` (a revision or a formula name).
#[instrument(skip(ctx, schedule, report), fields(phase = %phase))]
pub fn run_phase(
    phase: Phase,
    ctx: &mut RunContext<'_>,
    argument: &str,
    schedule: &mut Schedule,
    report: &mut Report,
) -> Result<()> {
    debug!(argument, "running phase");
    shared::header(phase.name(), argument);
    match phase {
        Phase::CleanupBefore => cleanup::cleanup_before(ctx, report),
        Phase::Setup => setup::run(ctx, report),
        Phase::TapSyntax => tap_syntax::run(ctx, report),
        Phase::FormulaeDetect => detect::run(ctx, argument, schedule, report),
        Phase::Formulae => formulae::run(ctx, schedule, report),
        Phase::FormulaeDependents => dependents::run(ctx, schedule, report),
        Phase::CleanupAfter => cleanup::cleanup_after(ctx, report),
    }
}
