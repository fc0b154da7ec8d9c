//! Environment checks before anything is built.

use anyhow::Result;

use crate::context::RunContext;
use crate::report::Report;
use crate::step::StepRequest;

pub fn run(ctx: &mut RunContext<'_>, report: &mut Report) -> Result<()> {
    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["config"])).verbose(true),
    )?;
    // Doctor warnings only fail CI runs; locally they are informational.
    let tolerate = !ctx.github.actions;
    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["doctor"])).ignore_failures(tolerate),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ContextFixture, ScriptedRunner};

    #[test]
    fn doctor_is_tolerated_outside_actions() {
        let runner = ScriptedRunner::new();
        runner.respond("brew doctor", false, "Warning: something\n");
        let fixture = ContextFixture::new().expect("fixture");
        let mut ctx = fixture.context(&runner);
        let mut report = Report::new("setup", ctx.repository());
        run(&mut ctx, &mut report).expect("setup");
        assert_eq!(runner.commands(), vec!["brew config", "brew doctor"]);
        assert!(report.is_success());
        assert_eq!(report.ignored_steps().len(), 1);
    }

    #[test]
    fn doctor_fails_under_actions() {
        let runner = ScriptedRunner::new();
        runner.respond("brew doctor", false, "Warning: something\n");
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.github.actions = true;
        let mut ctx = fixture.context(&runner);
        let mut report = Report::new("setup", ctx.repository());
        run(&mut ctx, &mut report).expect("setup");
        assert_eq!(report.failed_steps().len(), 1);
    }
}
