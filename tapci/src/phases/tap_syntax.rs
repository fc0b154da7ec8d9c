//! Style, load and audit checks across the whole tap.

use anyhow::Result;
use tracing::debug;
use walkdir::WalkDir;

use crate::context::RunContext;
use crate::report::Report;
use crate::step::StepRequest;

pub fn run(ctx: &mut RunContext<'_>, report: &mut Report) -> Result<()> {
    let Some(tap) = ctx.options.tap_name() else {
        debug!("no tap to check");
        return Ok(());
    };

    if !ctx.options.stable {
        report.record(ctx, StepRequest::new(ctx.brew_command(&["style", &tap])))?;
    }

    let formula_dir = ctx.repository().join(&ctx.settings.formula_dir);
    let has_formulae = WalkDir::new(&formula_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| {
            entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "rb")
        });
    if has_formulae {
        report.record(
            ctx,
            StepRequest::new(ctx.brew_command(&[
                "readall",
                "--aliases",
                "--os=all",
                "--arch=all",
                &tap,
            ])),
        )?;
    }

    if !ctx.options.stable {
        let tap_arg = format!("--tap={tap}");
        report.record(
            ctx,
            StepRequest::new(ctx.brew_command(&["audit", "--except=installed", &tap_arg])),
        )?;
    }
    Ok(())
}
