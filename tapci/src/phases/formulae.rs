//! Build, bottle and test every scheduled formula.
//!
//! Candidates run strictly one after another in batch-dependency order. A
//! failing candidate is recorded and the loop moves on; only fail-fast or an
//! infrastructure error stops the phase.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::context::RunContext;
use crate::core::graph::{BottleDecision, decide_bottle};
use crate::core::ordering::order_by_batch_dependents;
use crate::core::schedule::Schedule;
use crate::core::types::Formula;
use crate::io::artifacts::bottle_files_for;
use crate::io::brew::{DepScope, QueryError, UsesScope};
use crate::io::disk::below_threshold;
use crate::io::github::{AnnotationLocation, workflow_command};
use crate::phases::shared::{
    append_output, available, bottle_tag, download_previous, print_skip, query_with_tap_retry,
    set_contains, verify_artifacts,
};
use crate::report::Report;
use crate::step::StepRequest;

/// What happened to one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Built,
    /// Reused the previous run's artifact.
    Cached,
    Skipped,
    Failed,
}

/// Per-phase state shared by the candidates.
struct Batch {
    tag: String,
    order: Vec<String>,
    deps_of: BTreeMap<String, Vec<String>>,
    previous: Option<String>,
    gcc_attempted: bool,
}

#[instrument(skip_all)]
pub fn run(ctx: &mut RunContext<'_>, schedule: &mut Schedule, report: &mut Report) -> Result<()> {
    let tag = bottle_tag(ctx)?;
    verify_artifacts(ctx, report)?;
    let previous = download_previous(ctx, "bottles*")?;

    let candidates: Vec<String> = schedule.testing.iter().cloned().collect();
    let mut deps_of = BTreeMap::new();
    for name in &candidates {
        let deps = match query_with_tap_retry(ctx, report, |query| {
            query.dependencies(name, DepScope::ALL)
        }) {
            Ok(deps) => deps,
            Err(err) if matches!(err.downcast_ref::<QueryError>(), Some(QueryError::NotFound(_))) => {
                warn!(formula = %name, "no metadata for candidate");
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        deps_of.insert(name.clone(), deps);
    }
    let order = order_by_batch_dependents(&candidates, &deps_of);
    info!(?order, "build order");

    let mut batch = Batch {
        tag,
        order,
        deps_of,
        previous,
        gcc_attempted: false,
    };
    for name in batch.order.clone() {
        let outcome = build_and_test(ctx, &mut batch, &name, schedule, report)?;
        debug!(formula = %name, ?outcome, "candidate finished");
    }

    check_deleted(ctx, schedule, report)?;
    finish(ctx, &batch.tag, schedule)
}

fn build_and_test(
    ctx: &mut RunContext<'_>,
    batch: &mut Batch,
    name: &str,
    schedule: &mut Schedule,
    report: &mut Report,
) -> Result<Outcome> {
    println!();
    println!("==> Testing {name}");
    cleanup_during(ctx, batch, report)?;

    let formula = match ctx.query.formula(name) {
        Ok(formula) => formula,
        Err(err) => {
            report.record_check(ctx, "formula-load", Err(format!("{name}: {err}")))?;
            schedule.skipped_or_failed.push(name);
            return Ok(Outcome::Failed);
        }
    };
    if formula.disabled {
        return Ok(skip(schedule, name, "disabled"));
    }

    let deps = batch.deps_of.get(name).cloned().unwrap_or_default();
    let changed = |dep: &str| set_contains(&schedule.testing, dep) || set_contains(&schedule.added, dep);
    if let Some(dep) = deps
        .iter()
        .find(|dep| changed(dep.as_str()) && set_contains(&schedule.skipped_or_failed, dep))
    {
        let reason = format!("depends on {dep}, which was skipped or failed");
        return Ok(skip(schedule, name, &reason));
    }

    let unsatisfied = formula.unsatisfied_requirements();
    if !unsatisfied.is_empty() {
        report.record(
            ctx,
            StepRequest::new(ctx.brew_command(&["fetch", "--retry"])).named([name]),
        )?;
        report.record(
            ctx,
            StepRequest::new(ctx.brew_command(&["audit", "--online"])).named([name]),
        )?;
        return Ok(skip(schedule, name, &unsatisfied.join("; ")));
    }

    let new = set_contains(&schedule.added, name);
    if !new && reuse_cached(ctx, batch, &formula, &deps, schedule, report)? {
        return Ok(Outcome::Cached);
    }

    let decision = {
        let ctx: &RunContext<'_> = ctx;
        decide_bottle(&formula, |dep| available(ctx, schedule, dep))
    };
    debug!(formula = %name, ?decision, "bottle decision");
    if let BottleDecision::Skip(missing) = &decision {
        let reason = format!("no bottles for {}", missing.join(", "));
        return Ok(skip(schedule, name, &reason));
    }

    if !ensure_compiler(ctx, batch, report)? {
        return Ok(skip(schedule, name, "no compiler available"));
    }

    install_dependencies(ctx, &deps, schedule, report)?;

    // Failures only count when a current artifact is expected here.
    let tolerate = !(formula.bottled && !new);
    let build_flag = match decision {
        BottleDecision::Produce => "--build-bottle",
        _ => "--build-from-source",
    };

    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["fetch", "--retry", "--build-from-source"]))
            .named([name])
            .ignore_failures(tolerate),
    )?;
    let install_args = ["--verbose", "--formula", build_flag];
    let mut only_deps = vec!["install", "--only-dependencies"];
    only_deps.extend(install_args);
    let deps_passed = report
        .record(
            ctx,
            StepRequest::new(ctx.brew_command(&only_deps))
                .named([name])
                .ignore_failures(tolerate),
        )?
        .passed();
    if !deps_passed {
        return Ok(unbuilt(schedule, name, tolerate));
    }
    let mut install = vec!["install"];
    install.extend(install_args);
    let installed = report
        .record(
            ctx,
            StepRequest::new(ctx.brew_command(&install))
                .named([name])
                .ignore_failures(tolerate),
        )?
        .passed();

    let mut audit = vec!["audit", "--online"];
    if new {
        audit.push("--new");
    } else {
        audit.extend(["--git", "--skip-style"]);
    }
    if ctx.options.skip_revision_audit {
        audit.push("--skip-revision-audit");
    }
    report.record(ctx, StepRequest::new(ctx.brew_command(&audit)).named([name]))?;

    if !installed {
        return Ok(unbuilt(schedule, name, tolerate));
    }

    if decision == BottleDecision::Produce && !bottle(ctx, batch, &formula, new, report)? {
        ctx.ledger.discard(&formula.full_name)?;
        schedule.skipped_or_failed.push(name);
        return Ok(Outcome::Failed);
    }

    schedule.built.push(name);
    if !linkage_and_test(ctx, &formula, tolerate, report)? {
        let discarded = ctx.ledger.discard(&formula.full_name)?;
        debug!(formula = %name, ?discarded, "discarded artifacts");
        schedule.skipped_or_failed.push(name);
        return Ok(Outcome::Failed);
    }
    Ok(Outcome::Built)
}

fn skip(schedule: &mut Schedule, name: &str, reason: &str) -> Outcome {
    print_skip(name, reason);
    schedule.skipped_or_failed.push(name);
    Outcome::Skipped
}

fn unbuilt(schedule: &mut Schedule, name: &str, tolerated: bool) -> Outcome {
    schedule.skipped_or_failed.push(name);
    if tolerated {
        print_skip(name, "build failed; no bottle expected on this platform");
        Outcome::Skipped
    } else {
        Outcome::Failed
    }
}

/// Free disk space when the cache filesystem runs low.
fn cleanup_during(ctx: &mut RunContext<'_>, batch: &Batch, report: &mut Report) -> Result<()> {
    if !ctx.options.cleanup {
        return Ok(());
    }
    let cache = ctx.query.cache_dir()?;
    if !below_threshold(&cache, ctx.settings.min_free_disk_gb) {
        return Ok(());
    }
    ctx.disk_cleanups += 1;
    warn!(cache = %cache.display(), occurrence = ctx.disk_cleanups, "low disk space");
    let cache_arg = cache.display().to_string();
    report.record(ctx, StepRequest::new(["rm", "-rf", cache_arg.as_str()]))?;

    if ctx.disk_cleanups >= 2 {
        let strays: Vec<String> = ctx
            .query
            .installed()?
            .into_iter()
            .filter(|installed| !batch.order.iter().any(|name| name == installed))
            .collect();
        if !strays.is_empty() {
            report.record(
                ctx,
                StepRequest::new(ctx.brew_command(&[
                    "uninstall",
                    "--force",
                    "--ignore-dependencies",
                ]))
                .named(strays),
            )?;
        }
    }
    Ok(())
}

/// Install the previous run's artifact when neither the formula nor any of
/// its dependencies changed since that run.
fn reuse_cached(
    ctx: &mut RunContext<'_>,
    batch: &Batch,
    formula: &Formula,
    deps: &[String],
    schedule: &mut Schedule,
    report: &mut Report,
) -> Result<bool> {
    if !ctx.github.actions {
        return Ok(false);
    }
    let Some(previous) = batch.previous.clone() else {
        return Ok(false);
    };
    let cached = bottle_files_for(&ctx.paths.artifact_cache, &formula.name, &batch.tag)?;
    let Some(tarball) = cached
        .iter()
        .find(|path| path.to_string_lossy().ends_with(".tar.gz"))
        .cloned()
    else {
        return Ok(false);
    };

    report.record(
        ctx,
        StepRequest::new(ctx.git_command(&["fetch", "origin", &previous])).ignore_failures(true),
    )?;
    let mut paths = vec![formula.path.clone()];
    for dep in deps {
        if let Ok(dep_formula) = ctx.query.formula(dep)
            && ctx.repository().join(&dep_formula.path).exists()
        {
            paths.push(dep_formula.path);
        }
    }
    if !ctx.git.unchanged_since(&previous, &paths)? {
        debug!(formula = %formula.full_name, "changed since previous run");
        return Ok(false);
    }

    let tarball_arg = tarball.display().to_string();
    let installed = report
        .record(
            ctx,
            StepRequest::new(ctx.brew_command(&["install", tarball_arg.as_str()]))
                .ignore_failures(true),
        )?
        .passed();
    if !installed {
        return Ok(false);
    }

    for file in &cached {
        let Some(file_name) = file.file_name() else {
            continue;
        };
        let dest = ctx.paths.output_dir.join(file_name);
        fs::copy(file, &dest)
            .with_context(|| format!("copy {} to {}", file.display(), dest.display()))?;
        ctx.ledger.expect(&formula.full_name, &batch.tag, &dest)?;
    }
    schedule.built.push(formula.full_name.clone());
    schedule.testing.remove(&formula.full_name);
    let location = AnnotationLocation {
        title: Some("Bottle cache hit".to_string()),
        ..AnnotationLocation::default()
    };
    let message = format!(
        "Reused the bottle of {} from {previous}; it is unchanged since.",
        formula.full_name
    );
    println!("{}", workflow_command("notice", &location, &message));
    Ok(true)
}

/// One recovery attempt per run: install a compiler, then re-check.
fn ensure_compiler(ctx: &RunContext<'_>, batch: &mut Batch, report: &mut Report) -> Result<bool> {
    for attempt in 0..2 {
        if ctx.query.compiler_available() {
            return Ok(true);
        }
        if attempt > 0 || batch.gcc_attempted {
            break;
        }
        batch.gcc_attempted = true;
        report.record(ctx, StepRequest::new(ctx.brew_command(&["install", "gcc"])))?;
    }
    Ok(false)
}

/// Bring the candidate's dependencies into place.
///
/// Installed dependencies (and those built earlier in this run) are left
/// alone. Unchanged ones are fetched as bottles; changed ones are built from
/// source in one batch step.
fn install_dependencies(
    ctx: &RunContext<'_>,
    deps: &[String],
    schedule: &Schedule,
    report: &mut Report,
) -> Result<()> {
    if deps.is_empty() {
        return Ok(());
    }
    let installed = ctx.query.installed()?;
    let missing: Vec<&String> = deps
        .iter()
        .filter(|dep| !installed.contains(dep) && !set_contains(&schedule.built, dep))
        .collect();
    let (changed, unchanged): (Vec<&String>, Vec<&String>) = missing.into_iter().partition(|dep| {
        set_contains(&schedule.testing, dep) || set_contains(&schedule.added, dep)
    });

    if !unchanged.is_empty() {
        report.record(
            ctx,
            StepRequest::new(ctx.brew_command(&["fetch", "--retry"])).named(unchanged),
        )?;
    }
    if changed.is_empty() {
        return Ok(());
    }
    let tolerate = changed.iter().any(|dep| {
        ctx.query
            .formula(dep)
            .map(|formula| !formula.bottled)
            .unwrap_or(true)
    });
    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["fetch", "--retry", "--build-from-source"]))
            .named(changed.iter().copied()),
    )?;
    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["install", "--build-from-source"]))
            .named(changed.iter().copied())
            .ignore_failures(tolerate),
    )?;
    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["postinstall"])).named(changed.iter().copied()),
    )?;
    Ok(())
}

/// Produce, merge and reinstall from the artifact. Returns whether it
/// succeeded.
fn bottle(
    ctx: &mut RunContext<'_>,
    batch: &Batch,
    formula: &Formula,
    new: bool,
    report: &mut Report,
) -> Result<bool> {
    verify_artifacts(ctx, report)?;
    let mut args = vec!["bottle".to_string(), "--verbose".to_string(), "--json".to_string()];
    if ctx.options.keep_old && !new {
        args.push("--keep-old".to_string());
    }
    if ctx.options.skip_relocation {
        args.push("--skip-relocation".to_string());
    }
    if let Some(root_url) = &ctx.options.root_url {
        args.push(format!("--root-url={root_url}"));
    }
    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let step = report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&refs)).named([formula.full_name.as_str()]),
    )?;
    let bottled = step.passed();
    let output = step.output().map(str::to_string);
    append_output(&ctx.paths.bottle_output, output.as_deref())?;
    if !bottled {
        return Ok(false);
    }

    let files = bottle_files_for(&ctx.paths.output_dir, &formula.name, &batch.tag)?;
    if files.is_empty() {
        if ctx.options.dry_run {
            return Ok(true);
        }
        report.record_check(
            ctx,
            "bottle-files",
            Err(format!("no bottle files produced for {}", formula.full_name)),
        )?;
        return Ok(false);
    }
    for file in &files {
        ctx.ledger.expect(&formula.full_name, &batch.tag, file)?;
    }

    let (json, tarballs): (Vec<PathBuf>, Vec<PathBuf>) = files
        .into_iter()
        .partition(|path| path.extension().is_some_and(|ext| ext == "json"));
    let json: Vec<String> = json.iter().map(|path| path.display().to_string()).collect();
    let tarballs: Vec<String> = tarballs
        .iter()
        .map(|path| path.display().to_string())
        .collect();

    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["bottle", "--merge", "--write", "--no-commit"]))
            .named(json),
    )?;
    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["uninstall", "--formula", "--force"]))
            .named([formula.full_name.as_str()]),
    )?;
    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["install", "--only-dependencies"]))
            .named(tarballs.iter().cloned()),
    )?;
    let reinstalled = report
        .record(
            ctx,
            StepRequest::new(ctx.brew_command(&["install"])).named(tarballs),
        )?
        .passed();
    verify_artifacts(ctx, report)?;
    Ok(reinstalled)
}

/// Linkage check and, when declared, the formula's test.
fn linkage_and_test(
    ctx: &RunContext<'_>,
    formula: &Formula,
    tolerate: bool,
    report: &mut Report,
) -> Result<bool> {
    let name = formula.full_name.as_str();
    let step = report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["linkage", "--test"])).named([name]),
    )?;
    let linked = step.passed();
    let output = step.output().map(str::to_string);
    append_output(&ctx.paths.linkage_output, output.as_deref())?;

    let mut tested = true;
    if formula.test_defined {
        report.record(
            ctx,
            StepRequest::new(ctx.brew_command(&[
                "install",
                "--only-dependencies",
                "--include-test",
            ]))
            .named([name]),
        )?;
        tested = report
            .record(
                ctx,
                StepRequest::new(ctx.brew_command(&["test", "--verbose"]))
                    .named([name])
                    .ignore_failures(tolerate),
            )?
            .passed();
    }
    Ok(linked && tested)
}

/// A deleted formula must not be used by anything left in the tap.
fn check_deleted(ctx: &RunContext<'_>, schedule: &Schedule, report: &mut Report) -> Result<()> {
    let scope = UsesScope {
        recursive: false,
        include_build: true,
        include_test: true,
        include_optional: true,
    };
    for name in &schedule.deleted {
        let users = match ctx.query.dependents(name, scope) {
            Ok(users) => users,
            Err(QueryError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let result = if users.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "{name} was deleted but is still used by: {}",
                users.join(", ")
            ))
        };
        report.record_check(ctx, "deleted-formula-usage", result)?;
    }
    Ok(())
}

fn finish(ctx: &mut RunContext<'_>, tag: &str, schedule: &Schedule) -> Result<()> {
    let path = ctx.paths.skipped_or_failed(tag);
    fs::write(&path, schedule.skipped_or_failed.join(","))
        .with_context(|| format!("write {}", path.display()))?;
    ctx.set_output(
        "skipped_or_failed_formulae",
        schedule.skipped_or_failed.join(","),
    );
    ctx.set_output("built_formulae", schedule.built.join(","));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Dependency, Requirement};
    use crate::test_support::{
        ContextFixture, FakeCatalog, ScriptedRunner, TestRepo, formula, formula_with_deps,
    };

    fn schedule(names: &[&str]) -> Schedule {
        let testing: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        Schedule::from_lists(&testing, &[], &[])
    }

    #[test]
    fn dry_run_walks_the_full_pipeline() {
        let runner = ScriptedRunner::new();
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.options.dry_run = true;
        fixture.catalog.insert(formula("foo"));
        let mut ctx = fixture.context(&runner);
        let mut schedule = schedule(&["foo"]);
        let mut report = Report::new("formulae", ctx.repository());

        run(&mut ctx, &mut schedule, &mut report).expect("formulae");
        let commands: Vec<String> = report.steps().iter().map(|step| step.command_short()).collect();
        assert_eq!(
            commands,
            vec![
                "fetch --build-from-source foo",
                "install --only-dependencies --formula --build-bottle foo",
                "install --formula --build-bottle foo",
                "audit --online --git --skip-style foo",
                "bottle foo",
                "linkage --test foo",
                "install --only-dependencies --include-test foo",
                "test foo",
            ]
        );
        assert!(runner.commands().is_empty());
        assert_eq!(schedule.built.as_slice(), ["foo".to_string()]);
        assert!(ctx.paths.skipped_or_failed("arm64_sonoma").exists());
    }

    #[test]
    fn dependencies_are_built_first() {
        let runner = ScriptedRunner::new();
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.options.dry_run = true;
        fixture.catalog.insert(formula_with_deps("app", &["lib"]));
        fixture.catalog.insert(formula("lib"));
        let mut ctx = fixture.context(&runner);
        let mut schedule = schedule(&["app", "lib"]);
        let mut report = Report::new("formulae", ctx.repository());

        run(&mut ctx, &mut schedule, &mut report).expect("formulae");
        assert_eq!(
            schedule.built.as_slice(),
            ["lib".to_string(), "app".to_string()]
        );
        let builds_lib_from_source = report.steps().iter().any(|step| {
            step.command_short() == "install --build-from-source lib"
        });
        assert!(!builds_lib_from_source, "lib was built in this run already");
    }

    #[test]
    fn failing_dependency_skips_dependent() {
        let runner = ScriptedRunner::new();
        runner.respond("brew install --verbose --formula --build-bottle lib", false, "Error: boom\n");
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.catalog.insert(formula_with_deps("app", &["lib"]));
        fixture.catalog.insert(formula("lib"));
        let mut ctx = fixture.context(&runner);
        let mut schedule = schedule(&["app", "lib"]);
        let mut report = Report::new("formulae", ctx.repository());

        run(&mut ctx, &mut schedule, &mut report).expect("formulae");
        assert_eq!(
            schedule.skipped_or_failed.as_slice(),
            ["lib".to_string(), "app".to_string()]
        );
        assert!(schedule.built.is_empty());
        assert_eq!(report.failed_steps().len(), 1);
        assert_eq!(
            ctx.outputs
                .iter()
                .find(|(key, _)| key == "skipped_or_failed_formulae")
                .map(|(_, value)| value.as_str()),
            Some("lib,app")
        );
    }

    #[test]
    fn new_formula_failures_are_tolerated() {
        let runner = ScriptedRunner::new();
        runner.respond("brew install --verbose --formula", false, "Error: boom\n");
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.catalog.insert(formula("fresh"));
        let mut ctx = fixture.context(&runner);
        let testing = vec!["fresh".to_string()];
        let mut schedule = Schedule::from_lists(&testing, &testing, &[]);
        let mut report = Report::new("formulae", ctx.repository());

        run(&mut ctx, &mut schedule, &mut report).expect("formulae");
        assert!(report.is_success());
        assert_eq!(report.ignored_steps().len(), 1);
        assert!(schedule.skipped_or_failed.contains("fresh"));
        let audit = report
            .steps()
            .iter()
            .find(|step| step.command()[1] == "audit")
            .expect("audit step");
        assert!(audit.command().contains(&"--new".to_string()));
    }

    #[test]
    fn unsatisfied_requirements_skip_after_fetch_and_audit() {
        let runner = ScriptedRunner::new();
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.options.dry_run = true;
        fixture.catalog.insert(Formula {
            requirements: vec![Requirement {
                name: "macos".to_string(),
                satisfied: false,
                optional: false,
                message: Some("macOS is required.".to_string()),
            }],
            ..formula("mac-only")
        });
        let mut ctx = fixture.context(&runner);
        let mut schedule = schedule(&["mac-only"]);
        let mut report = Report::new("formulae", ctx.repository());

        run(&mut ctx, &mut schedule, &mut report).expect("formulae");
        let commands: Vec<String> = report.steps().iter().map(|step| step.command_short()).collect();
        assert_eq!(commands, vec!["fetch mac-only", "audit --online mac-only"]);
        assert!(schedule.skipped_or_failed.contains("mac-only"));
    }

    #[test]
    fn missing_compiler_is_recovered_at_most_once() {
        let runner = ScriptedRunner::new();
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.options.dry_run = true;
        fixture.catalog = FakeCatalog::new("arm64_sonoma")
            .without_compiler()
            .with(formula("one"))
            .with(formula("two"));
        let mut ctx = fixture.context(&runner);
        let mut schedule = schedule(&["one", "two"]);
        let mut report = Report::new("formulae", ctx.repository());

        run(&mut ctx, &mut schedule, &mut report).expect("formulae");
        let gcc = report
            .steps()
            .iter()
            .filter(|step| step.command_short() == "install gcc")
            .count();
        assert_eq!(gcc, 1);
        assert_eq!(
            schedule.skipped_or_failed.as_slice(),
            ["one".to_string(), "two".to_string()]
        );
    }

    #[test]
    fn unbottled_dependency_skips_candidate() {
        let runner = ScriptedRunner::new();
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.options.dry_run = true;
        fixture.catalog.insert(Formula {
            bottled: false,
            deps: vec![Dependency::runtime("rare")],
            ..formula("needs-rare")
        });
        fixture.catalog.insert(Formula {
            bottled: false,
            ..formula("rare")
        });
        let mut ctx = fixture.context(&runner);
        let mut schedule = schedule(&["needs-rare"]);
        let mut report = Report::new("formulae", ctx.repository());

        run(&mut ctx, &mut schedule, &mut report).expect("formulae");
        assert!(report.is_empty());
        assert!(schedule.skipped_or_failed.contains("needs-rare"));
    }

    #[test]
    fn deleted_formula_still_in_use_fails() {
        let runner = ScriptedRunner::new();
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.options.dry_run = true;
        fixture.catalog.insert(formula("old"));
        fixture.catalog.insert(formula_with_deps("user", &["old"]));
        let mut ctx = fixture.context(&runner);
        let deleted = vec!["old".to_string(), "gone".to_string()];
        let mut schedule = Schedule::from_lists(&[], &[], &deleted);
        let mut report = Report::new("formulae", ctx.repository());

        run(&mut ctx, &mut schedule, &mut report).expect("formulae");
        assert_eq!(report.steps().len(), 2);
        assert!(report.steps()[0].failed());
        assert!(report.steps()[0].output().is_some_and(|out| out.contains("user")));
        assert!(report.steps()[1].passed());
    }

    #[test]
    fn unchanged_formula_reuses_previous_bottle() {
        let repo = TestRepo::new().expect("repo");
        let previous = repo
            .commit_file("Formula/foo.rb", "class Foo\nend\n", "foo")
            .expect("commit");
        repo.commit_file("README.md", "# tap\n", "docs").expect("commit");

        let runner = ScriptedRunner::new();
        let mut fixture = ContextFixture::new().expect("fixture");
        fixture.options.repository = repo.path().to_path_buf();
        fixture.github.actions = true;
        fixture.github.repository = Some("acme/homebrew-tools".to_string());
        fixture.catalog.insert(formula("foo"));
        let cache = fixture.options.output_dir.join(&fixture.settings.artifact_cache);
        fs::create_dir_all(&cache).expect("cache dir");
        let tarball = cache.join("foo--1.0.arm64_sonoma.bottle.tar.gz");
        fs::write(&tarball, b"bottle").expect("tarball");
        fs::write(cache.join("foo--1.0.arm64_sonoma.bottle.json"), b"{}").expect("json");
        let mut ctx = fixture.context(&runner);
        let mut schedule = schedule(&["foo"]);
        let mut report = Report::new("formulae", ctx.repository());

        run(&mut ctx, &mut schedule, &mut report).expect("formulae");
        let commands = runner.commands();
        let fetch = format!("fetch origin {previous}");
        assert!(commands.iter().any(|command| command.ends_with(&fetch)));
        assert!(commands.contains(&format!("brew install {}", tarball.display())));
        assert!(!commands.iter().any(|command| command.contains("--build-from-source")));
        assert!(!commands.iter().any(|command| command.contains("--build-bottle")));
        assert!(schedule.testing.is_empty());
        assert_eq!(schedule.built.as_slice(), ["foo".to_string()]);

        let expected: Vec<&str> = ctx
            .ledger
            .upload_set()
            .into_iter()
            .map(|entry| entry.file.as_str())
            .collect();
        assert_eq!(
            expected,
            vec![
                "foo--1.0.arm64_sonoma.bottle.json",
                "foo--1.0.arm64_sonoma.bottle.tar.gz",
            ]
        );
        assert!(ctx.paths.output_dir.join("foo--1.0.arm64_sonoma.bottle.tar.gz").exists());
    }
}
