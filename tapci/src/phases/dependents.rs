//! Install and test the packages that depend on what was just built.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::context::RunContext;
use crate::core::graph::{
    DependentCandidate, PartitionPolicy, expand_closure, is_deferred, merge_dependent_names,
    partition,
};
use crate::core::schedule::Schedule;
use crate::core::types::Formula;
use crate::io::artifacts::bottle_files_for;
use crate::io::brew::{DepScope, QueryError, UsesScope};
use crate::phases::shared::{
    append_output, append_text, available, bottle_tag, download_previous, find_file, print_skip,
    query_with_tap_retry, set_contains,
};
use crate::report::Report;
use crate::step::StepRequest;

/// Dependents that passed in the previous CI run.
#[derive(Debug, Clone, Default)]
struct PreviousRun {
    sha: Option<String>,
    tested: Vec<String>,
}

/// Per-phase state shared by every parent.
struct Round {
    tag: String,
    previous: PreviousRun,
}

/// The package whose dependents are being tested.
struct Parent<'p> {
    round: &'p Round,
    formula: &'p Formula,
}

#[instrument(skip_all)]
pub fn run(ctx: &mut RunContext<'_>, schedule: &mut Schedule, report: &mut Report) -> Result<()> {
    let tag = bottle_tag(ctx)?;
    let candidates: Vec<String> = schedule
        .testing
        .iter()
        .filter(|name| !set_contains(&schedule.skipped_or_failed, name))
        .cloned()
        .collect();
    if candidates.is_empty() {
        println!("No formulae to test dependents of.");
    }

    install_candidates(ctx, &tag, &candidates, report)?;
    let previous = previous_run(ctx, &tag)?;
    let round = Round { tag, previous };

    for (index, name) in candidates.iter().enumerate() {
        let pending = &candidates[index + 1..];
        test_dependents_of(ctx, &round, name, pending, schedule, report)?;
    }

    ctx.set_output("tested_dependents", schedule.tested_dependents.join(","));
    Ok(())
}

/// Install candidates that are not installed yet from the produced
/// artifacts, without their dependencies and unlinked.
fn install_candidates(
    ctx: &RunContext<'_>,
    tag: &str,
    candidates: &[String],
    report: &mut Report,
) -> Result<()> {
    for name in candidates {
        let formula = query_with_tap_retry(ctx, report, |query| query.formula(name))?;
        if formula.installed {
            continue;
        }
        let tarballs: Vec<String> = bottle_files_for(&ctx.paths.output_dir, &formula.name, tag)?
            .into_iter()
            .map(|path| path.display().to_string())
            .filter(|path| path.ends_with(".tar.gz"))
            .collect();
        if tarballs.is_empty() {
            if ctx.options.dry_run {
                debug!(formula = %name, "no bottle to install in dry run");
                continue;
            }
            bail!("no bottle found for {name} in {}", ctx.paths.output_dir.display());
        }
        report.record(
            ctx,
            StepRequest::new(ctx.brew_command(&[
                "install",
                "--ignore-dependencies",
                "--skip-post-install",
            ]))
            .named(tarballs),
        )?;
        report.record(
            ctx,
            StepRequest::new(ctx.brew_command(&["unlink"])).named([name]),
        )?;
    }
    Ok(())
}

/// The previous run's tested-dependents list, downloaded into the cache.
fn previous_run(ctx: &RunContext<'_>, tag: &str) -> Result<PreviousRun> {
    let sha = download_previous(ctx, "tested-dependents*")?;
    let file_name = format!("tested_dependents-{tag}.txt");
    let Some(path) = find_file(&ctx.paths.artifact_cache, &file_name) else {
        return Ok(PreviousRun {
            sha,
            tested: Vec::new(),
        });
    };
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let tested = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    Ok(PreviousRun { sha, tested })
}

fn test_dependents_of(
    ctx: &mut RunContext<'_>,
    round: &Round,
    name: &str,
    pending: &[String],
    schedule: &mut Schedule,
    report: &mut Report,
) -> Result<()> {
    let tag = round.tag.as_str();
    println!();
    println!("==> Determining dependents of {name}");
    let formula = query_with_tap_retry(ctx, report, |query| query.formula(name))?;

    let recursive =
        !ctx.options.skip_recursive_dependents && ctx.settings.dependents.recursive_for(tag);
    let with_test = query_with_tap_retry(ctx, report, |query| {
        query.dependents(
            name,
            UsesScope {
                recursive,
                include_test: true,
                ..UsesScope::default()
            },
        )
    })?;
    let with_build = query_with_tap_retry(ctx, report, |query| {
        query.dependents(
            name,
            UsesScope {
                include_build: true,
                ..UsesScope::default()
            },
        )
    })?;
    let names = merge_dependent_names(
        with_test.into_iter().chain(with_build),
        schedule.testing.as_slice(),
    );

    let mut candidates = Vec::new();
    for dependent_name in names {
        let dependent = match ctx.query.formula(&dependent_name) {
            Ok(dependent) => dependent,
            Err(err) => {
                warn!(dependent = %dependent_name, err = %err, "could not load dependent");
                continue;
            }
        };
        let deps = if recursive {
            let transitive = match ctx.query.dependencies(&dependent_name, DepScope::RUNTIME) {
                Ok(transitive) => transitive,
                Err(QueryError::NotFound(_)) => Vec::new(),
                Err(err) => return Err(err.into()),
            };
            expand_closure(&dependent.deps, &transitive)
        } else {
            dependent.deps.clone()
        };
        if is_deferred(&deps, pending) {
            info!(dependent = %dependent_name, "deferred to a later candidate");
            continue;
        }
        candidates.push(DependentCandidate {
            formula: dependent,
            deps,
        });
    }

    let mut availability: BTreeMap<String, bool> = BTreeMap::new();
    for dep in candidates.iter().flat_map(|candidate| candidate.deps.iter()) {
        if !availability.contains_key(&dep.name) {
            let is_available = available(ctx, schedule, &dep.name);
            availability.insert(dep.name.clone(), is_available);
        }
    }
    let plan = partition(
        candidates,
        PartitionPolicy {
            package: name,
            testing: schedule.testing.as_slice(),
            build_from_source: ctx.options.build_dependents_from_source,
        },
        |dep| availability.get(dep).copied().unwrap_or(false),
    );
    if plan.is_empty() {
        println!("No dependents of {name} to test.");
        return Ok(());
    }
    let source: Vec<&str> = plan.source.iter().map(DependentCandidate::name).collect();
    let bottled: Vec<&str> = plan.bottled.iter().map(DependentCandidate::name).collect();
    println!("Source dependents: {}", source.join(" "));
    println!("Bottled dependents: {}", bottled.join(" "));

    prepare_parent(ctx, &formula, report)?;
    let parent = Parent {
        round,
        formula: &formula,
    };
    for candidate in &plan.source {
        let testable = plan.is_testable(candidate.name());
        test_dependent(ctx, &parent, candidate, true, testable, schedule, report)?;
    }
    for candidate in &plan.bottled {
        let testable = plan.is_testable(candidate.name());
        test_dependent(ctx, &parent, candidate, false, testable, schedule, report)?;
    }
    Ok(())
}

/// Link the freshly built package and make its dependencies usable.
fn prepare_parent(ctx: &RunContext<'_>, formula: &Formula, report: &mut Report) -> Result<()> {
    let name = formula.full_name.as_str();
    if !formula.linked && !formula.keg_only {
        report.record(ctx, StepRequest::new(ctx.brew_command(&["link"])).named([name]))?;
    }
    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["install", "--only-dependencies"])).named([name]),
    )?;
    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&["postinstall"])).named([name]),
    )?;
    Ok(())
}

/// The previous run's sha when `candidate` passed in that run and neither it,
/// the parent, nor anything in its dependency closure changed since.
fn tested_previously(
    ctx: &RunContext<'_>,
    parent: &Parent<'_>,
    candidate: &DependentCandidate,
) -> Option<String> {
    let previous = &parent.round.previous;
    let sha = previous.sha.as_ref()?;
    let name = candidate.name();
    if !previous.tested.iter().any(|tested| tested == name) {
        return None;
    }

    let mut paths = vec![candidate.formula.path.clone(), parent.formula.path.clone()];
    for dep in &candidate.deps {
        if let Ok(dep_formula) = ctx.query.formula(&dep.name)
            && ctx.repository().join(&dep_formula.path).exists()
            && !paths.contains(&dep_formula.path)
        {
            paths.push(dep_formula.path);
        }
    }
    match ctx.git.unchanged_since(sha, &paths) {
        Ok(true) => Some(sha.clone()),
        Ok(false) => {
            debug!(dependent = %name, %sha, "closure changed since previous run");
            None
        }
        Err(err) => {
            warn!(dependent = %name, err = %format!("{err:#}"), "could not compare with previous run");
            None
        }
    }
}

fn test_dependent(
    ctx: &RunContext<'_>,
    parent: &Parent<'_>,
    candidate: &DependentCandidate,
    source: bool,
    testable: bool,
    schedule: &mut Schedule,
    report: &mut Report,
) -> Result<()> {
    let dependent = &candidate.formula;
    let name = dependent.full_name.as_str();

    if let Some(sha) = tested_previously(ctx, parent, candidate) {
        let reason = format!("tested in the run for {sha} and unchanged since");
        print_skip(name, &reason);
        report.record_note("reuse-dependent", name, reason);
        return Ok(());
    }
    let unsatisfied = dependent.unsatisfied_requirements();
    if !unsatisfied.is_empty() {
        print_skip(name, &unsatisfied.join("; "));
        return Ok(());
    }
    if dependent.deprecated || dependent.disabled {
        let state = if dependent.disabled { "disabled" } else { "deprecated" };
        print_skip(name, state);
        return Ok(());
    }

    // Unbottled dependents may legitimately fail to build here.
    let tolerate = !dependent.bottled;
    let from_source: &[&str] = if source { &["--build-from-source"] } else { &[] };

    let mut fetch = vec!["fetch", "--retry"];
    fetch.extend_from_slice(from_source);
    report.record(
        ctx,
        StepRequest::new(ctx.brew_command(&fetch))
            .named([name])
            .ignore_failures(tolerate),
    )?;

    let previously_installed = dependent.installed;
    let mut installed = true;
    if !previously_installed {
        let mut only_deps = vec!["install", "--only-dependencies"];
        only_deps.extend_from_slice(from_source);
        installed = report
            .record(
                ctx,
                StepRequest::new(ctx.brew_command(&only_deps))
                    .named([name])
                    .ignore_failures(tolerate),
            )?
            .passed();
        if installed {
            let mut install = vec!["install"];
            install.extend_from_slice(from_source);
            installed = report
                .record(
                    ctx,
                    StepRequest::new(ctx.brew_command(&install))
                        .named([name])
                        .ignore_failures(tolerate),
                )?
                .passed();
        }
    }

    let mut passed = installed;
    if installed {
        if previously_installed && !dependent.linked && !dependent.keg_only {
            report.record(ctx, StepRequest::new(ctx.brew_command(&["link"])).named([name]))?;
        }
        let deps_installed = report
            .record(
                ctx,
                StepRequest::new(ctx.brew_command(&["install", "--only-dependencies"]))
                    .named([name]),
            )?
            .passed();
        let step = report.record(
            ctx,
            StepRequest::new(ctx.brew_command(&["linkage", "--test"])).named([name]),
        )?;
        let linked = step.passed();
        let output = step.output().map(str::to_string);
        append_output(&ctx.paths.linkage_output, output.as_deref())?;

        let mut tested = true;
        if testable {
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
                    StepRequest::new(ctx.brew_command(&["test", "--retry", "--verbose"]))
                        .named([name]),
                )?
                .passed();
        }
        passed = deps_installed && linked && tested;
    }

    if passed {
        append_text(&ctx.paths.tested_dependents(&parent.round.tag), name)?;
        schedule.tested_dependents.push(name);
    }
    if !previously_installed {
        report.record(
            ctx,
            StepRequest::new(ctx.brew_command(&[
                "uninstall",
                "--force",
                "--ignore-dependencies",
            ]))
            .named([name]),
        )?;
    }
    Ok(())
}
