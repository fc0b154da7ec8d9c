//! Explicit run context threaded through every phase.
//!
//! All global inputs (flags, settings, CI environment, collaborators) are
//! resolved once in `main` and carried here; phases never read the process
//! environment directly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::plan::{Phase, PhaseSelection};
use crate::io::artifacts::{ArtifactLedger, FAILED_DIR};
use crate::io::brew::FormulaQuery;
use crate::io::config::Settings;
use crate::io::git::Git;
use crate::io::github::GitHubEnv;
use crate::io::process::CommandRunner;
use crate::io::store::ArtifactStore;
use crate::step::{AnnotationConfig, StepEnv};

/// Invalid invocation; exits with the usage status code.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct UsageError(pub String);

impl UsageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Resolved command-line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub repository: PathBuf,
    /// `user/repo`; derived from the repository path when not given.
    pub tap: Option<String>,
    pub output_dir: PathBuf,
    /// Revisions or formula names; never empty after resolution.
    pub targets: Vec<String>,

    pub only: Option<Phase>,
    pub skip_setup: bool,
    pub skip_dependents: bool,
    pub skip_recursive_dependents: bool,
    pub skip_revision_audit: bool,

    pub testing_formulae: Vec<String>,
    pub added_formulae: Vec<String>,
    pub deleted_formulae: Vec<String>,
    pub skipped_or_failed_formulae: Vec<String>,

    pub dry_run: bool,
    pub fail_fast: bool,
    pub verbose: bool,
    pub cleanup: bool,
    pub stable: bool,
    pub build_dependents_from_source: bool,
    pub test_default_formula: bool,

    pub keep_old: bool,
    pub skip_relocation: bool,
    pub root_url: Option<String>,
}

impl Options {
    pub fn new(repository: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            tap: None,
            output_dir: output_dir.into(),
            targets: vec!["HEAD".to_string()],
            only: None,
            skip_setup: false,
            skip_dependents: false,
            skip_recursive_dependents: false,
            skip_revision_audit: false,
            testing_formulae: Vec::new(),
            added_formulae: Vec::new(),
            deleted_formulae: Vec::new(),
            skipped_or_failed_formulae: Vec::new(),
            dry_run: false,
            fail_fast: false,
            verbose: false,
            cleanup: false,
            stable: false,
            build_dependents_from_source: false,
            test_default_formula: false,
            keep_old: false,
            skip_relocation: false,
            root_url: None,
        }
    }

    pub fn has_explicit_lists(&self) -> bool {
        !self.testing_formulae.is_empty()
            || !self.added_formulae.is_empty()
            || !self.deleted_formulae.is_empty()
    }

    pub fn selection(&self) -> PhaseSelection {
        PhaseSelection {
            only: self.only,
            skip_setup: self.skip_setup,
            skip_dependents: self.skip_dependents,
            explicit_lists: self.has_explicit_lists(),
        }
    }

    /// Flag combinations that are rejected before anything runs.
    pub fn validate(&self) -> Result<(), UsageError> {
        if !self.skipped_or_failed_formulae.is_empty()
            && self.only != Some(Phase::FormulaeDependents)
        {
            return Err(UsageError::new(
                "`--skipped-or-failed-formulae` requires `--only-formulae-dependents`",
            ));
        }
        if self.cleanup && same_dir(&self.output_dir, &self.repository) {
            return Err(UsageError::new(
                "`--cleanup` requires an output directory outside the repository",
            ));
        }
        if self.targets.is_empty() {
            return Err(UsageError::new("no targets given"));
        }
        Ok(())
    }

    /// Tap name from `--tap`, or from a `Taps/<user>/homebrew-<repo>` path.
    pub fn tap_name(&self) -> Option<String> {
        if let Some(tap) = &self.tap {
            return Some(tap.to_lowercase());
        }
        let components: Vec<String> = self
            .repository
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let index = components.iter().rposition(|c| c == "Taps")?;
        let user = components.get(index + 1)?;
        let repo = components.get(index + 2)?;
        let repo = repo.strip_prefix("homebrew-").unwrap_or(repo);
        Some(format!("{user}/{repo}").to_lowercase())
    }

    /// Formula names are qualified only for taps other than core.
    pub fn qualifying_tap(&self) -> Option<String> {
        self.tap_name().filter(|tap| tap != CORE_TAP)
    }
}

pub const CORE_TAP: &str = "homebrew/core";

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Inter-phase signals that turn into step environment overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSignals {
    /// Install from local definitions rather than the package API.
    pub no_install_from_api: bool,
}

impl RunSignals {
    pub fn env(&self) -> BTreeMap<String, Option<String>> {
        let mut env = BTreeMap::new();
        if self.no_install_from_api {
            env.insert(
                "HOMEBREW_NO_INSTALL_FROM_API".to_string(),
                Some("1".to_string()),
            );
        }
        env
    }
}

/// Files and directories written under the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub output_dir: PathBuf,
    pub junit: PathBuf,
    pub steps_output: PathBuf,
    pub bottle_output: PathBuf,
    pub linkage_output: PathBuf,
    pub failed: PathBuf,
    pub artifact_cache: PathBuf,
}

impl OutputPaths {
    pub fn new(output_dir: &Path, settings: &Settings) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            junit: output_dir.join("tapci-results.xml"),
            steps_output: output_dir.join("steps_output.txt"),
            bottle_output: output_dir.join("bottle_output.txt"),
            linkage_output: output_dir.join("linkage_output.txt"),
            failed: output_dir.join(FAILED_DIR),
            artifact_cache: output_dir.join(&settings.artifact_cache),
        }
    }

    pub fn skipped_or_failed(&self, tag: &str) -> PathBuf {
        self.output_dir
            .join(format!("skipped_or_failed_formulae-{tag}.txt"))
    }

    pub fn tested_dependents(&self, tag: &str) -> PathBuf {
        self.output_dir.join(format!("tested_dependents-{tag}.txt"))
    }
}

/// Collaborators borrowed for the length of a run.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub runner: &'a dyn CommandRunner,
    pub query: &'a dyn FormulaQuery,
    pub store: &'a dyn ArtifactStore,
}

/// Single owner of the run's mutable state; passed by `&mut` to phases.
pub struct RunContext<'a> {
    pub options: Options,
    pub settings: Settings,
    pub github: GitHubEnv,
    pub paths: OutputPaths,
    pub git: Git,
    pub runner: &'a dyn CommandRunner,
    pub query: &'a dyn FormulaQuery,
    pub store: &'a dyn ArtifactStore,
    pub signals: RunSignals,
    pub ledger: ArtifactLedger,
    /// Number of times the disk threshold has been hit this run.
    pub disk_cleanups: u32,
    /// Key/values for the GitHub output channel, written once at the end.
    pub outputs: Vec<(String, String)>,
    annotations: AnnotationConfig,
}

impl<'a> RunContext<'a> {
    pub fn new(
        options: Options,
        settings: Settings,
        github: GitHubEnv,
        collaborators: Collaborators<'a>,
    ) -> Self {
        let paths = OutputPaths::new(&options.output_dir, &settings);
        let annotations = AnnotationConfig {
            formula_dir: settings.formula_dir.clone(),
            limit_bytes: settings.annotation_limit_bytes,
            context_lines: settings.annotation_context_lines,
        };
        Self {
            git: Git::new(&options.repository),
            ledger: ArtifactLedger::new(&options.output_dir),
            paths,
            options,
            settings,
            github,
            runner: collaborators.runner,
            query: collaborators.query,
            store: collaborators.store,
            signals: RunSignals::default(),
            disk_cleanups: 0,
            outputs: Vec::new(),
            annotations,
        }
    }

    pub fn step_env(&self) -> StepEnv<'_> {
        StepEnv {
            runner: self.runner,
            repository: &self.options.repository,
            workdir: &self.options.output_dir,
            dry_run: self.options.dry_run,
            verbose: self.options.verbose,
            annotations: self.github.actions.then_some(&self.annotations),
        }
    }

    /// Set a GitHub output; a later value for the same key replaces it.
    pub fn set_output(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.outputs.iter_mut().find(|(existing, _)| existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.outputs.push((key.to_string(), value)),
        }
    }

    pub fn repository(&self) -> &Path {
        &self.options.repository
    }

    /// `git -C <repository> <args...>` as a step command.
    pub fn git_command(&self, args: &[&str]) -> Vec<String> {
        let mut command = vec![
            "git".to_string(),
            "-C".to_string(),
            self.options.repository.display().to_string(),
        ];
        command.extend(args.iter().map(|arg| arg.to_string()));
        command
    }

    /// `brew <args...>` as a step command.
    pub fn brew_command(&self, args: &[&str]) -> Vec<String> {
        let mut command = vec!["brew".to_string()];
        command.extend(args.iter().map(|arg| arg.to_string()));
        command
    }
}
