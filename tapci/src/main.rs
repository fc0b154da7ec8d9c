//! `tapci` command-line entry point.
//!
//! Parses flags, loads the optional settings file, wires the real
//! collaborators (`brew`, `git`, `gh`) into a run context and maps the
//! outcome to an exit code.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use tracing::debug;

use tapci::context::{Collaborators, Options, RunContext, UsageError};
use tapci::core::plan::Phase;
use tapci::exit_codes;
use tapci::io::brew::BrewCli;
use tapci::io::config::{CONFIG_FILE, load_settings};
use tapci::io::github::GitHubEnv;
use tapci::io::process::SystemRunner;
use tapci::io::store::{ArtifactStore, GhCliStore, NoArtifactStore};
use tapci::logging;
use tapci::runner;

#[derive(Debug, Parser)]
#[command(
    name = "tapci",
    version,
    about = "Build, bottle and test the formulae changed in a tap"
)]
#[command(group(ArgGroup::new("only").multiple(false)))]
struct Cli {
    /// Revisions (`HEAD`) or formula names to test.
    #[arg(value_name = "TARGET")]
    targets: Vec<String>,

    /// Tap repository to test (defaults to the current directory).
    #[arg(long, env = "TAPCI_REPOSITORY")]
    repository: Option<PathBuf>,
    /// Tap name (`user/repo`) when it cannot be derived from the path.
    #[arg(long)]
    tap: Option<String>,
    /// Where reports and bottles are written (defaults to the current directory).
    #[arg(long, env = "TAPCI_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,
    /// Settings file (defaults to `<repository>/.tapci.toml`).
    #[arg(long, env = "TAPCI_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, group = "only")]
    only_cleanup_before: bool,
    #[arg(long, group = "only")]
    only_setup: bool,
    #[arg(long, group = "only")]
    only_tap_syntax: bool,
    #[arg(long, group = "only")]
    only_formulae_detect: bool,
    /// Build and test formulae, then their dependents.
    #[arg(long, group = "only")]
    only_formulae: bool,
    #[arg(long, group = "only")]
    only_formulae_dependents: bool,
    #[arg(long, group = "only")]
    only_cleanup_after: bool,

    #[arg(long)]
    skip_setup: bool,
    #[arg(long)]
    skip_dependents: bool,
    #[arg(long)]
    skip_recursive_dependents: bool,
    #[arg(long)]
    skip_revision_audit: bool,

    /// Formulae to test instead of detecting them (comma separated).
    #[arg(long, value_delimiter = ',')]
    testing_formulae: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    added_formulae: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    deleted_formulae: Vec<String>,
    /// Formulae whose dependents are not tested (needs `--only-formulae-dependents`).
    #[arg(long, value_delimiter = ',')]
    skipped_or_failed_formulae: Vec<String>,

    /// Print the steps without running them.
    #[arg(long)]
    dry_run: bool,
    /// Stop at the first failed step.
    #[arg(long)]
    fail_fast: bool,
    #[arg(long, short)]
    verbose: bool,
    /// Reset the repository and prune caches before and after the run.
    #[arg(long)]
    cleanup: bool,
    /// Skip style and audit checks of the whole tap.
    #[arg(long)]
    stable: bool,
    #[arg(long)]
    build_dependents_from_source: bool,
    /// Also test the configured default test formula.
    #[arg(long)]
    test_default_formula: bool,

    #[arg(long)]
    keep_old: bool,
    #[arg(long)]
    skip_relocation: bool,
    #[arg(long)]
    root_url: Option<String>,
}

impl Cli {
    fn only(&self) -> Option<Phase> {
        [
            (self.only_cleanup_before, Phase::CleanupBefore),
            (self.only_setup, Phase::Setup),
            (self.only_tap_syntax, Phase::TapSyntax),
            (self.only_formulae_detect, Phase::FormulaeDetect),
            (self.only_formulae, Phase::Formulae),
            (self.only_formulae_dependents, Phase::FormulaeDependents),
            (self.only_cleanup_after, Phase::CleanupAfter),
        ]
        .into_iter()
        .find_map(|(set, phase)| set.then_some(phase))
    }

    fn into_options(self, cwd: &Path) -> Options {
        let only = self.only();
        let repository = self.repository.unwrap_or_else(|| cwd.to_path_buf());
        let output_dir = self.output_dir.unwrap_or_else(|| cwd.to_path_buf());
        let mut options = Options::new(repository, output_dir);
        if !self.targets.is_empty() {
            options.targets = self.targets;
        }
        options.tap = self.tap;
        options.only = only;
        options.skip_setup = self.skip_setup;
        options.skip_dependents = self.skip_dependents;
        options.skip_recursive_dependents = self.skip_recursive_dependents;
        options.skip_revision_audit = self.skip_revision_audit;
        options.testing_formulae = non_blank(self.testing_formulae);
        options.added_formulae = non_blank(self.added_formulae);
        options.deleted_formulae = non_blank(self.deleted_formulae);
        options.skipped_or_failed_formulae = non_blank(self.skipped_or_failed_formulae);
        options.dry_run = self.dry_run;
        options.fail_fast = self.fail_fast;
        options.verbose = self.verbose;
        options.cleanup = self.cleanup;
        options.stable = self.stable;
        options.build_dependents_from_source = self.build_dependents_from_source;
        options.test_default_formula = self.test_default_formula;
        options.keep_old = self.keep_old;
        options.skip_relocation = self.skip_relocation;
        options.root_url = self.root_url;
        options
    }
}

/// `--testing-formulae=` (empty) means no list, not one empty name.
fn non_blank(names: Vec<String>) -> Vec<String> {
    names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(true) => exit_codes::OK,
        Ok(false) => exit_codes::FAILED,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if err.downcast_ref::<UsageError>().is_some() {
                exit_codes::USAGE
            } else {
                exit_codes::FAILED
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<bool> {
    let cwd = std::env::current_dir().context("read current directory")?;
    let config = cli.config.clone();
    let options = cli.into_options(&cwd);
    let config_path = config.unwrap_or_else(|| options.repository.join(CONFIG_FILE));
    let settings = load_settings(&config_path)?;
    debug!(config = %config_path.display(), ?settings, "loaded settings");
    let github = GitHubEnv::from_env();

    let system = SystemRunner;
    let query = BrewCli::new(&system, options.repository.clone(), settings.bottle_tag.clone());
    let gh_store = GhCliStore::new(&system);
    let no_store = NoArtifactStore;
    let store: &dyn ArtifactStore = if github.actions && github.repository.is_some() {
        &gh_store
    } else {
        &no_store
    };

    let mut ctx = RunContext::new(
        options,
        settings,
        github,
        Collaborators {
            runner: &system,
            query: &query,
            store,
        },
    );
    let outcome = runner::run(&mut ctx)?;
    Ok(outcome.success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn parses_lists_and_flags() {
        let cli = Cli::try_parse_from([
            "tapci",
            "--only-formulae-dependents",
            "--testing-formulae=foo,bar",
            "--skipped-or-failed-formulae=bar",
            "--dry-run",
        ])
        .expect("parse");
        let options = cli.into_options(Path::new("/work"));
        assert_eq!(options.only, Some(Phase::FormulaeDependents));
        assert_eq!(options.testing_formulae, vec!["foo", "bar"]);
        assert_eq!(options.skipped_or_failed_formulae, vec!["bar"]);
        assert_eq!(options.targets, vec!["HEAD"]);
        assert_eq!(options.repository, PathBuf::from("/work"));
        assert!(options.dry_run);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn two_only_flags_conflict() {
        let err = Cli::try_parse_from(["tapci", "--only-setup", "--only-formulae"])
            .expect_err("conflict");
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
        assert_eq!(err.exit_code(), exit_codes::USAGE);
    }
}
