//! A single external command invocation and its outcome.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::core::truncate::truncate_around_error;
use crate::core::types::{StepStatus, short_name};
use crate::io::github::{AnnotationLocation, workflow_command};
use crate::io::process::{CommandRequest, CommandRunner};

/// Arguments removed from report record names.
const SHORT_NOISE: &[&str] = &["brew", "-C", "--force", "--retry", "--verbose", "--json"];

/// What to run, built fluently by the phases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepRequest {
    pub command: Vec<String>,
    /// Formula names the command acts on; appended to the command.
    pub named_args: Vec<String>,
    pub env: BTreeMap<String, Option<String>>,
    pub ignore_failures: bool,
    pub verbose: bool,
}

impl StepRequest {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn named<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.named_args.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), Some(value.to_string()));
        self
    }

    pub fn unset(mut self, key: &str) -> Self {
        self.env.insert(key.to_string(), None);
        self
    }

    pub fn ignore_failures(mut self, ignore: bool) -> Self {
        self.ignore_failures = ignore;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn full_command(&self) -> Vec<String> {
        let mut command = self.command.clone();
        command.extend(self.named_args.iter().cloned());
        command
    }
}

/// Annotation limits and where to look for definitions.
#[derive(Debug, Clone)]
pub struct AnnotationConfig {
    pub formula_dir: String,
    pub limit_bytes: usize,
    pub context_lines: usize,
}

/// Everything a step needs from the run, without borrowing the whole context.
pub struct StepEnv<'a> {
    pub runner: &'a dyn CommandRunner,
    pub repository: &'a Path,
    /// Directory commands run in; produced artifacts land here.
    pub workdir: &'a Path,
    pub dry_run: bool,
    pub verbose: bool,
    /// Set when running under GitHub Actions.
    pub annotations: Option<&'a AnnotationConfig>,
}

/// A finished command. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Step {
    command: Vec<String>,
    named_args: Vec<String>,
    env: BTreeMap<String, Option<String>>,
    repository: PathBuf,
    ignore_failures: bool,
    verbose: bool,
    status: StepStatus,
    output: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl Step {
    fn running(request: StepRequest, repository: &Path) -> Self {
        Self {
            command: request.full_command(),
            named_args: request.named_args,
            env: request.env,
            repository: repository.to_path_buf(),
            ignore_failures: request.ignore_failures,
            verbose: request.verbose,
            status: StepStatus::Running,
            output: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Run `request` to completion.
    ///
    /// A non-zero exit or a spawn failure is a failed (or ignored) step, not
    /// an error. Only malformed requests are rejected.
    #[instrument(skip_all, fields(command = %request.command.first().map(String::as_str).unwrap_or("")))]
    pub fn execute(request: StepRequest, env: &StepEnv<'_>) -> Result<Self> {
        validate_command(&request.full_command())?;
        let mut step = Step::running(request, env.repository);
        let verbose = step.verbose || env.verbose;

        println!("==> {}", step.command_trimmed());
        step.start_time = Some(Utc::now());

        if env.dry_run {
            step.finish(StepStatus::Passed);
            return Ok(step);
        }

        let process = CommandRequest {
            program: step.command[0].clone(),
            args: step.command[1..].to_vec(),
            env: step.env.clone(),
            workdir: Some(env.workdir.to_path_buf()),
            echo: verbose,
        };
        let (success, bytes) = match env.runner.run(&process) {
            Ok(output) => (output.success, output.output),
            Err(err) => {
                warn!(err = %err, "step could not be spawned");
                (false, format!("{err:#}").into_bytes())
            }
        };

        let text = String::from_utf8_lossy(&bytes).into_owned();
        step.output = (!text.trim().is_empty()).then_some(text);

        let status = if success {
            StepStatus::Passed
        } else if step.ignore_failures {
            StepStatus::Ignored
        } else {
            StepStatus::Failed
        };
        step.finish(status);
        step.print_result(verbose);

        if step.failed()
            && let Some(config) = env.annotations
        {
            for annotation in step.annotations(config) {
                println!("{annotation}");
            }
        }
        Ok(step)
    }

    /// A step for an integrity check that is not a subprocess.
    pub fn check(name: &str, result: Result<(), String>, repository: &Path) -> Self {
        let mut step = Step::running(StepRequest::new(["tapci", name]), repository);
        step.start_time = Some(Utc::now());
        let status = match result {
            Ok(()) => StepStatus::Passed,
            Err(message) => {
                step.output = Some(message);
                StepStatus::Failed
            }
        };
        step.finish(status);
        step.print_result(false);
        step
    }

    /// A passed step that only records why work was not done, e.g. a
    /// dependent reused from an earlier run.
    pub fn note(name: &str, target: &str, message: String, repository: &Path) -> Self {
        let mut step = Step::running(StepRequest::new(["tapci", name]).named([target]), repository);
        step.start_time = Some(Utc::now());
        step.output = Some(message);
        step.finish(StepStatus::Passed);
        step
    }

    fn finish(&mut self, status: StepStatus) {
        debug_assert_eq!(self.status, StepStatus::Running);
        debug_assert!(status.is_terminal());
        self.status = status;
        self.end_time = Some(Utc::now());
        debug!(status = %status, "step finished");
    }

    fn print_result(&self, verbose: bool) {
        match self.status {
            StepStatus::Failed => {
                println!("FAILED: {}", self.command_trimmed());
                if !verbose && let Some(output) = &self.output {
                    println!("{output}");
                }
            }
            StepStatus::Ignored => println!("IGNORED: {}", self.command_trimmed()),
            StepStatus::Passed | StepStatus::Running => {}
        }
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn named_args(&self) -> &[String] {
        &self.named_args
    }

    pub fn env(&self) -> &BTreeMap<String, Option<String>> {
        &self.env
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn passed(&self) -> bool {
        self.status == StepStatus::Passed
    }

    pub fn failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn ignored(&self) -> bool {
        self.status == StepStatus::Ignored
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Wall-clock seconds, zero when the step never ran.
    pub fn time(&self) -> f64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
            _ => 0.0,
        }
    }

    /// Command for summaries: `--exclude*` arguments and the repository
    /// prefix dropped.
    pub fn command_trimmed(&self) -> String {
        let repo_prefix = format!("{}/", self.repository.display());
        self.command
            .iter()
            .filter(|arg| !arg.starts_with("--exclude"))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
            .replace(&repo_prefix, "")
            .replace("/usr/bin/", "")
    }

    /// Command for report record names.
    pub fn command_short(&self) -> String {
        let repository = self.repository.display().to_string();
        let repo_prefix = format!("{repository}/");
        self.command
            .iter()
            .filter(|arg| !SHORT_NOISE.contains(&arg.as_str()) && **arg != repository)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
            .replace(&repo_prefix, "")
            .replace("/usr/bin/", "")
    }

    /// `::error` workflow commands, one per named formula whose definition
    /// could be located.
    pub fn annotations(&self, config: &AnnotationConfig) -> Vec<String> {
        let body = truncate_around_error(
            self.output.as_deref().unwrap_or(""),
            config.limit_bytes,
            config.context_lines,
        );
        let title = format!(
            "`{}` failed on {}-{}!",
            self.command_trimmed(),
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        let subcommand = self.command.get(1).map(String::as_str).unwrap_or("");
        self.named_args
            .iter()
            .filter_map(|name| {
                let (file, line) = locate_definition(&self.repository, &config.formula_dir, name, subcommand)?;
                let location = AnnotationLocation {
                    file: Some(file),
                    line,
                    title: Some(title.clone()),
                };
                Some(workflow_command("error", &location, &body))
            })
            .collect()
    }
}

/// `git` must be pinned to a repository with `-C` (or be a clone).
fn validate_command(command: &[String]) -> Result<()> {
    let Some(program) = command.first() else {
        bail!("empty step command");
    };
    if program.trim().is_empty() {
        bail!("empty step command");
    }
    let is_git = Path::new(program)
        .file_name()
        .is_some_and(|name| name == "git");
    if is_git {
        let pinned = matches!(command.get(1).map(String::as_str), Some("-C") | Some("clone"));
        if !pinned {
            bail!("refusing to run git without -C: {}", command.join(" "));
        }
    }
    Ok(())
}

/// Definition file (relative to the repository) and, when found, the line
/// declaring the method for `subcommand`.
fn locate_definition(
    repository: &Path,
    formula_dir: &str,
    name: &str,
    subcommand: &str,
) -> Option<(String, Option<usize>)> {
    let file_name = format!("{}.rb", short_name(name));
    let root = repository.join(formula_dir);
    let search_root = if root.is_dir() { root } else { repository.to_path_buf() };
    let path = WalkDir::new(&search_root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && entry.file_name() == file_name.as_str())?
        .into_path();

    let line = definition_line(&path, subcommand);
    let relative = path
        .strip_prefix(repository)
        .unwrap_or(&path)
        .display()
        .to_string();
    Some((relative, line))
}

fn definition_line(path: &Path, subcommand: &str) -> Option<usize> {
    if subcommand.is_empty() || subcommand.starts_with('-') {
        return None;
    }
    let sub = regex::escape(subcommand);
    let pattern = Regex::new(&format!(r"^\s*(def\s+{sub}\b|{sub}\s+do\b)")).ok()?;
    let contents = fs::read_to_string(path).ok()?;
    contents
        .lines()
        .position(|line| pattern.is_match(line))
        .map(|index| index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    fn env<'a>(runner: &'a dyn CommandRunner, repository: &'a Path, dry_run: bool) -> StepEnv<'a> {
        StepEnv {
            runner,
            repository,
            workdir: repository,
            dry_run,
            verbose: false,
            annotations: None,
        }
    }

    #[test]
    fn passes_on_success() {
        let runner = ScriptedRunner::new();
        runner.respond("brew install", true, "installed\n");
        let step = Step::execute(
            StepRequest::new(["brew", "install"]).named(["foo"]),
            &env(&runner, Path::new("/repo"), false),
        )
        .expect("step");
        assert_eq!(step.status(), StepStatus::Passed);
        assert_eq!(step.output(), Some("installed\n"));
        assert!(step.end_time().is_some());
        assert_eq!(runner.commands(), vec!["brew install foo"]);
    }

    #[test]
    fn failure_can_be_ignored() {
        let runner = ScriptedRunner::new();
        runner.respond("brew audit", false, "Error: bad\n");
        let request = StepRequest::new(["brew", "audit"]).ignore_failures(true);
        let step = Step::execute(request, &env(&runner, Path::new("/repo"), false)).expect("step");
        assert_eq!(step.status(), StepStatus::Ignored);
        assert!(!step.failed());
    }

    #[test]
    fn spawn_failure_is_a_failed_step() {
        let runner = crate::io::process::SystemRunner;
        let temp = tempfile::tempdir().expect("tempdir");
        let step = Step::execute(
            StepRequest::new(["tapci-definitely-not-a-program"]),
            &env(&runner, temp.path(), false),
        )
        .expect("step");
        assert!(step.failed());
        assert!(step.output().is_some_and(|out| out.contains("spawn")));
    }

    #[test]
    fn dry_run_spawns_nothing() {
        let runner = ScriptedRunner::new();
        let step = Step::execute(
            StepRequest::new(["brew", "install", "foo"]),
            &env(&runner, Path::new("/repo"), true),
        )
        .expect("step");
        assert!(step.passed());
        assert_eq!(step.output(), None);
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn invalid_utf8_is_normalized() {
        let runner = ScriptedRunner::new();
        runner.respond_bytes("brew test", true, vec![b'o', b'k', 0xff, b'\n']);
        let step = Step::execute(
            StepRequest::new(["brew", "test"]),
            &env(&runner, Path::new("/repo"), false),
        )
        .expect("step");
        assert_eq!(step.output(), Some("ok\u{fffd}\n"));
    }

    #[test]
    fn rejects_unpinned_git() {
        let runner = ScriptedRunner::new();
        let err = Step::execute(
            StepRequest::new(["git", "status"]),
            &env(&runner, Path::new("/repo"), false),
        )
        .expect_err("rejected");
        assert!(err.to_string().contains("-C"));
        assert!(runner.commands().is_empty());
        assert!(validate_command(&["git".into(), "-C".into(), "/repo".into()]).is_ok());
        assert!(validate_command(&["git".into(), "clone".into()]).is_ok());
    }

    #[test]
    fn display_helpers_drop_noise() {
        let runner = ScriptedRunner::new();
        let step = Step::execute(
            StepRequest::new([
                "git",
                "-C",
                "/repo",
                "clean",
                "-ff",
                "--exclude=/Formula",
                "/repo/x",
            ]),
            &env(&runner, Path::new("/repo"), true),
        )
        .expect("step");
        assert_eq!(step.command_trimmed(), "git -C /repo clean -ff x");
        assert_eq!(step.command_short(), "git clean -ff --exclude=/Formula x");

        let brew = Step::check("verify-artifacts", Ok(()), Path::new("/repo"));
        assert_eq!(brew.command_short(), "tapci verify-artifacts");
        assert!(brew.passed());
    }

    #[test]
    fn annotations_point_at_definition() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("Formula/f")).expect("mkdir");
        fs::write(
            temp.path().join("Formula/f/foo.rb"),
            "class Foo < Formula\n  def install\n  end\n\n  test do\n  end\nend\n",
        )
        .expect("write");
        let runner = ScriptedRunner::new();
        runner.respond("brew test", false, "Error: test failed\n");
        let config = AnnotationConfig {
            formula_dir: "Formula".to_string(),
            limit_bytes: 4096,
            context_lines: 5,
        };
        let step_env = StepEnv {
            annotations: Some(&config),
            ..env(&runner, temp.path(), false)
        };
        let step = Step::execute(StepRequest::new(["brew", "test"]).named(["foo"]), &step_env)
            .expect("step");
        let annotations = step.annotations(&config);
        assert_eq!(annotations.len(), 1);
        assert!(annotations[0].starts_with("::error file=Formula/f/foo.rb,line=5,title="));
        assert!(annotations[0].ends_with("::Error: test failed%0A"));
    }
}
