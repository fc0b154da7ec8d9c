//! Test doubles and fixtures for the test bot.
//!
//! Available to unit tests and, through the `test-support` feature, to the
//! integration tests under `tests/`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::context::{Collaborators, Options, RunContext, RunSignals};
use crate::core::types::{Dependency, DependencyTags, Formula};
use crate::io::brew::{DepScope, FormulaQuery, QueryError, UsesScope};
use crate::io::config::Settings;
use crate::io::github::GitHubEnv;
use crate::io::process::{CommandOutput, CommandRequest, CommandRunner};
use crate::io::store::NoArtifactStore;

/// [`CommandRunner`] that answers from canned responses and records calls.
///
/// Responses match on a prefix of the displayed command; the longest
/// matching prefix wins. Unmatched commands succeed with no output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    responses: RefCell<Vec<(String, CommandOutput)>>,
    calls: RefCell<Vec<CommandRequest>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, success: bool, output: &str) {
        self.respond_bytes(prefix, success, output.as_bytes().to_vec());
    }

    pub fn respond_bytes(&self, prefix: &str, success: bool, output: Vec<u8>) {
        self.responses.borrow_mut().push((
            prefix.to_string(),
            CommandOutput {
                success,
                code: Some(if success { 0 } else { 1 }),
                output,
            },
        ));
    }

    /// Displayed form of every command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(CommandRequest::display).collect()
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.calls.borrow().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(request.clone());
        let display = request.display();
        let responses = self.responses.borrow();
        let matched = responses
            .iter()
            .filter(|(prefix, _)| display.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());
        Ok(match matched {
            Some((_, output)) => output.clone(),
            None => CommandOutput {
                success: true,
                code: Some(0),
                output: Vec::new(),
            },
        })
    }
}

/// Build a formula record with deterministic defaults.
pub fn formula(name: &str) -> Formula {
    Formula {
        name: crate::core::types::short_name(name).to_string(),
        full_name: name.to_string(),
        version: "1.0".to_string(),
        path: PathBuf::from(format!(
            "Formula/{}.rb",
            crate::core::types::short_name(name)
        )),
        deps: Vec::new(),
        requirements: Vec::new(),
        bottled: true,
        test_defined: true,
        installed: false,
        linked: false,
        keg_only: false,
        disabled: false,
        deprecated: false,
    }
}

/// Formula with runtime dependencies.
pub fn formula_with_deps(name: &str, deps: &[&str]) -> Formula {
    Formula {
        deps: deps.iter().map(|dep| Dependency::runtime(*dep)).collect(),
        ..formula(name)
    }
}

/// In-memory [`FormulaQuery`].
#[derive(Debug)]
pub struct FakeCatalog {
    formulae: BTreeMap<String, Formula>,
    tag: String,
    compiler: bool,
    cache: PathBuf,
    /// Formula name -> tap reported missing on the first query.
    missing_taps: RefCell<BTreeMap<String, String>>,
}

impl FakeCatalog {
    pub fn new(tag: &str) -> Self {
        Self {
            formulae: BTreeMap::new(),
            tag: tag.to_string(),
            compiler: true,
            cache: std::env::temp_dir().join("tapci-fake-cache"),
            missing_taps: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn with(mut self, formula: Formula) -> Self {
        self.insert(formula);
        self
    }

    pub fn insert(&mut self, formula: Formula) {
        self.formulae.insert(formula.full_name.clone(), formula);
    }

    pub fn without_compiler(mut self) -> Self {
        self.compiler = false;
        self
    }

    pub fn with_cache_dir(mut self, cache: impl Into<PathBuf>) -> Self {
        self.cache = cache.into();
        self
    }

    /// The next dependency query for `formula` fails with a missing tap.
    pub fn missing_tap_once(self, formula: &str, tap: &str) -> Self {
        self.missing_taps
            .borrow_mut()
            .insert(formula.to_string(), tap.to_string());
        self
    }

    fn lookup(&self, name: &str) -> Result<&Formula, QueryError> {
        self.formulae
            .get(name)
            .or_else(|| self.formulae.values().find(|f| f.name == name))
            .ok_or_else(|| QueryError::NotFound(name.to_string()))
    }

    fn included(tags: &DependencyTags, include_build: bool, include_test: bool) -> bool {
        if tags.optional {
            return false;
        }
        if tags.build && !tags.test {
            return include_build;
        }
        if tags.test && !tags.build {
            return include_test;
        }
        if tags.build && tags.test {
            return include_build || include_test;
        }
        true
    }

    fn closure(&self, name: &str, include_build: bool, include_test: bool) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        let mut stack = vec![name.to_string()];
        let mut first = true;
        while let Some(current) = stack.pop() {
            let Ok(formula) = self.lookup(&current) else {
                continue;
            };
            // Build and test dependencies only count at the top level.
            let (build, test) = if first {
                (include_build, include_test)
            } else {
                (false, false)
            };
            first = false;
            for dep in formula.deps.iter().rev() {
                if !Self::included(&dep.tags, build, test) || seen.contains(&dep.name) {
                    continue;
                }
                seen.push(dep.name.clone());
                stack.push(dep.name.clone());
            }
        }
        seen
    }
}

impl FormulaQuery for FakeCatalog {
    fn formula(&self, name: &str) -> Result<Formula, QueryError> {
        self.lookup(name).cloned()
    }

    fn dependencies(&self, name: &str, scope: DepScope) -> Result<Vec<String>, QueryError> {
        if let Some(tap) = self.missing_taps.borrow_mut().remove(name) {
            return Err(QueryError::TapUnavailable {
                tap,
                formula: name.to_string(),
            });
        }
        self.lookup(name)?;
        Ok(self.closure(name, scope.include_build, scope.include_test))
    }

    fn dependents(&self, name: &str, scope: UsesScope) -> Result<Vec<String>, QueryError> {
        self.lookup(name)?;
        let mut users = Vec::new();
        for formula in self.formulae.values() {
            if formula.full_name == name {
                continue;
            }
            let uses = if scope.recursive {
                self.closure(&formula.full_name, scope.include_build, scope.include_test)
                    .iter()
                    .any(|dep| dep == name)
            } else {
                formula.deps.iter().any(|dep| {
                    dep.name == name
                        && (Self::included(&dep.tags, scope.include_build, scope.include_test)
                            || (dep.tags.optional && scope.include_optional))
                })
            };
            if uses {
                users.push(formula.full_name.clone());
            }
        }
        Ok(users)
    }

    fn installed(&self) -> Result<Vec<String>, QueryError> {
        Ok(self
            .formulae
            .values()
            .filter(|formula| formula.installed)
            .map(|formula| formula.full_name.clone())
            .collect())
    }

    fn compiler_available(&self) -> bool {
        self.compiler
    }

    fn cache_dir(&self) -> Result<PathBuf, QueryError> {
        Ok(self.cache.clone())
    }

    fn bottle_tag(&self) -> Result<String, QueryError> {
        Ok(self.tag.clone())
    }
}

/// A scratch git repository with a committed identity.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { temp };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Write `contents` to `relative`, commit it, and return the new HEAD sha.
    pub fn commit_file(&self, relative: &str, contents: &str, message: &str) -> Result<String> {
        let path = self.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        self.git(&["add", relative])?;
        self.git(&["commit", "-q", "-m", message])?;
        self.head()
    }

    /// Delete `relative`, commit, and return the new HEAD sha.
    pub fn remove_file(&self, relative: &str, message: &str) -> Result<String> {
        self.git(&["rm", "-q", relative])?;
        self.git(&["commit", "-q", "-m", message])?;
        self.head()
    }

    pub fn head(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"])
    }

    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(self.path())
            .args(args)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Owns everything a [`RunContext`] borrows, for tests.
pub struct ContextFixture {
    pub temp: TempDir,
    pub options: Options,
    pub settings: Settings,
    pub github: GitHubEnv,
    pub signals: RunSignals,
    pub catalog: FakeCatalog,
    pub store: NoArtifactStore,
}

impl ContextFixture {
    /// Empty `repo/` and `out/` directories, no disk threshold.
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create fixture dir")?;
        let repository = temp.path().join("repo");
        let output_dir = temp.path().join("out");
        fs::create_dir_all(&repository).context("create repo dir")?;
        fs::create_dir_all(&output_dir).context("create out dir")?;
        Ok(Self {
            options: Options::new(repository, output_dir),
            settings: Settings {
                min_free_disk_gb: 0,
                ..Settings::default()
            },
            github: GitHubEnv::default(),
            signals: RunSignals::default(),
            catalog: FakeCatalog::new("arm64_sonoma"),
            store: NoArtifactStore,
            temp,
        })
    }

    pub fn context<'a>(&'a self, runner: &'a dyn CommandRunner) -> RunContext<'a> {
        let mut ctx = RunContext::new(
            self.options.clone(),
            self.settings.clone(),
            self.github.clone(),
            Collaborators {
                runner,
                query: &self.catalog,
                store: &self.store,
            },
        );
        ctx.signals = self.signals;
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_runner_prefers_longest_prefix() {
        let runner = ScriptedRunner::new();
        runner.respond("brew", true, "generic");
        runner.respond("brew test", false, "specific");
        let out = runner
            .run(&CommandRequest::new("brew", &["test", "foo"]))
            .expect("run");
        assert!(!out.success);
        assert_eq!(out.text(), "specific");
        assert_eq!(runner.commands(), vec!["brew test foo"]);
    }

    #[test]
    fn fake_catalog_closures() {
        let catalog = FakeCatalog::new("tag")
            .with(formula_with_deps("app", &["lib"]))
            .with(Formula {
                deps: vec![
                    Dependency::runtime("base"),
                    Dependency::new("cmake", DependencyTags::build()),
                ],
                ..formula("lib")
            })
            .with(formula("base"))
            .with(formula("cmake"));
        assert_eq!(
            catalog.dependencies("app", DepScope::RUNTIME).expect("deps"),
            vec!["lib", "base"]
        );
        assert_eq!(
            catalog.dependencies("lib", DepScope::ALL).expect("deps"),
            vec!["base", "cmake"]
        );
        let direct = UsesScope::default();
        assert_eq!(catalog.dependents("base", direct).expect("uses"), vec!["lib"]);
        let recursive = UsesScope {
            recursive: true,
            ..UsesScope::default()
        };
        assert_eq!(
            catalog.dependents("base", recursive).expect("uses"),
            vec!["app", "lib"]
        );
    }
}
