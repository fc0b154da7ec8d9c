//! Package metadata queries.
//!
//! [`FormulaQuery`] is the seam between scheduling and the package manager.
//! Queries are read-only and run even in dry-run mode; anything that changes
//! the system is a step instead.

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::{Dependency, DependencyTags, Formula, Requirement};
use crate::io::process::{CommandRequest, CommandRunner};

static TAP_HINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Please tap it and then try again: brew tap (\S+)").unwrap());
static TEST_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*test\s+do\b").unwrap());

/// Typed query failures that callers branch on.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The formula lives in a tap that is not installed yet.
    #[error("{formula} is in tap {tap}, which is not available")]
    TapUnavailable { tap: String, formula: String },
    #[error("no formula named {0}")]
    NotFound(String),
    #[error("`{command}` failed: {output}")]
    Command { command: String, output: String },
    #[error("could not parse {what}: {message}")]
    Parse { what: String, message: String },
}

/// Which dependency kinds a closure includes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepScope {
    pub include_build: bool,
    pub include_test: bool,
}

impl DepScope {
    pub const RUNTIME: DepScope = DepScope {
        include_build: false,
        include_test: false,
    };
    pub const ALL: DepScope = DepScope {
        include_build: true,
        include_test: true,
    };
}

/// Which dependents a reverse lookup includes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsesScope {
    pub recursive: bool,
    pub include_build: bool,
    pub include_test: bool,
    pub include_optional: bool,
}

/// Read-only package metadata and graph introspection.
pub trait FormulaQuery {
    fn formula(&self, name: &str) -> Result<Formula, QueryError>;

    /// Recursive dependency names of `name`.
    fn dependencies(&self, name: &str, scope: DepScope) -> Result<Vec<String>, QueryError>;

    /// Packages that depend on `name`.
    fn dependents(&self, name: &str, scope: UsesScope) -> Result<Vec<String>, QueryError>;

    /// Full names of every installed formula.
    fn installed(&self) -> Result<Vec<String>, QueryError>;

    fn compiler_available(&self) -> bool;

    /// The package manager's download cache.
    fn cache_dir(&self) -> Result<PathBuf, QueryError>;

    /// Platform tag artifacts are produced for (e.g. `arm64_sonoma`).
    fn bottle_tag(&self) -> Result<String, QueryError>;
}

/// [`FormulaQuery`] backed by the `brew` CLI.
pub struct BrewCli<'a> {
    runner: &'a dyn CommandRunner,
    repository: PathBuf,
    tag_override: Option<String>,
    tag: OnceCell<String>,
}

impl<'a> BrewCli<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        repository: impl Into<PathBuf>,
        tag_override: Option<String>,
    ) -> Self {
        Self {
            runner,
            repository: repository.into(),
            tag_override,
            tag: OnceCell::new(),
        }
    }

    fn brew(&self, args: &[&str]) -> Result<String, QueryError> {
        let mut request = CommandRequest::new("brew", args);
        request
            .env
            .insert("HOMEBREW_NO_AUTO_UPDATE".to_string(), Some("1".to_string()));
        let command = request.display();
        let output = self
            .runner
            .run(&request)
            .map_err(|err| QueryError::Command {
                command: command.clone(),
                output: format!("{err:#}"),
            })?;
        let text = output.text();
        if output.success {
            return Ok(text);
        }
        Err(classify_failure(&command, args.last().copied().unwrap_or(""), text))
    }

    fn names(&self, args: &[&str]) -> Result<Vec<String>, QueryError> {
        Ok(self
            .brew(args)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn test_defined(&self, source: Option<&str>) -> bool {
        let Some(source) = source else {
            return false;
        };
        let path = self.repository.join(source);
        match fs::read_to_string(&path) {
            Ok(contents) => TEST_BLOCK_RE.is_match(&contents),
            Err(err) => {
                debug!(path = %path.display(), err = %err, "formula source unreadable");
                false
            }
        }
    }
}

impl FormulaQuery for BrewCli<'_> {
    #[instrument(skip(self))]
    fn formula(&self, name: &str) -> Result<Formula, QueryError> {
        let json = self.brew(&["info", "--json=v2", "--formula", name])?;
        let info: InfoJson = serde_json::from_str(&json).map_err(|err| QueryError::Parse {
            what: format!("brew info for {name}"),
            message: err.to_string(),
        })?;
        let record = info
            .formulae
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::NotFound(name.to_string()))?;
        let tag = self.bottle_tag()?;
        let test_defined = self.test_defined(record.ruby_source_path.as_deref());
        Ok(record.into_formula(&tag, test_defined))
    }

    fn dependencies(&self, name: &str, scope: DepScope) -> Result<Vec<String>, QueryError> {
        let mut args = vec!["deps", "--full-name"];
        if scope.include_build {
            args.push("--include-build");
        }
        if scope.include_test {
            args.push("--include-test");
        }
        args.push(name);
        self.names(&args)
    }

    fn dependents(&self, name: &str, scope: UsesScope) -> Result<Vec<String>, QueryError> {
        let mut args = vec!["uses", "--formula", "--eval-all"];
        if scope.recursive {
            args.push("--recursive");
        }
        if scope.include_build {
            args.push("--include-build");
        }
        if scope.include_test {
            args.push("--include-test");
        }
        if scope.include_optional {
            args.push("--include-optional");
        }
        args.push(name);
        self.names(&args)
    }

    fn installed(&self) -> Result<Vec<String>, QueryError> {
        self.names(&["list", "--formula", "--full-name"])
    }

    fn compiler_available(&self) -> bool {
        let request = CommandRequest::new("cc", &["--version"]);
        match self.runner.run(&request) {
            Ok(output) => output.success,
            Err(err) => {
                warn!(err = %err, "no C compiler");
                false
            }
        }
    }

    fn cache_dir(&self) -> Result<PathBuf, QueryError> {
        Ok(PathBuf::from(self.brew(&["--cache"])?.trim()))
    }

    fn bottle_tag(&self) -> Result<String, QueryError> {
        if let Some(tag) = &self.tag_override {
            return Ok(tag.clone());
        }
        if let Some(tag) = self.tag.get() {
            return Ok(tag.clone());
        }
        let tag = self
            .brew(&["ruby", "-e", "puts Utils::Bottles.tag"])?
            .trim()
            .to_string();
        if tag.is_empty() {
            return Err(QueryError::Parse {
                what: "bottle tag".to_string(),
                message: "empty output".to_string(),
            });
        }
        Ok(self.tag.get_or_init(|| tag).clone())
    }
}

fn classify_failure(command: &str, name: &str, output: String) -> QueryError {
    if let Some(captures) = TAP_HINT_RE.captures(&output) {
        return QueryError::TapUnavailable {
            tap: captures[1].to_string(),
            formula: name.to_string(),
        };
    }
    if output.contains("No available formula") {
        return QueryError::NotFound(name.to_string());
    }
    QueryError::Command {
        command: command.to_string(),
        output: output.trim().to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct InfoJson {
    #[serde(default)]
    formulae: Vec<FormulaJson>,
}

#[derive(Debug, Deserialize)]
struct FormulaJson {
    name: String,
    full_name: String,
    #[serde(default)]
    versions: VersionsJson,
    #[serde(default)]
    revision: u32,
    #[serde(default)]
    ruby_source_path: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    build_dependencies: Vec<String>,
    #[serde(default)]
    test_dependencies: Vec<String>,
    #[serde(default)]
    optional_dependencies: Vec<String>,
    #[serde(default)]
    requirements: Vec<RequirementJson>,
    #[serde(default)]
    bottle: BottleJson,
    #[serde(default)]
    installed: Vec<InstalledJson>,
    #[serde(default)]
    linked_keg: Option<String>,
    #[serde(default)]
    keg_only: bool,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    deprecated: bool,
}

#[derive(Debug, Default, Deserialize)]
struct VersionsJson {
    stable: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RequirementJson {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct BottleJson {
    stable: Option<BottleSpecJson>,
}

#[derive(Debug, Deserialize)]
struct BottleSpecJson {
    #[serde(default)]
    files: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct InstalledJson {
    version: String,
}

impl FormulaJson {
    fn into_formula(self, tag: &str, test_defined: bool) -> Formula {
        let stable = self.versions.stable.unwrap_or_default();
        let version = if self.revision > 0 {
            format!("{stable}_{}", self.revision)
        } else {
            stable
        };

        let mut deps: Vec<Dependency> = Vec::new();
        let mut tag_dep = |name: &String, apply: fn(&mut DependencyTags)| {
            match deps.iter_mut().find(|dep| &dep.name == name) {
                Some(dep) => apply(&mut dep.tags),
                None => {
                    let mut tags = DependencyTags::runtime();
                    apply(&mut tags);
                    deps.push(Dependency::new(name.clone(), tags));
                }
            }
        };
        for name in &self.dependencies {
            tag_dep(name, |_| {});
        }
        for name in &self.build_dependencies {
            tag_dep(name, |tags| tags.build = true);
        }
        for name in &self.test_dependencies {
            tag_dep(name, |tags| tags.test = true);
        }
        for name in &self.optional_dependencies {
            tag_dep(name, |tags| tags.optional = true);
        }

        let requirements = self
            .requirements
            .into_iter()
            .map(|req| Requirement {
                satisfied: requirement_satisfied(&req.name),
                name: req.name,
                optional: false,
                message: None,
            })
            .collect();

        let bottled = self
            .bottle
            .stable
            .is_some_and(|spec| spec.files.contains_key(tag) || spec.files.contains_key("all"));
        let installed = self.installed.iter().any(|entry| entry.version == version);

        Formula {
            name: self.name,
            full_name: self.full_name,
            version,
            path: self.ruby_source_path.map(PathBuf::from).unwrap_or_default(),
            deps,
            requirements,
            bottled,
            test_defined,
            installed,
            linked: self.linked_keg.is_some(),
            keg_only: self.keg_only,
            disabled: self.disabled,
            deprecated: self.deprecated,
        }
    }
}

fn requirement_satisfied(name: &str) -> bool {
    match name {
        "macos" | "xcode" => cfg!(target_os = "macos"),
        "linux" => cfg!(target_os = "linux"),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    const INFO: &str = r#"{
      "formulae": [{
        "name": "foo",
        "full_name": "acme/tools/foo",
        "versions": {"stable": "1.2"},
        "revision": 1,
        "ruby_source_path": "Formula/foo.rb",
        "dependencies": ["zlib"],
        "build_dependencies": ["cmake"],
        "test_dependencies": ["cmake", "bats"],
        "optional_dependencies": [],
        "requirements": [{"name": "arch"}],
        "bottle": {"stable": {"files": {"arm64_sonoma": {}}}},
        "installed": [{"version": "1.2_1"}],
        "linked_keg": "1.2_1",
        "keg_only": false,
        "disabled": false,
        "deprecated": false
      }]
    }"#;

    #[test]
    fn parses_brew_info() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("Formula")).expect("mkdir");
        fs::write(
            temp.path().join("Formula/foo.rb"),
            "class Foo < Formula\n  test do\n    system \"true\"\n  end\nend\n",
        )
        .expect("write");
        let runner = ScriptedRunner::new();
        runner.respond("brew info", true, INFO);
        let brew = BrewCli::new(&runner, temp.path(), Some("arm64_sonoma".to_string()));

        let formula = brew.formula("acme/tools/foo").expect("formula");
        assert_eq!(formula.full_name, "acme/tools/foo");
        assert_eq!(formula.version, "1.2_1");
        assert!(formula.bottled);
        assert!(formula.installed);
        assert!(formula.linked);
        assert!(formula.test_defined);
        let cmake = formula
            .deps
            .iter()
            .find(|dep| dep.name == "cmake")
            .expect("cmake");
        assert!(cmake.tags.build && cmake.tags.test);
        assert_eq!(formula.deps.len(), 3);
    }

    #[test]
    fn not_bottled_for_other_tag() {
        let runner = ScriptedRunner::new();
        runner.respond("brew info", true, INFO);
        let brew = BrewCli::new(&runner, "/nonexistent", Some("x86_64_linux".to_string()));
        let formula = brew.formula("foo").expect("formula");
        assert!(!formula.bottled);
        assert!(!formula.test_defined);
    }

    #[test]
    fn missing_tap_is_typed() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "brew deps",
            false,
            "Error: No available formula with the name \"acme/tools/foo\".\nPlease tap it and then try again: brew tap acme/tools\n",
        );
        let brew = BrewCli::new(&runner, "/nonexistent", Some("tag".to_string()));
        match brew.dependencies("acme/tools/foo", DepScope::ALL) {
            Err(QueryError::TapUnavailable { tap, formula }) => {
                assert_eq!(tap, "acme/tools");
                assert_eq!(formula, "acme/tools/foo");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn uses_builds_expected_arguments() {
        let runner = ScriptedRunner::new();
        runner.respond("brew uses", true, "b\na\n");
        let brew = BrewCli::new(&runner, "/nonexistent", Some("tag".to_string()));
        let names = brew
            .dependents(
                "foo",
                UsesScope {
                    recursive: true,
                    include_test: true,
                    ..UsesScope::default()
                },
            )
            .expect("uses");
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(
            runner.commands(),
            vec!["brew uses --formula --eval-all --recursive --include-test foo"]
        );
    }

    #[test]
    fn bottle_tag_is_queried_once() {
        let runner = ScriptedRunner::new();
        runner.respond("brew ruby", true, "arm64_sonoma\n");
        let brew = BrewCli::new(&runner, "/nonexistent", None);
        assert_eq!(brew.bottle_tag().expect("tag"), "arm64_sonoma");
        assert_eq!(brew.bottle_tag().expect("tag"), "arm64_sonoma");
        assert_eq!(runner.commands().len(), 1);
    }
}
