//! Shared deterministic types for the scheduling core.
//!
//! These types define stable contracts between the query layer and the
//! phases. They do not depend on external state or I/O.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Terminal (or in-flight) status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Passed,
    Failed,
    /// The command failed but the failure was declared tolerable.
    Ignored,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Passed => "passed",
            StepStatus::Failed => "failed",
            StepStatus::Ignored => "ignored",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != StepStatus::Running
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualifiers attached to a declared dependency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyTags {
    pub build: bool,
    pub test: bool,
    pub optional: bool,
    /// Added by the package manager rather than declared by the formula.
    pub implicit: bool,
}

impl DependencyTags {
    pub fn runtime() -> Self {
        Self::default()
    }

    pub fn build() -> Self {
        Self {
            build: true,
            ..Self::default()
        }
    }

    pub fn test() -> Self {
        Self {
            test: true,
            ..Self::default()
        }
    }

    /// Needed only while building, never at run or test time.
    pub fn is_build_only(&self) -> bool {
        self.build && !self.test
    }

    pub fn is_test_only(&self) -> bool {
        self.test && !self.build
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub tags: DependencyTags,
}

impl Dependency {
    pub fn new(name: impl Into<String>, tags: DependencyTags) -> Self {
        Self {
            name: name.into(),
            tags,
        }
    }

    pub fn runtime(name: impl Into<String>) -> Self {
        Self::new(name, DependencyTags::runtime())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    pub satisfied: bool,
    #[serde(default)]
    pub optional: bool,
    /// Human-readable explanation shown when the requirement is unmet.
    #[serde(default)]
    pub message: Option<String>,
}

/// Opaque package record as reported by the formula query layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    pub full_name: String,
    pub version: String,
    /// Definition file, relative to the tap repository.
    pub path: PathBuf,
    #[serde(default)]
    pub deps: Vec<Dependency>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    /// A binary artifact exists for the current platform tag.
    #[serde(default)]
    pub bottled: bool,
    #[serde(default)]
    pub test_defined: bool,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub linked: bool,
    #[serde(default)]
    pub keg_only: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub deprecated: bool,
}

impl Formula {
    /// Messages for every non-optional requirement that is not satisfied.
    pub fn unsatisfied_requirements(&self) -> Vec<String> {
        self.requirements
            .iter()
            .filter(|req| !req.optional && !req.satisfied)
            .map(|req| {
                req.message
                    .clone()
                    .unwrap_or_else(|| format!("{} requires {}", self.full_name, req.name))
            })
            .collect()
    }

    /// Whether `name` is a direct dependency used at run or test time.
    pub fn consumes_at_runtime(&self, name: &str) -> bool {
        self.deps
            .iter()
            .any(|dep| dep.name == name && !dep.tags.is_build_only())
    }
}

/// Short name for a possibly tap-qualified formula name (`user/tap/foo` → `foo`).
pub fn short_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Name match that tolerates one side being tap-qualified.
pub fn same_formula(a: &str, b: &str) -> bool {
    a == b || (short_name(a) == short_name(b) && (!a.contains('/') || !b.contains('/')))
}
