//! Decisions over an already-queried dependency graph.
//!
//! The query layer resolves names to [`Formula`] records and dependency
//! lists; this module decides how candidates are built and which dependents
//! are tested.

use std::collections::BTreeSet;

use crate::core::types::{Dependency, DependencyTags, Formula};

/// A downstream package together with the dependency list used to judge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentCandidate {
    pub formula: Formula,
    pub deps: Vec<Dependency>,
}

impl DependentCandidate {
    pub fn name(&self) -> &str {
        &self.formula.full_name
    }

    /// Names of dependencies needed for install and test (build-only excluded).
    pub fn required_dep_names(&self) -> Vec<&str> {
        self.deps
            .iter()
            .filter(|dep| !dep.tags.is_build_only() && !dep.tags.optional)
            .map(|dep| dep.name.as_str())
            .collect()
    }
}

/// How the dependents of one package will be exercised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependentPlan {
    /// Built from source against the freshly built package.
    pub source: Vec<DependentCandidate>,
    /// Installed from their existing artifact.
    pub bottled: Vec<DependentCandidate>,
    /// Full names of planned dependents that declare a test.
    pub testable: Vec<String>,
}

impl DependentPlan {
    pub fn is_empty(&self) -> bool {
        self.source.is_empty() && self.bottled.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &DependentCandidate> {
        self.source.iter().chain(self.bottled.iter())
    }

    pub fn is_testable(&self, name: &str) -> bool {
        self.testable.iter().any(|testable| testable == name)
    }
}

/// Merge the union of two `uses` queries: sorted, de-duplicated, without
/// anything already being tested in this run.
pub fn merge_dependent_names<I, S>(names: I, testing: &[String]) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let set: BTreeSet<String> = names
        .into_iter()
        .map(Into::into)
        .filter(|name| !testing.contains(name))
        .collect();
    set.into_iter().collect()
}

/// Direct dependencies (with their tags) followed by any transitive runtime
/// dependency not already declared directly.
pub fn expand_closure(direct: &[Dependency], transitive: &[String]) -> Vec<Dependency> {
    let mut expanded: Vec<Dependency> = direct.to_vec();
    for name in transitive {
        if expanded.iter().any(|dep| &dep.name == name) {
            continue;
        }
        expanded.push(Dependency::new(name.clone(), DependencyTags::runtime()));
    }
    expanded
}

/// A dependent is deferred when it also depends on a candidate that has not
/// been processed yet; it will be exercised with that later candidate.
pub fn is_deferred(deps: &[Dependency], pending: &[String]) -> bool {
    deps.iter().any(|dep| pending.contains(&dep.name))
}

/// How a candidate is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BottleDecision {
    /// Build a bottle (`--build-bottle`) and upload it.
    Produce,
    /// Build from source only; an artifact already exists for this platform.
    BuildOnly,
    /// Cannot be built here; lists the dependencies lacking artifacts.
    Skip(Vec<String>),
}

/// Decide between producing an artifact, building only, or skipping.
///
/// Required dependencies are everything but test-only and optional ones.
pub fn decide_bottle(formula: &Formula, available: impl Fn(&str) -> bool) -> BottleDecision {
    let missing: Vec<String> = formula
        .deps
        .iter()
        .filter(|dep| !dep.tags.is_test_only() && !dep.tags.optional)
        .filter(|dep| !available(&dep.name))
        .map(|dep| dep.name.clone())
        .collect();
    if missing.is_empty() {
        BottleDecision::Produce
    } else if formula.bottled {
        BottleDecision::BuildOnly
    } else {
        BottleDecision::Skip(missing)
    }
}

/// Policy inputs for [`partition`].
#[derive(Debug, Clone, Copy)]
pub struct PartitionPolicy<'a> {
    /// The package whose dependents are being planned.
    pub package: &'a str,
    pub testing: &'a [String],
    pub build_from_source: bool,
}

/// Split candidates into source and bottled dependents.
///
/// `available` reports whether a dependency has an artifact for this platform
/// or was built earlier in this run.
pub fn partition(
    candidates: Vec<DependentCandidate>,
    policy: PartitionPolicy<'_>,
    available: impl Fn(&str) -> bool,
) -> DependentPlan {
    let mut plan = DependentPlan::default();
    for candidate in candidates {
        let builds_from_source = policy.build_from_source
            && candidate
                .deps
                .iter()
                .any(|dep| policy.testing.contains(&dep.name))
            && candidate
                .required_dep_names()
                .into_iter()
                .all(&available);
        if builds_from_source {
            plan.source.push(candidate);
            continue;
        }
        if !candidate.formula.consumes_at_runtime(policy.package) {
            continue;
        }
        if !candidate.formula.bottled {
            continue;
        }
        plan.bottled.push(candidate);
    }
    plan.testable = plan
        .all()
        .filter(|candidate| candidate.formula.test_defined)
        .map(|candidate| candidate.name().to_string())
        .collect();
    plan
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn formula(name: &str, deps: Vec<Dependency>, bottled: bool, test_defined: bool) -> Formula {
        Formula {
            name: name.to_string(),
            full_name: name.to_string(),
            version: "1.0".to_string(),
            path: PathBuf::from(format!("Formula/{name}.rb")),
            deps,
            requirements: Vec::new(),
            bottled,
            test_defined,
            installed: false,
            linked: false,
            keg_only: false,
            disabled: false,
            deprecated: false,
        }
    }

    fn candidate(name: &str, deps: Vec<Dependency>, bottled: bool, tested: bool) -> DependentCandidate {
        DependentCandidate {
            formula: formula(name, deps.clone(), bottled, tested),
            deps,
        }
    }

    #[test]
    fn bottle_decision_follows_dependency_availability() {
        let deps = vec![
            Dependency::runtime("zlib"),
            Dependency::new("cmake", DependencyTags::build()),
            Dependency::new("bats", DependencyTags::test()),
        ];
        let mut foo = formula("foo", deps, false, true);
        assert_eq!(decide_bottle(&foo, |_| true), BottleDecision::Produce);
        assert_eq!(decide_bottle(&foo, |name| name == "bats"), BottleDecision::Skip(vec![
            "zlib".to_string(),
            "cmake".to_string()
        ]));
        assert_eq!(decide_bottle(&foo, |name| name != "bats"), BottleDecision::Produce);
        foo.bottled = true;
        assert_eq!(decide_bottle(&foo, |name| name != "zlib"), BottleDecision::BuildOnly);
    }

    #[test]
    fn merge_sorts_and_drops_testing() {
        let merged = merge_dependent_names(
            ["zed", "alpha", "zed", "pkg"],
            &["pkg".to_string()],
        );
        assert_eq!(merged, vec!["alpha", "zed"]);
    }

    #[test]
    fn closure_keeps_direct_tags_first() {
        let direct = vec![Dependency::new("cmake", DependencyTags::build())];
        let expanded = expand_closure(&direct, &["cmake".to_string(), "zlib".to_string()]);
        assert_eq!(expanded.len(), 2);
        assert!(expanded[0].tags.build);
        assert_eq!(expanded[1].name, "zlib");
        assert!(!expanded[1].tags.build);
    }

    #[test]
    fn deferred_when_pending_dependency() {
        let deps = vec![Dependency::runtime("b")];
        assert!(is_deferred(&deps, &["b".to_string()]));
        assert!(!is_deferred(&deps, &["c".to_string()]));
    }

    #[test]
    fn build_only_dependents_are_dropped() {
        let testing = vec!["pkg".to_string()];
        let candidates = vec![
            candidate("uses-at-build", vec![Dependency::new("pkg", DependencyTags::build())], true, true),
            candidate("uses-at-run", vec![Dependency::runtime("pkg")], true, true),
            candidate("unbottled", vec![Dependency::runtime("pkg")], false, true),
        ];
        let plan = partition(
            candidates,
            PartitionPolicy {
                package: "pkg",
                testing: &testing,
                build_from_source: false,
            },
            |_| true,
        );
        assert!(plan.source.is_empty());
        let names: Vec<&str> = plan.bottled.iter().map(DependentCandidate::name).collect();
        assert_eq!(names, vec!["uses-at-run"]);
        assert_eq!(plan.testable, vec!["uses-at-run"]);
    }

    #[test]
    fn source_dependents_need_available_deps() {
        let testing = vec!["pkg".to_string()];
        let candidates = vec![
            candidate("ready", vec![Dependency::runtime("pkg")], false, false),
            candidate(
                "blocked",
                vec![Dependency::runtime("pkg"), Dependency::runtime("missing")],
                true,
                true,
            ),
        ];
        let plan = partition(
            candidates,
            PartitionPolicy {
                package: "pkg",
                testing: &testing,
                build_from_source: true,
            },
            |name| name != "missing",
        );
        assert_eq!(plan.source.len(), 1);
        assert_eq!(plan.source[0].name(), "ready");
        assert_eq!(plan.bottled.len(), 1);
        assert_eq!(plan.bottled[0].name(), "blocked");
        assert_eq!(plan.testable, vec!["blocked"]);
    }
}
