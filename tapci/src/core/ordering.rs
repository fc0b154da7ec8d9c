//! Build order for the candidates of one run.

use std::collections::BTreeMap;

use crate::core::types::same_formula;

/// Order candidates so that packages other candidates depend on come first.
///
/// `deps_of` maps each candidate to its full (recursive, build and test
/// included) dependency list. Candidates with more dependents inside the
/// batch are placed first, ties keep first-seen order, and candidates nobody
/// in the batch depends on follow in their original order. A dependency
/// matches a candidate even when only one of the two is tap-qualified.
pub fn order_by_batch_dependents(
    candidates: &[String],
    deps_of: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for candidate in candidates {
        let Some(deps) = deps_of.get(candidate) else {
            continue;
        };
        for dep in deps {
            let Some(target) = candidates.iter().find(|other| same_formula(other, dep)) else {
                continue;
            };
            if target == candidate {
                continue;
            }
            match counts.iter_mut().find(|(name, _)| name == target) {
                Some((_, count)) => *count += 1,
                None => counts.push((target.clone(), 1)),
            }
        }
    }
    // Vec::sort_by is stable, so ties keep insertion order.
    counts.sort_by(|a, b| b.1.cmp(&a.1));

    let mut ordered: Vec<String> = counts.into_iter().map(|(name, _)| name).collect();
    for candidate in candidates {
        if !ordered.contains(candidate) {
            ordered.push(candidate.clone());
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dependencies_first() {
        let candidates = names(&["app", "lib", "base"]);
        let mut deps = BTreeMap::new();
        deps.insert("app".to_string(), names(&["lib", "base", "zlib"]));
        deps.insert("lib".to_string(), names(&["base"]));
        deps.insert("base".to_string(), Vec::new());
        let ordered = order_by_batch_dependents(&candidates, &deps);
        assert_eq!(ordered, names(&["base", "lib", "app"]));
    }

    #[test]
    fn independent_candidates_keep_order() {
        let candidates = names(&["c", "a", "b"]);
        let deps = BTreeMap::new();
        assert_eq!(order_by_batch_dependents(&candidates, &deps), candidates);
    }

    #[test]
    fn ties_keep_first_seen_order() {
        let candidates = names(&["top", "x", "y"]);
        let mut deps = BTreeMap::new();
        deps.insert("top".to_string(), names(&["y", "x"]));
        let ordered = order_by_batch_dependents(&candidates, &deps);
        assert_eq!(ordered, names(&["y", "x", "top"]));
    }

    #[test]
    fn qualified_dependency_names_match_short_candidates() {
        let candidates = names(&["pkg-b", "pkg-a"]);
        let mut deps = BTreeMap::new();
        deps.insert("pkg-b".to_string(), names(&["acme/tools/pkg-a"]));
        let ordered = order_by_batch_dependents(&candidates, &deps);
        assert_eq!(ordered, names(&["pkg-a", "pkg-b"]));
    }
}
