//! Scheduling sets tracked across one run.

/// Ordered, de-duplicated set of formula names.
///
/// Insertion order is preserved so that reports and CI outputs stay stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameSet {
    names: Vec<String>,
}

impl NameSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `name` unless it is already present. Returns true when added.
    pub fn push(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.names.push(name);
        true
    }

    pub fn extend<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.push(name);
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.names.len();
        self.names.retain(|existing| existing != name);
        before != self.names.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|existing| existing == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.names.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn join(&self, sep: &str) -> String {
        self.names.join(sep)
    }
}

impl<S: Into<String>> FromIterator<S> for NameSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = NameSet::new();
        set.extend(iter);
        set
    }
}

impl<'a> IntoIterator for &'a NameSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.names.iter()
    }
}

/// Named scheduling sets shared by the detection, build and dependents phases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    /// Candidates for this run.
    pub testing: NameSet,
    pub added: NameSet,
    pub deleted: NameSet,
    pub skipped_or_failed: NameSet,
    /// Formulae whose artifact is trustworthy for this run.
    pub built: NameSet,
    pub tested_dependents: NameSet,
}

impl Schedule {
    pub fn from_lists(testing: &[String], added: &[String], deleted: &[String]) -> Self {
        Self {
            testing: testing.iter().cloned().collect(),
            added: added.iter().cloned().collect(),
            deleted: deleted.iter().cloned().collect(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_keeps_first_position() {
        let mut set = NameSet::new();
        assert!(set.push("b"));
        assert!(set.push("a"));
        assert!(!set.push("b"));
        assert_eq!(set.as_slice(), ["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn remove_only_drops_named_entry() {
        let mut set: NameSet = ["a", "b", "c"].into_iter().collect();
        assert!(set.remove("b"));
        assert!(!set.remove("b"));
        assert_eq!(set.join(","), "a,c");
    }
}
