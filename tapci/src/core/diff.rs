//! Deterministic classification of changed formula files.

use std::path::{Component, Path};

use anyhow::{Result, anyhow};

/// Kind of change reported by `git diff-tree --name-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedPath {
    pub kind: ChangeKind,
    pub path: String,
}

/// Formula names touched by a diff, already reconciled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormulaChanges {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl FormulaChanges {
    /// Classify changed paths under `formula_dir` into formula names.
    ///
    /// Only `.rb` files inside `formula_dir` (at any depth) count. Names are
    /// qualified with `tap` when given (`user/repo/name`). A name that is both
    /// added and deleted is reported as modified only.
    pub fn classify(entries: &[ChangedPath], formula_dir: &str, tap: Option<&str>) -> Self {
        let mut changes = FormulaChanges::default();
        for entry in entries {
            let Some(name) = formula_name(&entry.path, formula_dir, tap) else {
                continue;
            };
            let bucket = match entry.kind {
                ChangeKind::Added => &mut changes.added,
                ChangeKind::Modified => &mut changes.modified,
                ChangeKind::Deleted => &mut changes.deleted,
            };
            if !bucket.contains(&name) {
                bucket.push(name);
            }
        }

        let both: Vec<String> = changes
            .added
            .iter()
            .filter(|name| changes.deleted.contains(name))
            .cloned()
            .collect();
        changes.added.retain(|name| !both.contains(name));
        changes.deleted.retain(|name| !both.contains(name));
        for name in both {
            if !changes.modified.contains(&name) {
                changes.modified.push(name);
            }
        }
        changes
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Parse `git diff-tree -r --name-status` output.
///
/// Renames and copies (`R100\told\tnew`) are split into a deletion of the old
/// path and an addition of the new one.
pub fn parse_name_status(output: &str) -> Result<Vec<ChangedPath>> {
    let mut entries = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let code = fields.next().unwrap_or_default();
        let first = fields
            .next()
            .ok_or_else(|| anyhow!("unexpected diff line: '{line}'"))?;
        let kind_code = code.chars().next().unwrap_or(' ');
        match kind_code {
            'A' => entries.push(changed(ChangeKind::Added, first)),
            'M' | 'T' => entries.push(changed(ChangeKind::Modified, first)),
            'D' => entries.push(changed(ChangeKind::Deleted, first)),
            'R' | 'C' => {
                let second = fields
                    .next()
                    .ok_or_else(|| anyhow!("rename without target: '{line}'"))?;
                if kind_code == 'R' {
                    entries.push(changed(ChangeKind::Deleted, first));
                }
                entries.push(changed(ChangeKind::Added, second));
            }
            _ => return Err(anyhow!("unknown diff status '{code}' in '{line}'")),
        }
    }
    Ok(entries)
}

fn changed(kind: ChangeKind, path: &str) -> ChangedPath {
    ChangedPath {
        kind,
        path: path.trim().to_string(),
    }
}

fn formula_name(path: &str, formula_dir: &str, tap: Option<&str>) -> Option<String> {
    let path = Path::new(path);
    if path.extension().and_then(|ext| ext.to_str()) != Some("rb") {
        return None;
    }
    let dir = Path::new(formula_dir);
    let relative = path.strip_prefix(dir).ok()?;
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }
    let stem = relative.file_stem()?.to_str()?;
    Some(match tap {
        Some(tap) => format!("{}/{stem}", tap.to_lowercase()),
        None => stem.to_string(),
    })
}
