//! Ledger of binary artifacts produced or reused during a run.
//!
//! Every artifact the run intends to upload is recorded with its SHA-256.
//! Verification compares the ledger with the bottle files actually present
//! in the output directory; reconciliation moves anything untrustworthy into
//! `failed/` so that a second verification finds nothing to report.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

/// Holding directory for discarded artifacts, inside the output directory.
pub const FAILED_DIR: &str = "failed";

/// One expected artifact file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    pub formula: String,
    pub tag: String,
    /// File name inside the output directory.
    pub file: String,
    pub sha256: String,
}

/// Differences between the ledger and the output directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    /// Expected but absent.
    pub missing: Vec<String>,
    /// Present but never expected.
    pub unexpected: Vec<String>,
    /// Present with a different checksum.
    pub mismatched: Vec<String>,
}

impl Verification {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    pub fn describe(&self) -> String {
        let mut lines = Vec::new();
        for file in &self.missing {
            lines.push(format!("missing artifact: {file}"));
        }
        for file in &self.mismatched {
            lines.push(format!("checksum mismatch: {file}"));
        }
        for file in &self.unexpected {
            lines.push(format!("unexpected artifact: {file}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactLedger {
    output_dir: PathBuf,
    expected: BTreeMap<String, ArtifactEntry>,
}

impl ArtifactLedger {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            expected: BTreeMap::new(),
        }
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.output_dir.join(FAILED_DIR)
    }

    /// Record the current checksum of `file` (inside the output directory).
    pub fn expect(&mut self, formula: &str, tag: &str, file: &Path) -> Result<()> {
        let name = file_name(file)?;
        let sha256 = file_sha256(&self.output_dir.join(&name))?;
        debug!(file = %name, %sha256, "expecting artifact");
        self.expected.insert(
            name.clone(),
            ArtifactEntry {
                formula: formula.to_string(),
                tag: tag.to_string(),
                file: name,
                sha256,
            },
        );
        Ok(())
    }

    pub fn entries_for(&self, formula: &str) -> Vec<&ArtifactEntry> {
        self.expected
            .values()
            .filter(|entry| entry.formula == formula)
            .collect()
    }

    /// Entries that will be uploaded at the end of the run.
    pub fn upload_set(&self) -> Vec<&ArtifactEntry> {
        self.expected.values().collect()
    }

    #[instrument(skip_all)]
    pub fn verify(&self) -> Result<Verification> {
        let present = bottle_files(&self.output_dir)?;
        let mut verification = Verification::default();

        for (name, entry) in &self.expected {
            let path = self.output_dir.join(name);
            if !path.is_file() {
                verification.missing.push(name.clone());
                continue;
            }
            if file_sha256(&path)? != entry.sha256 {
                verification.mismatched.push(name.clone());
            }
        }
        for path in present {
            let name = file_name(&path)?;
            if !self.expected.contains_key(&name) {
                verification.unexpected.push(name);
            }
        }
        debug!(clean = verification.is_clean(), "verified artifacts");
        Ok(verification)
    }

    /// Make the ledger and the output directory agree again: mismatched and
    /// unexpected files move to `failed/`, missing and mismatched entries are
    /// dropped.
    pub fn reconcile(&mut self, verification: &Verification) -> Result<()> {
        for name in verification
            .mismatched
            .iter()
            .chain(verification.unexpected.iter())
        {
            self.move_to_failed(name)?;
        }
        for name in verification
            .missing
            .iter()
            .chain(verification.mismatched.iter())
        {
            self.expected.remove(name);
        }
        Ok(())
    }

    /// Move every artifact of `formula` to `failed/` and stop expecting it.
    pub fn discard(&mut self, formula: &str) -> Result<Vec<String>> {
        let names: Vec<String> = self
            .entries_for(formula)
            .into_iter()
            .map(|entry| entry.file.clone())
            .collect();
        for name in &names {
            if self.output_dir.join(name).exists() {
                self.move_to_failed(name)?;
            }
            self.expected.remove(name);
        }
        if !names.is_empty() {
            info!(formula, count = names.len(), "discarded artifacts");
        }
        Ok(names)
    }

    fn move_to_failed(&self, name: &str) -> Result<()> {
        let failed = self.failed_dir();
        fs::create_dir_all(&failed).with_context(|| format!("create {}", failed.display()))?;
        let from = self.output_dir.join(name);
        let to = failed.join(name);
        warn!(file = %name, "moving artifact to failed/");
        fs::rename(&from, &to)
            .with_context(|| format!("move {} to {}", from.display(), to.display()))
    }
}

/// Bottle files (`*.bottle*.tar.gz` and `*.bottle*.json`) directly in `dir`.
pub fn bottle_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        if !entry.file_type().is_ok_and(|kind| kind.is_file()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_bottle_file(&name) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Bottle files in `dir` for one formula and platform tag (or `all`).
pub fn bottle_files_for(dir: &Path, formula: &str, tag: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{formula}--");
    let tagged = format!(".{tag}.bottle");
    let universal = ".all.bottle";
    Ok(bottle_files(dir)?
        .into_iter()
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| {
                    name.starts_with(&prefix)
                        && (name.contains(&tagged) || name.contains(universal))
                })
        })
        .collect())
}

fn is_bottle_file(name: &str) -> bool {
    name.contains(".bottle") && (name.ends_with(".tar.gz") || name.ends_with(".json"))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("artifact path has no file name: {}", path.display()))
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    let digest = hasher.finalize();
    Ok(hex::encode(digest))
}
