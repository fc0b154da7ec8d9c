//! Tunables loaded from `.tapci.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default config file name inside the tap repository.
pub const CONFIG_FILE: &str = ".tapci.toml";

/// Run settings (TOML).
///
/// Every field has a default so an absent or partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Cap on step output embedded in the JUnit document.
    pub junit_output_limit_bytes: usize,
    /// Lines kept before the first error line when capping JUnit output.
    pub junit_context_lines: usize,

    /// Cap on step output embedded in a GitHub annotation.
    pub annotation_limit_bytes: usize,
    pub annotation_context_lines: usize,

    /// Free space (GiB) under the artifact cache below which caches are pruned.
    /// Zero disables the check.
    pub min_free_disk_gb: u64,

    /// Where artifacts from the previous CI run are downloaded.
    /// Relative paths resolve against the output directory.
    pub artifact_cache: PathBuf,

    /// Directory holding formula definitions, relative to the repository.
    pub formula_dir: String,

    /// Base revision for merge-queue runs.
    pub default_origin_ref: String,

    /// Formula added to the modified set by `--test-default-formula`.
    pub default_test_formula: String,

    /// Overrides the platform tag reported by the package manager.
    pub bottle_tag: Option<String>,

    pub dependents: DependentsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DependentsSettings {
    /// Expand dependents recursively (`uses --recursive`).
    pub recursive: bool,
    /// Platform tags on which recursive expansion is always disabled.
    pub non_recursive_tags: Vec<String>,
}

impl Default for DependentsSettings {
    fn default() -> Self {
        Self {
            recursive: true,
            non_recursive_tags: Vec::new(),
        }
    }
}

impl DependentsSettings {
    pub fn recursive_for(&self, tag: &str) -> bool {
        self.recursive && !self.non_recursive_tags.iter().any(|t| t == tag)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            junit_output_limit_bytes: 1024 * 1024 - 4 * 1024,
            junit_context_lines: 5,
            annotation_limit_bytes: 4 * 1024,
            annotation_context_lines: 5,
            min_free_disk_gb: 10,
            artifact_cache: PathBuf::from("artifact-cache"),
            formula_dir: "Formula".to_string(),
            default_origin_ref: "origin/main".to_string(),
            default_test_formula: "testbottest".to_string(),
            bottle_tag: None,
            dependents: DependentsSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.junit_output_limit_bytes == 0 {
            return Err(anyhow!("junit_output_limit_bytes must be > 0"));
        }
        if self.annotation_limit_bytes == 0 {
            return Err(anyhow!("annotation_limit_bytes must be > 0"));
        }
        if self.formula_dir.trim().is_empty() || Path::new(&self.formula_dir).is_absolute() {
            return Err(anyhow!("formula_dir must be a non-empty relative path"));
        }
        if self.default_origin_ref.trim().is_empty() {
            return Err(anyhow!("default_origin_ref must be non-empty"));
        }
        if self.default_test_formula.trim().is_empty() {
            return Err(anyhow!("default_test_formula must be non-empty"));
        }
        if self
            .bottle_tag
            .as_deref()
            .is_some_and(|tag| tag.trim().is_empty())
        {
            return Err(anyhow!("bottle_tag must be non-empty when set"));
        }
        if self.artifact_cache.as_os_str().is_empty() {
            return Err(anyhow!("artifact_cache must be non-empty"));
        }
        Ok(())
    }
}

/// Load settings from a TOML file.
///
/// If the file is missing, returns `Settings::default()`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        debug!(path = %path.display(), "no settings file, using defaults");
        let settings = Settings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}
