//! GitHub Actions environment, output channel and workflow commands.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::debug;

/// CI context captured once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitHubEnv {
    /// `GITHUB_ACTIONS` is set.
    pub actions: bool,
    pub repository: Option<String>,
    pub sha: Option<String>,
    pub git_ref: Option<String>,
    /// Target branch of a pull request.
    pub base_ref: Option<String>,
    pub event_name: Option<String>,
    /// File backing the step output channel.
    pub output: Option<PathBuf>,
    pub run_id: Option<String>,
}

impl GitHubEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            actions: get("GITHUB_ACTIONS").is_some(),
            repository: get("GITHUB_REPOSITORY"),
            sha: get("GITHUB_SHA"),
            git_ref: get("GITHUB_REF"),
            base_ref: get("GITHUB_BASE_REF"),
            event_name: get("GITHUB_EVENT_NAME"),
            output: get("GITHUB_OUTPUT").map(PathBuf::from),
            run_id: get("GITHUB_RUN_ID"),
        }
    }

    pub fn is_push(&self) -> bool {
        self.event_name.as_deref() == Some("push")
    }

    pub fn is_merge_group(&self) -> bool {
        self.event_name.as_deref() == Some("merge_group")
    }

    /// Under Actions the repository, sha and ref must all be known.
    pub fn require_complete(&self) -> Result<()> {
        if !self.actions {
            return Ok(());
        }
        let missing: Vec<&str> = [
            ("GITHUB_REPOSITORY", self.repository.is_none()),
            ("GITHUB_SHA", self.sha.is_none()),
            ("GITHUB_REF", self.git_ref.is_none()),
        ]
        .into_iter()
        .filter_map(|(key, missing)| missing.then_some(key))
        .collect();
        if !missing.is_empty() {
            bail!("missing GitHub Actions environment: {}", missing.join(", "));
        }
        Ok(())
    }

    /// Append `key=value` to the output channel; a no-op outside Actions.
    pub fn write_output(&self, key: &str, value: &str) -> Result<()> {
        let Some(path) = &self.output else {
            debug!(key, "no GITHUB_OUTPUT, skipping output");
            return Ok(());
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        writeln!(file, "{key}={value}").with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

/// Location properties for an annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationLocation {
    pub file: Option<String>,
    pub line: Option<usize>,
    pub title: Option<String>,
}

/// Format a workflow command such as `::error file=x,line=3,title=t::msg`.
pub fn workflow_command(kind: &str, location: &AnnotationLocation, message: &str) -> String {
    let mut properties = Vec::new();
    if let Some(file) = &location.file {
        properties.push(format!("file={}", escape_property(file)));
    }
    if let Some(line) = location.line {
        properties.push(format!("line={line}"));
    }
    if let Some(title) = &location.title {
        properties.push(format!("title={}", escape_property(title)));
    }
    let mut command = format!("::{kind}");
    if !properties.is_empty() {
        command.push(' ');
        command.push_str(&properties.join(","));
    }
    command.push_str("::");
    command.push_str(&escape_data(message));
    command
}

fn escape_data(value: &str) -> String {
    value
        .replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

fn escape_property(value: &str) -> String {
    escape_data(value).replace(':', "%3A").replace(',', "%2C")
}
