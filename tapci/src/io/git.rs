//! Read-only git queries against the tap repository.
//!
//! Mutations (fetch, reset, clean) are recorded as steps; this wrapper only
//! answers questions and therefore still runs in dry-run mode.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when the working directory is inside a git repository.
    pub fn is_repository(&self) -> bool {
        self.workdir.is_dir()
            && self
                .run(&["rev-parse", "--git-dir"])
                .is_ok_and(|out| out.status.success())
    }

    /// Resolve `rev` to a full commit sha, or `None` when it does not exist.
    pub fn resolve(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(non_empty(&out.stdout))
    }

    /// Merge base of two revisions, when they share history.
    #[instrument(skip_all, fields(start, end))]
    pub fn merge_base(&self, start: &str, end: &str) -> Result<Option<String>> {
        let out = self.run(&["merge-base", start, end])?;
        if !out.status.success() {
            debug!("no merge base");
            return Ok(None);
        }
        Ok(non_empty(&out.stdout))
    }

    /// `git diff-tree -r --name-status` between two revisions under `dir`.
    pub fn diff_tree_name_status(&self, start: &str, end: &str, dir: &str) -> Result<String> {
        self.run_capture(&["diff-tree", "-r", "--name-status", start, end, "--", dir])
    }

    /// The non-merge commit before HEAD, i.e. the commit a previous CI run
    /// most likely tested.
    pub fn previous_commit(&self) -> Result<Option<String>> {
        let out = self.run(&["log", "--no-merges", "--format=%H", "--skip=1", "-1"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(non_empty(&out.stdout))
    }

    /// True when none of `paths` changed between `rev` and the working tree.
    pub fn unchanged_since(&self, rev: &str, paths: &[PathBuf]) -> Result<bool> {
        let mut args = vec![
            "diff".to_string(),
            "--no-ext-diff".to_string(),
            "--quiet".to_string(),
            "--exit-code".to_string(),
            rev.to_string(),
            "--".to_string(),
        ];
        args.extend(paths.iter().map(|path| path.display().to_string()));
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run(&refs)?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git diff against {rev} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    /// True when the working tree differs from `rev`.
    pub fn differs_from(&self, rev: &str) -> Result<bool> {
        let out = self.run(&["diff", "--quiet", rev])?;
        Ok(!out.status.success())
    }

    /// Paths `git clean` would remove with the given arguments.
    pub fn clean_candidates(&self, clean_args: &[&str]) -> Result<Vec<String>> {
        let mut args = vec!["clean", "--dry-run"];
        args.extend_from_slice(clean_args);
        let out = self.run_capture(&args)?;
        Ok(out
            .lines()
            .filter_map(|line| line.strip_prefix("Would remove "))
            .map(|path| path.trim().to_string())
            .collect())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .arg("-C")
            .arg(&self.workdir)
            .args(args)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn non_empty(stdout: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}
