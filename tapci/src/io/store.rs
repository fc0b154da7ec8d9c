//! Remote storage for artifacts of previous CI runs.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::io::process::{CommandRequest, CommandRunner};

/// Which artifacts to fetch and where to put them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// `owner/repo` on GitHub.
    pub repository: String,
    /// Commit the previous run tested.
    pub commit: String,
    /// Artifact name glob, e.g. `bottles_*`.
    pub pattern: String,
    pub dest: PathBuf,
}

/// Fetches artifacts uploaded by an earlier run.
pub trait ArtifactStore {
    /// Download matching artifacts into `request.dest`. Returns the number of
    /// files now present there. Finding no previous run is not an error.
    fn download(&self, request: &DownloadRequest) -> Result<usize>;
}

/// Store that never has anything; used outside GitHub Actions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoArtifactStore;

impl ArtifactStore for NoArtifactStore {
    fn download(&self, request: &DownloadRequest) -> Result<usize> {
        debug!(pattern = %request.pattern, "artifact store disabled");
        Ok(0)
    }
}

/// Store backed by the `gh` CLI (`gh run list` + `gh run download`).
pub struct GhCliStore<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> GhCliStore<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    fn gh(&self, args: &[&str]) -> Result<String> {
        let request = CommandRequest::new("gh", args);
        let output = self
            .runner
            .run(&request)
            .with_context(|| format!("run {}", request.display()))?;
        if !output.success {
            return Err(anyhow!("{} failed: {}", request.display(), output.text().trim()));
        }
        Ok(output.text())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunJson {
    database_id: u64,
}

impl ArtifactStore for GhCliStore<'_> {
    #[instrument(skip_all, fields(commit = %request.commit, pattern = %request.pattern))]
    fn download(&self, request: &DownloadRequest) -> Result<usize> {
        let runs = self.gh(&[
            "run",
            "list",
            "--repo",
            &request.repository,
            "--commit",
            &request.commit,
            "--status",
            "completed",
            "--json",
            "databaseId",
            "--limit",
            "1",
        ])?;
        let runs: Vec<RunJson> = serde_json::from_str(&runs).context("parse gh run list")?;
        let Some(run) = runs.first() else {
            info!("no previous run for commit");
            return Ok(0);
        };

        fs::create_dir_all(&request.dest)
            .with_context(|| format!("create {}", request.dest.display()))?;
        let run_id = run.database_id.to_string();
        let dest = request.dest.display().to_string();
        self.gh(&[
            "run",
            "download",
            &run_id,
            "--repo",
            &request.repository,
            "--pattern",
            &request.pattern,
            "--dir",
            &dest,
        ])?;
        Ok(count_files(&request.dest))
    }
}

fn count_files(dir: &std::path::Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    #[test]
    fn downloads_latest_completed_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new();
        runner.respond("gh run list", true, r#"[{"databaseId": 42}]"#);
        runner.respond("gh run download", true, "");
        let store = GhCliStore::new(&runner);
        let count = store
            .download(&DownloadRequest {
                repository: "acme/homebrew-tools".to_string(),
                commit: "abc".to_string(),
                pattern: "bottles_*".to_string(),
                dest: temp.path().join("cache"),
            })
            .expect("download");
        assert_eq!(count, 0);
        let commands = runner.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[1].starts_with("gh run download 42 --repo acme/homebrew-tools"));
    }

    #[test]
    fn no_previous_run_is_empty() {
        let runner = ScriptedRunner::new();
        runner.respond("gh run list", true, "[]");
        let store = GhCliStore::new(&runner);
        let count = store
            .download(&DownloadRequest {
                repository: "acme/homebrew-tools".to_string(),
                commit: "abc".to_string(),
                pattern: "bottles_*".to_string(),
                dest: PathBuf::from("/nonexistent"),
            })
            .expect("download");
        assert_eq!(count, 0);
        assert_eq!(runner.commands().len(), 1);
    }

    #[test]
    fn gh_failure_is_an_error() {
        let runner = ScriptedRunner::new();
        runner.respond("gh run list", false, "HTTP 401");
        let store = GhCliStore::new(&runner);
        let err = store
            .download(&DownloadRequest {
                repository: "acme/homebrew-tools".to_string(),
                commit: "abc".to_string(),
                pattern: "bottles_*".to_string(),
                dest: PathBuf::from("/nonexistent"),
            })
            .expect_err("fails");
        assert!(err.to_string().contains("HTTP 401"));
    }
}
