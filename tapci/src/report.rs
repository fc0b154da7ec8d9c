//! Append-only step log for one phase.

use std::path::{Path, PathBuf};

use anyhow::Result;
use thiserror::Error;
use tracing::info;

use crate::context::RunContext;
use crate::step::{Step, StepRequest};

/// Raised after a failed step when `--fail-fast` is set.
#[derive(Debug, Error)]
#[error("fail-fast: `{command}` failed")]
pub struct FailFast {
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct Report {
    name: String,
    repository: PathBuf,
    steps: Vec<Step>,
}

impl Report {
    pub fn new(name: impl Into<String>, repository: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            repository: repository.into(),
            steps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn repository(&self) -> &Path {
        &self.repository
    }

    /// Run a step with the run's signal environment and append it.
    ///
    /// Returns [`FailFast`] (inside `anyhow::Error`) when fail-fast is on and
    /// the step failed; the step is recorded either way.
    pub fn record(&mut self, ctx: &RunContext<'_>, request: StepRequest) -> Result<&Step> {
        let mut request = request;
        for (key, value) in ctx.signals.env() {
            request.env.entry(key).or_insert(value);
        }
        let step = Step::execute(request, &ctx.step_env())?;
        self.push(step, ctx.options.fail_fast)
    }

    /// Append a synthetic check step named `tapci <name>`.
    pub fn record_check(
        &mut self,
        ctx: &RunContext<'_>,
        name: &str,
        result: Result<(), String>,
    ) -> Result<&Step> {
        let step = Step::check(name, result, &self.repository);
        self.push(step, ctx.options.fail_fast)
    }

    /// Append a passed `tapci <name> <target>` step carrying `message`.
    pub fn record_note(&mut self, name: &str, target: &str, message: String) -> &Step {
        let step = Step::note(name, target, message, &self.repository);
        self.steps.push(step);
        &self.steps[self.steps.len() - 1]
    }

    fn push(&mut self, step: Step, fail_fast: bool) -> Result<&Step> {
        let failed = step.failed();
        let command = step.command_trimmed();
        self.steps.push(step);
        if failed && fail_fast {
            info!(report = %self.name, %command, "aborting on first failure");
            return Err(FailFast { command }.into());
        }
        let index = self.steps.len() - 1;
        Ok(&self.steps[index])
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn failed_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|step| step.failed()).collect()
    }

    pub fn ignored_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|step| step.ignored()).collect()
    }

    pub fn passed_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|step| step.passed()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|step| !step.failed())
    }
}
