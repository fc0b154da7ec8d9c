//! Child process execution with merged, captured output.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};

/// A fully resolved command to spawn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    /// `Some` sets the variable, `None` removes it from the child environment.
    pub env: BTreeMap<String, Option<String>>,
    pub workdir: Option<PathBuf>,
    /// Echo output to our stdout as it arrives.
    pub echo: bool,
}

impl CommandRequest {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Exit status and interleaved stdout/stderr bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub output: Vec<u8>,
}

impl CommandOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Spawns commands for steps and queries.
///
/// Implementations must not interpret a non-zero exit as an error; only a
/// failure to spawn or collect the child is an `Err`.
pub trait CommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput>;
}

/// Real process runner.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    #[instrument(skip_all, fields(program = %request.program))]
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(dir) = &request.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &request.env {
            match value {
                Some(value) => {
                    cmd.env(key, value);
                }
                None => {
                    cmd.env_remove(key);
                }
            }
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(command = %request.display(), "spawning child process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).with_context(|| format!("spawn {}", request.program));
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let merged = Arc::new(Mutex::new(Vec::new()));
        let stdout_handle = {
            let merged = Arc::clone(&merged);
            let echo = request.echo;
            thread::spawn(move || read_merged(stdout, &merged, echo))
        };
        let stderr_handle = {
            let merged = Arc::clone(&merged);
            let echo = request.echo;
            thread::spawn(move || read_merged(stderr, &merged, echo))
        };

        let status = child.wait().context("wait for command")?;
        join_reader(stdout_handle).context("join stdout")?;
        join_reader(stderr_handle).context("join stderr")?;

        let output = match Arc::try_unwrap(merged) {
            Ok(mutex) => mutex
                .into_inner()
                .map_err(|_| anyhow!("output buffer poisoned"))?,
            Err(shared) => shared
                .lock()
                .map_err(|_| anyhow!("output buffer poisoned"))?
                .clone(),
        };

        debug!(exit_code = ?status.code(), bytes = output.len(), "command finished");
        Ok(CommandOutput {
            success: status.success(),
            code: status.code(),
            output,
        })
    }
}

fn join_reader(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Append chunks from one pipe to the shared buffer as they arrive, so the
/// buffer keeps the interleaving the child produced.
fn read_merged<R: Read>(mut reader: R, merged: &Mutex<Vec<u8>>, echo: bool) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        if echo {
            let mut out = std::io::stdout().lock();
            if let Err(e) = out.write_all(&chunk[..n]).and_then(|()| out.flush()) {
                warn!(err = %e, "failed to echo output");
            }
        }
        merged
            .lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?
            .extend_from_slice(&chunk[..n]);
    }
    Ok(())
}
