use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Extension helpers for [`std::process::Command`] so subprocess failures
/// surface as errors with useful detail instead of a bare exit code.
pub trait CommandRunExt {
    /// Log (at debug level) the command we're about to execute.
    fn log_debug(&mut self) -> &mut Self;
    /// Synchronously execute the child, returning an error if it exited
    /// unsuccessfully. Standard streams are inherited.
    fn run(&mut self) -> Result<()>;
    /// Like [`Self::run`], but capture stderr and fold it into the error.
    fn run_capture_stderr(&mut self) -> Result<()>;
    /// Run the command, parsing its standard output as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

fn describe_failure(cmd: &Command, status: ExitStatus, stderr: &[u8]) -> anyhow::Error {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        anyhow::anyhow!("Subprocess {program} failed: {status}")
    } else {
        anyhow::anyhow!("Subprocess {program} failed: {status}: {stderr}")
    }
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {self:?}");
        self
    }

    fn run(&mut self) -> Result<()> {
        let program = self.get_program().to_string_lossy().into_owned();
        let status = self
            .status()
            .with_context(|| format!("Spawning {program}"))?;
        if !status.success() {
            return Err(describe_failure(self, status, &[]));
        }
        Ok(())
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let program = self.get_program().to_string_lossy().into_owned();
        let output = self
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {program}"))?;
        if !output.status.success() {
            return Err(describe_failure(self, output.status, &output.stderr));
        }
        Ok(())
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let program = self.get_program().to_string_lossy().into_owned();
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {program}"))?;
        if !output.status.success() {
            return Err(describe_failure(self, output.status, &output.stderr));
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Parsing {program} output as JSON"))
    }
}
