//! Workflow engine invocation.
//!
//! The engine is an external CLI (Nextflow by default). Runs are long-lived children
//! owned by the supervisor; metadata queries are short-lived and bounded.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::io::config::EngineConfig;
use crate::io::process::{exit_code_of, run_bounded};

/// Hint line printed by `nextflow list` that is not a pipeline name.
const LIST_HINT_PREFIX: &str = "You can run";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Engine {
    /// Program followed by fixed leading arguments.
    pub command: Vec<String>,
    pub profile: String,
    pub query_timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Engine {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            profile: cfg.profile.clone(),
            query_timeout: Duration::from_secs(cfg.query_timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(self.program());
        cmd.args(self.command.iter().skip(1));
        cmd
    }

    /// Command that launches `pipeline` inside `workdir`.
    ///
    /// The child gets its own process group so cancellation reaches every process the
    /// engine forks.
    pub fn launch_command(
        &self,
        pipeline: &str,
        params_path: &Path,
        workdir: &Path,
    ) -> tokio::process::Command {
        let mut cmd = self.base_command();
        cmd.arg("run")
            .arg(pipeline)
            .arg("-profile")
            .arg(&self.profile)
            .arg("-params-file")
            .arg(params_path)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(false);
        cmd
    }

    /// `<engine> info <pipeline>` parsed into `key: value` pairs.
    #[instrument(skip(self))]
    pub fn info(&self, pipeline: &str) -> Result<BTreeMap<String, String>> {
        let mut cmd = self.base_command();
        cmd.arg("info").arg(pipeline);
        let stdout = self.query(cmd, "info")?;
        Ok(parse_info(&stdout))
    }

    /// `<engine> list`: names of locally installed pipelines.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<String>> {
        let mut cmd = self.base_command();
        cmd.arg("list");
        let stdout = self.query(cmd, "list")?;
        Ok(parse_list(&stdout))
    }

    fn query(&self, cmd: Command, what: &str) -> Result<String> {
        let output = run_bounded(cmd, self.query_timeout, self.output_limit_bytes)
            .map_err(|err| anyhow!("{} {what}: {err:#}", self.program()))?;
        if output.timed_out {
            return Err(anyhow!(
                "{} {what} timed out after {}s",
                self.program(),
                self.query_timeout.as_secs()
            ));
        }
        let code = exit_code_of(&output.status);
        if code != 0 {
            return Err(anyhow!(
                "{} {what} exited with code {code}: {}",
                self.program(),
                output.stderr.text().trim()
            ));
        }
        debug!(bytes = output.stdout.bytes.len(), "engine query finished");
        Ok(output.stdout.text())
    }
}

/// Parse `key: value` lines; lines without a colon are ignored and later keys win.
pub fn parse_info(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// First column of each non-empty line, skipping the engine's usage hint.
pub fn parse_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(LIST_HINT_PREFIX))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}
