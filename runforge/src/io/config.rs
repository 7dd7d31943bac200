//! Forge configuration stored at `<home>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Environment variable that overrides the default home directory.
pub const HOME_ENV: &str = "RUNFORGE_HOME";

/// Forge configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to the values
/// the desktop app shipped with. Relative folder paths resolve against the home dir.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForgeConfig {
    /// Parent directory of per-run working directories.
    pub runs_dir: PathBuf,

    /// Directory holding run logs and status sidecars.
    pub logs_dir: PathBuf,

    /// Directory for encrypted archives. Defaults to `runs_dir` when unset.
    pub archive_dir: Option<PathBuf>,

    pub engine: EngineConfig,
    pub cancel: CancelConfig,
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Command prefix used to invoke the workflow engine (e.g. `["nextflow"]`).
    pub command: Vec<String>,

    /// Execution profile passed as `-profile`.
    pub profile: String,

    /// Wall-clock limit for short metadata queries (`info`, `list`).
    pub query_timeout_secs: u64,

    /// Truncate metadata query output beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CancelConfig {
    /// Wait after SIGTERM before escalating to SIGKILL.
    pub grace_ms: u64,

    /// Wait after SIGKILL before giving up on the process.
    pub kill_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Maximum concurrent archival/restore jobs.
    pub workers: usize,

    /// Also archive cancelled runs in private mode.
    pub archive_cancelled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: vec!["nextflow".to_string()],
            profile: "docker".to_string(),
            query_timeout_secs: 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self {
            grace_ms: 2_000,
            kill_grace_ms: 1_000,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            archive_cancelled: false,
        }
    }
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("runs"),
            logs_dir: PathBuf::from("logs"),
            archive_dir: None,
            engine: EngineConfig::default(),
            cancel: CancelConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

impl CancelConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl ForgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.engine.command.is_empty() || self.engine.command[0].trim().is_empty() {
            return Err(anyhow!("engine.command must be a non-empty array"));
        }
        if self.engine.profile.trim().is_empty() {
            return Err(anyhow!("engine.profile must not be empty"));
        }
        if self.engine.query_timeout_secs == 0 {
            return Err(anyhow!("engine.query_timeout_secs must be > 0"));
        }
        if self.engine.output_limit_bytes == 0 {
            return Err(anyhow!("engine.output_limit_bytes must be > 0"));
        }
        if self.cancel.grace_ms == 0 || self.cancel.kill_grace_ms == 0 {
            return Err(anyhow!("cancel grace periods must be > 0"));
        }
        if self.archive.workers == 0 {
            return Err(anyhow!("archive.workers must be > 0"));
        }
        Ok(())
    }

    /// Folder layout with relative paths resolved against `home`.
    pub fn folders(&self, home: &Path) -> Folders {
        let runs_dir = resolve(home, &self.runs_dir);
        let archive_dir = self
            .archive_dir
            .as_deref()
            .map(|dir| resolve(home, dir))
            .unwrap_or_else(|| runs_dir.clone());
        Folders {
            runs_dir,
            logs_dir: resolve(home, &self.logs_dir),
            archive_dir,
        }
    }
}

/// Resolved absolute folder layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folders {
    pub runs_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub archive_dir: PathBuf,
}

fn resolve(home: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home.join(path)
    }
}

/// Home directory: explicit flag, then `RUNFORGE_HOME`, then `~/RunForge`.
pub fn resolve_home(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(HOME_ENV) {
        return Ok(PathBuf::from(path));
    }
    dirs::home_dir()
        .map(|home| home.join("RunForge"))
        .context("cannot determine home directory; pass --home or set RUNFORGE_HOME")
}

pub fn config_path(home: &Path) -> PathBuf {
    home.join("config.toml")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForgeConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForgeConfig> {
    if !path.exists() {
        let cfg = ForgeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForgeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForgeConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, &buf)
}
