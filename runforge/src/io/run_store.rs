//! On-disk run record store.
//!
//! Layout (all names derive from the run id):
//!
//! ```text
//! <runs_dir>/<run_id>/                  run directory (engine cwd, params.json)
//! <logs_dir>/<run_id>.txt               append-only run log
//! <logs_dir>/<run_id>.status.json       status sidecar
//! <archive_dir>/<run_id>.tar.gz         intermediate tarball (transient)
//! <archive_dir>/<run_id>.tar.gz.enc     encrypted archive
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::markers::infer_status_from_log;
use crate::core::run_id::{base_run_id, candidate_ids, validate_run_id};
use crate::core::types::{Params, RunStatus};
use crate::io::config::Folders;
use crate::io::crypto::part_path;
use crate::io::run_log::read_log;
use crate::io::write_atomic;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const LOG_EXT: &str = ".txt";
const STATUS_EXT: &str = ".status.json";
const TARBALL_EXT: &str = ".tar.gz";
const ARCHIVE_EXT: &str = ".tar.gz.enc";

/// Every path owned by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub log_path: PathBuf,
    pub status_path: PathBuf,
    pub params_path: PathBuf,
    pub tarball_path: PathBuf,
    pub archive_path: PathBuf,
}

/// Identity of a launched run. Immutable once the engine starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: String,
    pub pipeline: String,
    pub params: Params,
    pub paths: RunPaths,
}

/// Structured status persisted next to the log on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub run_id: String,
    pub pipeline: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub updated_at: String,
}

impl StatusRecord {
    pub fn new(run_id: &str, pipeline: &str, status: RunStatus) -> Self {
        Self {
            run_id: run_id.to_string(),
            pipeline: pipeline.to_string(),
            status,
            exit_code: None,
            detail: None,
            updated_at: Local::now().to_rfc3339(),
        }
    }
}

/// Which artifacts of a run are present on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Plaintext,
    Encrypted,
    /// Restored archive, or archival that has not finished deleting the plaintext.
    Both,
    Missing,
}

#[derive(Debug, Clone)]
pub struct RunStore {
    folders: Folders,
}

impl RunStore {
    pub fn new(folders: Folders) -> Self {
        Self { folders }
    }

    pub fn folders(&self) -> &Folders {
        &self.folders
    }

    /// Create the store directories if missing.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [&self.folders.runs_dir, &self.folders.logs_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn paths(&self, run_id: &str) -> RunPaths {
        let run_dir = self.folders.runs_dir.join(run_id);
        RunPaths {
            params_path: run_dir.join("params.json"),
            run_dir,
            log_path: self.folders.logs_dir.join(format!("{run_id}{LOG_EXT}")),
            status_path: self.folders.logs_dir.join(format!("{run_id}{STATUS_EXT}")),
            tarball_path: self
                .folders
                .archive_dir
                .join(format!("{run_id}{TARBALL_EXT}")),
            archive_path: self
                .folders
                .archive_dir
                .join(format!("{run_id}{ARCHIVE_EXT}")),
        }
    }

    /// Allocate a fresh run id and reserve its run directory.
    ///
    /// Ids that `is_live` reports, or that already own a log or archive, are skipped.
    /// The directory is created with a non-recursive `create_dir`, so concurrent callers
    /// can never both win the same id. Returns `Ok(None)` when every suffix is taken.
    pub fn reserve_run_id(
        &self,
        pipeline: &str,
        now: DateTime<Local>,
        is_live: impl Fn(&str) -> bool,
    ) -> io::Result<Option<(String, RunPaths)>> {
        fs::create_dir_all(&self.folders.runs_dir)?;
        fs::create_dir_all(&self.folders.logs_dir)?;
        let base = base_run_id(pipeline, &now.format(TIMESTAMP_FORMAT).to_string());
        for id in candidate_ids(&base) {
            if is_live(&id) {
                continue;
            }
            let paths = self.paths(&id);
            if paths.log_path.exists() || paths.archive_path.exists() {
                continue;
            }
            match fs::create_dir(&paths.run_dir) {
                Ok(()) => {
                    debug!(run_id = %id, "run id reserved");
                    return Ok(Some((id, paths)));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Write `params.json` (pretty JSON, trailing newline) into the run directory.
    pub fn write_params(&self, paths: &RunPaths, params: &Params) -> io::Result<()> {
        let mut json = serde_json::to_string_pretty(params).map_err(io::Error::other)?;
        json.push('\n');
        fs::write(&paths.params_path, json)
    }

    pub fn write_status(&self, record: &StatusRecord) -> Result<()> {
        let path = self.paths(&record.run_id).status_path;
        let mut json = serde_json::to_string_pretty(record).context("serialize status")?;
        json.push('\n');
        write_atomic(&path, &json)
    }

    pub fn load_status(&self, run_id: &str) -> Result<Option<StatusRecord>> {
        let path = self.paths(run_id).status_path;
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let record =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(record))
    }

    /// Run ids that own a log, sorted.
    pub fn list_run_ids(&self) -> Result<Vec<String>> {
        let dir = &self.folders.logs_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name.strip_suffix(LOG_EXT) else {
                continue;
            };
            if validate_run_id(id).is_ok() {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Persisted status: the sidecar when present, otherwise inferred from the log.
    pub fn status_of(&self, run_id: &str) -> Result<Option<StatusRecord>> {
        if let Some(record) = self.load_status(run_id)? {
            return Ok(Some(record));
        }
        let paths = self.paths(run_id);
        if !paths.log_path.exists() {
            return Ok(None);
        }
        let log = read_log(&paths.log_path)?;
        let pipeline = pipeline_from_log(&log).unwrap_or_default();
        let mut status = infer_status_from_log(&log);
        if status.is_process_terminal() && self.artifact_state(run_id) == ArtifactState::Encrypted {
            status = RunStatus::Archived;
        }
        Ok(Some(StatusRecord::new(run_id, &pipeline, status)))
    }

    pub fn artifact_state(&self, run_id: &str) -> ArtifactState {
        let paths = self.paths(run_id);
        match (paths.run_dir.is_dir(), paths.archive_path.is_file()) {
            (true, true) => ArtifactState::Both,
            (true, false) => ArtifactState::Plaintext,
            (false, true) => ArtifactState::Encrypted,
            (false, false) => ArtifactState::Missing,
        }
    }

    /// Remove every artifact of a run. Missing pieces are ignored.
    pub fn delete_run(&self, run_id: &str) -> Result<()> {
        validate_run_id(run_id)?;
        let paths = self.paths(run_id);
        if paths.run_dir.exists() {
            fs::remove_dir_all(&paths.run_dir)
                .with_context(|| format!("remove {}", paths.run_dir.display()))?;
        }
        for file in [
            &paths.log_path,
            &paths.status_path,
            &paths.tarball_path,
            &paths.archive_path,
        ] {
            remove_file_if_exists(file)?;
        }
        info!(run_id, "run deleted");
        Ok(())
    }

    /// Settle archival jobs that were interrupted by a crash.
    ///
    /// The intermediate tarball marks how far archival got, because it is removed only
    /// once the encrypted archive is complete and before any plaintext is touched:
    ///
    /// - A partial `.enc.part` is always garbage.
    /// - Tarball still present: the plaintext was never touched. The tarball and any
    ///   archive next to it are discarded and the plaintext stays authoritative.
    /// - Tarball gone, archive present, plaintext (possibly partial) still present: the
    ///   crash hit while removing the plaintext. The archive is the only complete copy, so
    ///   the rest of the plaintext is removed and the run counts as archived.
    /// - Plaintext gone but the status never updated: archival completed.
    ///
    /// Only runs whose status is process-terminal but not final are settled; restored
    /// runs are `archived` and left alone. Only the process that owns the store should
    /// call this.
    pub fn recover_incomplete_archives(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for run_id in self.list_run_ids()? {
            let paths = self.paths(&run_id);
            let part = part_path(&paths.archive_path);
            if part.exists() {
                remove_file_if_exists(&part)?;
                report.removed.push(part);
            }

            let had_tarball = paths.tarball_path.exists();
            let pending = self.load_status(&run_id)?.filter(|record| {
                record.status.is_process_terminal() && !record.status.is_final()
            });
            let has_archive = paths.archive_path.is_file();
            if !paths.run_dir.is_dir() {
                if let Some(record) = pending
                    && has_archive
                {
                    report.runs.push(RecoveredArchival::Completed(record));
                }
                continue;
            }

            if had_tarball {
                remove_file_if_exists(&paths.tarball_path)?;
                report.removed.push(paths.tarball_path.clone());
            }
            let Some(record) = pending else { continue };
            if !has_archive {
                continue;
            }
            if had_tarball {
                remove_file_if_exists(&paths.archive_path)?;
                report.removed.push(paths.archive_path.clone());
                report.runs.push(RecoveredArchival::Interrupted(record));
            } else {
                fs::remove_dir_all(&paths.run_dir)
                    .with_context(|| format!("remove {}", paths.run_dir.display()))?;
                report.removed.push(paths.run_dir.clone());
                report.runs.push(RecoveredArchival::Completed(record));
            }
        }
        if !report.removed.is_empty() || !report.runs.is_empty() {
            warn!(
                removed = report.removed.len(),
                runs = report.runs.len(),
                "recovered interrupted archival"
            );
        }
        Ok(report)
    }
}

/// Archival outcome reconstructed for one run during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveredArchival {
    /// Stopped before the plaintext was touched; the archive was discarded.
    Interrupted(StatusRecord),
    /// The archive was complete; the plaintext is gone but the status never reached
    /// `archived`.
    Completed(StatusRecord),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub removed: Vec<PathBuf>,
    pub runs: Vec<RecoveredArchival>,
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

fn pipeline_from_log(log: &str) -> Option<String> {
    log.lines()
        .next()?
        .strip_prefix(crate::core::markers::HEADER_PREFIX)
        .map(|name| name.trim().to_string())
}
