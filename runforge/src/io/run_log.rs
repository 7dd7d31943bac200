//! Append-only run logs under `<logs_dir>/<run_id>.txt`.
//!
//! Every line goes out in a single `write` on a file opened with `O_APPEND`, so a
//! crash can at worst lose the line being written, never corrupt earlier ones.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::markers::{HEADER_PREFIX, TerminalMarker};
use crate::core::types::Params;

/// Open handle to a run log.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    /// Create a fresh log with the `Running pipeline:` header and an optional config block.
    ///
    /// Fails if the log already exists: a log belongs to exactly one run.
    pub fn create(path: &Path, pipeline: &str, params: Option<&Params>) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)?;
        let mut log = Self {
            path: path.to_path_buf(),
            file,
        };
        log.append_line(&format!("{HEADER_PREFIX}{pipeline}"))?;
        if let Some(params) = params {
            let json = serde_json::to_string_pretty(params).map_err(io::Error::other)?;
            log.append_line(&format!("Config: {json}"))?;
        }
        debug!(path = %path.display(), "run log created");
        Ok(log)
    }

    /// Reopen an existing log for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line (a trailing newline is added) and flush it to the OS.
    pub fn append_line(&mut self, line: &str) -> io::Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.file.write_all(buf.as_bytes())?;
        self.file.flush()
    }

    pub fn append_marker(&mut self, marker: TerminalMarker) -> io::Result<()> {
        self.append_line(&marker.line())
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Read a whole run log.
pub fn read_log(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read run log {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Append a single line to an existing log without keeping it open.
pub fn append_to_log(path: &Path, line: &str) -> Result<()> {
    let mut log =
        RunLog::open(path).with_context(|| format!("open run log {}", path.display()))?;
    log.append_line(line)
        .with_context(|| format!("append to run log {}", path.display()))
}
