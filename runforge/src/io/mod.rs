//! I/O helpers for run orchestration.

pub mod archive;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod engine;
pub mod process;
pub mod run_log;
pub mod run_store;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Atomically write `contents` to `path` (temp file + rename).
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);
    fs::write(tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
