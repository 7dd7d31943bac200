//! Test-only helpers: sandboxed folders and fake engines.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::core::lifecycle::ArchivePolicy;
use crate::io::config::{EngineConfig, Folders};
use crate::io::credentials::{CredentialStore, NoCredentials};
use crate::io::engine::Engine;
use crate::supervisor::{Supervisor, SupervisorOptions};

/// Temporary home with `runs/`, `logs/` and `scripts/`.
pub struct Sandbox {
    pub dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn folders(&self) -> Folders {
        Folders {
            runs_dir: self.root().join("runs"),
            logs_dir: self.root().join("logs"),
            archive_dir: self.root().join("runs"),
        }
    }

    /// Write a fake engine as a shell script and return the command that runs it.
    ///
    /// The script receives the usual `run <pipeline> -profile <p> -params-file <f>`
    /// arguments. It is run through `sh` rather than executed directly, which avoids
    /// `ETXTBSY` races with files that were just written.
    pub fn engine_script(&self, name: &str, body: &str) -> Vec<String> {
        let dir = self.root().join("scripts");
        fs::create_dir_all(&dir).expect("create scripts dir");
        let path = dir.join(format!("{name}.sh"));
        fs::write(&path, body).expect("write engine script");
        vec!["sh".to_string(), path.display().to_string()]
    }

    /// Supervisor options with short cancel grace periods.
    pub fn options(&self, engine_command: Vec<String>) -> SupervisorOptions {
        let cfg = EngineConfig {
            command: engine_command,
            query_timeout_secs: 10,
            ..EngineConfig::default()
        };
        SupervisorOptions {
            folders: self.folders(),
            engine: Engine::from_config(&cfg),
            grace: Duration::from_millis(2_000),
            kill_grace: Duration::from_millis(1_000),
            archive_policy: ArchivePolicy::default(),
            archive_workers: 2,
            recover: true,
        }
    }

    pub fn supervisor(&self, engine_command: Vec<String>) -> Supervisor {
        self.supervisor_with(self.options(engine_command), Arc::new(NoCredentials))
    }

    pub fn supervisor_with(
        &self,
        options: SupervisorOptions,
        credentials: Arc<dyn CredentialStore>,
    ) -> Supervisor {
        Supervisor::new(options, credentials).expect("supervisor")
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Every file under `dir` keyed by relative path, for byte-identical comparisons.
pub fn snapshot_tree(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut out = BTreeMap::new();
    collect(dir, dir, &mut out);
    out
}

fn collect(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
    for entry in fs::read_dir(dir).expect("read dir") {
        let path = entry.expect("dir entry").path();
        if path.is_dir() {
            collect(root, &path, out);
        } else {
            let rel = path.strip_prefix(root).expect("relative path").to_path_buf();
            out.insert(rel, fs::read(&path).expect("read file"));
        }
    }
}
