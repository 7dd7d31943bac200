//! Error taxonomy for run orchestration.
//!
//! Only conditions a caller must tell apart get a typed variant. A pipeline that exits
//! non-zero is not an error at all: it is a [`RunStatus`](crate::core::types::RunStatus).
//! Plumbing failures (config, store reads) stay `anyhow::Error`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::archival::ArchiveStep;
use crate::io::crypto::CryptoError;

/// The engine process for a run could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid run request: {0}")]
    InvalidRequest(String),
    #[error("no free run id for pipeline '{pipeline}'")]
    IdExhausted { pipeline: String },
    #[error("create run directory {}: {source}", .path.display())]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write parameter file {}: {source}", .path.display())]
    ParamsFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("create run log {}: {source}", .path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Post-run archival (compress, encrypt, delete plaintext) failed.
///
/// The plaintext run directory is never removed when this is returned.
#[derive(Debug, Error)]
pub enum ArchivalError {
    #[error("compress {}: {source}", .path.display())]
    Compress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encrypt {}: {source}", .path.display())]
    Encrypt {
        path: PathBuf,
        #[source]
        source: CryptoError,
    },
    #[error("remove {}: {source}", .path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("archival interrupted after step {0:?}")]
    Interrupted(ArchiveStep),
    #[error("archival worker failed: {0}")]
    Worker(String),
}

/// Restoring a run directory from its encrypted archive failed.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// The credential does not derive the key this archive was sealed with.
    #[error("credentials do not match archive {}", .archive.display())]
    CredentialMismatch { archive: PathBuf },
    /// The archive is damaged or truncated.
    #[error("archive {} is damaged: {reason}", .archive.display())]
    Decryption { archive: PathBuf, reason: String },
    #[error("archive {} not found", .archive.display())]
    MissingArchive { archive: PathBuf },
    #[error("restore target {} already exists", .path.display())]
    TargetExists { path: PathBuf },
    #[error("extract into {}: {source}", .path.display())]
    Extract {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("restore worker failed: {0}")]
    Worker(String),
}

impl RestoreError {
    pub(crate) fn from_crypto(archive: PathBuf, err: CryptoError) -> Self {
        match err {
            CryptoError::CredentialMismatch => RestoreError::CredentialMismatch { archive },
            CryptoError::Corrupt(reason) => RestoreError::Decryption { archive, reason },
            CryptoError::Io(source) => RestoreError::Io {
                action: "decrypt",
                path: archive,
                source,
            },
        }
    }
}

/// Errors from supervisor requests (cancel, status, restore, delete).
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown run {0}")]
    UnknownRun(String),
    #[error("run {0} is not running")]
    NotRunning(String),
    #[error("run {0} is still running")]
    StillRunning(String),
    #[error("run {0} is already being cancelled")]
    CancelInProgress(String),
    /// The process survived both SIGTERM and SIGKILL.
    #[error("process {pid} of run {run_id} survived a forced kill; manual cleanup required")]
    CancellationTimeout { run_id: String, pid: u32 },
    #[error(transparent)]
    Restore(#[from] RestoreError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
