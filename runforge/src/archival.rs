//! Post-run archival and restore.
//!
//! Archival replaces a run directory by `<run_id>.tar.gz.enc`:
//!
//! 1. compress the run directory to `<run_id>.tar.gz`
//! 2. encrypt it to `<run_id>.tar.gz.enc` (via `.part` + rename)
//! 3. remove the intermediate tarball
//! 4. remove the plaintext run directory
//!
//! The plaintext is removed last, and only after the encrypted archive is complete on
//! disk. Any earlier failure leaves it untouched and discards the archive. If removing
//! the plaintext itself fails part way, the archive is kept as the only complete copy.
//! Restore runs the inverse and keeps the encrypted archive.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::error::{ArchivalError, RestoreError};
use crate::io::archive::{compress_dir, extract_archive};
use crate::io::credentials::Credential;
use crate::io::crypto::{ArchiveKey, decrypt_file, encrypt_file};
use crate::io::run_store::RunPaths;

/// Completed archival step, reported to the checkpoint hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStep {
    Compressed,
    Encrypted,
    IntermediateRemoved,
    PlaintextRemoved,
}

#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub tarball_path: PathBuf,
    pub archive_path: PathBuf,
    pub key: ArchiveKey,
}

impl ArchiveJob {
    pub fn new(run_id: &str, paths: &RunPaths, key: ArchiveKey) -> Self {
        Self {
            run_id: run_id.to_string(),
            run_dir: paths.run_dir.clone(),
            tarball_path: paths.tarball_path.clone(),
            archive_path: paths.archive_path.clone(),
            key,
        }
    }
}

/// Archive a run directory. Returns the encrypted archive path.
///
/// `checkpoint` runs after every completed step; returning an error aborts the job at
/// that point, as a crash would.
#[instrument(skip_all, fields(run_id = %job.run_id))]
pub fn archive_run_dir(
    job: &ArchiveJob,
    mut checkpoint: impl FnMut(ArchiveStep) -> io::Result<()>,
) -> Result<PathBuf, ArchivalError> {
    if let Err(source) = compress_dir(&job.run_dir, &job.tarball_path) {
        let _ = fs::remove_file(&job.tarball_path);
        return Err(ArchivalError::Compress {
            path: job.run_dir.clone(),
            source,
        });
    }
    reached(&mut checkpoint, ArchiveStep::Compressed)?;

    if let Err(source) = encrypt_file(&job.tarball_path, &job.archive_path, &job.key) {
        let _ = fs::remove_file(&job.tarball_path);
        return Err(ArchivalError::Encrypt {
            path: job.archive_path.clone(),
            source,
        });
    }
    reached(&mut checkpoint, ArchiveStep::Encrypted)?;

    // The plaintext stays authoritative until the unencrypted tarball is gone.
    if let Err(source) = fs::remove_file(&job.tarball_path) {
        let _ = fs::remove_file(&job.archive_path);
        return Err(ArchivalError::Cleanup {
            path: job.tarball_path.clone(),
            source,
        });
    }
    reached(&mut checkpoint, ArchiveStep::IntermediateRemoved)?;

    fs::remove_dir_all(&job.run_dir).map_err(|source| ArchivalError::Cleanup {
        path: job.run_dir.clone(),
        source,
    })?;
    reached(&mut checkpoint, ArchiveStep::PlaintextRemoved)?;

    info!(archive = %job.archive_path.display(), "run directory archived");
    Ok(job.archive_path.clone())
}

fn reached(
    checkpoint: &mut impl FnMut(ArchiveStep) -> io::Result<()>,
    step: ArchiveStep,
) -> Result<(), ArchivalError> {
    checkpoint(step).map_err(|err| {
        warn!(?step, err = %err, "archival interrupted");
        ArchivalError::Interrupted(step)
    })
}

#[derive(Debug, Clone)]
pub struct RestoreJob {
    pub archive_path: PathBuf,
    pub tarball_path: PathBuf,
    pub restore_dir: PathBuf,
    pub credential: Credential,
}

impl RestoreJob {
    pub fn new(paths: &RunPaths, credential: Credential) -> Self {
        Self {
            archive_path: paths.archive_path.clone(),
            tarball_path: paths.tarball_path.clone(),
            restore_dir: paths.run_dir.clone(),
            credential,
        }
    }
}

/// Decrypt and unpack an archive back into its run directory.
#[instrument(skip_all, fields(archive = %job.archive_path.display()))]
pub fn restore_archive(job: &RestoreJob) -> Result<PathBuf, RestoreError> {
    if job.restore_dir.exists() {
        return Err(RestoreError::TargetExists {
            path: job.restore_dir.clone(),
        });
    }
    if !job.archive_path.is_file() {
        return Err(RestoreError::MissingArchive {
            archive: job.archive_path.clone(),
        });
    }

    let key = job.credential.derive_key();
    decrypt_file(&job.archive_path, &job.tarball_path, &key)
        .map_err(|err| RestoreError::from_crypto(job.archive_path.clone(), err))?;

    if let Err(source) = extract_archive(&job.tarball_path, &job.restore_dir) {
        let _ = fs::remove_dir_all(&job.restore_dir);
        let _ = fs::remove_file(&job.tarball_path);
        return Err(RestoreError::Extract {
            path: job.restore_dir.clone(),
            source,
        });
    }

    fs::remove_file(&job.tarball_path).map_err(|source| RestoreError::Io {
        action: "remove",
        path: job.tarball_path.clone(),
        source,
    })?;
    info!(dir = %job.restore_dir.display(), "archive restored");
    Ok(job.restore_dir.clone())
}

/// Bounded pool for archival and restore jobs.
///
/// Jobs run on tokio's blocking pool; the semaphore caps how many touch the disk at once.
#[derive(Debug, Clone)]
pub struct Archiver {
    permits: Arc<Semaphore>,
}

impl Archiver {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub async fn archive(&self, job: ArchiveJob) -> Result<PathBuf, ArchivalError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|err| ArchivalError::Worker(err.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            archive_run_dir(&job, |_| Ok(()))
        })
        .await
        .map_err(|err| ArchivalError::Worker(err.to_string()))?
    }

    pub async fn restore(&self, job: RestoreJob) -> Result<PathBuf, RestoreError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|err| RestoreError::Worker(err.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            restore_archive(&job)
        })
        .await
        .map_err(|err| RestoreError::Worker(err.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn job(root: &Path, key: ArchiveKey) -> ArchiveJob {
        let run_dir = root.join("runs/demo_run");
        fs::create_dir_all(run_dir.join("work")).expect("mkdir");
        fs::write(run_dir.join("params.json"), "{}\n").expect("write");
        fs::write(run_dir.join("work/out.txt"), "result\n").expect("write");
        ArchiveJob {
            run_id: "demo_run".to_string(),
            run_dir,
            tarball_path: root.join("runs/demo_run.tar.gz"),
            archive_path: root.join("runs/demo_run.tar.gz.enc"),
            key,
        }
    }

    #[test]
    fn archive_replaces_plaintext_with_encrypted_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let job = job(temp.path(), ArchiveKey::derive("u", "p"));
        let mut steps = Vec::new();
        let archive = archive_run_dir(&job, |step| {
            steps.push(step);
            Ok(())
        })
        .expect("archive");
        assert_eq!(archive, job.archive_path);
        assert!(!job.run_dir.exists());
        assert!(!job.tarball_path.exists());
        assert!(job.archive_path.is_file());
        assert_eq!(
            steps,
            vec![
                ArchiveStep::Compressed,
                ArchiveStep::Encrypted,
                ArchiveStep::IntermediateRemoved,
                ArchiveStep::PlaintextRemoved
            ]
        );
    }

    #[test]
    fn interrupted_archival_keeps_plaintext() {
        for stop_at in [
            ArchiveStep::Compressed,
            ArchiveStep::Encrypted,
            ArchiveStep::IntermediateRemoved,
        ] {
            let temp = tempfile::tempdir().expect("tempdir");
            let job = job(temp.path(), ArchiveKey::derive("u", "p"));
            let err = archive_run_dir(&job, |step| {
                if step == stop_at {
                    Err(io::Error::other("simulated crash"))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
            assert!(matches!(err, ArchivalError::Interrupted(step) if step == stop_at));
            assert_eq!(
                fs::read_to_string(job.run_dir.join("work/out.txt")).expect("read"),
                "result\n"
            );
        }
    }

    #[test]
    fn restore_round_trip_keeps_archive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let job = job(temp.path(), ArchiveKey::derive("alice", "pw"));
        archive_run_dir(&job, |_| Ok(())).expect("archive");

        let restore = RestoreJob {
            archive_path: job.archive_path.clone(),
            tarball_path: job.tarball_path.clone(),
            restore_dir: job.run_dir.clone(),
            credential: Credential::new("alice", "pw"),
        };
        restore_archive(&restore).expect("restore");
        assert_eq!(
            fs::read_to_string(job.run_dir.join("work/out.txt")).expect("read"),
            "result\n"
        );
        assert!(job.archive_path.is_file());
        assert!(!job.tarball_path.exists());

        let err = restore_archive(&restore).unwrap_err();
        assert!(matches!(err, RestoreError::TargetExists { .. }));
    }

    #[test]
    fn restore_distinguishes_wrong_credentials_from_damage() {
        let temp = tempfile::tempdir().expect("tempdir");
        let job = job(temp.path(), ArchiveKey::derive("alice", "pw"));
        archive_run_dir(&job, |_| Ok(())).expect("archive");

        let mut restore = RestoreJob {
            archive_path: job.archive_path.clone(),
            tarball_path: job.tarball_path.clone(),
            restore_dir: job.run_dir.clone(),
            credential: Credential::new("alice", "wrong"),
        };
        let err = restore_archive(&restore).unwrap_err();
        assert!(matches!(err, RestoreError::CredentialMismatch { .. }));
        assert!(!job.run_dir.exists());

        let mut bytes = fs::read(&job.archive_path).expect("read");
        let len = bytes.len();
        bytes.truncate(len - 10);
        fs::write(&job.archive_path, bytes).expect("write");
        restore.credential = Credential::new("alice", "pw");
        let err = restore_archive(&restore).unwrap_err();
        assert!(matches!(err, RestoreError::Decryption { .. }));
        assert!(!job.run_dir.exists());
        assert!(!job.tarball_path.exists());
    }

    #[tokio::test]
    async fn archiver_runs_jobs_off_the_runtime() {
        let temp = tempfile::tempdir().expect("tempdir");
        let job = job(temp.path(), ArchiveKey::derive("u", "p"));
        let archiver = Archiver::new(1);
        let archive = archiver.archive(job.clone()).await.expect("archive");
        assert!(archive.is_file());

        let restored = archiver
            .restore(RestoreJob {
                archive_path: job.archive_path.clone(),
                tarball_path: job.tarball_path.clone(),
                restore_dir: job.run_dir.clone(),
                credential: Credential::new("u", "p"),
            })
            .await
            .expect("restore");
        assert!(restored.join("params.json").is_file());
    }
}
