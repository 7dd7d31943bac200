//! Process supervisor: launches engine runs, streams their output into run logs and
//! drives each run through the lifecycle state machine.
//!
//! Every live run owns three tasks: one pump per output stream and one supervision task
//! that waits for exit (or a cancel request). Shared state lives in a run table keyed by
//! run id; callbacks only ever look up their own entry. The table lock is never held
//! across an `.await`.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::archival::{ArchiveJob, Archiver, RestoreJob};
use crate::core::lifecycle::{ArchivePolicy, decide_archival, decide_exit};
use crate::core::lines::LineAssembler;
use crate::core::markers::TerminalMarker;
use crate::core::run_id::validate_run_id;
use crate::core::types::{ParamValue, Params, RunSnapshot, RunStatus, StreamKind};
use crate::error::{ArchivalError, LaunchError, SupervisorError};
use crate::io::config::{Folders, ForgeConfig};
use crate::io::credentials::{Credential, CredentialStore};
use crate::io::engine::Engine;
use crate::io::process::{ProcessSignal, exit_code_of, signal_process_group};
use crate::io::run_log::{RunLog, append_to_log};
use crate::io::run_store::{
    ArtifactState, RecoveredArchival, RunRecord, RunStore, StatusRecord,
};

/// Upper bound on waiting for output pumps after the process has exited.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK: usize = 8192;

/// Request to launch a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub pipeline: String,
    pub params: Params,
}

impl RunRequest {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            params: Params::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// How a cancellation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The process group exited within the SIGTERM grace period.
    Terminated,
    /// SIGKILL was needed.
    Killed,
    /// The process exited on its own before it could be signalled.
    AlreadyExited,
}

/// Result of delivering an exit notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitNotification {
    Applied(RunStatus),
    /// The run was not running any more (duplicate or late notification).
    Ignored,
}

/// Lifecycle notifications for observers (the UI refreshes its run list on these).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Started { run_id: String, pipeline: String },
    StatusChanged { run_id: String, status: RunStatus },
    ArchiveFailed { run_id: String, error: String },
    Restored { run_id: String, run_dir: PathBuf },
}

/// One row of the run list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub pipeline: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub live: bool,
    pub artifacts: ArtifactState,
}

/// Supervisor settings, usually derived from [`ForgeConfig`].
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub folders: Folders,
    pub engine: Engine,
    /// Wait after SIGTERM before escalating.
    pub grace: Duration,
    /// Wait after SIGKILL before reporting the process as unkillable.
    pub kill_grace: Duration,
    pub archive_policy: ArchivePolicy,
    pub archive_workers: usize,
    /// Settle archival interrupted by a crash on construction. Only the process that
    /// owns the store should enable this.
    pub recover: bool,
}

impl SupervisorOptions {
    pub fn from_config(cfg: &ForgeConfig, home: &Path) -> Self {
        Self {
            folders: cfg.folders(home),
            engine: Engine::from_config(&cfg.engine),
            grace: cfg.cancel.grace(),
            kill_grace: cfg.cancel.kill_grace(),
            archive_policy: ArchivePolicy {
                archive_cancelled: cfg.archive.archive_cancelled,
            },
            archive_workers: cfg.archive.workers,
            recover: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    AlreadyExited,
    Terminated,
    Killed,
    Unkillable,
}

#[derive(Debug)]
struct CancelRequest {
    reply: oneshot::Sender<Termination>,
}

struct LiveRun {
    record: RunRecord,
    status: RunStatus,
    exit_code: Option<i32>,
    pid: Option<u32>,
    /// The engine process has been reaped; output may still be draining.
    exited: bool,
    cancel_requested: bool,
    cancel_tx: Option<oneshot::Sender<CancelRequest>>,
    /// Open while the process runs; closed once the terminal marker is down.
    log: Option<RunLog>,
    stdout: LineAssembler,
    stderr: LineAssembler,
    output: Option<broadcast::Sender<String>>,
    status_tx: watch::Sender<RunSnapshot>,
    archival_pending: bool,
}

impl LiveRun {
    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            status: self.status,
            exit_code: self.exit_code,
            settled: self.status.is_process_terminal() && !self.archival_pending,
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    fn status_record(&self, detail: Option<String>) -> StatusRecord {
        let mut record =
            StatusRecord::new(&self.record.run_id, &self.record.pipeline, self.status);
        record.exit_code = self.exit_code;
        record.detail = detail;
        record
    }

    fn assembler(&mut self, stream: StreamKind) -> &mut LineAssembler {
        match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    /// Append a line to the log and forward it to live subscribers.
    fn emit_line(&mut self, line: &str) {
        self.note(line);
        if let Some(output) = &self.output {
            let _ = output.send(line.to_string());
        }
    }

    fn note(&mut self, line: &str) {
        match &mut self.log {
            Some(log) => {
                if let Err(err) = log.append_line(line) {
                    warn!(
                        run_id = %self.record.run_id,
                        path = %log.path().display(),
                        err = %err,
                        "failed to append to run log"
                    );
                }
            }
            None => {
                if let Err(err) = append_to_log(&self.record.paths.log_path, line) {
                    warn!(run_id = %self.record.run_id, err = %format!("{err:#}"), "failed to append to run log");
                }
            }
        }
    }
}

struct Inner {
    store: RunStore,
    engine: Engine,
    grace: Duration,
    kill_grace: Duration,
    archive_policy: ArchivePolicy,
    credentials: Arc<dyn CredentialStore>,
    archiver: Archiver,
    runs: Mutex<HashMap<String, Arc<Mutex<LiveRun>>>>,
    events: broadcast::Sender<RunEvent>,
}

/// Cloneable handle to the process supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Build a supervisor, settling archival jobs a previous process left unfinished
    /// when `options.recover` is set.
    pub fn new(
        options: SupervisorOptions,
        credentials: Arc<dyn CredentialStore>,
    ) -> anyhow::Result<Self> {
        let store = RunStore::new(options.folders);
        store.ensure_layout()?;
        if options.recover {
            let report = store.recover_incomplete_archives()?;
            settle_recovered(&store, report.runs)?;
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                engine: options.engine,
                grace: options.grace,
                kill_grace: options.kill_grace,
                archive_policy: options.archive_policy,
                credentials,
                archiver: Archiver::new(options.archive_workers),
                runs: Mutex::new(HashMap::new()),
                events,
            }),
        })
    }

    pub fn store(&self) -> &RunStore {
        &self.inner.store
    }

    fn entry(&self, run_id: &str) -> Option<Arc<Mutex<LiveRun>>> {
        self.inner.runs.lock().get(run_id).cloned()
    }

    fn is_live(&self, run_id: &str) -> bool {
        self.inner.runs.lock().contains_key(run_id)
    }

    fn emit(&self, event: RunEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Drop a settled run from the live table, closing its log. Later reads go to the
    /// store.
    fn retire(&self, run_id: &str) {
        let mut runs = self.inner.runs.lock();
        if runs
            .get(run_id)
            .is_some_and(|entry| entry.lock().snapshot().settled)
        {
            runs.remove(run_id);
            debug!(run_id, "settled run retired");
        }
    }

    fn persist(&self, record: &StatusRecord) {
        if let Err(err) = self.inner.store.write_status(record) {
            warn!(run_id = %record.run_id, err = %format!("{err:#}"), "failed to write status sidecar");
        }
    }

    /// Launch a pipeline run. Must be called from within a tokio runtime.
    ///
    /// On any failure before the engine is running, the reserved run directory and log
    /// are removed again so no orphan record remains.
    #[instrument(skip_all, fields(pipeline = %request.pipeline))]
    pub async fn start_run(&self, request: RunRequest) -> Result<String, LaunchError> {
        let pipeline = request.pipeline.trim().to_string();
        if pipeline.is_empty() {
            return Err(LaunchError::InvalidRequest(
                "pipeline name must not be empty".to_string(),
            ));
        }
        if let Some(key) = request.params.keys().find(|k| k.trim().is_empty()) {
            return Err(LaunchError::InvalidRequest(format!(
                "parameter name must not be empty (got '{key}')"
            )));
        }

        let store = &self.inner.store;
        let (run_id, paths) = store
            .reserve_run_id(&pipeline, Local::now(), |id| self.is_live(id))
            .map_err(|source| LaunchError::WorkingDirectory {
                path: store.folders().runs_dir.clone(),
                source,
            })?
            .ok_or_else(|| LaunchError::IdExhausted {
                pipeline: pipeline.clone(),
            })?;

        let cleanup = |remove_log: bool| {
            let _ = std::fs::remove_dir_all(&paths.run_dir);
            if remove_log {
                let _ = std::fs::remove_file(&paths.log_path);
            }
        };

        if let Err(source) = store.write_params(&paths, &request.params) {
            cleanup(false);
            return Err(LaunchError::ParamsFile {
                path: paths.params_path.clone(),
                source,
            });
        }

        let log = match RunLog::create(&paths.log_path, &pipeline, Some(&request.params)) {
            Ok(log) => log,
            Err(source) => {
                cleanup(false);
                return Err(LaunchError::Log {
                    path: paths.log_path.clone(),
                    source,
                });
            }
        };

        let params_path =
            std::path::absolute(&paths.params_path).unwrap_or_else(|_| paths.params_path.clone());
        let mut command =
            self.inner
                .engine
                .launch_command(&pipeline, &params_path, &paths.run_dir);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!(err = %source, "failed to spawn engine");
                drop(log);
                cleanup(true);
                return Err(LaunchError::Spawn {
                    program: self.inner.engine.program().to_string(),
                    source,
                });
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (status_tx, _) = watch::channel(RunSnapshot::running());
        let record = RunRecord {
            run_id: run_id.clone(),
            pipeline: pipeline.clone(),
            params: request.params,
            paths,
        };
        let live = LiveRun {
            record,
            status: RunStatus::Running,
            exit_code: None,
            pid,
            exited: false,
            cancel_requested: false,
            cancel_tx: Some(cancel_tx),
            log: Some(log),
            stdout: Default::default(),
            stderr: Default::default(),
            output: Some(output_tx),
            status_tx,
            archival_pending: false,
        };
        let sidecar = live.status_record(None);
        self.inner
            .runs
            .lock()
            .insert(run_id.clone(), Arc::new(Mutex::new(live)));
        self.persist(&sidecar);
        info!(run_id = %run_id, pid = ?pid, "pipeline run started");
        self.emit(RunEvent::Started {
            run_id: run_id.clone(),
            pipeline,
        });

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            pumps.push(tokio::spawn(pump(
                self.clone(),
                run_id.clone(),
                StreamKind::Stdout,
                stdout,
            )));
        }
        if let Some(stderr) = stderr {
            pumps.push(tokio::spawn(pump(
                self.clone(),
                run_id.clone(),
                StreamKind::Stderr,
                stderr,
            )));
        }
        tokio::spawn(
            self.clone()
                .supervise(run_id.clone(), child, cancel_rx, pumps),
        );
        Ok(run_id)
    }

    /// Feed raw output bytes of one stream. Complete lines go to the log and to
    /// subscribers; a trailing partial line waits for more bytes.
    pub fn on_output_available(&self, run_id: &str, stream: StreamKind, bytes: &[u8]) {
        let Some(entry) = self.entry(run_id) else {
            debug!(run_id, "output for unknown run dropped");
            return;
        };
        let mut live = entry.lock();
        if live.status.is_process_terminal() {
            debug!(run_id, "output after exit dropped");
            return;
        }
        for line in live.assembler(stream).push(bytes) {
            live.emit_line(&line);
        }
    }

    /// End of one output stream: flush its trailing partial line.
    pub fn on_output_closed(&self, run_id: &str, stream: StreamKind) {
        let Some(entry) = self.entry(run_id) else {
            return;
        };
        let mut live = entry.lock();
        if live.status.is_process_terminal() {
            return;
        }
        if let Some(line) = live.assembler(stream).finish() {
            live.emit_line(&line);
        }
    }

    /// Cancel a running pipeline: record the cancellation, then SIGTERM the process
    /// group, escalating to SIGKILL after the grace period.
    ///
    /// A run whose process already exited (output may still be draining) is left alone
    /// and reported as `AlreadyExited`. Returns once the run has left `Running`.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: &str) -> Result<CancelOutcome, SupervisorError> {
        let entry = self.entry(run_id).ok_or_else(|| self.not_live_error(run_id))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let cancel_tx = {
            let mut live = entry.lock();
            if live.status != RunStatus::Running {
                return Err(SupervisorError::NotRunning(run_id.to_string()));
            }
            if live.exited {
                debug!(run_id, "cancel after exit ignored");
                return Ok(CancelOutcome::AlreadyExited);
            }
            live.cancel_tx
                .take()
                .ok_or_else(|| SupervisorError::CancelInProgress(run_id.to_string()))?
        };
        info!(run_id, "cancellation requested");

        if cancel_tx.send(CancelRequest { reply: reply_tx }).is_err() {
            return Ok(CancelOutcome::AlreadyExited);
        }
        match reply_rx.await {
            Ok(Termination::AlreadyExited) => Ok(CancelOutcome::AlreadyExited),
            Ok(Termination::Terminated) => Ok(CancelOutcome::Terminated),
            Ok(Termination::Killed) => Ok(CancelOutcome::Killed),
            Ok(Termination::Unkillable) => {
                let pid = entry.lock().pid.unwrap_or_default();
                Err(SupervisorError::CancellationTimeout {
                    run_id: run_id.to_string(),
                    pid,
                })
            }
            // The process exited before the request was picked up.
            Err(_) => Ok(CancelOutcome::AlreadyExited),
        }
    }

    /// Apply a process exit. Writes exactly one terminal marker per run; duplicate or
    /// late notifications are ignored.
    #[instrument(skip(self))]
    pub fn on_process_exited(&self, run_id: &str, exit_code: i32) -> ExitNotification {
        let Some(entry) = self.entry(run_id) else {
            return ExitNotification::Ignored;
        };
        let key = self.inner.credentials.archive_key();
        let (decision, sidecar, job) = {
            let mut live = entry.lock();
            let Some(decision) = decide_exit(
                live.status,
                live.cancel_requested,
                exit_code,
                key.is_some(),
                self.inner.archive_policy,
            ) else {
                debug!(status = %live.status, "duplicate exit notification ignored");
                return ExitNotification::Ignored;
            };

            for stream in [StreamKind::Stdout, StreamKind::Stderr] {
                if let Some(line) = live.assembler(stream).finish() {
                    live.emit_line(&line);
                }
            }
            // Dropping the handle closes the log; later notes reopen it.
            if let Some(mut log) = live.log.take() {
                if let Some(marker) = decision.marker
                    && let Err(err) = log.append_marker(marker)
                {
                    error!(err = %err, "failed to write terminal marker");
                }
                if let Err(err) = log.sync() {
                    warn!(err = %err, "failed to sync run log");
                }
            }

            live.status = decision.status;
            live.exit_code = Some(exit_code);
            live.pid = None;
            live.output = None;
            live.cancel_tx = None;
            let job = match (decision.archive, key) {
                (true, Some(key)) => {
                    live.archival_pending = true;
                    Some(ArchiveJob::new(run_id, &live.record.paths, key))
                }
                _ => None,
            };
            (decision, live.status_record(None), job)
        };

        self.persist(&sidecar);
        if job.is_none() {
            self.retire(run_id);
        }
        entry.lock().publish();
        info!(status = %decision.status, exit_code, "pipeline run finished");
        self.emit(RunEvent::StatusChanged {
            run_id: run_id.to_string(),
            status: decision.status,
        });
        if let Some(job) = job {
            self.spawn_archival(job);
        }
        ExitNotification::Applied(decision.status)
    }

    fn spawn_archival(&self, job: ArchiveJob) {
        let supervisor = self.clone();
        let run_id = job.run_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = supervisor.inner.archiver.archive(job).await;
                    supervisor.on_archive_finished(&run_id, result);
                });
            }
            Err(_) => {
                let result = crate::archival::archive_run_dir(&job, |_| Ok(()));
                self.on_archive_finished(&run_id, result);
            }
        }
    }

    /// Apply the outcome of a post-run archival job.
    #[instrument(skip(self, result))]
    pub fn on_archive_finished(
        &self,
        run_id: &str,
        result: Result<PathBuf, ArchivalError>,
    ) -> ExitNotification {
        let Some(entry) = self.entry(run_id) else {
            return ExitNotification::Ignored;
        };
        let (next, sidecar) = {
            let mut live = entry.lock();
            let Some(next) = decide_archival(live.status, result.is_ok()) else {
                return ExitNotification::Ignored;
            };
            let code = live.exit_code.unwrap_or(-1);
            let detail = match &result {
                Ok(archive) => {
                    let name = archive
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| archive.display().to_string());
                    live.note(&format!(
                        "Run directory archived to {name} (pipeline exit code {code})."
                    ));
                    archive.display().to_string()
                }
                Err(err) => {
                    live.note(&format!(
                        "Archival failed (pipeline exit code {code} preserved): {err}"
                    ));
                    err.to_string()
                }
            };
            live.status = next;
            live.archival_pending = false;
            (next, live.status_record(Some(detail)))
        };

        self.persist(&sidecar);
        self.retire(run_id);
        entry.lock().publish();
        self.emit(RunEvent::StatusChanged {
            run_id: run_id.to_string(),
            status: next,
        });
        match result {
            Ok(_) => info!("run directory archived"),
            Err(err) => {
                error!(err = %err, "archival failed; plaintext run directory kept");
                self.emit(RunEvent::ArchiveFailed {
                    run_id: run_id.to_string(),
                    error: err.to_string(),
                });
            }
        }
        ExitNotification::Applied(next)
    }

    /// Live output lines of a running pipeline. Lines emitted before subscribing are
    /// only in the log.
    pub fn subscribe_output(
        &self,
        run_id: &str,
    ) -> Result<broadcast::Receiver<String>, SupervisorError> {
        let entry = self.entry(run_id).ok_or_else(|| self.not_live_error(run_id))?;
        let live = entry.lock();
        live.output
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| SupervisorError::NotRunning(run_id.to_string()))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Current status: live table first, then the persisted record.
    pub fn status(&self, run_id: &str) -> Result<RunStatus, SupervisorError> {
        if let Some(entry) = self.entry(run_id) {
            return Ok(entry.lock().status);
        }
        self.inner
            .store
            .status_of(run_id)?
            .map(|record| record.status)
            .ok_or_else(|| SupervisorError::UnknownRun(run_id.to_string()))
    }

    /// Snapshot of a run started by this supervisor.
    pub fn snapshot(&self, run_id: &str) -> Option<RunSnapshot> {
        self.entry(run_id).map(|entry| entry.lock().snapshot())
    }

    /// Wait until the run has exited and any archival has finished.
    pub async fn wait_settled(&self, run_id: &str) -> Result<RunSnapshot, SupervisorError> {
        if let Some(entry) = self.entry(run_id) {
            let mut rx = entry.lock().status_tx.subscribe();
            drop(entry);
            if let Ok(snapshot) = rx.wait_for(|snapshot| snapshot.settled).await {
                return Ok(*snapshot);
            }
        }
        let record = self
            .inner
            .store
            .status_of(run_id)?
            .ok_or_else(|| SupervisorError::UnknownRun(run_id.to_string()))?;
        Ok(RunSnapshot {
            status: record.status,
            exit_code: record.exit_code,
            settled: record.status.is_process_terminal(),
        })
    }

    /// Every run known on disk or live in this supervisor.
    pub fn runs(&self) -> Result<Vec<RunSummary>, SupervisorError> {
        let mut ids: BTreeSet<String> = self.inner.store.list_run_ids()?.into_iter().collect();
        ids.extend(self.inner.runs.lock().keys().cloned());

        let mut summaries = Vec::with_capacity(ids.len());
        for run_id in ids {
            let artifacts = self.inner.store.artifact_state(&run_id);
            if let Some(entry) = self.entry(&run_id) {
                let live = entry.lock();
                summaries.push(RunSummary {
                    pipeline: live.record.pipeline.clone(),
                    status: live.status,
                    exit_code: live.exit_code,
                    live: live.status == RunStatus::Running,
                    artifacts,
                    run_id,
                });
                continue;
            }
            if let Some(record) = self.inner.store.status_of(&run_id)? {
                summaries.push(RunSummary {
                    pipeline: record.pipeline,
                    status: record.status,
                    exit_code: record.exit_code,
                    live: false,
                    artifacts,
                    run_id,
                });
            }
        }
        Ok(summaries)
    }

    /// Decrypt an archived run back into its run directory. The archive is kept and the
    /// run status does not change.
    #[instrument(skip(self, credential))]
    pub async fn restore(
        &self,
        run_id: &str,
        credential: &Credential,
    ) -> Result<PathBuf, SupervisorError> {
        validate_run_id(run_id)?;
        self.ensure_settled(run_id)?;
        let paths = self.inner.store.paths(run_id);
        let run_dir = self
            .inner
            .archiver
            .restore(RestoreJob::new(&paths, credential.clone()))
            .await?;
        let archive_name = paths
            .archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let line = format!("Run directory restored from {archive_name}.");
        if let Err(err) = append_to_log(&paths.log_path, &line) {
            warn!(err = %format!("{err:#}"), "failed to record restore in run log");
        }
        self.emit(RunEvent::Restored {
            run_id: run_id.to_string(),
            run_dir: run_dir.clone(),
        });
        Ok(run_dir)
    }

    /// Remove every artifact of a finished run.
    #[instrument(skip(self))]
    pub fn delete_run(&self, run_id: &str) -> Result<(), SupervisorError> {
        self.ensure_settled(run_id)?;
        if self.entry(run_id).is_none() && self.inner.store.status_of(run_id)?.is_none() {
            return Err(SupervisorError::UnknownRun(run_id.to_string()));
        }
        self.inner.runs.lock().remove(run_id);
        self.inner.store.delete_run(run_id)?;
        Ok(())
    }

    /// Cancel every running pipeline (application shutdown).
    pub async fn shutdown(&self) {
        let running: Vec<String> = {
            let runs = self.inner.runs.lock();
            runs.iter()
                .filter(|(_, entry)| entry.lock().status == RunStatus::Running)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut tasks = Vec::with_capacity(running.len());
        for run_id in running {
            let supervisor = self.clone();
            tasks.push(tokio::spawn(async move {
                let outcome = supervisor.cancel_run(&run_id).await;
                (run_id, outcome)
            }));
        }
        for task in tasks {
            match task.await {
                Ok((run_id, Err(err))) => warn!(run_id = %run_id, err = %err, "cancel on shutdown failed"),
                Ok((run_id, Ok(outcome))) => debug!(run_id = %run_id, ?outcome, "cancelled on shutdown"),
                Err(err) => warn!(err = %err, "shutdown task failed"),
            }
        }
    }

    fn ensure_settled(&self, run_id: &str) -> Result<(), SupervisorError> {
        if let Some(entry) = self.entry(run_id)
            && !entry.lock().snapshot().settled
        {
            return Err(SupervisorError::StillRunning(run_id.to_string()));
        }
        Ok(())
    }

    fn not_live_error(&self, run_id: &str) -> SupervisorError {
        match self.inner.store.status_of(run_id) {
            Ok(Some(_)) => SupervisorError::NotRunning(run_id.to_string()),
            _ => SupervisorError::UnknownRun(run_id.to_string()),
        }
    }

    async fn supervise(
        self,
        run_id: String,
        mut child: Child,
        cancel_rx: oneshot::Receiver<CancelRequest>,
        pumps: Vec<JoinHandle<()>>,
    ) {
        let mut reply = None;
        let waited = tokio::select! {
            waited = child.wait() => waited,
            Ok(request) = cancel_rx => {
                if let Ok(Some(status)) = child.try_wait() {
                    let _ = request.reply.send(Termination::AlreadyExited);
                    Ok(status)
                } else {
                    self.record_cancel(&run_id);
                    let (termination, waited) = self.terminate(&run_id, &mut child).await;
                    match waited {
                        Some(waited) => {
                            reply = Some((request.reply, termination));
                            waited
                        }
                        None => {
                            let _ = request.reply.send(Termination::Unkillable);
                            child.wait().await
                        }
                    }
                }
            }
        };
        if let Some(entry) = self.entry(&run_id) {
            entry.lock().exited = true;
        }

        let exit_code = match &waited {
            Ok(status) => exit_code_of(status),
            Err(err) => {
                error!(run_id = %run_id, err = %err, "failed to wait for engine process");
                -1
            }
        };
        drain_pumps(&run_id, pumps).await;
        self.on_process_exited(&run_id, exit_code);
        if let Some((reply, termination)) = reply {
            let _ = reply.send(termination);
        }
    }

    /// The cancel marker goes into the log before any signal is sent.
    fn record_cancel(&self, run_id: &str) {
        let Some(entry) = self.entry(run_id) else {
            return;
        };
        let mut live = entry.lock();
        live.cancel_requested = true;
        let written = match &mut live.log {
            Some(log) => log.append_marker(TerminalMarker::Cancelled),
            None => Err(io::Error::other("run log already closed")),
        };
        if let Err(err) = written {
            warn!(run_id, err = %err, "failed to record cancellation");
        }
    }

    /// Signal escalation. `None` means the process survived SIGKILL.
    async fn terminate(
        &self,
        run_id: &str,
        child: &mut Child,
    ) -> (Termination, Option<io::Result<ExitStatus>>) {
        let pid = child.id();
        self.signal(run_id, child, pid, ProcessSignal::Terminate);
        if let Ok(waited) = tokio::time::timeout(self.inner.grace, child.wait()).await {
            return (Termination::Terminated, Some(waited));
        }

        warn!(run_id, grace_ms = self.inner.grace.as_millis() as u64, "engine ignored SIGTERM, killing");
        self.signal(run_id, child, pid, ProcessSignal::Kill);
        if let Ok(waited) = tokio::time::timeout(self.inner.kill_grace, child.wait()).await {
            return (Termination::Killed, Some(waited));
        }

        error!(run_id, pid = ?pid, "engine survived SIGKILL");
        if let Some(entry) = self.entry(run_id) {
            entry.lock().note(&format!(
                "Process {} did not exit after SIGKILL; manual cleanup required.",
                pid.unwrap_or_default()
            ));
        }
        (Termination::Unkillable, None)
    }

    fn signal(&self, run_id: &str, child: &mut Child, pid: Option<u32>, signal: ProcessSignal) {
        let grouped = match pid {
            Some(pid) => match signal_process_group(pid, signal) {
                Ok(()) => true,
                Err(err) => {
                    warn!(run_id, pid, ?signal, err = %err, "failed to signal process group");
                    false
                }
            },
            None => false,
        };
        if signal == ProcessSignal::Kill || !grouped {
            if let Err(err) = child.start_kill() {
                debug!(run_id, err = %err, "start_kill failed");
            }
        }
    }
}

/// Log and persist the archival outcome of runs found by crash recovery.
fn settle_recovered(store: &RunStore, runs: Vec<RecoveredArchival>) -> anyhow::Result<()> {
    for recovered in runs {
        let (record, archived) = match recovered {
            RecoveredArchival::Interrupted(record) => (record, false),
            RecoveredArchival::Completed(record) => (record, true),
        };
        let Some(next) = decide_archival(record.status, archived) else {
            continue;
        };
        let paths = store.paths(&record.run_id);
        let code = record.exit_code.unwrap_or(-1);
        let (line, detail) = if archived {
            let name = paths
                .archive_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (
                format!("Run directory archived to {name} (pipeline exit code {code})."),
                paths.archive_path.display().to_string(),
            )
        } else {
            let detail = "interrupted before completion".to_string();
            (
                format!("Archival failed (pipeline exit code {code} preserved): {detail}"),
                detail,
            )
        };
        append_to_log(&paths.log_path, &line)?;
        let mut settled = StatusRecord::new(&record.run_id, &record.pipeline, next);
        settled.exit_code = record.exit_code;
        settled.detail = Some(detail);
        store.write_status(&settled)?;
        info!(run_id = %record.run_id, status = %next, "settled interrupted archival");
    }
    Ok(())
}

async fn pump<R: AsyncRead + Unpin>(
    supervisor: Supervisor,
    run_id: String,
    stream: StreamKind,
    mut reader: R,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => supervisor.on_output_available(&run_id, stream, &buf[..n]),
            Err(err) => {
                warn!(run_id = %run_id, ?stream, err = %err, "output stream read failed");
                break;
            }
        }
    }
    supervisor.on_output_closed(&run_id, stream);
}

/// Wait for the pumps to reach EOF. Descendants that escaped the process group can keep
/// a pipe open forever, so the wait is bounded.
async fn drain_pumps(run_id: &str, pumps: Vec<JoinHandle<()>>) {
    let deadline = tokio::time::Instant::now() + PUMP_DRAIN_TIMEOUT;
    for mut pump in pumps {
        if tokio::time::timeout_at(deadline, &mut pump).await.is_err() {
            warn!(run_id, "output still open after exit, detaching");
            pump.abort();
        }
    }
}
