//! End-to-end run lifecycle scenarios against fake engines.
//!
//! Each test launches shell scripts through the real supervisor and checks the
//! on-disk results: run directory, log markers, status sidecar and archives.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use runforge::archival::{ArchiveJob, RestoreJob, archive_run_dir, restore_archive};
use runforge::core::markers::{CANCELLED_LINE, count_terminal_markers};
use runforge::core::types::{RunSnapshot, RunStatus};
use runforge::error::{LaunchError, RestoreError, SupervisorError};
use runforge::io::credentials::{Credential, SessionCredentials};
use runforge::io::crypto::ArchiveKey;
use runforge::io::run_log::read_log;
use runforge::io::run_store::ArtifactState;
use runforge::supervisor::{
    CancelOutcome, ExitNotification, RunEvent, RunRequest, Supervisor,
};
use runforge::test_support::{Sandbox, snapshot_tree};

async fn settle(supervisor: &Supervisor, run_id: &str) -> RunSnapshot {
    tokio::time::timeout(Duration::from_secs(20), supervisor.wait_settled(run_id))
        .await
        .expect("run settles in time")
        .expect("wait settled")
}

async fn wait_for_log_line(supervisor: &Supervisor, run_id: &str, needle: &str) {
    let log_path = supervisor.store().paths(run_id).log_path;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let log = read_log(&log_path).expect("read log");
        if log.lines().any(|line| line == needle) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for '{needle}'");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn private_session() -> Arc<SessionCredentials> {
    Arc::new(SessionCredentials::logged_in(&Credential::new("alice", "s3cret")))
}

#[tokio::test(flavor = "multi_thread")]
async fn run_writes_params_and_logs_output_with_one_marker() {
    let sandbox = Sandbox::new();
    let engine = sandbox.engine_script(
        "engine",
        "echo \"args: $*\"\n\
         test -f params.json && echo in-run-dir\n\
         echo to-stderr >&2\n\
         printf 'no trailing newline'\n\
         exit 0\n",
    );
    let supervisor = sandbox.supervisor(engine);
    let mut events = supervisor.subscribe_events();

    let run_id = supervisor
        .start_run(RunRequest::new("nf-core/demo").param("input", "samples.csv"))
        .await
        .expect("start");
    assert!(run_id.starts_with("demo_"));
    assert!(run_id.ends_with("_run"));

    let snapshot = settle(&supervisor, &run_id).await;
    assert_eq!(snapshot.status, RunStatus::CompletedSuccess);
    assert_eq!(snapshot.exit_code, Some(0));

    let paths = supervisor.store().paths(&run_id);
    assert_eq!(
        fs::read_to_string(&paths.params_path).expect("params"),
        "{\n  \"input\": \"samples.csv\"\n}\n"
    );

    let log = read_log(&paths.log_path).expect("log");
    assert!(log.starts_with("Running pipeline: nf-core/demo\nConfig: {\n"));
    assert!(log.contains(&format!(
        "args: run nf-core/demo -profile docker -params-file {}\n",
        paths.params_path.display()
    )));
    assert!(log.contains("in-run-dir\n"));
    assert!(log.contains("to-stderr\n"));
    assert!(log.contains("no trailing newline\n"));
    assert!(log.ends_with("Pipeline run completed <<exit-code:0>>.\n"));
    assert_eq!(count_terminal_markers(&log), 1);

    let sidecar = supervisor
        .store()
        .load_status(&run_id)
        .expect("load status")
        .expect("sidecar");
    assert_eq!(sidecar.status, RunStatus::CompletedSuccess);
    assert_eq!(sidecar.exit_code, Some(0));
    assert_eq!(supervisor.store().artifact_state(&run_id), ArtifactState::Plaintext);

    assert_eq!(
        events.recv().await.expect("event"),
        RunEvent::Started {
            run_id: run_id.clone(),
            pipeline: "nf-core/demo".to_string()
        }
    );
    assert_eq!(
        events.recv().await.expect("event"),
        RunEvent::StatusChanged {
            run_id: run_id.clone(),
            status: RunStatus::CompletedSuccess
        }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_exit_notifications_are_ignored() {
    let sandbox = Sandbox::new();
    let supervisor = sandbox.supervisor(sandbox.engine_script("fail", "echo boom\nexit 3\n"));
    let run_id = supervisor
        .start_run(RunRequest::new("demo"))
        .await
        .expect("start");
    let snapshot = settle(&supervisor, &run_id).await;
    assert_eq!(snapshot.status, RunStatus::CompletedFailure);
    assert_eq!(snapshot.exit_code, Some(3));

    assert_eq!(
        supervisor.on_process_exited(&run_id, 0),
        ExitNotification::Ignored
    );
    assert_eq!(
        supervisor.on_process_exited(&run_id, 3),
        ExitNotification::Ignored
    );

    let log = read_log(&supervisor.store().paths(&run_id).log_path).expect("log");
    assert_eq!(count_terminal_markers(&log), 1);
    assert!(log.ends_with("Pipeline run completed <<exit-code:3>>.\n"));
    assert_eq!(
        supervisor.status(&run_id).expect("status"),
        RunStatus::CompletedFailure
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn rapid_starts_get_distinct_ids() {
    let sandbox = Sandbox::new();
    let supervisor = sandbox.supervisor(sandbox.engine_script("quick", "exit 0\n"));
    let (a, b, c) = tokio::join!(
        supervisor.start_run(RunRequest::new("nf-core/demo")),
        supervisor.start_run(RunRequest::new("nf-core/demo")),
        supervisor.start_run(RunRequest::new("nf-core/demo")),
    );
    let mut ids = vec![a.expect("a"), b.expect("b"), c.expect("c")];
    for id in &ids {
        settle(&supervisor, id).await;
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    for id in &ids {
        assert!(supervisor.store().paths(id).run_dir.is_dir());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn output_subscribers_receive_lines_until_exit() {
    let sandbox = Sandbox::new();
    let supervisor = sandbox.supervisor(
        sandbox.engine_script("slow", "sleep 0.5\necho one\necho two\n"),
    );
    let run_id = supervisor
        .start_run(RunRequest::new("demo"))
        .await
        .expect("start");
    let mut output = supervisor.subscribe_output(&run_id).expect("subscribe");

    assert_eq!(output.recv().await.expect("line"), "one");
    assert_eq!(output.recv().await.expect("line"), "two");
    assert!(output.recv().await.is_err());
    settle(&supervisor, &run_id).await;
    assert!(matches!(
        supervisor.subscribe_output(&run_id),
        Err(SupervisorError::NotRunning(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_escalates_to_kill_when_sigterm_is_ignored() {
    let sandbox = Sandbox::new();
    let supervisor = sandbox.supervisor(sandbox.engine_script(
        "stubborn",
        "trap '' TERM\necho waiting\nexec sleep 30\n",
    ));
    let run_id = supervisor
        .start_run(RunRequest::new("demo"))
        .await
        .expect("start");
    wait_for_log_line(&supervisor, &run_id, "waiting").await;

    let started = Instant::now();
    let outcome = supervisor.cancel_run(&run_id).await.expect("cancel");
    let elapsed = started.elapsed();
    assert_eq!(outcome, CancelOutcome::Killed);
    assert!(elapsed < Duration::from_secs(4), "cancel took {elapsed:?}");
    assert_eq!(
        supervisor.status(&run_id).expect("status"),
        RunStatus::Cancelled
    );

    let log = read_log(&supervisor.store().paths(&run_id).log_path).expect("log");
    assert_eq!(count_terminal_markers(&log), 1);
    let waiting = log.find("waiting\n").expect("waiting line");
    let cancelled = log.find(CANCELLED_LINE).expect("cancel marker");
    assert!(waiting < cancelled);
    assert!(!log.contains("<<exit-code:"));

    assert!(matches!(
        supervisor.cancel_run(&run_id).await,
        Err(SupervisorError::NotRunning(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_terminates_cooperative_engine() {
    let sandbox = Sandbox::new();
    let supervisor =
        sandbox.supervisor(sandbox.engine_script("polite", "echo ready\nsleep 30\n"));
    let run_id = supervisor
        .start_run(RunRequest::new("demo"))
        .await
        .expect("start");
    wait_for_log_line(&supervisor, &run_id, "ready").await;

    let (first, second) = tokio::join!(supervisor.cancel_run(&run_id), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.cancel_run(&run_id).await
    });
    assert_eq!(first.expect("cancel"), CancelOutcome::Terminated);
    assert!(matches!(
        second,
        Err(SupervisorError::CancelInProgress(_)) | Err(SupervisorError::NotRunning(_))
    ));

    let snapshot = settle(&supervisor, &run_id).await;
    assert_eq!(snapshot.status, RunStatus::Cancelled);
    let log = read_log(&supervisor.store().paths(&run_id).log_path).expect("log");
    assert_eq!(count_terminal_markers(&log), 1);
    // Cancelled runs keep their plaintext output even in public mode.
    assert_eq!(
        supervisor.store().artifact_state(&run_id),
        ArtifactState::Plaintext
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_after_exit_keeps_the_exit_status() {
    let sandbox = Sandbox::new();
    // The engine exits at once but a straggler holds stdout open for a while.
    let supervisor = sandbox.supervisor(sandbox.engine_script(
        "straggler",
        "echo done\n(sleep 2; echo late) &\nexit 0\n",
    ));
    let run_id = supervisor
        .start_run(RunRequest::new("demo"))
        .await
        .expect("start");
    wait_for_log_line(&supervisor, &run_id, "done").await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        supervisor.status(&run_id).expect("status"),
        RunStatus::Running
    );

    let outcome = supervisor.cancel_run(&run_id).await.expect("cancel");
    assert_eq!(outcome, CancelOutcome::AlreadyExited);

    let snapshot = settle(&supervisor, &run_id).await;
    assert_eq!(snapshot.status, RunStatus::CompletedSuccess);
    assert_eq!(snapshot.exit_code, Some(0));
    let log = read_log(&supervisor.store().paths(&run_id).log_path).expect("log");
    assert!(!log.contains(CANCELLED_LINE));
    assert_eq!(count_terminal_markers(&log), 1);
    assert!(log.ends_with("Pipeline run completed <<exit-code:0>>.\n"));
}

#[cfg(target_os = "linux")]
fn open_handles_to(path: &std::path::Path) -> usize {
    let target = fs::canonicalize(path).expect("canonical log path");
    fs::read_dir("/proc/self/fd")
        .expect("fd dir")
        .filter_map(|entry| fs::read_link(entry.ok()?.path()).ok())
        .filter(|link| *link == target)
        .count()
}

#[tokio::test(flavor = "multi_thread")]
async fn settled_runs_leave_the_live_table() {
    let sandbox = Sandbox::new();
    let supervisor = sandbox.supervisor(sandbox.engine_script("quick", "echo hi\nexit 2\n"));
    let mut ids = Vec::new();
    for _ in 0..3 {
        let run_id = supervisor
            .start_run(RunRequest::new("demo"))
            .await
            .expect("start");
        settle(&supervisor, &run_id).await;
        ids.push(run_id);
    }

    for run_id in &ids {
        assert!(supervisor.snapshot(run_id).is_none());
        assert_eq!(
            supervisor.status(run_id).expect("status"),
            RunStatus::CompletedFailure
        );
        let snapshot = supervisor.wait_settled(run_id).await.expect("settled");
        assert_eq!(snapshot.exit_code, Some(2));
        #[cfg(target_os = "linux")]
        assert_eq!(
            open_handles_to(&supervisor.store().paths(run_id).log_path),
            0
        );
    }
    let runs = supervisor.runs().expect("runs");
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|run| !run.live));
}

#[tokio::test(flavor = "multi_thread")]
async fn private_failed_run_is_archived_and_restorable() {
    let sandbox = Sandbox::new();
    let engine = sandbox.engine_script("private", "echo out > result.txt\necho done\nexit 1\n");
    let supervisor = sandbox.supervisor_with(sandbox.options(engine), private_session());

    let run_id = supervisor
        .start_run(RunRequest::new("demo"))
        .await
        .expect("start");
    let snapshot = settle(&supervisor, &run_id).await;
    assert_eq!(snapshot.status, RunStatus::Archived);
    assert_eq!(snapshot.exit_code, Some(1));

    let paths = supervisor.store().paths(&run_id);
    assert!(!paths.run_dir.exists());
    assert!(!paths.tarball_path.exists());
    assert!(paths.archive_path.is_file());
    assert_eq!(
        supervisor.store().artifact_state(&run_id),
        ArtifactState::Encrypted
    );

    let log = read_log(&paths.log_path).expect("log");
    assert_eq!(count_terminal_markers(&log), 1);
    assert!(log.contains("Pipeline run completed <<exit-code:1>>.\n"));
    assert!(log.contains(&format!(
        "Run directory archived to {run_id}.tar.gz.enc (pipeline exit code 1).\n"
    )));
    let sidecar = supervisor
        .store()
        .load_status(&run_id)
        .expect("load")
        .expect("sidecar");
    assert_eq!(sidecar.status, RunStatus::Archived);
    assert_eq!(sidecar.exit_code, Some(1));

    let err = supervisor
        .restore(&run_id, &Credential::new("alice", "wrong"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::Restore(RestoreError::CredentialMismatch { .. })
    ));
    assert!(!paths.run_dir.exists());

    let restored = supervisor
        .restore(&run_id, &Credential::new("alice", "s3cret"))
        .await
        .expect("restore");
    assert_eq!(
        fs::read_to_string(restored.join("result.txt")).expect("result"),
        "out\n"
    );
    assert!(restored.join("params.json").is_file());
    assert!(paths.archive_path.is_file());
    assert_eq!(
        supervisor.status(&run_id).expect("status"),
        RunStatus::Archived
    );
    assert_eq!(supervisor.store().artifact_state(&run_id), ArtifactState::Both);
    let log = read_log(&paths.log_path).expect("log");
    assert!(log.ends_with(&format!(
        "Run directory restored from {run_id}.tar.gz.enc.\n"
    )));
}

#[tokio::test(flavor = "multi_thread")]
async fn unwritable_archive_destination_keeps_plaintext() {
    let sandbox = Sandbox::new();
    let blocker = sandbox.root().join("archive-is-a-file");
    fs::write(&blocker, "not a directory").expect("write blocker");

    let engine = sandbox.engine_script("ok", "echo data > out.txt\nexit 0\n");
    let mut options = sandbox.options(engine);
    options.folders.archive_dir = blocker;
    let supervisor = sandbox.supervisor_with(options, private_session());
    let mut events = supervisor.subscribe_events();

    let run_id = supervisor
        .start_run(RunRequest::new("demo"))
        .await
        .expect("start");
    let snapshot = settle(&supervisor, &run_id).await;
    assert_eq!(snapshot.status, RunStatus::ArchiveFailed);
    assert_eq!(snapshot.exit_code, Some(0));

    let paths = supervisor.store().paths(&run_id);
    assert_eq!(
        fs::read_to_string(paths.run_dir.join("out.txt")).expect("plaintext kept"),
        "data\n"
    );
    let log = read_log(&paths.log_path).expect("log");
    assert_eq!(count_terminal_markers(&log), 1);
    assert!(log.contains("Archival failed (pipeline exit code 0 preserved): "));

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let RunEvent::ArchiveFailed { run_id: id, .. } = event {
            assert_eq!(id, run_id);
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test(flavor = "multi_thread")]
async fn spawn_failure_leaves_no_orphan_record() {
    let sandbox = Sandbox::new();
    let supervisor =
        sandbox.supervisor(vec!["/nonexistent/runforge-engine".to_string()]);
    let err = supervisor
        .start_run(RunRequest::new("demo"))
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::Spawn { .. }));

    let folders = sandbox.folders();
    assert_eq!(fs::read_dir(&folders.runs_dir).expect("runs").count(), 0);
    assert_eq!(fs::read_dir(&folders.logs_dir).expect("logs").count(), 0);
    assert!(supervisor.runs().expect("runs").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_refuses_running_runs() {
    let sandbox = Sandbox::new();
    let supervisor =
        sandbox.supervisor(sandbox.engine_script("wait", "echo up\nsleep 30\n"));
    let run_id = supervisor
        .start_run(RunRequest::new("demo"))
        .await
        .expect("start");
    assert!(matches!(
        supervisor.delete_run(&run_id),
        Err(SupervisorError::StillRunning(_))
    ));

    supervisor.shutdown().await;
    let snapshot = settle(&supervisor, &run_id).await;
    assert_eq!(snapshot.status, RunStatus::Cancelled);

    supervisor.delete_run(&run_id).expect("delete");
    assert_eq!(
        supervisor.store().artifact_state(&run_id),
        ArtifactState::Missing
    );
    assert!(matches!(
        supervisor.status(&run_id),
        Err(SupervisorError::UnknownRun(_))
    ));
}

#[test]
fn archive_round_trip_is_byte_identical() {
    let sandbox = Sandbox::new();
    let run_dir = sandbox.root().join("runs/demo_run");
    fs::create_dir_all(run_dir.join("work/a1/b2")).expect("mkdir");
    fs::write(run_dir.join("params.json"), "{\n  \"input\": \"x\"\n}\n").expect("write");
    fs::write(run_dir.join("work/a1/b2/.command.log"), "line\n".repeat(1000)).expect("write");
    let binary: Vec<u8> = (0..=255u8).cycle().take(3 * 1024 * 1024 + 7).collect();
    fs::write(run_dir.join("work/a1/data.bin"), &binary).expect("write");
    let before = snapshot_tree(&run_dir);

    let job = ArchiveJob {
        run_id: "demo_run".to_string(),
        run_dir: run_dir.clone(),
        tarball_path: sandbox.root().join("runs/demo_run.tar.gz"),
        archive_path: sandbox.root().join("runs/demo_run.tar.gz.enc"),
        key: ArchiveKey::derive("alice", "s3cret"),
    };
    archive_run_dir(&job, |_| Ok(())).expect("archive");
    assert!(!run_dir.exists());

    restore_archive(&RestoreJob {
        archive_path: job.archive_path.clone(),
        tarball_path: job.tarball_path.clone(),
        restore_dir: run_dir.clone(),
        credential: Credential::new("alice", "s3cret"),
    })
    .expect("restore");
    assert_eq!(snapshot_tree(&run_dir), before);
}
