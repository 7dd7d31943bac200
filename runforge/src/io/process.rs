//! Child process helpers: bounded short-lived commands and process-group signals.

use std::io::{self, Read};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Bytes kept from one output stream, plus how many were dropped past the limit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Result of a bounded engine query.
#[derive(Debug)]
pub struct QueryOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    /// The query hit its deadline and was killed.
    pub timed_out: bool,
}

/// Run a short-lived command to completion or until `timeout`, whichever comes first.
///
/// Both pipes are drained on their own threads while the child runs, so a chatty child
/// can never block on a full pipe. At most `limit` bytes per stream are kept.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_ms = timeout.as_millis() as u64))]
pub fn run_bounded(mut cmd: Command, timeout: Duration, limit: usize) -> Result<QueryOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("spawn query process")?;
    let (stdout, stderr) = drain_pipes(&mut child, limit)?;

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for query")? {
        Some(status) => (status, false),
        None => {
            warn!("query exceeded its deadline, killing");
            child.kill().context("kill query process")?;
            (child.wait().context("reap query process")?, true)
        }
    };

    let stdout = collect(stdout, "stdout")?;
    let stderr = collect(stderr, "stderr")?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "query output truncated"
        );
    }
    debug!(code = ?status.code(), timed_out, "query finished");
    Ok(QueryOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

type Drain = JoinHandle<io::Result<Captured>>;

fn drain_pipes(child: &mut Child, limit: usize) -> Result<(Drain, Drain)> {
    let stdout: ChildStdout = child.stdout.take().context("stdout not piped")?;
    let stderr: ChildStderr = child.stderr.take().context("stderr not piped")?;
    Ok((
        thread::spawn(move || capture(stdout, limit)),
        thread::spawn(move || capture(stderr, limit)),
    ))
}

fn collect(handle: Drain, stream: &str) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("{stream} reader panicked"))?
        .with_context(|| format!("read query {stream}"))
}

/// Read `reader` to EOF, keeping the first `limit` bytes.
fn capture(mut reader: impl Read, limit: usize) -> io::Result<Captured> {
    let mut out = Captured::default();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(out),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        let room = limit.saturating_sub(out.bytes.len()).min(n);
        out.bytes.extend_from_slice(&chunk[..room]);
        out.dropped += n - room;
    }
}

/// Exit code as recorded in run logs: the code itself, `128 + signal` for a signal
/// death, `-1` when neither is known.
pub fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Signals the supervisor sends to an engine's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Terminate,
    Kill,
}

/// Signal every process in the group led by `pid`.
///
/// A group that no longer exists is not an error.
#[cfg(unix)]
pub fn signal_process_group(pid: u32, signal: ProcessSignal) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let signal = match signal {
        ProcessSignal::Terminate => Signal::SIGTERM,
        ProcessSignal::Kill => Signal::SIGKILL,
    };
    let pgid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!(pid, "process group already gone");
            Ok(())
        }
        Err(errno) => Err(io::Error::from(errno)),
    }
}

/// Without process groups only the direct child can be addressed; the caller falls
/// back to `Child::start_kill`.
#[cfg(not(unix))]
pub fn signal_process_group(_pid: u32, _signal: ProcessSignal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are not supported on this platform",
    ))
}
