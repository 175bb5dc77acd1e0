//! Run an external diagnostic program with a hard time limit.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long the pipes may stay open once the program itself has exited.
const DRAIN_AFTER_EXIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Exited on its own with a non-zero code.
    Exited { code: i32 },
    /// Terminated by a signal it did not receive from us.
    Signalled { signal: i32 },
    /// Killed after exceeding the time limit.
    TimedOut,
    /// Killed because the service is shutting down.
    Cancelled,
    /// The program could not be started at all.
    SpawnFailed { kind: io::ErrorKind },
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Interleaved stdout and stderr, truncated at the runner's output cap.
    pub output: Vec<u8>,
    pub status: RunStatus,
    pub elapsed: Duration,
}

impl RunOutput {
    pub fn ok(&self) -> bool { self.status == RunStatus::Success }

    /// Whether the process ran at all, so its output describes what happened.
    pub fn started(&self) -> bool {
        !matches!(self.status, RunStatus::SpawnFailed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
    max_output_bytes: usize,
}

enum Outcome {
    Finished(ExitStatus),
    WaitFailed(io::Error),
    TimedOut,
    Cancelled,
}

impl CommandRunner {
    pub fn new(timeout: Duration, max_output_bytes: usize) -> Self {
        CommandRunner { timeout, max_output_bytes }
    }

    pub fn timeout(&self) -> Duration { self.timeout }

    /// Spawn `program` with `args` (no shell), capture combined output until it
    /// exits, and kill it if it outlives the time limit or `cancel` fires.
    /// The program leads its own process group and kills hit the whole group,
    /// so helpers it forked die with it. A killed child is always waited on
    /// before returning.
    pub async fn run(&self, program: &str, args: &[String], cancel: &CancellationToken) -> RunOutput {
        let started = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(program, error = %e, "failed to start diagnostic");
                return RunOutput { output: Vec::new(), status: RunStatus::SpawnFailed { kind: e.kind() }, elapsed: started.elapsed() };
            }
        };
        let pid = child.id();
        debug!(program, ?pid, ?args, "spawned diagnostic");

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return RunOutput { output: Vec::new(), status: RunStatus::SpawnFailed { kind: io::ErrorKind::BrokenPipe }, elapsed: started.elapsed() };
        };

        let mut output = Vec::new();
        let cap = self.max_output_bytes;
        let outcome = tokio::select! {
            res = timeout(self.timeout, wait_and_drain(&mut child, stdout, stderr, &mut output, cap, pid)) => match res {
                Ok(Ok(status)) => Outcome::Finished(status),
                Ok(Err(e)) => Outcome::WaitFailed(e),
                Err(_) => Outcome::TimedOut,
            },
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let status = match outcome {
            Outcome::Finished(status) => classify(program, pid, status),
            Outcome::WaitFailed(e) => {
                warn!(program, ?pid, error = %e, "lost track of diagnostic process");
                reap(&mut child, program, pid).await;
                RunStatus::Exited { code: -1 }
            }
            Outcome::TimedOut => {
                warn!(program, ?pid, timeout = ?self.timeout, "diagnostic timed out, killing");
                reap(&mut child, program, pid).await;
                RunStatus::TimedOut
            }
            Outcome::Cancelled => {
                warn!(program, ?pid, "diagnostic cancelled by shutdown, killing");
                reap(&mut child, program, pid).await;
                RunStatus::Cancelled
            }
        };
        RunOutput { output, status, elapsed: started.elapsed() }
    }
}

/// Wait for the child and read its pipes at the same time. Once the child
/// has exited, anything still holding the pipes gets [`DRAIN_AFTER_EXIT`]
/// before its group is killed.
async fn wait_and_drain(
    child: &mut Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    buf: &mut Vec<u8>,
    cap: usize,
    pid: Option<u32>,
) -> io::Result<ExitStatus> {
    let drain = collect(stdout, stderr, buf, cap);
    tokio::pin!(drain);
    let exited = tokio::select! {
        r = &mut drain => {
            r?;
            None
        }
        s = child.wait() => Some(s?),
    };
    let Some(status) = exited else {
        return child.wait().await;
    };
    match timeout(DRAIN_AFTER_EXIT, &mut drain).await {
        Ok(r) => r?,
        Err(_) => {
            debug!(?pid, "pipes still open after exit, killing process group");
            kill_group(pid);
            if timeout(DRAIN_AFTER_EXIT, &mut drain).await.is_err() {
                warn!(?pid, "pipes still open after killing process group");
            }
        }
    }
    Ok(status)
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else { return };
    // SAFETY: kill(2) takes no pointers. The child was spawned as leader of
    // its own group, so a negative pid addresses exactly that group.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %io::Error::last_os_error(), "process group kill failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn reap(child: &mut Child, program: &str, pid: Option<u32>) {
    kill_group(pid);
    if let Err(e) = child.start_kill() {
        debug!(program, ?pid, error = %e, "kill failed, process may have exited");
    }
    if let Err(e) = child.wait().await {
        warn!(program, ?pid, error = %e, "failed to reap killed process");
    }
}

fn classify(program: &str, pid: Option<u32>, status: ExitStatus) -> RunStatus {
    if status.success() { return RunStatus::Success; }
    if let Some(code) = status.code() {
        warn!(program, ?pid, code, "diagnostic exited with non-zero status");
        return RunStatus::Exited { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            warn!(program, ?pid, signal, "diagnostic was signalled");
            return RunStatus::Signalled { signal };
        }
    }
    warn!(program, ?pid, %status, "diagnostic exited abnormally");
    RunStatus::Exited { code: -1 }
}

fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) {
    let room = cap.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

// Both pipes are drained to EOF even past the cap so the child never blocks on a full pipe.
async fn collect(mut out: ChildStdout, mut err: ChildStderr, buf: &mut Vec<u8>, cap: usize) -> io::Result<()> {
    let mut ob = [0u8; 4096];
    let mut eb = [0u8; 4096];
    let (mut out_open, mut err_open) = (true, true);
    while out_open || err_open {
        tokio::select! {
            r = out.read(&mut ob), if out_open => match r? {
                0 => out_open = false,
                n => append_capped(buf, &ob[..n], cap),
            },
            r = err.read(&mut eb), if err_open => match r? {
                0 => err_open = false,
                n => append_capped(buf, &eb[..n], cap),
            },
        }
    }
    Ok(())
}
