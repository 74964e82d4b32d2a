//! Process Runner
//!
//! Launches one external tool with stdout and stderr joined onto a single pipe,
//! so the lines arrive in exactly the order the tool wrote them. Each child is
//! put in its own process group; termination signals go to the whole group so
//! compilers spawned by `make`/`ninja` stop as well.

use crate::command::CommandSpec;
use crate::error::{ProcessError, ProcessResult};
use crate::mux::LogSource;
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Time between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Spawns subprocesses with a shared base environment.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    base_env: Vec<(String, String)>,
}

impl ProcessRunner {
    /// Runner that only adds each command's own environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner adding `env` to every child (e.g. the job server's `MAKEFLAGS`).
    pub fn with_env(env: Vec<(String, String)>) -> Self {
        Self { base_env: env }
    }

    /// Start `spec`.
    ///
    /// Nothing is started when this fails.
    pub fn spawn(&self, spec: &CommandSpec) -> ProcessResult<RunningProcess> {
        let program = spec.program().ok_or(ProcessError::EmptyCommand)?;

        let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
        let stderr = write.try_clone()?;

        let mut command = Command::new(program);
        command
            .args(&spec.argv[1..])
            .envs(self.base_env.iter().map(|(k, v)| (k, v)))
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(write))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &spec.workdir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| ProcessError::Launch {
            program: program.to_string(),
            source,
        })?;
        // Our copies of the write end must be gone, or end-of-file never arrives.
        drop(command);

        let pid = child.id().map(|id| Pid::from_raw(id as i32));
        debug!(pid = ?pid, command = %spec.display(), "Spawned process");

        Ok(RunningProcess {
            child,
            pid,
            output: LineReader::new(pipe::Receiver::from_owned_fd(read)?),
            timeout: spec.timeout,
            command: spec.display(),
        })
    }
}

/// Splits the merged output into lines.
#[derive(Debug)]
struct LineReader {
    reader: BufReader<pipe::Receiver>,
    pending: Vec<u8>,
    eof: bool,
}

impl LineReader {
    fn new(receiver: pipe::Receiver) -> Self {
        Self {
            reader: BufReader::new(receiver),
            pending: Vec::new(),
            eof: false,
        }
    }

    /// Cancel safe: partial reads stay in `pending` for the next call.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        if self.eof {
            return Ok(None);
        }

        let read = self.reader.read_until(b'\n', &mut self.pending).await?;
        if read == 0 {
            self.eof = true;
            if self.pending.is_empty() {
                return Ok(None);
            }
        }

        let mut bytes = std::mem::take(&mut self.pending);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// A started subprocess whose output has not been fully consumed yet.
#[derive(Debug)]
pub struct RunningProcess {
    child: Child,
    pid: Option<Pid>,
    output: LineReader,
    timeout: Option<Duration>,
    command: String,
}

impl RunningProcess {
    /// OS process id.
    pub fn pid(&self) -> Option<u32> {
        self.pid.map(|pid| pid.as_raw() as u32)
    }

    /// Next merged output line, or `None` once the output is exhausted.
    pub async fn next_line(&mut self) -> ProcessResult<Option<String>> {
        Ok(self.output.next_line().await?)
    }

    /// Consume remaining output and wait for exit.
    pub async fn wait(mut self) -> ProcessResult<i32> {
        while self.output.next_line().await?.is_some() {}
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }

    /// Drive the process to completion, handing every line to `on_line`.
    ///
    /// When `cancel` fires or the command's timeout expires the group gets
    /// SIGTERM, then SIGKILL after [`TERMINATE_GRACE`]. Output produced before
    /// and during shutdown is still delivered.
    pub async fn supervise<F>(
        mut self,
        cancel: &CancellationToken,
        mut on_line: F,
    ) -> ProcessResult<Supervised>
    where
        F: FnMut(String),
    {
        let started = Instant::now();
        let deadline = self.timeout.map(|t| started + t);
        let mut stopper = Stopper::new(self.pid);

        loop {
            tokio::select! {
                line = self.output.next_line() => match line? {
                    Some(line) => on_line(line),
                    None => break,
                },
                _ = cancel.cancelled(), if stopper.reason.is_none() => {
                    stopper.begin(StopReason::Cancelled, &self.command);
                }
                _ = sleep_until(deadline), if stopper.reason.is_none() => {
                    stopper.begin(StopReason::TimedOut, &self.command);
                }
                _ = sleep_until(stopper.kill_at), if stopper.kill_at.is_some() => {
                    stopper.escalate(&self.command);
                }
            }
        }

        let status = loop {
            tokio::select! {
                status = self.child.wait() => break status?,
                _ = cancel.cancelled(), if stopper.reason.is_none() => {
                    stopper.begin(StopReason::Cancelled, &self.command);
                }
                _ = sleep_until(deadline), if stopper.reason.is_none() => {
                    stopper.begin(StopReason::TimedOut, &self.command);
                }
                _ = sleep_until(stopper.kill_at), if stopper.kill_at.is_some() => {
                    stopper.escalate(&self.command);
                }
            }
        };

        Ok(Supervised {
            exit_code: exit_code(status),
            stopped: stopper.reason,
            duration: started.elapsed(),
        })
    }
}

/// Why a process was stopped from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The run was cancelled.
    Cancelled,
    /// The command exceeded its timeout.
    TimedOut,
}

/// Result of [`RunningProcess::supervise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Supervised {
    /// Exit code, or `128 + signal`.
    pub exit_code: i32,
    /// Set when we stopped the process ourselves.
    pub stopped: Option<StopReason>,
    /// Wall-clock time from supervision start to exit.
    pub duration: Duration,
}

struct Stopper {
    pid: Option<Pid>,
    reason: Option<StopReason>,
    kill_at: Option<Instant>,
}

impl Stopper {
    fn new(pid: Option<Pid>) -> Self {
        Self {
            pid,
            reason: None,
            kill_at: None,
        }
    }

    fn begin(&mut self, reason: StopReason, command: &str) {
        debug!(?reason, command, "Terminating process");
        self.reason = Some(reason);
        self.kill_at = Some(Instant::now() + TERMINATE_GRACE);
        signal_group(self.pid, Signal::SIGTERM);
    }

    fn escalate(&mut self, command: &str) {
        warn!(command, "Process ignored SIGTERM, killing it");
        self.kill_at = None;
        signal_group(self.pid, Signal::SIGKILL);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn signal_group(pid: Option<Pid>, signal: Signal) {
    let Some(pid) = pid else {
        return;
    };
    match killpg(pid, signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(errno) => {
            warn!(pid = pid.as_raw(), %signal, "Failed to signal process group: {}", errno)
        }
    }
}

/// Process exit code, or `128 + signal` when killed by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// What happened to one command whose output went into a log source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Exit code, or `128 + signal`.
    pub exit_code: i32,
    /// A fatal diagnostic was printed, whatever the exit code.
    pub fatal_diagnostic: bool,
    /// Stopped because the run was cancelled.
    pub cancelled: bool,
    /// Stopped because the command's timeout expired.
    pub timed_out: bool,
    /// Wall-clock run time.
    pub duration: Duration,
}

impl ProcessOutcome {
    /// Clean zero exit with no fatal diagnostic.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.fatal_diagnostic && !self.cancelled && !self.timed_out
    }
}

/// Run `process` to completion with its output classified into `source`.
pub async fn run_logged(
    process: RunningProcess,
    source: &mut LogSource,
    cancel: &CancellationToken,
) -> ProcessResult<ProcessOutcome> {
    let supervised = process
        .supervise(cancel, |line| {
            source.emit(line);
        })
        .await?;

    Ok(ProcessOutcome {
        exit_code: supervised.exit_code,
        fatal_diagnostic: source.saw_fatal(),
        cancelled: supervised.stopped == Some(StopReason::Cancelled),
        timed_out: supervised.stopped == Some(StopReason::TimedOut),
        duration: supervised.duration,
    })
}
