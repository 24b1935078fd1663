//! External process execution.
//!
//! [`ProcessRunner`] is the seam between the engine and the operating
//! system: backends describe *what* to run as a [`CommandSpec`], a runner
//! decides *how*. [`SystemRunner`] is the real implementation:
//!
//! - Spawns the tool in a new process group (death pact via `process_guard`)
//! - Registers the PID with `ChildRegistry::global()` for signal cleanup
//! - Drains stdout/stderr on reader threads so a chatty plan never blocks
//! - Kills the whole group on timeout or cancellation, and sweeps the
//!   group once the tool exits so no descendant outlives the run
//!
//! The child is owned by a `ChildGuard`, so it is reaped and unregistered
//! on every exit path. If the harness itself dies, the parent-death signal
//! takes the tool down with it.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::process_guard::{ChildRegistry, CommandProcessGroup, signal_group_or_process, terminate_group};

/// A fully resolved external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the process.
    pub cwd: PathBuf,
    /// Extra environment on top of the inherited one.
    pub env: Vec<(String, String)>,
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Output of one process execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl InvocationResult {
    /// Exit code zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Text inspected by the classifier: stderr, then stdout.
    pub fn error_text(&self) -> String {
        match (self.stderr.trim().is_empty(), self.stdout.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stderr, self.stdout),
            (false, true) => self.stderr.clone(),
            (true, _) => self.stdout.clone(),
        }
    }

    /// One-line failure summary for reports.
    pub fn failure_summary(&self) -> String {
        let code = match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        let detail = last_meaningful_line(&self.stderr)
            .or_else(|| last_meaningful_line(&self.stdout))
            .unwrap_or("no output");
        format!("{}: {}", code, detail)
    }
}

/// Error lines start with `Error:`; prefer those, else the last line.
fn last_meaningful_line(text: &str) -> Option<&str> {
    let all: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    all.iter()
        .find(|l| l.starts_with("Error:") || l.starts_with("ERROR"))
        .or_else(|| all.last())
        .copied()
}

/// Shared flag a caller flips to abort running test cases.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation.
    /// Returns false if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(25);
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLICE.min(deadline - now));
        }
    }
}

/// Per-invocation limits.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel: CancelToken,
    /// Time limit of one attempt.
    pub timeout: Option<Duration>,
    /// Absolute end of the current attempt. Without one, each command
    /// gets the full `timeout` from its own start.
    pub deadline: Option<Instant>,
}

impl RunControl {
    /// Pin `timeout` to a deadline shared by every command of the attempt
    /// starting now.
    pub fn start_attempt(&self) -> Self {
        Self {
            cancel: self.cancel.clone(),
            timeout: self.timeout,
            deadline: self.timeout.map(|limit| Instant::now() + limit),
        }
    }

    fn deadline_from(&self, start: Instant) -> Option<Instant> {
        self.deadline.or_else(|| self.timeout.map(|limit| start + limit))
    }

    fn timed_out(&self, command: &CommandSpec, start: Instant) -> HarnessError {
        HarnessError::TimedOut {
            binary: command.program.clone(),
            after: self.timeout.unwrap_or_else(|| start.elapsed()),
        }
    }
}

/// Runs external commands for a backend.
pub trait ProcessRunner: Send + Sync {
    /// Run `command` to completion.
    ///
    /// # Errors
    ///
    /// - `Launch` if the process cannot be started
    /// - `TimedOut` / `Cancelled` if it was killed by `control`
    ///
    /// A non-zero exit is NOT an error; it is returned for classification.
    fn run(&self, command: &CommandSpec, control: &RunControl) -> Result<InvocationResult>;
}

impl<R: ProcessRunner + ?Sized> ProcessRunner for &R {
    fn run(&self, command: &CommandSpec, control: &RunControl) -> Result<InvocationResult> {
        (**self).run(command, control)
    }
}

impl<R: ProcessRunner + ?Sized> ProcessRunner for Arc<R> {
    fn run(&self, command: &CommandSpec, control: &RunControl) -> Result<InvocationResult> {
        (**self).run(command, control)
    }
}

/// Spawns real processes.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    poll_interval: Duration,
    kill_grace: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time between SIGTERM and SIGKILL when tearing down a child.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

impl ProcessRunner for SystemRunner {
    fn run(&self, command: &CommandSpec, control: &RunControl) -> Result<InvocationResult> {
        if control.cancel.is_cancelled() {
            return Err(HarnessError::Cancelled);
        }

        let start = Instant::now();
        let deadline = control.deadline_from(start);
        if deadline.is_some_and(|d| start >= d) {
            warn!(command = %command, "attempt deadline already passed, not spawning");
            return Err(control.timed_out(command, start));
        }

        debug!(
            command = %command,
            cwd = %command.cwd.display(),
            env = ?command.env,
            "spawning provisioning tool"
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        let child = cmd
            .spawn()
            .map_err(|e| HarnessError::launch(&command.program, &command.cwd, e))?;

        let mut guard = ChildGuard::new(child, self.kill_grace);
        let stdout = spawn_reader(guard.child.stdout.take());
        let stderr = spawn_reader(guard.child.stderr.take());

        let status = loop {
            if let Some(status) = guard.try_wait()? {
                break status;
            }

            if control.cancel.is_cancelled() {
                warn!(command = %command, "cancelled, killing process group");
                guard.terminate();
                join_reader(stdout);
                join_reader(stderr);
                return Err(HarnessError::Cancelled);
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(command = %command, "attempt timed out, killing process group");
                guard.terminate();
                join_reader(stdout);
                join_reader(stderr);
                return Err(control.timed_out(command, start));
            }

            thread::sleep(self.poll_interval);
        };

        // Descendants left in the group still hold the output pipes
        guard.terminate();

        let result = InvocationResult {
            exit_code: status.code(),
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
            duration: start.elapsed(),
        };

        info!(
            command = %command,
            exit_code = ?result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            "provisioning tool exited"
        );

        Ok(result)
    }
}

/// Owns a spawned child: registered while alive, killed and reaped on drop.
struct ChildGuard {
    child: Child,
    pid: u32,
    grace: Duration,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child, grace: Duration) -> Self {
        let pid = child.id();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }
        Self {
            child,
            pid,
            grace,
            reaped: false,
        }
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    /// SIGTERM the group, wait up to the grace period, then SIGKILL.
    /// Members left behind by an exited leader get the same treatment.
    fn terminate(&mut self) {
        if !self.reaped {
            signal_group_or_process(self.pid, Signal::SIGTERM);

            let start = Instant::now();
            while !self.reaped && start.elapsed() < self.grace {
                match self.child.try_wait() {
                    Ok(Some(_)) => self.reaped = true,
                    _ => thread::sleep(Duration::from_millis(25)),
                }
            }

            if !self.reaped {
                warn!(pid = self.pid, "process group ignored SIGTERM, sending SIGKILL");
                signal_group_or_process(self.pid, Signal::SIGKILL);
                if self.child.wait().is_ok() {
                    self.reaped = true;
                }
            }
        }

        terminate_group(self.pid, self.grace);
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.terminate();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(self.pid);
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buf) {
                debug!(error = %e, "output pipe read failed");
            }
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
