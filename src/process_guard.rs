//! Process lifecycle management for provisioning tool children
//!
//! A plan run can take minutes and spawns provider plugins of its own. When
//! the harness is interrupted, a timed-out attempt is abandoned, or a test
//! case is cancelled, the whole process tree has to go with it.
//!
//! # Solution
//! - Spawn children in their own process group with a parent-death signal
//! - Track all child PIDs in a global registry
//! - First SIGINT/SIGTERM/SIGHUP cancels the shared [`CancelToken`]; runners
//!   observe it and tear down their own children
//! - A second signal (or dropping [`ProcessGuard`]) terminates every
//!   registered group: SIGTERM, grace period, then SIGKILL

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::runner::CancelToken;

/// Global registry of child process IDs
static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Grace period between SIGTERM and SIGKILL on final cleanup
pub const CLEANUP_GRACE: Duration = Duration::from_secs(5);

/// Registry tracking all spawned child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    /// Set of child PIDs currently running (each is also its group id)
    pids: HashSet<u32>,
    /// Whether cleanup has already been initiated
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Register a new child process
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!(pid, "registered child process");
    }

    /// Unregister a child process (called when it has been reaped)
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!(pid, "unregistered child process");
    }

    /// Get count of tracked children
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    /// Terminate all tracked child process groups
    /// Sends SIGTERM first, waits up to `grace_period`, then SIGKILL
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            debug!("cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            debug!("no child processes to terminate");
            return;
        }

        info!(count = self.pids.len(), "terminating child process groups");

        let pids_to_kill: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids_to_kill {
            signal_group_or_process(pid, Signal::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids_to_kill.iter().all(|&pid| !is_process_alive(pid)) {
                info!("all child processes terminated gracefully");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids_to_kill {
            if is_process_alive(pid) {
                warn!(pid, "process group did not terminate, sending SIGKILL");
                signal_group_or_process(pid, Signal::SIGKILL);
            }
        }

        self.pids.clear();
        info!("child process cleanup complete");
    }
}

/// Signal the group led by `pid`, falling back to the process itself
pub(crate) fn signal_group_or_process(pid: u32, sig: Signal) {
    if let Err(e) = send_signal_to_group(pid, sig) {
        debug!(pid, error = %e, "group signal failed, signalling process");
        if let Err(e2) = send_signal(pid, sig) {
            debug!(pid, error = %e2, "signal failed (process already gone?)");
        }
    }
}

/// Terminate every process still in group `pgid` once its leader is gone.
///
/// SIGTERM, wait up to `grace` for the group to empty, then SIGKILL. Only
/// the group is signalled: the leader's PID may already belong to someone
/// else.
pub(crate) fn terminate_group(pgid: u32, grace: Duration) {
    if send_signal_to_group(pgid, Signal::SIGTERM).is_err() {
        return;
    }
    debug!(pgid, "terminating leftover members of process group");

    let start = Instant::now();
    while start.elapsed() < grace {
        if !is_group_alive(pgid) {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }

    warn!(pgid, "leftover process group members ignored SIGTERM, sending SIGKILL");
    if let Err(e) = send_signal_to_group(pgid, Signal::SIGKILL) {
        debug!(pgid, error = %e, "group already gone");
    }
}

fn is_group_alive(pgid: u32) -> bool {
    signal::kill(Pid::from_raw(-(pgid as i32)), None).is_ok()
}

/// Send a signal to a process
fn send_signal(pid: u32, sig: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), sig)
}

/// Send a signal to an entire process group (negative PID)
fn send_signal_to_group(pgid: u32, sig: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), sig)
}

/// Check if a process is still alive (not dead or zombie)
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/pid/stat is the state; Z and X are not running
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// RAII guard that terminates all registered children on drop.
/// Held by `main` for the lifetime of a run.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
    grace: Duration,
}

impl ProcessGuard {
    /// Create a new process guard attached to the global registry
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
            grace: CLEANUP_GRACE,
        }
    }

}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        debug!("ProcessGuard dropped, initiating cleanup");
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(self.grace);
        }
    }
}

/// Install handlers for SIGINT, SIGTERM and SIGHUP.
///
/// The first signal cancels `token` so in-flight runs wind down and still
/// report. A second signal terminates every registered child and exits
/// with 128 + signal number.
pub fn init_signal_handlers(token: CancelToken) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            if !token.is_cancelled() {
                warn!(signal = signal_name, "cancelling running test cases (signal again to force exit)");
                token.cancel();
                continue;
            }

            warn!(signal = signal_name, "forcing exit");
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    /// This allows us to kill the entire process tree with a single signal
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                // PGID = child PID, so the group can be signalled as a unit
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                // Die with the harness instead of leaving a plan running
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
