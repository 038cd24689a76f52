//! Worker process supervisor for cluster mode.
//!
//! Spawns one copy of this executable per worker, each told to listen on
//! the same address with a single I/O thread. Workers bind with
//! SO_REUSEPORT, so the kernel spreads connections across them.
//!
//! There is no coordination after spawn: no health checks, no IPC, no
//! restarts. A worker that exits stays gone. On Linux, workers are
//! terminated when the supervisor dies, so killing the supervisor frees
//! the port.

use crate::config::Config;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::{error, info, warn};

/// Spawns and waits on worker processes.
#[derive(Debug)]
pub struct Supervisor {
    program: PathBuf,
    /// Full argument list for each worker, indexed by worker id.
    worker_args: Vec<Vec<OsString>>,
}

impl Supervisor {
    /// Plan `config.workers` workers, each running `program` with the
    /// arguments that reproduce `config` as a single-threaded listener.
    pub fn new(program: impl Into<PathBuf>, config: &Config) -> Self {
        let worker_args = (0..config.workers)
            .map(|id| config.worker_args(id).into_iter().map(OsString::from).collect())
            .collect();

        Self {
            program: program.into(),
            worker_args,
        }
    }

    /// Plan workers that re-run the current executable.
    pub fn for_current_exe(config: &Config) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config))
    }

    /// Number of workers this supervisor starts.
    pub fn worker_count(&self) -> usize {
        self.worker_args.len()
    }

    /// Start every worker.
    ///
    /// Workers already started are left running if a later spawn fails.
    pub fn spawn(&self) -> io::Result<Vec<Child>> {
        let mut children = Vec::with_capacity(self.worker_args.len());

        for (worker_id, args) in self.worker_args.iter().enumerate() {
            let mut command = Command::new(&self.program);
            command.args(args).stdin(Stdio::null());
            exit_with_parent(&mut command);
            let child = command.spawn()?;

            info!(worker = worker_id, pid = child.id(), "Spawned worker");
            children.push(child);
        }

        Ok(children)
    }

    /// Spawn every worker, then wait until all of them have exited.
    pub fn run(&self) -> io::Result<()> {
        info!(
            workers = self.worker_count(),
            program = %self.program.display(),
            "Starting cluster supervisor"
        );

        let children = self.spawn()?;

        for (worker_id, mut child) in children.into_iter().enumerate() {
            let pid = child.id();
            match child.wait() {
                Ok(status) if status.success() => {
                    info!(worker = worker_id, pid, "Worker exited");
                }
                Ok(status) => {
                    warn!(worker = worker_id, pid, %status, "Worker exited, not restarting");
                }
                Err(e) => {
                    error!(worker = worker_id, pid, error = %e, "Failed to wait on worker");
                }
            }
        }

        Ok(())
    }
}

/// Have the kernel send SIGTERM to the child once the supervisor dies.
///
/// The death signal is tied to the thread that forked the child, so
/// workers must be spawned from a thread that outlives them.
#[cfg(target_os = "linux")]
fn exit_with_parent(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    let supervisor = std::process::id() as libc::pid_t;

    // Safety: the hook runs between fork and exec and only makes
    // async-signal-safe calls, without allocating.
    unsafe {
        command.pre_exec(move || {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) != 0 {
                return Err(io::Error::last_os_error());
            }
            // The supervisor died before the signal was armed.
            if libc::getppid() != supervisor {
                return Err(io::Error::from_raw_os_error(libc::ESRCH));
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn exit_with_parent(_command: &mut Command) {}
