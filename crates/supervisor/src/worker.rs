//! Worker process handles.

use std::process::{Child, Command};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use gantry_core::error::{Error, Result};

use crate::state::SupervisorState;

const WATCH_POLL: Duration = Duration::from_millis(100);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// A spawned worker process and its watcher.
pub(crate) struct WorkerProcess {
    pub(crate) idx: usize,
    pub(crate) birth: Instant,
    pid: u32,
    child: Arc<Mutex<Child>>,
    interrupt_by_parent: Arc<AtomicBool>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("idx", &self.idx)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl WorkerProcess {
    /// Spawn the process and start a watcher thread that reports unexpected
    /// exits to the supervisor.
    pub(crate) fn spawn(
        idx: usize,
        mut command: Command,
        state: Arc<SupervisorState>,
    ) -> Result<Self> {
        let child = command
            .spawn()
            .map_err(|e| Error::Fatal(format!("cannot spawn worker-{}: {e}", idx + 1)))?;
        let pid = child.id();
        tracing::info!("spawning worker-{} with PID: {pid}", idx + 1);
        state.worker_pids.lock().insert(idx, pid);

        let child = Arc::new(Mutex::new(child));
        let interrupt_by_parent = Arc::new(AtomicBool::new(false));

        let watch_child = child.clone();
        let watch_interrupted = interrupt_by_parent.clone();
        std::thread::Builder::new()
            .name(format!("gantry-watch-{}", idx + 1))
            .spawn(move || {
                loop {
                    match watch_child.lock().try_wait() {
                        Ok(Some(_)) => break,
                        Ok(None) => {}
                        Err(_) => break,
                    }
                    std::thread::sleep(WATCH_POLL);
                }
                if !watch_interrupted.load(Ordering::SeqCst) {
                    tracing::error!("unexpected exit from worker-{}", idx + 1);
                    state.interrupt_children.lock().push(idx);
                    state.event.set();
                }
            })
            .map_err(Error::Io)?;

        Ok(Self {
            idx,
            birth: Instant::now(),
            pid,
            child,
            interrupt_by_parent,
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn is_alive(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    /// Request a graceful stop (SIGTERM).
    pub(crate) fn terminate(&self) {
        self.interrupt_by_parent.store(true, Ordering::SeqCst);
        #[cfg(unix)]
        {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(self.pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.lock().kill();
        }
    }

    /// Force an immediate stop (SIGKILL).
    pub(crate) fn kill(&self) {
        self.interrupt_by_parent.store(true, Ordering::SeqCst);
        let _ = self.child.lock().kill();
    }

    /// Wait for exit. With a timeout, returns once the process exited or the
    /// timeout elapsed; without one, blocks until exit.
    pub(crate) fn join(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if !self.is_alive() {
                return;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return;
                }
            }
            std::thread::sleep(JOIN_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(seconds: &str) -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg(seconds);
        cmd
    }

    #[test]
    fn test_terminate_is_not_a_crash() {
        let state = Arc::new(SupervisorState::default());
        let worker = WorkerProcess::spawn(0, sleeper("30"), state.clone()).unwrap();
        assert!(worker.is_alive());
        assert_eq!(state.worker_pids.lock().get(&0), Some(&worker.pid()));

        worker.terminate();
        worker.join(Some(Duration::from_secs(5)));
        assert!(!worker.is_alive());

        // Give the watcher a poll cycle to observe the exit.
        std::thread::sleep(Duration::from_millis(300));
        assert!(state.interrupt_children.lock().is_empty());
    }

    #[test]
    fn test_unexpected_exit_flagged() {
        let state = Arc::new(SupervisorState::default());
        let worker = WorkerProcess::spawn(3, sleeper("0"), state.clone()).unwrap();
        worker.join(Some(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(state.interrupt_children.lock().as_slice(), &[3]);
    }

    #[test]
    fn test_kill_stops_quickly() {
        let state = Arc::new(SupervisorState::default());
        let worker = WorkerProcess::spawn(1, sleeper("30"), state).unwrap();
        worker.kill();
        worker.join(Some(Duration::from_secs(5)));
        assert!(!worker.is_alive());
    }
}
