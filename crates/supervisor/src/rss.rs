//! Worker RSS sampling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::state::SupervisorState;

/// Start the sampler thread. Workers whose resident set exceeds `max_rss`
/// bytes are reported for graceful respawn.
pub(crate) fn spawn_rss_watcher(
    state: Arc<SupervisorState>,
    max_rss: u64,
    sample_interval: u64,
    stop: Arc<AtomicBool>,
) {
    let _ = std::thread::Builder::new()
        .name("gantry-rss".into())
        .spawn(move || {
            let mut system = System::new();
            loop {
                std::thread::sleep(Duration::from_secs(sample_interval.max(1)));
                if stop.load(Ordering::SeqCst) {
                    return;
                }

                let pids: Vec<(usize, Pid)> = state
                    .worker_pids
                    .lock()
                    .iter()
                    .map(|(idx, pid)| (*idx, Pid::from_u32(*pid)))
                    .collect();
                if pids.is_empty() {
                    continue;
                }
                let sys_pids: Vec<Pid> = pids.iter().map(|(_, pid)| *pid).collect();
                system.refresh_processes(ProcessesToUpdate::Some(&sys_pids), true);

                let mut exceeded = Vec::new();
                for (idx, pid) in pids {
                    let Some(process) = system.process(pid) else {
                        continue;
                    };
                    let rss = process.memory();
                    if rss > max_rss {
                        tracing::info!(
                            worker = idx + 1,
                            rss,
                            limit = max_rss,
                            "worker exceeds memory limit"
                        );
                        exceeded.push(idx);
                    }
                }
                if !exceeded.is_empty() {
                    state.rss_children.lock().extend(exceeded);
                    state.flag(&state.rss_signal);
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_rss_visible() {
        // The sampler relies on sysinfo reporting RSS in bytes; sanity-check
        // against our own process.
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let rss = system.process(pid).map(sysinfo::Process::memory).unwrap_or(0);
        assert!(rss > 1024, "expected a plausible RSS, got {rss}");
    }
}
