//! Shared supervisor state: one wait primitive plus a set of flags.
//!
//! Every signal source (OS signals, worker watchers, lifetime and RSS
//! watchers) sets its flag and fires the main event; the serve loop wakes,
//! inspects the flags and acts. This keeps the state machine a single
//! event-driven loop instead of nested per-signal conditionals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// The supervisor's single wait primitive.
#[derive(Debug, Default)]
pub(crate) struct MainEvent {
    fired: Mutex<bool>,
    cvar: Condvar,
}

impl MainEvent {
    pub(crate) fn set(&self) {
        *self.fired.lock() = true;
        self.cvar.notify_all();
    }

    pub(crate) fn clear(&self) {
        *self.fired.lock() = false;
    }

    pub(crate) fn wait(&self) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.cvar.wait(&mut fired);
        }
    }

    /// Wait until fired or `timeout` elapsed. Returns whether it fired.
    pub(crate) fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let mut fired = self.fired.lock();
        if !*fired {
            let _ = self.cvar.wait_for(&mut fired, timeout);
        }
        *fired
    }
}

#[derive(Debug, Default)]
pub(crate) struct SupervisorState {
    pub(crate) event: MainEvent,
    pub(crate) interrupt_signal: AtomicBool,
    pub(crate) reload_signal: AtomicBool,
    pub(crate) lifetime_signal: AtomicBool,
    pub(crate) rss_signal: AtomicBool,
    pub(crate) interrupt_children: Mutex<Vec<usize>>,
    pub(crate) rss_children: Mutex<Vec<usize>>,
    pub(crate) worker_pids: Mutex<HashMap<usize, u32>>,
}

impl SupervisorState {
    pub(crate) fn flag(&self, flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
        self.event.set();
    }

    pub(crate) fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::SeqCst)
    }
}
