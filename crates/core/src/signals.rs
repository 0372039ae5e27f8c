//! Shutdown events and worker signal routing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

/// A single-consumer shutdown latch, awaitable from async code.
///
/// Cloning shares the same latch. `set` is idempotent; every pending and
/// future `wait` completes once it fires.
#[derive(Clone, Debug, Default)]
pub struct ShutdownEvent {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownEvent {
    /// Create an unset event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the event.
    pub fn set(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the event has fired.
    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Wait until the event fires.
    pub async fn wait(&self) {
        while !self.is_set() {
            let notified = self.inner.notify.notified();
            if self.is_set() {
                break;
            }
            notified.await;
        }
    }
}

/// Blocking variant of [`ShutdownEvent`] for synchronous worker code.
#[derive(Clone, Debug, Default)]
pub struct SyncShutdownEvent {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl SyncShutdownEvent {
    /// Create an unset event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the event.
    pub fn set(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock() = true;
        cvar.notify_all();
    }

    /// Whether the event has fired.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block the calling thread until the event fires.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock();
        while !*fired {
            cvar.wait(&mut fired);
        }
    }
}

/// Install SIGINT/SIGTERM handlers that fire `event`.
///
/// Must run inside a tokio runtime; the returned future lives until the
/// first signal arrives.
pub async fn watch_interrupt_signals(event: ShutdownEvent) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGINT handler");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        event.set();
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            event.set();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_shutdown_event_latches() {
        let event = ShutdownEvent::new();
        assert!(!event.is_set());

        let waiter = event.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        event.set();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        // A wait after the fact returns immediately.
        tokio::time::timeout(Duration::from_millis(100), event.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_event_set_idempotent() {
        let event = ShutdownEvent::new();
        event.set();
        event.set();
        assert!(event.is_set());
    }

    #[test]
    fn test_sync_shutdown_event() {
        let event = SyncShutdownEvent::new();
        let waiter = event.clone();
        let handle = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(Duration::from_millis(10));
        event.set();
        handle.join().unwrap();
        assert!(event.is_set());
    }
}
