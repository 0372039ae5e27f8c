//! Embedded supervisor: workers as tasks on the caller's event loop.
//!
//! Same supervision semantics as the process supervisor, with
//! [`WorkerSignal`] latches in place of OS signals. There is no PID file, no
//! env-file loading and no reload-on-changes in this mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use gantry_core::error::{Error, Result};
use gantry_core::interface::App;
use gantry_core::net::ListenerSpec;
use gantry_core::scheduler::{SchedulerImpl, build_scheduler};
use gantry_core::signals::ShutdownEvent;
use gantry_core::worker::{StaticFiles, Worker, WorkerConfig};
use gantry_serve_static::StaticMount;

/// Per-worker stop latch replacing OS signals in embedded mode.
pub type WorkerSignal = ShutdownEvent;

const CRASH_LOOP_WINDOW: Duration = Duration::from_millis(5500);
const LIFETIME_FACTOR: f64 = 0.95;
const LIFETIME_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Single-process server: the supervisor state machine over worker tasks.
#[derive(Debug)]
pub struct EmbeddedServer {
    /// Listening socket specification. With several workers, TCP sockets
    /// share the accept queue through `SO_REUSEPORT`.
    pub listener: ListenerSpec,
    /// Number of worker tasks.
    pub workers: usize,
    /// Worker configuration template; the id field is assigned per slot.
    pub config: WorkerConfig,
    /// Scheduler strategy for the user runtime.
    pub scheduler_impl: SchedulerImpl,
    /// Static file mount.
    pub static_mount: Option<StaticMount>,
    /// Respawn workers that die unexpectedly instead of stopping.
    pub respawn_failed_workers: bool,
    /// Seconds between a replacement starting and its predecessor stopping.
    pub respawn_interval: f64,
    /// Worker lifetime in seconds.
    pub workers_lifetime: Option<u64>,
    /// Seconds to wait for a stopping worker before cancelling its task.
    pub workers_kill_timeout: Option<u64>,
}

struct EmbedWorker {
    idx: usize,
    birth: Instant,
    signal: WorkerSignal,
    abort: AbortHandle,
    interrupt_by_parent: Arc<AtomicBool>,
}

impl EmbedWorker {
    fn terminate(&self) {
        self.interrupt_by_parent.store(true, Ordering::SeqCst);
        self.signal.set();
    }

    fn kill(&self) {
        self.interrupt_by_parent.store(true, Ordering::SeqCst);
        self.abort.abort();
    }
}

enum Exit {
    Clean(usize),
    Crashed(usize),
}

impl EmbeddedServer {
    /// A server with default settings for `listener`.
    #[must_use]
    pub fn new(listener: ListenerSpec) -> Self {
        Self {
            listener,
            workers: 1,
            config: WorkerConfig::default(),
            scheduler_impl: SchedulerImpl::default(),
            static_mount: None,
            respawn_failed_workers: false,
            respawn_interval: 3.5,
            workers_lifetime: None,
            workers_kill_timeout: None,
        }
    }

    fn validate(&self, app: &App) -> Result<()> {
        self.listener.validate()?;
        self.config.validate(app.interface())?;
        if self.workers > 1 && matches!(self.listener, ListenerSpec::Unix { .. }) {
            return Err(Error::config(
                "multiple embedded workers require a TCP listener",
            ));
        }
        if let Some(lifetime) = self.workers_lifetime {
            if lifetime < 60 {
                return Err(Error::config(
                    "workers_lifetime cannot be less than 60 seconds",
                ));
            }
        }
        Ok(())
    }

    /// Serve until `stop` fires.
    ///
    /// `factory` builds one application instance per worker task.
    pub async fn serve<F>(&self, factory: F, stop: ShutdownEvent) -> Result<()>
    where
        F: Fn() -> App,
    {
        let probe = factory();
        self.validate(&probe)?;
        drop(probe);

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut workers: Vec<EmbedWorker> = Vec::with_capacity(self.workers);
        for idx in 0..self.workers {
            workers.push(self.spawn_worker(idx, &factory, &done_tx)?);
        }

        let mut respawned: HashMap<usize, Instant> = HashMap::new();
        let mut lifetime_check = tokio::time::interval(LIFETIME_CHECK_INTERVAL);
        lifetime_check.reset();

        let outcome = 'main: loop {
            tokio::select! {
                () = stop.wait() => break Ok(()),
                exit = done_rx.recv() => {
                    let Some(exit) = exit else { break Ok(()) };
                    match exit {
                        Exit::Clean(idx) => {
                            tracing::debug!("worker-{} stopped", idx + 1);
                        }
                        Exit::Crashed(idx) => {
                            tracing::error!("unexpected exit from worker-{}", idx + 1);
                            if !self.respawn_failed_workers {
                                break Err(Error::Fatal("worker crashed".into()));
                            }
                            let now = Instant::now();
                            let looping = respawned
                                .get(&idx)
                                .is_some_and(|at| now.duration_since(*at) <= CRASH_LOOP_WINDOW);
                            if looping {
                                break Err(Error::Fatal("worker crash loop detected".into()));
                            }
                            respawned.clear();
                            respawned.insert(idx, now);
                            tracing::info!("respawning worker-{}", idx + 1);
                            workers.retain(|w| w.idx != idx);
                            match self.spawn_worker(idx, &factory, &done_tx) {
                                Ok(worker) => workers.push(worker),
                                Err(e) => break 'main Err(e),
                            }
                        }
                    }
                }
                _ = lifetime_check.tick(), if self.workers_lifetime.is_some() => {
                    let lifetime = self.workers_lifetime.expect("guarded by select condition");
                    let ttl = Duration::from_secs_f64(lifetime as f64 * LIFETIME_FACTOR);
                    let now = Instant::now();
                    let expired: Vec<usize> = workers
                        .iter()
                        .filter(|w| now.duration_since(w.birth) >= ttl)
                        .map(|w| w.idx)
                        .collect();
                    for idx in expired {
                        tracing::info!(
                            "worker-{} lifetime expired, gracefully respawning..",
                            idx + 1
                        );
                        respawned.insert(idx, Instant::now());
                        let replacement = match self.spawn_worker(idx, &factory, &done_tx) {
                            Ok(worker) => worker,
                            Err(e) => break 'main Err(e),
                        };
                        if self.respawn_interval > 0.0 {
                            tokio::time::sleep(Duration::from_secs_f64(self.respawn_interval))
                                .await;
                        }
                        if let Some(old) = workers.iter().find(|w| w.idx == idx) {
                            old.terminate();
                        }
                        workers.retain(|w| w.idx != idx);
                        workers.push(replacement);
                    }
                }
            }
        };

        self.stop_workers(&mut workers, &mut done_rx).await;
        outcome
    }

    fn spawn_worker<F>(
        &self,
        idx: usize,
        factory: &F,
        done_tx: &mpsc::UnboundedSender<Exit>,
    ) -> Result<EmbedWorker>
    where
        F: Fn() -> App,
    {
        let holder = self.listener.build()?;
        let mut config = self.config.clone();
        config.id = idx + 1;
        let app = factory();
        let scheduler = build_scheduler(
            self.scheduler_impl,
            config.blocking_threads,
            config.blocking_threads_idle_timeout,
        )?;
        let statics = self
            .static_mount
            .clone()
            .map(|mount| Arc::new(mount) as Arc<dyn StaticFiles>);
        let signal = WorkerSignal::new();
        let interrupt_by_parent = Arc::new(AtomicBool::new(false));

        let worker_signal = signal.clone();
        let handle = tokio::spawn(async move {
            let worker = Worker::new(config);
            worker
                .serve_async(app, scheduler, holder, worker_signal, statics)
                .await
        });
        let abort = handle.abort_handle();

        let watcher_interrupted = interrupt_by_parent.clone();
        let watcher_tx = done_tx.clone();
        tokio::spawn(async move {
            let outcome = handle.await;
            let clean =
                watcher_interrupted.load(Ordering::SeqCst) || matches!(outcome, Ok(Ok(())));
            let exit = if clean {
                Exit::Clean(idx)
            } else {
                Exit::Crashed(idx)
            };
            let _ = watcher_tx.send(exit);
        });

        Ok(EmbedWorker {
            idx,
            birth: Instant::now(),
            signal,
            abort,
            interrupt_by_parent,
        })
    }

    async fn stop_workers(
        &self,
        workers: &mut Vec<EmbedWorker>,
        done_rx: &mut mpsc::UnboundedReceiver<Exit>,
    ) {
        for worker in workers.iter() {
            worker.terminate();
        }
        let mut remaining = workers.len();
        let deadline = self
            .workers_kill_timeout
            .map(|t| tokio::time::Instant::now() + Duration::from_secs(t));
        while remaining > 0 {
            let exited = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, done_rx.recv()).await {
                        Ok(exit) => exit.is_some(),
                        Err(_) => break,
                    }
                }
                None => done_rx.recv().await.is_some(),
            };
            if !exited {
                break;
            }
            remaining -= 1;
        }
        if remaining > 0 {
            tracing::warn!("cancelling {remaining} workers after the kill timeout");
            for worker in workers.iter() {
                worker.kill();
            }
        }
        workers.clear();
    }
}

#[cfg(test)]
mod tests {
    use gantry_core::async_trait;
    use gantry_core::http::{HeaderMap, StatusCode};
    use gantry_core::interface::{HttpTransport, MessageHandler};
    use gantry_core::scope::Scope;

    use super::*;

    struct NoopApp;

    #[async_trait]
    impl MessageHandler for NoopApp {
        async fn call(&self, _scope: Scope, mut transport: HttpTransport) -> Result<()> {
            transport.response_empty(StatusCode::NO_CONTENT, HeaderMap::new())
        }
    }

    fn app() -> App {
        App::Message(Arc::new(NoopApp))
    }

    #[tokio::test]
    async fn test_serve_and_stop() {
        let server = EmbeddedServer::new(ListenerSpec::tcp("127.0.0.1", 0, 128));
        let stop = ShutdownEvent::new();
        let stopper = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            stopper.set();
        });
        server.serve(app, stop).await.unwrap();
    }

    #[tokio::test]
    async fn test_uds_multi_worker_rejected() {
        let mut server = EmbeddedServer::new(ListenerSpec::unix("/tmp/gantry-embed.sock", 128, None));
        server.workers = 2;
        let err = server.serve(app, ShutdownEvent::new()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_short_lifetime_rejected() {
        let mut server = EmbeddedServer::new(ListenerSpec::tcp("127.0.0.1", 0, 128));
        server.workers_lifetime = Some(10);
        let err = server.serve(app, ShutdownEvent::new()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
