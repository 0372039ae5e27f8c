//! Bridge between the native reactor and the user handler runtime.
//!
//! The reactor owns sockets and timers; handler execution happens on a
//! dedicated user runtime owned by the scheduler. The two communicate only
//! through thread-safe wake-ups: the reactor enqueues work, the user runtime
//! signals completion back through each request's [`Watcher`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::error::{Error, Result};
use crate::scope::Scope;

/// Signal sent back to the engine when a handler finishes.
pub(crate) type Completion = std::result::Result<(), String>;

/// Opaque handle tying one user-code invocation to a wire-level request.
///
/// Owned by neither runtime: the engine holds it to observe completion and
/// cancel, the scheduler holds it to report completion. Completion is
/// delivered at most once; later calls are ignored.
pub struct Watcher {
    scope: Scope,
    completion: Mutex<Option<oneshot::Sender<Completion>>>,
    abort: Mutex<Option<AbortHandle>>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("method", &self.scope.method)
            .field("path", &self.scope.path)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    pub(crate) fn new(scope: Scope) -> (Arc<Self>, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                scope,
                completion: Mutex::new(Some(tx)),
                abort: Mutex::new(None),
            }),
            rx,
        )
    }

    /// The scope this watcher was dispatched with.
    #[inline]
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Report successful completion.
    pub fn done(&self) {
        if let Some(tx) = self.completion.lock().take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Report failed completion.
    pub fn err(&self, message: impl Into<String>) {
        if let Some(tx) = self.completion.lock().take() {
            let _ = tx.send(Err(message.into()));
        }
    }

    /// Whether completion has been reported.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.completion.lock().is_none()
    }

    /// Abort the scheduled handler, if it is still running, and report the
    /// cancellation as a failed completion.
    pub fn cancel(&self) {
        if let Some(handle) = self.abort.lock().take() {
            handle.abort();
        }
        self.err("cancelled");
    }

    fn bind_abort(&self, handle: AbortHandle) {
        *self.abort.lock() = Some(handle);
    }
}

/// Work dispatched onto the user runtime.
type HandlerFuture = BoxFuture<'static, Result<()>>;
type BlockingHandler = Box<dyn FnOnce() -> Result<()> + Send>;

/// Which scheduler strategy a worker uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SchedulerImpl {
    /// Queue + pump with watcher-completion wrappers.
    #[default]
    Callback,
    /// One native task per handler, handles retained for join/cancel.
    Task,
}

/// Build the configured scheduler strategy.
pub fn build_scheduler(
    implementation: SchedulerImpl,
    blocking_threads: usize,
    blocking_threads_idle_timeout: u64,
) -> Result<Arc<dyn Scheduler>> {
    Ok(match implementation {
        SchedulerImpl::Callback => Arc::new(CallbackScheduler::start(
            blocking_threads,
            blocking_threads_idle_timeout,
        )?),
        SchedulerImpl::Task => Arc::new(TaskScheduler::start(
            blocking_threads,
            blocking_threads_idle_timeout,
        )?),
    })
}

/// Scheduling strategy contract shared by both scheduler implementations.
pub trait Scheduler: Send + Sync + 'static {
    /// Deliver an async handler invocation to the user runtime.
    fn dispatch(&self, watcher: Arc<Watcher>, fut: HandlerFuture);

    /// Deliver a synchronous handler invocation to the blocking pool of the
    /// user runtime.
    fn dispatch_blocking(&self, watcher: Arc<Watcher>, f: BlockingHandler);

    /// Cancel all in-flight handlers and stop the user runtime.
    fn close(&self);
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, AbortHandle>>,
}

impl Registry {
    fn insert(&self, handle: AbortHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().insert(id, handle);
        id
    }

    fn remove(&self, id: u64) {
        self.tasks.lock().remove(&id);
    }

    fn abort_all(&self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

struct UserRuntime {
    handle: tokio::runtime::Handle,
    stop: Arc<Notify>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl UserRuntime {
    /// Spin up a single-threaded user runtime on its own OS thread, with a
    /// blocking pool of `blocking_threads` threads reaped after
    /// `blocking_threads_idle_timeout` seconds of idleness.
    fn start(blocking_threads: usize, blocking_threads_idle_timeout: u64) -> Result<Self> {
        let stop = Arc::new(Notify::new());
        let park = stop.clone();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("gantry-user-rt".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .max_blocking_threads(blocking_threads.max(1))
                    .thread_keep_alive(Duration::from_secs(blocking_threads_idle_timeout))
                    .build();
                match runtime {
                    Ok(runtime) => {
                        if handle_tx.send(Ok(runtime.handle().clone())).is_err() {
                            return;
                        }
                        runtime.block_on(park.notified());
                        // Dropping the runtime aborts everything still
                        // pending.
                    }
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                    }
                }
            })
            .map_err(Error::Io)?;

        let handle = handle_rx
            .recv()
            .map_err(|_| Error::Fatal("user runtime thread died during startup".into()))?
            .map_err(Error::Io)?;
        Ok(Self {
            handle,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn close(&self) {
        self.stop.notify_one();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

/// Callback-style scheduler: requests flow through a queue consumed by a
/// pump task on the user runtime, which wraps each handler in a
/// watcher-completion future.
pub struct CallbackScheduler {
    runtime: UserRuntime,
    queue: mpsc::UnboundedSender<(Arc<Watcher>, HandlerFuture)>,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for CallbackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CallbackScheduler")
    }
}

impl CallbackScheduler {
    /// Start the scheduler and its user runtime.
    pub fn start(blocking_threads: usize, blocking_threads_idle_timeout: u64) -> Result<Self> {
        let runtime = UserRuntime::start(blocking_threads, blocking_threads_idle_timeout)?;
        let registry = Arc::new(Registry::default());
        let (queue, mut rx) = mpsc::unbounded_channel::<(Arc<Watcher>, HandlerFuture)>();

        let pump_registry = registry.clone();
        runtime.handle.spawn(async move {
            while let Some((watcher, fut)) = rx.recv().await {
                let registry = pump_registry.clone();
                let task_watcher = watcher.clone();
                let task = tokio::spawn(async move {
                    match fut.await {
                        Ok(()) => task_watcher.done(),
                        Err(e) => task_watcher.err(e.to_string()),
                    }
                });
                watcher.bind_abort(task.abort_handle());
                let id = registry.insert(task.abort_handle());
                let reap_registry = registry.clone();
                tokio::spawn(async move {
                    let _ = task.await;
                    reap_registry.remove(id);
                });
            }
        });

        Ok(Self {
            runtime,
            queue,
            registry,
        })
    }
}

impl Scheduler for CallbackScheduler {
    fn dispatch(&self, watcher: Arc<Watcher>, fut: HandlerFuture) {
        if self.queue.send((watcher.clone(), fut)).is_err() {
            watcher.err("scheduler is closed");
        }
    }

    fn dispatch_blocking(&self, watcher: Arc<Watcher>, f: BlockingHandler) {
        let fut: HandlerFuture = Box::pin(async move {
            tokio::task::spawn_blocking(f)
                .await
                .map_err(|e| Error::Fatal(format!("blocking handler panicked: {e}")))?
        });
        self.dispatch(watcher, fut);
    }

    fn close(&self) {
        self.registry.abort_all();
        self.runtime.close();
    }
}

/// Task-style scheduler: each handler is spawned directly as a native task
/// on the user runtime, with its handle retained for join and cancel.
pub struct TaskScheduler {
    runtime: UserRuntime,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskScheduler")
    }
}

impl TaskScheduler {
    /// Start the scheduler and its user runtime.
    pub fn start(blocking_threads: usize, blocking_threads_idle_timeout: u64) -> Result<Self> {
        let runtime = UserRuntime::start(blocking_threads, blocking_threads_idle_timeout)?;
        Ok(Self {
            runtime,
            registry: Arc::new(Registry::default()),
        })
    }
}

impl Scheduler for TaskScheduler {
    fn dispatch(&self, watcher: Arc<Watcher>, fut: HandlerFuture) {
        let task_watcher = watcher.clone();
        let task = self.runtime.handle.spawn(async move {
            match fut.await {
                Ok(()) => task_watcher.done(),
                Err(e) => task_watcher.err(e.to_string()),
            }
        });
        watcher.bind_abort(task.abort_handle());
        let id = self.registry.insert(task.abort_handle());
        let registry = self.registry.clone();
        self.runtime.handle.spawn(async move {
            let _ = task.await;
            registry.remove(id);
        });
    }

    fn dispatch_blocking(&self, watcher: Arc<Watcher>, f: BlockingHandler) {
        let fut: HandlerFuture = Box::pin(async move {
            tokio::task::spawn_blocking(f)
                .await
                .map_err(|e| Error::Fatal(format!("blocking handler panicked: {e}")))?
        });
        self.dispatch(watcher, fut);
    }

    fn close(&self) {
        self.registry.abort_all();
        self.runtime.close();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use http::{Method, Version};

    use super::*;
    use crate::net::SocketAddr;
    use crate::scope::ScopeProtocol;

    fn test_scope() -> Scope {
        Scope {
            protocol: ScopeProtocol::Http,
            http_version: Version::HTTP_11,
            scheme: "http",
            method: Method::GET,
            path: "/".to_owned(),
            query_string: String::new(),
            headers: http::HeaderMap::new(),
            peer_addr: SocketAddr::Unknown,
            server_addr: SocketAddr::Unknown,
            tls: false,
            authority: None,
            state: HashMap::new(),
        }
    }

    #[test]
    fn test_watcher_completion_at_most_once() {
        let (watcher, mut rx) = Watcher::new(test_scope());
        watcher.done();
        watcher.err("late");
        assert!(watcher.is_finished());
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_callback_scheduler_runs_handler() {
        let scheduler = CallbackScheduler::start(1, 30).unwrap();
        let (watcher, rx) = Watcher::new(test_scope());
        scheduler.dispatch(watcher, Box::pin(async { Ok(()) }));
        assert_eq!(rx.await.unwrap(), Ok(()));
        scheduler.close();
    }

    #[tokio::test]
    async fn test_callback_scheduler_reports_errors() {
        let scheduler = CallbackScheduler::start(1, 30).unwrap();
        let (watcher, rx) = Watcher::new(test_scope());
        scheduler.dispatch(
            watcher,
            Box::pin(async { Err(Error::Fatal("boom".into())) }),
        );
        assert!(rx.await.unwrap().is_err());
        scheduler.close();
    }

    #[tokio::test]
    async fn test_task_scheduler_runs_blocking_handler() {
        let scheduler = TaskScheduler::start(2, 30).unwrap();
        let (watcher, rx) = Watcher::new(test_scope());
        scheduler.dispatch_blocking(watcher, Box::new(|| Ok(())));
        assert_eq!(rx.await.unwrap(), Ok(()));
        scheduler.close();
    }

    #[tokio::test]
    async fn test_cancel_aborts_handler() {
        let scheduler = TaskScheduler::start(1, 30).unwrap();
        let (watcher, rx) = Watcher::new(test_scope());
        scheduler.dispatch(
            watcher.clone(),
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        watcher.cancel();
        let completion = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion, Err("cancelled".to_owned()));
        scheduler.close();
    }
}
