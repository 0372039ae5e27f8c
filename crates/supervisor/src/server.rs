//! Multi-process server supervisor.
//!
//! The supervisor owns the listening socket and the PID file, spawns one
//! worker process per slot (re-executing the current binary in worker mode),
//! and runs an event-driven loop over a single wait primitive: OS signals,
//! worker watchers and the lifetime/RSS tickers all set flags and fire the
//! same event.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use gantry_core::error::{Error, Result};
use gantry_core::http::{Http1Settings, Http2Settings, HttpMode};
use gantry_core::interface::{App, Interface};
use gantry_core::net::{ListenerSpec, SOCKET_ENV, SocketHolder};
use gantry_core::scheduler::{SchedulerImpl, build_scheduler};
use gantry_core::signals::ShutdownEvent;
use gantry_core::tls::TlsConfig;
use gantry_core::worker::{RuntimeMode, StaticFiles, Worker, WorkerConfig};
use gantry_serve_static::StaticMount;

use crate::envfiles::load_env_files;
use crate::pidfile::{remove_pid_file, write_pid_file};
use crate::reload::{ChangeWatcher, ReloadConfig};
use crate::rss::spawn_rss_watcher;
use crate::signals::install_main_signals;
use crate::state::SupervisorState;
use crate::worker::WorkerProcess;

/// Environment variable marking a process as a worker (holds the 1-based
/// worker id).
pub const WORKER_ID_ENV: &str = "GANTRY_WORKER";
/// Environment variable carrying the serialized worker configuration.
pub const WORKER_CONFIG_ENV: &str = "GANTRY_WORKER_CONFIG";

/// A worker respawned more recently than this on its next crash means the
/// fleet is crash-looping.
const CRASH_LOOP_WINDOW: Duration = Duration::from_millis(5500);
/// Share of `workers_lifetime` after which a worker is considered expired.
const LIFETIME_FACTOR: f64 = 0.95;
/// Floor for the next lifetime wake, seconds.
const MIN_LIFETIME_TICK: u64 = 60;

/// A parameterless callable invoked at a supervisor transition.
pub type Hook = Box<dyn Fn() + Send + Sync>;

/// Payload handed to worker processes through the environment.
#[derive(Serialize, Deserialize)]
struct WorkerPayload {
    config: WorkerConfig,
    scheduler_impl: SchedulerImpl,
    static_mount: Option<StaticMount>,
    process_name: Option<String>,
}

/// Flattened server configuration. Validated once at startup.
pub struct Server {
    /// Listening socket specification.
    pub listener: ListenerSpec,
    /// Number of worker processes.
    pub workers: usize,
    /// Reactor threading mode per worker.
    pub runtime_mode: RuntimeMode,
    /// Reactor threads per worker in `mt` mode.
    pub runtime_threads: usize,
    /// Reactor blocking pool size per worker.
    pub runtime_blocking_threads: Option<usize>,
    /// User-runtime blocking threads. Defaults to `backpressure / 2` for the
    /// synchronous interface and 1 otherwise.
    pub blocking_threads: Option<usize>,
    /// Idle seconds before a blocking thread is reaped.
    pub blocking_threads_idle_timeout: u64,
    /// Per-worker concurrency cap. Defaults to `backlog / workers`.
    pub backpressure: Option<usize>,
    /// Protocol selection mode.
    pub http: HttpMode,
    /// HTTP/1 settings.
    pub http1: Http1Settings,
    /// HTTP/2 settings.
    pub http2: Http2Settings,
    /// Allow WebSocket upgrades.
    pub websockets: bool,
    /// TLS configuration.
    pub tls: Option<TlsConfig>,
    /// Static file mount.
    pub static_mount: Option<StaticMount>,
    /// Scheduler strategy for the user runtime.
    pub scheduler_impl: SchedulerImpl,
    /// Emit access log events.
    pub log_access: bool,
    /// Respawn workers that die unexpectedly instead of exiting.
    pub respawn_failed_workers: bool,
    /// Seconds between a replacement worker starting and its predecessor
    /// being stopped.
    pub respawn_interval: f64,
    /// Worker lifetime in seconds; expired workers are gracefully respawned.
    pub workers_lifetime: Option<u64>,
    /// Seconds to wait for a stopping worker before killing it.
    pub workers_kill_timeout: Option<u64>,
    /// Per-worker resident set limit in bytes.
    pub workers_max_rss: Option<u64>,
    /// Seconds between RSS samples.
    pub rss_sample_interval: u64,
    /// Reload-on-changes configuration.
    pub reload: Option<ReloadConfig>,
    /// Process title prefix exported to workers.
    pub process_name: Option<String>,
    /// PID file path.
    pub pid_file: Option<PathBuf>,
    /// Env files loaded into worker environments.
    pub env_files: Vec<PathBuf>,
    /// Seconds granted to in-flight requests at worker shutdown.
    pub shutdown_grace: u64,
    /// Callables invoked after startup completes.
    pub on_startup: Vec<Hook>,
    /// Callables invoked on each reload.
    pub on_reload: Vec<Hook>,
    /// Callables invoked before shutdown.
    pub on_shutdown: Vec<Hook>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener)
            .field("workers", &self.workers)
            .field("http", &self.http)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// A server with default settings for `listener`.
    #[must_use]
    pub fn new(listener: ListenerSpec) -> Self {
        Self {
            listener,
            workers: 1,
            runtime_mode: RuntimeMode::St,
            runtime_threads: 1,
            runtime_blocking_threads: None,
            blocking_threads: None,
            blocking_threads_idle_timeout: 30,
            backpressure: None,
            http: HttpMode::Auto,
            http1: Http1Settings::default(),
            http2: Http2Settings::default(),
            websockets: true,
            tls: None,
            static_mount: None,
            scheduler_impl: SchedulerImpl::default(),
            log_access: false,
            respawn_failed_workers: false,
            respawn_interval: 3.5,
            workers_lifetime: None,
            workers_kill_timeout: None,
            workers_max_rss: None,
            rss_sample_interval: 15,
            reload: None,
            process_name: None,
            pid_file: None,
            env_files: Vec::new(),
            shutdown_grace: 30,
            on_startup: Vec::new(),
            on_reload: Vec::new(),
            on_shutdown: Vec::new(),
        }
    }

    fn backlog(&self) -> u32 {
        match &self.listener {
            ListenerSpec::Tcp { backlog, .. } | ListenerSpec::Unix { backlog, .. } => *backlog,
        }
    }

    fn resolved_backpressure(&self) -> usize {
        self.backpressure
            .unwrap_or_else(|| (self.backlog() as usize / self.workers.max(1)).max(1))
    }

    fn resolved_blocking_threads(&self, interface: Interface) -> usize {
        self.blocking_threads.unwrap_or(match interface {
            Interface::SyncIter => (self.resolved_backpressure() / 2).max(1),
            _ => 1,
        })
    }

    /// Build the worker configuration template for `interface` and check
    /// the whole record.
    pub fn worker_config(&self, interface: Interface) -> Result<WorkerConfig> {
        self.listener.validate()?;
        if self.workers < 1 {
            return Err(Error::config("workers"));
        }
        if let Some(lifetime) = self.workers_lifetime {
            if lifetime < 60 {
                return Err(Error::config(
                    "workers_lifetime cannot be less than 60 seconds",
                ));
            }
        }
        if self.reload.is_some() && (self.workers_lifetime.is_some() || self.workers_max_rss.is_some())
        {
            return Err(Error::config(
                "reload is mutually exclusive with workers_lifetime and workers_max_rss",
            ));
        }
        if let Some(reload) = &self.reload {
            reload.validate()?;
        }

        let config = WorkerConfig {
            id: 0,
            runtime_mode: self.runtime_mode,
            runtime_threads: self.runtime_threads,
            runtime_blocking_threads: self.runtime_blocking_threads,
            blocking_threads: self.resolved_blocking_threads(interface),
            blocking_threads_idle_timeout: self.blocking_threads_idle_timeout,
            backpressure: self.resolved_backpressure(),
            http: self.http,
            http1: self.http1.clone(),
            http2: self.http2.clone(),
            websockets: self.websockets,
            tls: self.tls.clone(),
            log_access: self.log_access,
            shutdown_grace: self.shutdown_grace,
        };
        config.validate(interface)?;

        if let Ok(cpus) = std::thread::available_parallelism() {
            if self.workers > cpus.get() {
                tracing::warn!(
                    workers = self.workers,
                    cpus = cpus.get(),
                    "more workers configured than CPU cores available; this may \
                     reduce overall throughput"
                );
            }
        }
        Ok(config)
    }

    /// Run the server.
    ///
    /// In the parent this becomes the supervisor; in processes spawned by
    /// the supervisor it becomes the worker engine. `factory` builds the
    /// application in each worker process.
    ///
    /// `Err` maps to exit code 1: configuration or PID-file rejection, a
    /// worker crash (without respawn) or a crash loop.
    pub fn serve<F>(&self, factory: F) -> Result<()>
    where
        F: Fn() -> App,
    {
        if std::env::var_os(WORKER_ID_ENV).is_some() {
            return run_worker(&factory);
        }
        self.run_supervisor(&factory)
    }

    fn run_supervisor<F>(&self, factory: &F) -> Result<()>
    where
        F: Fn() -> App,
    {
        // The application is instantiated here only to learn its dialect;
        // worker processes build their own copy.
        let interface = factory().interface();
        let template = self.worker_config(interface)?;

        let pid = std::process::id();
        tracing::info!("starting gantry (main PID: {pid})");
        if let Some(pid_file) = &self.pid_file {
            write_pid_file(pid_file, pid)?;
        }

        let state = Arc::new(SupervisorState::default());
        install_main_signals(state.clone());

        let holder = self.listener.build()?;
        #[cfg(unix)]
        holder.set_inheritable()?;
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        tracing::info!("listening at: {scheme}://{}", holder.local_addr());

        let result = self.supervise(template, &holder, state);

        holder.cleanup();
        if let Some(pid_file) = &self.pid_file {
            remove_pid_file(pid_file, pid);
        }
        result
    }

    fn supervise(
        &self,
        template: WorkerConfig,
        holder: &SocketHolder,
        state: Arc<SupervisorState>,
    ) -> Result<()> {
        #[cfg(unix)]
        let socket_payload = holder.to_env_payload()?;
        #[cfg(not(unix))]
        let socket_payload = {
            let _ = holder;
            return Err(Error::config(
                "multi-process serving requires a POSIX platform; use the embedded supervisor",
            ));
        };

        let env_vars = load_env_files(&self.env_files)?;
        let mut fleet = Fleet {
            server: self,
            state: state.clone(),
            template,
            socket_payload,
            env_vars,
            workers: Vec::new(),
            respawned: HashMap::new(),
        };

        fleet.spawn_all()?;
        run_hooks(&self.on_startup, "on_startup");

        if let Some(lifetime) = self.workers_lifetime {
            spawn_lifetime_tick(state.clone(), lifetime);
        }
        let rss_stop = Arc::new(AtomicBool::new(false));
        if let Some(max_rss) = self.workers_max_rss {
            spawn_rss_watcher(
                state.clone(),
                max_rss,
                self.rss_sample_interval,
                rss_stop.clone(),
            );
        }

        let result = if self.reload.is_some() {
            self.serve_with_reloader(&mut fleet)
        } else {
            self.serve_loop(&mut fleet)
        };

        tracing::info!("shutting down gantry");
        run_hooks(&self.on_shutdown, "on_shutdown");
        rss_stop.store(true, Ordering::SeqCst);
        fleet.stop_all();
        result
    }

    fn serve_loop(&self, fleet: &mut Fleet) -> Result<()> {
        loop {
            fleet.state.event.wait();
            fleet.state.event.clear();

            if SupervisorState::take(&fleet.state.interrupt_signal) {
                return Ok(());
            }

            // Reload wins over concurrent crash recovery: it respawns every
            // slot, so crash flags raised meanwhile are satisfied by it.
            if SupervisorState::take(&fleet.state.reload_signal) {
                self.reload(fleet)?;
            }

            let crashed: Vec<usize> = {
                let mut children = fleet.state.interrupt_children.lock();
                children.drain(..).collect()
            };
            if !crashed.is_empty() {
                if !self.respawn_failed_workers {
                    return Err(Error::Fatal("worker crashed".into()));
                }
                let now = Instant::now();
                let looping = crashed.iter().any(|idx| {
                    fleet
                        .respawned
                        .get(idx)
                        .is_some_and(|at| now.duration_since(*at) <= CRASH_LOOP_WINDOW)
                });
                if looping {
                    return Err(Error::Fatal("worker crash loop detected".into()));
                }
                fleet.respawned.clear();
                fleet.respawn(&crashed, 0.0)?;
            }

            if SupervisorState::take(&fleet.state.lifetime_signal) {
                self.refresh_lifetimes(fleet)?;
            }

            if SupervisorState::take(&fleet.state.rss_signal) {
                let exceeded: Vec<usize> = {
                    let mut children = fleet.state.rss_children.lock();
                    let mut exceeded: Vec<usize> = children.drain(..).collect();
                    exceeded.sort_unstable();
                    exceeded.dedup();
                    exceeded
                };
                if !exceeded.is_empty() {
                    tracing::info!(workers = ?exceeded, "memory limit reached, gracefully respawning..");
                    fleet.respawn(&exceeded, self.respawn_interval)?;
                }
            }
        }
    }

    fn serve_with_reloader(&self, fleet: &mut Fleet) -> Result<()> {
        let reload = self.reload.clone().expect("reloader requires config");
        let watcher = ChangeWatcher::new(reload)?;

        loop {
            if SupervisorState::take(&fleet.state.interrupt_signal) {
                return Ok(());
            }
            if SupervisorState::take(&fleet.state.reload_signal) {
                self.reload(fleet)?;
            }
            let crashed: Vec<usize> = {
                let mut children = fleet.state.interrupt_children.lock();
                children.drain(..).collect()
            };
            if !crashed.is_empty() && !self.respawn_failed_workers {
                return Err(Error::Fatal("worker crashed".into()));
            } else if !crashed.is_empty() {
                fleet.respawn(&crashed, 0.0)?;
            }

            let changes = watcher.poll();
            if !changes.is_empty() {
                tracing::info!("changes detected, reloading workers..");
                for path in &changes {
                    tracing::info!("changed: {}", path.display());
                }
                run_hooks(&self.on_reload, "on_reload");
                fleet.stop_all();
                fleet.spawn_all()?;
            }
        }
    }

    fn reload(&self, fleet: &mut Fleet) -> Result<()> {
        tracing::info!("HUP signal received, gracefully respawning workers..");
        run_hooks(&self.on_reload, "on_reload");
        let slots: Vec<usize> = (0..self.workers).collect();
        fleet.respawned.clear();
        // Every slot is renewed, so pending crash reports are stale.
        fleet.state.interrupt_children.lock().clear();
        fleet.respawn(&slots, self.respawn_interval)
    }

    fn refresh_lifetimes(&self, fleet: &mut Fleet) -> Result<()> {
        let Some(lifetime) = self.workers_lifetime else {
            return Ok(());
        };
        let ttl = Duration::from_secs_f64(lifetime as f64 * LIFETIME_FACTOR);
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut etas = vec![lifetime];
        for worker in &fleet.workers {
            let elapsed = now.duration_since(worker.birth);
            if elapsed >= ttl {
                tracing::info!(
                    "worker-{} lifetime expired, gracefully respawning..",
                    worker.idx + 1
                );
                expired.push(worker.idx);
            } else {
                let remaining = lifetime.saturating_sub(elapsed.as_secs());
                etas.push(remaining.max(MIN_LIFETIME_TICK));
            }
        }
        fleet.respawn(&expired, self.respawn_interval)?;
        let next_tick = etas.iter().copied().min().unwrap_or(lifetime);
        spawn_lifetime_tick(fleet.state.clone(), next_tick);
        Ok(())
    }
}

fn run_hooks(hooks: &[Hook], label: &str) {
    for hook in hooks {
        hook();
    }
    if !hooks.is_empty() {
        tracing::debug!(hooks = hooks.len(), "{label} hooks executed");
    }
}

fn spawn_lifetime_tick(state: Arc<SupervisorState>, seconds: u64) {
    let _ = std::thread::Builder::new()
        .name("gantry-lifetime".into())
        .spawn(move || {
            std::thread::sleep(Duration::from_secs(seconds));
            state.flag(&state.lifetime_signal);
        });
}

struct Fleet<'a> {
    server: &'a Server,
    state: Arc<SupervisorState>,
    template: WorkerConfig,
    socket_payload: String,
    env_vars: Vec<(String, String)>,
    workers: Vec<WorkerProcess>,
    respawned: HashMap<usize, Instant>,
}

impl Fleet<'_> {
    fn command(&self, idx: usize) -> Result<Command> {
        let exe = std::env::current_exe().map_err(Error::Io)?;
        let mut config = self.template.clone();
        config.id = idx + 1;
        let payload = WorkerPayload {
            config,
            scheduler_impl: self.server.scheduler_impl,
            static_mount: self.server.static_mount.clone(),
            process_name: self.server.process_name.clone(),
        };
        let mut command = Command::new(exe);
        command.args(std::env::args().skip(1));
        command.env(WORKER_ID_ENV, (idx + 1).to_string());
        command.env(SOCKET_ENV, &self.socket_payload);
        command.env(
            WORKER_CONFIG_ENV,
            serde_json::to_string(&payload).map_err(|e| Error::config(e.to_string()))?,
        );
        for (key, value) in &self.env_vars {
            command.env(key, value);
        }
        Ok(command)
    }

    fn spawn_slot(&self, idx: usize) -> Result<WorkerProcess> {
        WorkerProcess::spawn(idx, self.command(idx)?, self.state.clone())
    }

    fn spawn_all(&mut self) -> Result<()> {
        for idx in 0..self.server.workers {
            let worker = self.spawn_slot(idx)?;
            self.workers.push(worker);
        }
        Ok(())
    }

    /// Gracefully replace the given slots: the new worker starts serving
    /// (shared accept queue) before the old one is stopped.
    fn respawn(&mut self, slots: &[usize], delay: f64) -> Result<()> {
        for &idx in slots {
            self.respawned.insert(idx, Instant::now());
            tracing::info!("respawning worker-{}", idx + 1);
            let replacement = self.spawn_slot(idx)?;
            let position = self.workers.iter().position(|w| w.idx == idx);
            let old = match position {
                Some(position) => Some(std::mem::replace(
                    &mut self.workers[position],
                    replacement,
                )),
                None => {
                    self.workers.push(replacement);
                    None
                }
            };
            if let Some(old) = old {
                if delay > 0.0 {
                    std::thread::sleep(Duration::from_secs_f64(delay));
                }
                tracing::info!("stopping old worker-{}", idx + 1);
                self.stop_worker(&old);
            }
        }
        Ok(())
    }

    fn stop_worker(&self, worker: &WorkerProcess) {
        worker.terminate();
        let timeout = self.server.workers_kill_timeout.map(Duration::from_secs);
        worker.join(timeout);
        if self.server.workers_kill_timeout.is_some() {
            // The worker might still be reported alive right after the
            // timed join; yield once before the verdict.
            if worker.is_alive() {
                std::thread::sleep(Duration::from_millis(1));
            }
            if worker.is_alive() {
                tracing::warn!(
                    "killing worker-{} after it refused to gracefully stop",
                    worker.idx + 1
                );
                worker.kill();
                worker.join(None);
            }
        }
    }

    fn stop_all(&mut self) {
        for worker in &self.workers {
            worker.terminate();
        }
        let workers = std::mem::take(&mut self.workers);
        for worker in &workers {
            self.stop_worker(worker);
        }
        self.state.worker_pids.lock().clear();
    }
}

/// Worker-mode entry: reconstruct the socket and configuration from the
/// environment and run the engine until the shutdown signal.
fn run_worker<F>(factory: &F) -> Result<()>
where
    F: Fn() -> App,
{
    let payload = std::env::var(WORKER_CONFIG_ENV)
        .map_err(|_| Error::Fatal("worker started without configuration".into()))?;
    let payload: WorkerPayload =
        serde_json::from_str(&payload).map_err(|e| Error::Fatal(e.to_string()))?;

    #[cfg(unix)]
    let holder = {
        let socket = std::env::var(SOCKET_ENV)
            .map_err(|_| Error::Fatal("worker started without a socket".into()))?;
        SocketHolder::from_env_payload(&socket)?
    };
    #[cfg(not(unix))]
    return Err(Error::Fatal(
        "worker processes are not supported on this platform".into(),
    ));

    #[cfg(unix)]
    {
        if let Some(name) = &payload.process_name {
            tracing::info!(process = %name, worker = payload.config.id, "worker starting");
        }
        let app = factory();
        let scheduler = build_scheduler(
            payload.scheduler_impl,
            payload.config.blocking_threads,
            payload.config.blocking_threads_idle_timeout,
        )?;
        let statics = payload
            .static_mount
            .map(|mount| Arc::new(mount) as Arc<dyn StaticFiles>);
        let shutdown = ShutdownEvent::new();
        let worker = Worker::new(payload.config);
        worker.serve(app, scheduler, holder, shutdown, statics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Server {
        Server::new(ListenerSpec::tcp("127.0.0.1", 0, 1024))
    }

    #[test]
    fn test_backpressure_defaults_to_backlog_share() {
        let mut server = server();
        server.workers = 4;
        assert_eq!(server.resolved_backpressure(), 256);
        server.backpressure = Some(10);
        assert_eq!(server.resolved_backpressure(), 10);
    }

    #[test]
    fn test_blocking_threads_defaults() {
        let mut server = server();
        server.workers = 4;
        assert_eq!(
            server.resolved_blocking_threads(Interface::AsyncCallback),
            1
        );
        assert_eq!(server.resolved_blocking_threads(Interface::SyncIter), 128);
    }

    #[test]
    fn test_worker_config_valid_by_default() {
        let config = server().worker_config(Interface::AsyncMessage).unwrap();
        assert_eq!(config.backpressure, 1024);
        assert_eq!(config.blocking_threads, 1);
    }

    #[test]
    fn test_short_lifetime_rejected() {
        let mut server = server();
        server.workers_lifetime = Some(30);
        assert!(server.worker_config(Interface::AsyncMessage).is_err());
    }

    #[test]
    fn test_reload_excludes_lifetime_and_rss() {
        let mut server = server();
        server.reload = Some(ReloadConfig::default());
        assert!(server.worker_config(Interface::AsyncMessage).is_ok());

        server.workers_lifetime = Some(120);
        assert!(server.worker_config(Interface::AsyncMessage).is_err());

        server.workers_lifetime = None;
        server.workers_max_rss = Some(1 << 30);
        assert!(server.worker_config(Interface::AsyncMessage).is_err());
    }

    #[test]
    fn test_crash_loop_window() {
        // The window the serve loop uses to declare a crash loop.
        assert_eq!(CRASH_LOOP_WINDOW, Duration::from_millis(5500));
    }
}
