//! Worker engine: accept loop, protocol state machines and request dispatch.

pub(crate) mod service;
pub mod ws;

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use http::{HeaderMap, Method};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::fs::CHUNK_SIZE;
use crate::http::{Http1Settings, Http2Settings, HttpMode};
use crate::interface::{App, Interface};
use crate::lifespan::Lifespan;
use crate::net::{SocketAddr, SocketHolder, Stream};
use crate::scheduler::Scheduler;
use crate::scope::ResponseIntent;
use crate::signals::ShutdownEvent;
use crate::tls::TlsConfig;

/// How the native reactor schedules its threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeMode {
    /// One OS thread runs the reactor.
    #[default]
    St,
    /// A work-stealing pool of reactor threads.
    Mt,
}

/// Special-path handler for static file mounts.
///
/// Implemented outside the core crate; the engine consults it before
/// dispatching to user code.
pub trait StaticFiles: Send + Sync + 'static {
    /// Whether `path` falls under this mount's URL prefix.
    fn matches(&self, path: &str) -> bool;

    /// Produce the response for a matched path. Called for `GET` and `HEAD`
    /// only.
    fn handle(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> BoxFuture<'static, ResponseIntent>;
}

/// Flattened per-worker configuration record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker index, 1-based in log output.
    pub id: usize,
    /// Reactor threading mode.
    pub runtime_mode: RuntimeMode,
    /// Reactor threads in `mt` mode.
    pub runtime_threads: usize,
    /// Blocking pool size of the reactor runtime.
    pub runtime_blocking_threads: Option<usize>,
    /// Blocking pool size of the user runtime. Must be 1 for the async
    /// interfaces.
    pub blocking_threads: usize,
    /// Idle seconds before a blocking thread is reaped. Range 10..=600.
    pub blocking_threads_idle_timeout: u64,
    /// Maximum concurrently dispatched handlers on this worker.
    pub backpressure: usize,
    /// Protocol selection mode.
    pub http: HttpMode,
    /// HTTP/1 settings.
    pub http1: Http1Settings,
    /// HTTP/2 settings.
    pub http2: Http2Settings,
    /// Allow WebSocket upgrades.
    pub websockets: bool,
    /// TLS configuration, when serving HTTPS.
    pub tls: Option<TlsConfig>,
    /// Emit one access log event per request.
    pub log_access: bool,
    /// Seconds granted to in-flight requests after the shutdown signal
    /// before remaining work is abandoned.
    pub shutdown_grace: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: 1,
            runtime_mode: RuntimeMode::St,
            runtime_threads: 1,
            runtime_blocking_threads: None,
            blocking_threads: 1,
            blocking_threads_idle_timeout: 30,
            backpressure: 128,
            http: HttpMode::Auto,
            http1: Http1Settings::default(),
            http2: Http2Settings::default(),
            websockets: true,
            tls: None,
            log_access: false,
            shutdown_grace: 30,
        }
    }
}

impl WorkerConfig {
    /// Validate against the interface the worker will host.
    pub fn validate(&self, interface: Interface) -> Result<()> {
        if self.runtime_threads < 1 {
            return Err(Error::config("runtime_threads"));
        }
        if self.backpressure < 1 {
            return Err(Error::config("backpressure"));
        }
        if self.blocking_threads < 1 {
            return Err(Error::config("blocking_threads"));
        }
        if interface != Interface::SyncIter && self.blocking_threads != 1 {
            return Err(Error::config(
                "blocking_threads must be 1 on async interfaces",
            ));
        }
        if self.blocking_threads_idle_timeout < 10 || self.blocking_threads_idle_timeout > 600 {
            return Err(Error::config("blocking_threads_idle_timeout"));
        }
        self.http1.validate()?;
        self.http2.validate()?;
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }

    /// Channel slots for streamed response bodies, derived from the send
    /// buffer budget.
    pub(crate) fn stream_buffer_slots(&self) -> usize {
        ((self.http2.max_send_buffer_size as u64 / CHUNK_SIZE) as usize).max(1)
    }
}

pub(crate) struct WorkerCtx {
    pub(crate) cfg: WorkerConfig,
    pub(crate) app: App,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) statics: Option<Arc<dyn StaticFiles>>,
    pub(crate) lifespan: Option<Arc<Lifespan>>,
}

/// One worker's protocol engine.
#[derive(Debug)]
pub struct Worker {
    config: WorkerConfig,
}

impl Worker {
    /// Create a worker from its configuration.
    #[must_use]
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Build the reactor runtime and serve until `shutdown` fires.
    ///
    /// This is the multi-process entry point: it owns the calling thread,
    /// installs interrupt signal handlers and drives the lifespan protocol
    /// for callback applications.
    pub fn serve(
        &self,
        app: App,
        scheduler: Arc<dyn Scheduler>,
        holder: SocketHolder,
        shutdown: ShutdownEvent,
        statics: Option<Arc<dyn StaticFiles>>,
    ) -> Result<()> {
        let runtime = match self.config.runtime_mode {
            RuntimeMode::St => {
                let mut builder = tokio::runtime::Builder::new_current_thread();
                builder.enable_all();
                builder
                    .max_blocking_threads(self.config.runtime_blocking_threads.unwrap_or(512));
                builder.build()?
            }
            RuntimeMode::Mt => {
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                builder
                    .worker_threads(self.config.runtime_threads)
                    .enable_all()
                    .max_blocking_threads(self.config.runtime_blocking_threads.unwrap_or(512));
                builder.build()?
            }
        };
        runtime.block_on(async {
            tokio::spawn(crate::signals::watch_interrupt_signals(shutdown.clone()));
            self.serve_async(app, scheduler, holder, shutdown, statics).await
        })
    }

    /// Serve on the current runtime. Embedded-mode entry point; no signal
    /// handlers are installed here.
    pub async fn serve_async(
        &self,
        app: App,
        scheduler: Arc<dyn Scheduler>,
        holder: SocketHolder,
        shutdown: ShutdownEvent,
        statics: Option<Arc<dyn StaticFiles>>,
    ) -> Result<()> {
        self.config.validate(app.interface())?;

        // Callback applications get the lifespan protocol once per worker.
        let lifespan = match &app {
            App::Callback(handler) => {
                let lifespan = Arc::new(Lifespan::new(handler.clone()));
                lifespan.startup(scheduler.as_ref()).await?;
                Some(lifespan)
            }
            _ => None,
        };

        let listener = holder.into_listener()?;
        let local_addr = listener.local_addr();

        let tls_acceptor = match &self.config.tls {
            Some(tls) => {
                let server_config = tls.build_server_config(self.config.http)?;
                Some(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)))
            }
            None => None,
        };

        let mut http1 = hyper::server::conn::http1::Builder::new();
        http1.timer(TokioTimer::new());
        self.config.http1.apply(&mut http1);
        let mut http2 = hyper::server::conn::http2::Builder::new(TokioExecutor::new());
        http2.timer(TokioTimer::new());
        self.config.http2.apply(&mut http2);

        let ctx = Arc::new(WorkerCtx {
            semaphore: Arc::new(Semaphore::new(self.config.backpressure)),
            cfg: self.config.clone(),
            app,
            scheduler,
            statics,
            lifespan,
        });

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracing::info!(
            worker = self.config.id,
            addr = %local_addr,
            "worker online"
        );

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = shutdown.wait() => break,
            };
            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    continue;
                }
            };

            let conn = ConnTask {
                ctx: ctx.clone(),
                http1: http1.clone(),
                http2: http2.clone(),
                tls_acceptor: tls_acceptor.clone(),
                token: token.child_token(),
                peer_addr,
                local_addr: local_addr.clone(),
            };
            tracker.spawn(conn.run(stream));
        }

        // Stop accepting, drain in-flight connections up to the grace
        // period, then abandon whatever is left.
        drop(listener);
        token.cancel();
        tracker.close();
        let drained =
            tokio::time::timeout(Duration::from_secs(self.config.shutdown_grace), tracker.wait())
                .await;
        if drained.is_err() {
            tracing::warn!(
                worker = self.config.id,
                "graceful period expired with requests in flight"
            );
        }
        if let Some(lifespan) = &ctx.lifespan {
            lifespan.shutdown().await;
        }
        ctx.scheduler.close();
        tracing::info!(worker = self.config.id, "worker stopped");
        Ok(())
    }
}

struct ConnTask {
    ctx: Arc<WorkerCtx>,
    http1: hyper::server::conn::http1::Builder,
    http2: hyper::server::conn::http2::Builder<TokioExecutor>,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    token: CancellationToken,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl ConnTask {
    async fn run(self, stream: Stream) {
        match &self.tls_acceptor {
            Some(acceptor) => {
                let accepted = tokio::select! {
                    accepted = acceptor.accept(stream) => accepted,
                    () = self.token.cancelled() => return,
                };
                let tls_stream = match accepted {
                    Ok(tls_stream) => tls_stream,
                    Err(e) => {
                        tracing::debug!(peer = %self.peer_addr, error = %e, "tls handshake failed");
                        return;
                    }
                };
                let use_http2 = match self.ctx.cfg.http {
                    HttpMode::Http2 => true,
                    HttpMode::Http1 => false,
                    HttpMode::Auto => {
                        tls_stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice())
                    }
                };
                self.drive(tls_stream, true, use_http2).await;
            }
            None => {
                let use_http2 = matches!(self.ctx.cfg.http, HttpMode::Http2);
                self.drive(stream, false, use_http2).await;
            }
        }
    }

    async fn drive<I>(&self, io: I, tls: bool, use_http2: bool)
    where
        I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = self.ctx.clone();
        let peer_addr = self.peer_addr.clone();
        let local_addr = self.local_addr.clone();
        let http_version = if use_http2 {
            http::Version::HTTP_2
        } else {
            http::Version::HTTP_11
        };
        let service = service_fn(move |req| {
            service::handle_request(
                ctx.clone(),
                service::ConnInfo {
                    peer_addr: peer_addr.clone(),
                    server_addr: local_addr.clone(),
                    tls,
                    http_version,
                },
                req,
            )
        });

        if use_http2 {
            let mut conn = pin!(self.http2.serve_connection(TokioIo::new(io), service));
            tokio::select! {
                result = conn.as_mut() => log_conn_result(&self.peer_addr, result),
                () = self.token.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    log_conn_result(&self.peer_addr, conn.as_mut().await);
                }
            }
        } else {
            let mut conn = pin!(
                self.http1
                    .serve_connection(TokioIo::new(io), service)
                    .with_upgrades()
            );
            tokio::select! {
                result = conn.as_mut() => log_conn_result(&self.peer_addr, result),
                () = self.token.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    log_conn_result(&self.peer_addr, conn.as_mut().await);
                }
            }
        }
    }
}

fn log_conn_result(peer: &SocketAddr, result: std::result::Result<(), hyper::Error>) {
    if let Err(e) = result {
        // Header read timeouts and peer disconnects land here; both close
        // the connection.
        tracing::debug!(peer = %peer, error = %e, "connection terminated");
    }
}
