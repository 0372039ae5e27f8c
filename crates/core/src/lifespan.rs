//! Lifespan startup/shutdown protocol for the callback interface.
//!
//! Runs once per worker. The handler is dispatched with a lifespan scope and
//! kept alive across the worker's life; startup and shutdown are message
//! exchanges on its channel. A handler that fails before acknowledging is
//! treated as not supporting the protocol and skipped from then on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::interface::{
    CallbackHandler, EngineChannel, InMessage, OutMessage, message_channel,
};
use crate::net::SocketAddr;
use crate::scheduler::{Scheduler, Watcher};
use crate::scope::{Scope, ScopeProtocol};

/// Lifespan protocol driver and state bag owner.
pub struct Lifespan {
    app: Arc<dyn CallbackHandler>,
    state: Mutex<HashMap<String, serde_json::Value>>,
    unsupported: AtomicBool,
    channel: tokio::sync::Mutex<Option<EngineChannel>>,
}

impl std::fmt::Debug for Lifespan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifespan")
            .field("unsupported", &self.unsupported.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn lifespan_scope() -> Scope {
    Scope {
        protocol: ScopeProtocol::Lifespan,
        http_version: http::Version::HTTP_11,
        scheme: "http",
        method: http::Method::GET,
        path: String::new(),
        query_string: String::new(),
        headers: http::HeaderMap::new(),
        peer_addr: SocketAddr::Unknown,
        server_addr: SocketAddr::Unknown,
        tls: false,
        authority: None,
        state: HashMap::new(),
    }
}

impl Lifespan {
    /// Create a driver for `app`.
    #[must_use]
    pub fn new(app: Arc<dyn CallbackHandler>) -> Self {
        Self {
            app,
            state: Mutex::new(HashMap::new()),
            unsupported: AtomicBool::new(false),
            channel: tokio::sync::Mutex::new(None),
        }
    }

    /// Whether the application declined the protocol.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        self.unsupported.load(Ordering::SeqCst)
    }

    /// Shallow copy of the state bag for one request scope.
    #[must_use]
    pub fn state_snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.state.lock().clone()
    }

    /// Run the startup exchange.
    ///
    /// `Err` means the application reported a startup failure and the worker
    /// must exit with code 1. A handler error before any acknowledgement
    /// downgrades to unsupported mode and returns `Ok`.
    pub async fn startup(&self, scheduler: &dyn Scheduler) -> Result<()> {
        let (engine, channel) = message_channel();
        let scope = lifespan_scope();
        let (watcher, mut completion) = Watcher::new(scope.clone());
        let app = self.app.clone();
        scheduler.dispatch(
            watcher,
            Box::pin(async move { app.call(scope, channel).await }),
        );

        if engine.send(InMessage::LifespanStartup).is_err() {
            self.mark_unsupported();
            return Ok(());
        }

        let mut engine = engine;
        loop {
            tokio::select! {
                msg = engine.recv() => match msg {
                    Ok(OutMessage::LifespanState(entries)) => {
                        self.state.lock().extend(entries);
                    }
                    Ok(OutMessage::LifespanStartupComplete) => {
                        *self.channel.lock().await = Some(engine);
                        return Ok(());
                    }
                    Ok(OutMessage::LifespanStartupFailed(message)) => {
                        return Err(Error::Fatal(format!("lifespan startup failed: {message}")));
                    }
                    Ok(_) => {}
                    Err(_) => {
                        self.mark_unsupported();
                        return Ok(());
                    }
                },
                outcome = &mut completion => {
                    match outcome {
                        Ok(Err(message)) => {
                            tracing::warn!(
                                error = %message,
                                "lifespan handler failed before acknowledging startup, \
                                 continuing without lifespan support"
                            );
                        }
                        _ => {
                            tracing::warn!(
                                "lifespan handler exited before acknowledging startup, \
                                 continuing without lifespan support"
                            );
                        }
                    }
                    self.mark_unsupported();
                    return Ok(());
                }
            }
        }
    }

    /// Run the shutdown exchange. Failures are logged, never fatal.
    pub async fn shutdown(&self) {
        if self.is_unsupported() {
            return;
        }
        self.state.lock().clear();

        let mut guard = self.channel.lock().await;
        let Some(engine) = guard.as_mut() else {
            return;
        };
        if engine.send(InMessage::LifespanShutdown).is_err() {
            return;
        }
        loop {
            match engine.recv().await {
                Ok(OutMessage::LifespanShutdownComplete) => return,
                Ok(OutMessage::LifespanShutdownFailed(message)) => {
                    tracing::error!(error = %message, "lifespan shutdown failed");
                    return;
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    }

    fn mark_unsupported(&self) {
        self.unsupported.store(true, Ordering::SeqCst);
    }
}
