//! The core runtime crate of the gantry application server.
//!
//! `gantry_core` owns sockets, decodes HTTP/1 and HTTP/2 (cleartext or TLS),
//! bridges wire-level requests to user handlers through a scheduler, and
//! enforces per-worker backpressure. Process supervision lives in
//! `gantry-supervisor`; static file mounts in `gantry-serve-static`.
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Re-export `async_trait` for handler implementations.
pub use async_trait::async_trait;
pub use hyper;

pub mod error;
pub mod fs;
pub mod http;
pub mod interface;
pub mod lifespan;
pub mod net;
pub mod scheduler;
pub mod scope;
pub mod signals;
pub mod tls;
pub mod worker;

pub use error::{BoxedError, Error, Result};
pub use http::{Http1Settings, Http2Settings, HttpMode};
pub use interface::{
    App, CallbackHandler, HttpTransport, InMessage, Interface, MessageChannel, MessageHandler,
    OutMessage, SyncBody, SyncHandler, SyncResponse, WsHandshake,
};
pub use lifespan::Lifespan;
pub use net::{ListenerSpec, SocketHolder};
pub use scheduler::{
    CallbackScheduler, Scheduler, SchedulerImpl, TaskScheduler, Watcher, build_scheduler,
};
pub use scope::{BodyIntent, ResponseIntent, Scope, ScopeProtocol};
pub use signals::{ShutdownEvent, SyncShutdownEvent};
pub use tls::{MinTlsVersion, TlsConfig};
pub use worker::ws::{WsMessage, WsTransport};
pub use worker::{RuntimeMode, StaticFiles, Worker, WorkerConfig};
