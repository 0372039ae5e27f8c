//! Gantry is a multi-protocol HTTP/WebSocket application server runtime.
//!
//! The runtime owns sockets, decodes HTTP/1 and HTTP/2 (cleartext or TLS),
//! supervises a worker fleet and bridges wire-level requests to user
//! handlers written against one of three interfaces: a callback-based async
//! interface, a message-passing async interface, or a synchronous
//! iterator-based interface.
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use gantry_core as core;
#[doc(no_inline)]
pub use gantry_core::*;

#[cfg(feature = "serve-static")]
#[cfg_attr(docsrs, doc(cfg(feature = "serve-static")))]
#[doc(no_inline)]
pub use gantry_serve_static as serve_static;

#[cfg(feature = "supervisor")]
#[cfg_attr(docsrs, doc(cfg(feature = "supervisor")))]
#[doc(no_inline)]
pub use gantry_supervisor as supervisor;

#[cfg(feature = "serve-static")]
#[doc(no_inline)]
pub use gantry_serve_static::StaticMount;

#[cfg(feature = "supervisor")]
#[doc(no_inline)]
pub use gantry_supervisor::{EmbeddedServer, ReloadConfig, Server};
