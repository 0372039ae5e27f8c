//! Application interface dialects and their transports.
//!
//! The three dialects differ in message shape, not transport: a tagged
//! [`App`] selects the dispatch path and the response encoding. User code is
//! registered as a trait object behind one of [`CallbackHandler`],
//! [`MessageHandler`] or [`SyncHandler`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::scope::{ResponseIntent, Scope};
use crate::worker::ws::WsTransport;

/// Interface dialect tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interface {
    /// Callback-based async interface with message channels and lifespan.
    AsyncCallback,
    /// Message-passing async interface with explicit response committers.
    AsyncMessage,
    /// Synchronous iterator-based interface, run on the blocking pool.
    SyncIter,
}

/// The registered application.
#[derive(Clone)]
pub enum App {
    /// Callback-based async handler.
    Callback(Arc<dyn CallbackHandler>),
    /// Message-passing async handler.
    Message(Arc<dyn MessageHandler>),
    /// Synchronous handler.
    Sync(Arc<dyn SyncHandler>),
}

impl App {
    /// Dialect tag of this application.
    #[must_use]
    pub fn interface(&self) -> Interface {
        match self {
            Self::Callback(_) => Interface::AsyncCallback,
            Self::Message(_) => Interface::AsyncMessage,
            Self::Sync(_) => Interface::SyncIter,
        }
    }

    /// Whether the dialect can host WebSocket sessions.
    #[must_use]
    pub fn supports_websockets(&self) -> bool {
        !matches!(self, Self::Sync(_))
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "App::{:?}", self.interface())
    }
}

/// Handler contract for the callback-based async interface.
#[async_trait]
pub trait CallbackHandler: Send + Sync + 'static {
    /// Handle one scope. `channel` carries request events in and response
    /// events out; the handler must emit a complete response (or lifespan
    /// acknowledgement) before returning.
    async fn call(&self, scope: Scope, channel: MessageChannel) -> Result<()>;
}

/// Handler contract for the message-passing async interface.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one HTTP request.
    async fn call(&self, scope: Scope, transport: HttpTransport) -> Result<()>;

    /// Handle one WebSocket handshake. The default declines.
    async fn call_ws(&self, scope: Scope, handshake: WsHandshake) -> Result<()> {
        let _ = scope;
        handshake.reject(403)
    }
}

/// Handler contract for the synchronous iterator interface.
pub trait SyncHandler: Send + Sync + 'static {
    /// Handle one request with its fully-buffered body.
    fn call(&self, scope: Scope, body: Bytes) -> Result<SyncResponse>;
}

/// Response produced by a [`SyncHandler`].
pub struct SyncResponse {
    /// Response status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: SyncBody,
}

/// Body shapes a synchronous handler can produce.
pub enum SyncBody {
    /// One buffer.
    Bytes(Vec<u8>),
    /// Iterator of chunks, drained on the blocking pool.
    Iter(Box<dyn Iterator<Item = Vec<u8>> + Send>),
    /// File served from disk.
    File(PathBuf),
}

impl fmt::Debug for SyncBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "SyncBody::Bytes({} bytes)", bytes.len()),
            Self::Iter(_) => f.write_str("SyncBody::Iter(..)"),
            Self::File(path) => write!(f, "SyncBody::File({})", path.display()),
        }
    }
}

impl fmt::Debug for SyncResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Events delivered to a callback handler.
#[derive(Debug)]
#[non_exhaustive]
pub enum InMessage {
    /// A request body chunk. `more` is false on the final chunk.
    Body {
        /// Chunk payload.
        chunk: Bytes,
        /// Whether more chunks follow.
        more: bool,
    },
    /// A WebSocket client completed the upgrade handshake validation.
    WsConnect,
    /// Incoming WebSocket text frame.
    WsText(String),
    /// Incoming WebSocket binary frame.
    WsBytes(Bytes),
    /// The WebSocket peer closed, with an optional close code.
    WsClose(Option<u16>),
    /// Lifespan startup request.
    LifespanStartup,
    /// Lifespan shutdown request.
    LifespanShutdown,
}

/// Events emitted by a callback handler.
#[derive(Debug)]
#[non_exhaustive]
pub enum OutMessage {
    /// Begin the HTTP response.
    ResponseStart {
        /// Response status code.
        status: u16,
        /// Response headers.
        headers: Vec<(String, String)>,
    },
    /// A response body chunk. `more` is false on the final chunk.
    ResponseBody {
        /// Chunk payload.
        chunk: Bytes,
        /// Whether more chunks follow.
        more: bool,
    },
    /// Serve a file as the whole response body.
    ResponseFile {
        /// File path.
        path: PathBuf,
    },
    /// Accept a pending WebSocket handshake.
    WsAccept,
    /// Decline a pending WebSocket handshake with this HTTP status.
    WsReject {
        /// Response status code.
        status: u16,
    },
    /// Outgoing WebSocket text frame.
    WsText(String),
    /// Outgoing WebSocket binary frame.
    WsBytes(Bytes),
    /// Close the WebSocket session.
    WsClose(Option<u16>),
    /// Merge entries into the worker's lifespan state bag.
    LifespanState(std::collections::HashMap<String, serde_json::Value>),
    /// Lifespan startup succeeded.
    LifespanStartupComplete,
    /// Lifespan startup failed.
    LifespanStartupFailed(String),
    /// Lifespan shutdown succeeded.
    LifespanShutdownComplete,
    /// Lifespan shutdown failed.
    LifespanShutdownFailed(String),
}

/// Handler side of a callback message exchange.
#[derive(Debug)]
pub struct MessageChannel {
    rx: mpsc::UnboundedReceiver<InMessage>,
    tx: mpsc::UnboundedSender<OutMessage>,
}

impl MessageChannel {
    /// Receive the next event. Errors with [`Error::ProtocolClosed`] when
    /// the connection is gone.
    pub async fn recv(&mut self) -> Result<InMessage> {
        self.rx.recv().await.ok_or(Error::ProtocolClosed)
    }

    /// Emit an event. Errors with [`Error::ProtocolClosed`] when the
    /// connection is gone.
    pub fn send(&self, message: OutMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::ProtocolClosed)
    }
}

/// Engine side of a callback message exchange.
#[derive(Debug)]
pub(crate) struct EngineChannel {
    pub(crate) tx: mpsc::UnboundedSender<InMessage>,
    pub(crate) rx: mpsc::UnboundedReceiver<OutMessage>,
}

impl EngineChannel {
    pub(crate) async fn recv(&mut self) -> Result<OutMessage> {
        self.rx.recv().await.ok_or(Error::ProtocolClosed)
    }

    pub(crate) fn send(&self, message: InMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::ProtocolClosed)
    }
}

/// Create a connected engine/handler channel pair.
pub(crate) fn message_channel() -> (EngineChannel, MessageChannel) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (
        EngineChannel {
            tx: in_tx,
            rx: out_rx,
        },
        MessageChannel {
            rx: in_rx,
            tx: out_tx,
        },
    )
}

/// Per-request I/O handle for the message-passing interface.
///
/// Owns the request body and a single-use response committer. Committing a
/// second response is a protocol error.
pub struct HttpTransport {
    body: Option<hyper::body::Incoming>,
    committer: Option<oneshot::Sender<ResponseIntent>>,
    stream_buffer: usize,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("committed", &self.committer.is_none())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub(crate) fn new(
        body: hyper::body::Incoming,
        committer: oneshot::Sender<ResponseIntent>,
        stream_buffer: usize,
    ) -> Self {
        Self {
            body: Some(body),
            committer: Some(committer),
            stream_buffer,
        }
    }

    /// Await the next request body chunk. `None` marks the end of the body.
    pub async fn request_chunk(&mut self) -> Result<Option<Bytes>> {
        let body = self.body.as_mut().ok_or(Error::ProtocolClosed)?;
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        return Ok(Some(data));
                    }
                    // Trailers; skip.
                }
                Some(Err(e)) => return Err(Error::Hyper(e)),
                None => {
                    self.body = None;
                    return Ok(None);
                }
            }
        }
    }

    /// Collect the whole request body.
    pub async fn request_body(&mut self) -> Result<Bytes> {
        let body = self.body.take().ok_or(Error::ProtocolClosed)?;
        let collected = body.collect().await?;
        Ok(collected.to_bytes())
    }

    fn commit(&mut self, intent: ResponseIntent) -> Result<()> {
        let committer = self
            .committer
            .take()
            .ok_or_else(|| Error::Protocol("response already committed".into()))?;
        committer.send(intent).map_err(|_| Error::ProtocolClosed)
    }

    /// Commit an empty response.
    pub fn response_empty(&mut self, status: StatusCode, headers: HeaderMap) -> Result<()> {
        self.commit(ResponseIntent::empty(status, headers))
    }

    /// Commit a single-buffer response.
    pub fn response_bytes(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<()> {
        self.commit(ResponseIntent::bytes(status, headers, body))
    }

    /// Commit a string response.
    pub fn response_str(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        body: String,
    ) -> Result<()> {
        self.commit(ResponseIntent::bytes(status, headers, body.into()))
    }

    /// Commit a whole-file response.
    pub fn response_file(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        path: impl Into<PathBuf>,
    ) -> Result<()> {
        self.commit(ResponseIntent::file(status, headers, path))
    }

    /// Commit a file-segment response of `len` bytes from `start`.
    pub fn response_file_range(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        path: impl Into<PathBuf>,
        start: u64,
        len: u64,
    ) -> Result<()> {
        self.commit(ResponseIntent::file_range(status, headers, path, start, len))
    }

    /// Commit a streamed response, returning the chunk sender. The sender
    /// blocks once the engine's write buffer is full, back-pressuring the
    /// producer.
    pub fn response_stream(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
    ) -> Result<mpsc::Sender<Bytes>> {
        let (intent, tx) = ResponseIntent::stream(status, headers, self.stream_buffer);
        self.commit(intent)?;
        Ok(tx)
    }
}

pub(crate) enum WsDecision {
    Accept,
    Reject(u16),
}

/// Pending WebSocket handshake handed to a [`MessageHandler`].
pub struct WsHandshake {
    decision: oneshot::Sender<WsDecision>,
    transport: oneshot::Receiver<WsTransport>,
}

impl fmt::Debug for WsHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WsHandshake")
    }
}

impl WsHandshake {
    pub(crate) fn new(
        decision: oneshot::Sender<WsDecision>,
        transport: oneshot::Receiver<WsTransport>,
    ) -> Self {
        Self {
            decision,
            transport,
        }
    }

    /// Accept the handshake and wait for the upgraded transport.
    pub async fn accept(self) -> Result<WsTransport> {
        self.decision
            .send(WsDecision::Accept)
            .map_err(|_| Error::ProtocolClosed)?;
        self.transport.await.map_err(|_| Error::ProtocolClosed)
    }

    /// Decline the handshake; the client receives `status`.
    pub fn reject(self, status: u16) -> Result<()> {
        self.decision
            .send(WsDecision::Reject(status))
            .map_err(|_| Error::ProtocolClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_channel_round_trip() {
        let (engine, mut handler) = message_channel();
        engine
            .send(InMessage::Body {
                chunk: Bytes::from_static(b"x"),
                more: false,
            })
            .unwrap();
        let InMessage::Body { chunk, more } = handler.recv().await.unwrap() else {
            panic!("expected body message");
        };
        assert_eq!(chunk, "x");
        assert!(!more);
    }

    #[tokio::test]
    async fn test_message_channel_closed() {
        let (engine, handler) = message_channel();
        drop(handler);
        assert!(matches!(
            engine.send(InMessage::WsConnect),
            Err(Error::ProtocolClosed)
        ));
    }

    #[tokio::test]
    async fn test_ws_handshake_reject() {
        let (decision_tx, decision_rx) = oneshot::channel();
        let (_transport_tx, transport_rx) = oneshot::channel();
        let handshake = WsHandshake::new(decision_tx, transport_rx);
        handshake.reject(403).unwrap();
        assert!(matches!(
            decision_rx.await.unwrap(),
            WsDecision::Reject(403)
        ));
    }
}
