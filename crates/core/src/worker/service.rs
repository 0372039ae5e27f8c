//! Per-request translation between the wire protocol and interface events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::sync::{OwnedSemaphorePermit, mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result};
use crate::fs::{file_body, whole_file_body};
use crate::http::ResBody;
use crate::interface::{
    App, EngineChannel, HttpTransport, InMessage, OutMessage, SyncBody, WsDecision, WsHandshake,
    message_channel,
};
use crate::net::SocketAddr;
use crate::scheduler::{Completion, Watcher};
use crate::scope::{BodyIntent, ResponseIntent, Scope, ScopeProtocol};
use crate::worker::ws;
use crate::worker::WorkerCtx;

/// Connection-level facts shared by every request on the connection.
#[derive(Clone, Debug)]
pub(crate) struct ConnInfo {
    pub(crate) peer_addr: SocketAddr,
    pub(crate) server_addr: SocketAddr,
    pub(crate) tls: bool,
    pub(crate) http_version: Version,
}

pub(crate) async fn handle_request(
    ctx: Arc<WorkerCtx>,
    conn: ConnInfo,
    req: hyper::Request<Incoming>,
) -> std::result::Result<hyper::Response<ResBody>, Infallible> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = percent_encoding::percent_decode_str(req.uri().path())
        .decode_utf8_lossy()
        .into_owned();

    let response = route_request(&ctx, &conn, req, &path).await;

    if ctx.cfg.log_access {
        tracing::info!(
            target: "gantry::access",
            peer = %conn.peer_addr,
            method = %method,
            path = %path,
            version = ?conn.http_version,
            status = response.status().as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "request"
        );
    }
    Ok(response)
}

async fn route_request(
    ctx: &Arc<WorkerCtx>,
    conn: &ConnInfo,
    req: hyper::Request<Incoming>,
    path: &str,
) -> hyper::Response<ResBody> {
    // Static mounts are checked before user code.
    if let Some(statics) = &ctx.statics {
        if (req.method() == http::Method::GET || req.method() == http::Method::HEAD)
            && statics.matches(path)
        {
            let intent = statics
                .handle(req.method(), path, req.headers())
                .await;
            return encode_intent(intent).await;
        }
    }

    if ws::is_upgrade_request(&req) {
        // Upgrades are only valid on HTTP/1 connections with an interface
        // that can host them.
        if conn.http_version == Version::HTTP_2
            || !ctx.cfg.websockets
            || !ctx.app.supports_websockets()
        {
            return status_response(StatusCode::BAD_REQUEST);
        }
        return handle_ws(ctx, conn, req, path).await;
    }

    handle_http(ctx, conn, req, path).await
}

fn build_scope(
    ctx: &WorkerCtx,
    conn: &ConnInfo,
    req: &hyper::Request<Incoming>,
    path: &str,
    protocol: ScopeProtocol,
) -> Scope {
    let authority = req
        .uri()
        .authority()
        .map(|a| a.as_str().to_owned())
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned)
        });
    Scope {
        protocol,
        http_version: conn.http_version,
        scheme: if conn.tls { "https" } else { "http" },
        method: req.method().clone(),
        path: path.to_owned(),
        query_string: req.uri().query().unwrap_or_default().to_owned(),
        headers: req.headers().clone(),
        peer_addr: conn.peer_addr.clone(),
        server_addr: conn.server_addr.clone(),
        tls: conn.tls,
        authority,
        state: ctx
            .lifespan
            .as_ref()
            .map(|l| l.state_snapshot())
            .unwrap_or_default(),
    }
}

async fn handle_http(
    ctx: &Arc<WorkerCtx>,
    conn: &ConnInfo,
    req: hyper::Request<Incoming>,
    path: &str,
) -> hyper::Response<ResBody> {
    let permit = acquire_permit(ctx).await;
    let scope = build_scope(ctx, conn, &req, path, ScopeProtocol::Http);
    let body = req.into_body();

    let result = match &ctx.app {
        App::Callback(handler) => {
            dispatch_callback(ctx, handler.clone(), scope, body, permit).await
        }
        App::Message(handler) => {
            dispatch_message(ctx, handler.clone(), scope, body, permit).await
        }
        App::Sync(handler) => dispatch_sync(ctx, handler.clone(), scope, body, permit).await,
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            if !e.is_closed() {
                tracing::error!(error = %e, "handler failed before committing a response");
            }
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn acquire_permit(ctx: &Arc<WorkerCtx>) -> OwnedSemaphorePermit {
    // The gate never closes while the worker runs; acquire errors cannot
    // happen outside shutdown, where parking forever is fine.
    match ctx.semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => std::future::pending().await,
    }
}

/// Hold the backpressure permit until the handler reports completion, then
/// log any late failure.
fn release_after_completion(
    completion: oneshot::Receiver<Completion>,
    permit: OwnedSemaphorePermit,
) {
    tokio::spawn(async move {
        if let Ok(Err(message)) = completion.await {
            if message != "cancelled" {
                tracing::error!(error = %message, "handler failed after committing its response");
            }
        }
        drop(permit);
    });
}

/// Cancels the dispatched handler when the connection goes away before a
/// response was produced.
struct CancelGuard {
    watcher: Arc<Watcher>,
    armed: bool,
}

impl CancelGuard {
    fn new(watcher: Arc<Watcher>) -> Self {
        Self {
            watcher,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.watcher.cancel();
        }
    }
}

async fn dispatch_message(
    ctx: &Arc<WorkerCtx>,
    handler: Arc<dyn crate::interface::MessageHandler>,
    scope: Scope,
    body: Incoming,
    permit: OwnedSemaphorePermit,
) -> Result<hyper::Response<ResBody>> {
    let (intent_tx, mut intent_rx) = oneshot::channel();
    let transport = HttpTransport::new(body, intent_tx, ctx.cfg.stream_buffer_slots());
    let (watcher, mut completion) = Watcher::new(scope.clone());
    let mut guard = CancelGuard::new(watcher.clone());

    let handler_scope = scope;
    ctx.scheduler.dispatch(
        watcher,
        Box::pin(async move { handler.call(handler_scope, transport).await }),
    );

    let intent = tokio::select! {
        biased;
        intent = &mut intent_rx => intent.ok(),
        outcome = &mut completion => {
            match outcome {
                Ok(Err(message)) => {
                    guard.disarm();
                    drop(permit);
                    return Err(Error::handler(message));
                }
                // Handler finished; a response may have been committed in
                // its final moments.
                _ => intent_rx.try_recv().ok(),
            }
        }
    };
    guard.disarm();

    match intent {
        Some(intent) => {
            release_after_completion(completion, permit);
            Ok(encode_intent(intent).await)
        }
        None => {
            drop(permit);
            Err(Error::Protocol("handler committed no response".into()))
        }
    }
}

async fn dispatch_callback(
    ctx: &Arc<WorkerCtx>,
    handler: Arc<dyn crate::interface::CallbackHandler>,
    scope: Scope,
    body: Incoming,
    permit: OwnedSemaphorePermit,
) -> Result<hyper::Response<ResBody>> {
    let (mut engine, channel) = message_channel();
    let (watcher, completion) = Watcher::new(scope.clone());
    let mut guard = CancelGuard::new(watcher.clone());

    let handler_scope = scope;
    ctx.scheduler.dispatch(
        watcher,
        Box::pin(async move { handler.call(handler_scope, channel).await }),
    );

    // Feed the request body as it arrives.
    let body_tx = engine.tx.clone();
    tokio::spawn(pump_request_body(body, body_tx));

    // First event must start the response (or declare a file body).
    let (status, headers) = loop {
        match engine.recv().await {
            Ok(OutMessage::ResponseStart { status, headers }) => {
                let status = StatusCode::from_u16(status)
                    .map_err(|_| Error::Protocol("invalid response status".into()))?;
                let headers = headers_from_pairs(&headers)?;
                break (status, headers);
            }
            Ok(OutMessage::ResponseFile { path }) => {
                guard.disarm();
                release_after_completion(completion, permit);
                let intent =
                    ResponseIntent::file(StatusCode::OK, HeaderMap::new(), path);
                return Ok(encode_intent(intent).await);
            }
            Ok(_) => {}
            Err(_) => {
                guard.disarm();
                drop(permit);
                return Err(Error::Protocol("handler committed no response".into()));
            }
        }
    };

    // Body events follow. A single final chunk makes a buffered response;
    // anything longer streams.
    let intent = match engine.recv().await {
        Ok(OutMessage::ResponseBody { chunk, more: false }) => {
            ResponseIntent::bytes(status, headers, chunk)
        }
        Ok(OutMessage::ResponseBody { chunk, more: true }) => {
            let (intent, tx) =
                ResponseIntent::stream(status, headers, ctx.cfg.stream_buffer_slots());
            tokio::spawn(async move {
                if tx.send(chunk).await.is_err() {
                    return;
                }
                while let Ok(message) = engine.recv().await {
                    match message {
                        OutMessage::ResponseBody { chunk, more } => {
                            if !chunk.is_empty() && tx.send(chunk).await.is_err() {
                                break;
                            }
                            if !more {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            });
            intent
        }
        Ok(_) | Err(_) => ResponseIntent::empty(status, headers),
    };

    guard.disarm();
    release_after_completion(completion, permit);
    Ok(encode_intent(intent).await)
}

async fn pump_request_body(
    body: Incoming,
    tx: mpsc::UnboundedSender<InMessage>,
) {
    let mut body = body;
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(chunk) = frame.into_data() {
                    if tx
                        .send(InMessage::Body { chunk, more: true })
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Some(Err(_)) | None => break,
        }
    }
    let _ = tx.send(InMessage::Body {
        chunk: Bytes::new(),
        more: false,
    });
}

async fn dispatch_sync(
    ctx: &Arc<WorkerCtx>,
    handler: Arc<dyn crate::interface::SyncHandler>,
    scope: Scope,
    body: Incoming,
    permit: OwnedSemaphorePermit,
) -> Result<hyper::Response<ResBody>> {
    // The synchronous interface sees a fully-buffered request body.
    let body = body.collect().await?.to_bytes();
    let (intent_tx, mut intent_rx) = oneshot::channel();
    let (watcher, mut completion) = Watcher::new(scope.clone());
    let mut guard = CancelGuard::new(watcher.clone());
    let slots = ctx.cfg.stream_buffer_slots();

    let handler_scope = scope;
    ctx.scheduler.dispatch_blocking(
        watcher,
        Box::new(move || {
            let response = handler.call(handler_scope, body)?;
            let status = StatusCode::from_u16(response.status)
                .map_err(|_| Error::Protocol("invalid response status".into()))?;
            let headers = headers_from_pairs(&response.headers)?;
            match response.body {
                SyncBody::Bytes(bytes) => {
                    let _ = intent_tx.send(ResponseIntent::bytes(status, headers, bytes.into()));
                }
                SyncBody::File(path) => {
                    let _ = intent_tx.send(ResponseIntent::file(status, headers, path));
                }
                SyncBody::Iter(iter) => {
                    let (intent, tx) = ResponseIntent::stream(status, headers, slots);
                    if intent_tx.send(intent).is_err() {
                        return Ok(());
                    }
                    // Drained on this blocking thread; a full channel parks
                    // it until the reactor catches up.
                    for chunk in iter {
                        if chunk.is_empty() {
                            continue;
                        }
                        if tx.blocking_send(chunk.into()).is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(())
        }),
    );

    let intent = tokio::select! {
        biased;
        intent = &mut intent_rx => intent.ok(),
        outcome = &mut completion => {
            match outcome {
                Ok(Err(message)) => {
                    guard.disarm();
                    drop(permit);
                    return Err(Error::handler(message));
                }
                _ => intent_rx.try_recv().ok(),
            }
        }
    };
    guard.disarm();

    match intent {
        Some(intent) => {
            release_after_completion(completion, permit);
            Ok(encode_intent(intent).await)
        }
        None => {
            drop(permit);
            Err(Error::Protocol("handler committed no response".into()))
        }
    }
}

async fn handle_ws(
    ctx: &Arc<WorkerCtx>,
    conn: &ConnInfo,
    mut req: hyper::Request<Incoming>,
    path: &str,
) -> hyper::Response<ResBody> {
    let key = match ws::validate_upgrade(&req) {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!(peer = %conn.peer_addr, error = %e, "invalid websocket handshake");
            return status_response(StatusCode::BAD_REQUEST);
        }
    };
    let on_upgrade = hyper::upgrade::on(&mut req);
    let permit = acquire_permit(ctx).await;
    let scope = build_scope(ctx, conn, &req, path, ScopeProtocol::Ws);

    match &ctx.app {
        App::Message(handler) => {
            let (decision_tx, decision_rx) = oneshot::channel();
            let (transport_tx, transport_rx) = oneshot::channel();
            let handshake = WsHandshake::new(decision_tx, transport_rx);
            let (watcher, completion) = Watcher::new(scope.clone());
            let handler = handler.clone();
            let handler_scope = scope;
            ctx.scheduler.dispatch(
                watcher,
                Box::pin(async move { handler.call_ws(handler_scope, handshake).await }),
            );

            match decision_rx.await {
                Ok(WsDecision::Accept) => {
                    release_after_completion(completion, permit);
                    tokio::spawn(async move {
                        match on_upgrade.await {
                            Ok(upgraded) => {
                                let transport = ws::wrap_upgraded(upgraded).await;
                                let _ = transport_tx.send(transport);
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "websocket upgrade failed");
                            }
                        }
                    });
                    ws::upgrade_response(key)
                }
                Ok(WsDecision::Reject(status)) => {
                    drop(permit);
                    StatusCode::from_u16(status)
                        .map(status_response)
                        .unwrap_or_else(|_| status_response(StatusCode::FORBIDDEN))
                }
                Err(_) => {
                    drop(permit);
                    status_response(StatusCode::FORBIDDEN)
                }
            }
        }
        App::Callback(handler) => {
            let (engine, channel) = message_channel();
            let (watcher, completion) = Watcher::new(scope.clone());
            let handler = handler.clone();
            let handler_scope = scope;
            ctx.scheduler.dispatch(
                watcher,
                Box::pin(async move { handler.call(handler_scope, channel).await }),
            );

            let mut engine = engine;
            if engine.send(InMessage::WsConnect).is_err() {
                drop(permit);
                return status_response(StatusCode::FORBIDDEN);
            }
            loop {
                match engine.recv().await {
                    Ok(OutMessage::WsAccept) => {
                        release_after_completion(completion, permit);
                        tokio::spawn(async move {
                            match on_upgrade.await {
                                Ok(upgraded) => {
                                    let transport = ws::wrap_upgraded(upgraded).await;
                                    pump_ws_session(transport, engine).await;
                                }
                                Err(e) => {
                                    tracing::debug!(error = %e, "websocket upgrade failed");
                                }
                            }
                        });
                        return ws::upgrade_response(key);
                    }
                    Ok(OutMessage::WsReject { status }) => {
                        drop(permit);
                        return StatusCode::from_u16(status)
                            .map(status_response)
                            .unwrap_or_else(|_| status_response(StatusCode::FORBIDDEN));
                    }
                    Ok(_) => {}
                    Err(_) => {
                        drop(permit);
                        return status_response(StatusCode::FORBIDDEN);
                    }
                }
            }
        }
        App::Sync(_) => status_response(StatusCode::BAD_REQUEST),
    }
}

/// Shuttle frames between the upgraded stream and a callback handler's
/// channels until either side closes.
async fn pump_ws_session(mut transport: ws::WsTransport, engine: EngineChannel) {
    let EngineChannel { tx, mut rx } = engine;
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(OutMessage::WsText(text)) => {
                    if transport.send(ws::WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(OutMessage::WsBytes(bytes)) => {
                    if transport.send(ws::WsMessage::Bytes(bytes)).await.is_err() {
                        break;
                    }
                }
                Some(OutMessage::WsClose(code)) => {
                    let _ = transport.send(ws::WsMessage::Close(code)).await;
                    break;
                }
                Some(_) => {}
                None => {
                    let _ = transport.close().await;
                    break;
                }
            },
            inbound = transport.recv() => match inbound {
                Ok(Some(ws::WsMessage::Text(text))) => {
                    if tx.send(InMessage::WsText(text)).is_err() {
                        break;
                    }
                }
                Ok(Some(ws::WsMessage::Bytes(bytes))) => {
                    if tx.send(InMessage::WsBytes(bytes)).is_err() {
                        break;
                    }
                }
                Ok(Some(ws::WsMessage::Close(code))) => {
                    let _ = tx.send(InMessage::WsClose(code));
                    break;
                }
                Ok(None) | Err(_) => {
                    let _ = tx.send(InMessage::WsClose(None));
                    break;
                }
            },
        }
    }
}

pub(crate) fn headers_from_pairs(pairs: &[(String, String)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        let name = name
            .parse::<HeaderName>()
            .map_err(|_| Error::Protocol(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::Protocol(format!("invalid header value for {name}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

pub(crate) fn status_response(status: StatusCode) -> hyper::Response<ResBody> {
    let mut response = hyper::Response::new(ResBody::None);
    *response.status_mut() = status;
    response
}

pub(crate) async fn encode_intent(intent: ResponseIntent) -> hyper::Response<ResBody> {
    let ResponseIntent {
        status,
        headers,
        body,
    } = intent;

    let body = match body {
        BodyIntent::Empty => ResBody::None,
        BodyIntent::Bytes(bytes) => ResBody::from(bytes),
        BodyIntent::File(path) => match whole_file_body(&path).await {
            Ok((body, _)) => body,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "cannot open response file");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
        BodyIntent::FileRange { path, start, len } => match file_body(&path, start, len).await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "cannot open response file");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
        BodyIntent::Stream(rx) => ResBody::Stream(ReceiverStream::new(rx).map(Ok).boxed()),
    };

    let mut response = hyper::Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
