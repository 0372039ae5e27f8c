//! WebSocket upgrade handling and session transport, RFC 6455.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use headers::{Connection, HeaderMapExt, SecWebsocketAccept, SecWebsocketKey, Upgrade};
use http::header::{SEC_WEBSOCKET_VERSION, UPGRADE};
use http::{Method, StatusCode};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, Role};

use crate::error::{Error, Result};
use crate::http::ResBody;

/// Whether the request asks for a connection upgrade to WebSocket.
pub(crate) fn is_upgrade_request<B>(req: &hyper::Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .typed_get::<Connection>()
        .map(|conn| conn.contains(UPGRADE))
        .unwrap_or(false);
    let upgrade_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_upgrade && upgrade_websocket
}

/// Validate the handshake headers and extract the client key.
pub(crate) fn validate_upgrade<B>(req: &hyper::Request<B>) -> Result<SecWebsocketKey> {
    if req.method() != Method::GET {
        return Err(Error::Protocol("websocket upgrade requires GET".into()));
    }
    let version_ok = req
        .headers()
        .get(SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "13")
        .unwrap_or(false);
    if !version_ok {
        return Err(Error::Protocol("unsupported websocket version".into()));
    }
    req.headers()
        .typed_get::<SecWebsocketKey>()
        .ok_or_else(|| Error::Protocol("missing sec-websocket-key".into()))
}

/// The `101 Switching Protocols` response for an accepted handshake.
pub(crate) fn upgrade_response(key: SecWebsocketKey) -> hyper::Response<ResBody> {
    let mut res = hyper::Response::new(ResBody::None);
    *res.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    res.headers_mut().typed_insert(Connection::upgrade());
    res.headers_mut().typed_insert(Upgrade::websocket());
    res.headers_mut().typed_insert(SecWebsocketAccept::from(key));
    res
}

/// Wrap an upgraded connection into a server-side WebSocket stream.
pub(crate) async fn wrap_upgraded(upgraded: Upgraded) -> WsTransport {
    let stream =
        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
    WsTransport { stream }
}

/// A WebSocket message crossing the interface boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsMessage {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Bytes(Bytes),
    /// Close frame with an optional close code.
    Close(Option<u16>),
}

/// Frame-level I/O handle for one WebSocket session.
///
/// Owned by the handler after a successful upgrade. Any operation after the
/// session closed surfaces [`Error::ProtocolClosed`].
pub struct WsTransport {
    stream: WebSocketStream<TokioIo<Upgraded>>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WsTransport")
    }
}

impl WsTransport {
    /// Receive the next message. `None` means the stream ended without a
    /// close frame.
    pub async fn recv(&mut self) -> Result<Option<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(WsMessage::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(WsMessage::Bytes(bytes)));
                }
                Some(Ok(Message::Close(frame))) => {
                    return Ok(Some(WsMessage::Close(frame.map(|f| f.code.into()))));
                }
                // Pings are answered by the protocol layer.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(map_ws_error(e)),
                None => return Ok(None),
            }
        }
    }

    /// Send one message.
    pub async fn send(&mut self, message: WsMessage) -> Result<()> {
        let message = match message {
            WsMessage::Text(text) => Message::text(text),
            WsMessage::Bytes(bytes) => Message::binary(bytes),
            WsMessage::Close(code) => Message::Close(code.map(|code| CloseFrame {
                code: code.into(),
                reason: "".into(),
            })),
        };
        self.stream.send(message).await.map_err(map_ws_error)
    }

    /// Send a close frame and drain the session.
    pub async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(e) => match map_ws_error(e) {
                Error::ProtocolClosed => Ok(()),
                other => Err(other),
            },
        }
    }
}

fn map_ws_error(e: tokio_tungstenite::tungstenite::Error) -> Error {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => Error::ProtocolClosed,
        WsError::Io(e) => Error::Io(e),
        WsError::Protocol(e) => Error::Protocol(e.to_string()),
        other => Error::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request() -> hyper::Request<()> {
        hyper::Request::builder()
            .method(Method::GET)
            .uri("/ws")
            .header("connection", "Upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap()
    }

    #[test]
    fn test_detects_upgrade_request() {
        assert!(is_upgrade_request(&upgrade_request()));

        let plain = hyper::Request::builder()
            .method(Method::GET)
            .uri("/")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&plain));
    }

    #[test]
    fn test_validate_accepts_well_formed_handshake() {
        assert!(validate_upgrade(&upgrade_request()).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_version() {
        let req = hyper::Request::builder()
            .method(Method::GET)
            .uri("/ws")
            .header("connection", "Upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "8")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();
        assert!(validate_upgrade(&req).is_err());
    }

    #[test]
    fn test_validate_rejects_non_get() {
        let req = hyper::Request::builder()
            .method(Method::POST)
            .uri("/ws")
            .header("connection", "Upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();
        assert!(validate_upgrade(&req).is_err());
    }

    #[test]
    fn test_upgrade_response_headers() {
        let key = upgrade_request()
            .headers()
            .typed_get::<SecWebsocketKey>()
            .unwrap();
        let res = upgrade_response(key);
        assert_eq!(res.status(), StatusCode::SWITCHING_PROTOCOLS);
        // RFC 6455 sample nonce produces the well-known accept value.
        assert_eq!(
            res.headers().get("sec-websocket-accept").unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
