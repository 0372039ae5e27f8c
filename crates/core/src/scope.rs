//! Per-request metadata and response intents crossing the runtime boundary.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::sync::mpsc;

use crate::net::SocketAddr;

/// Protocol of a dispatched scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeProtocol {
    /// Plain HTTP request/response exchange.
    Http,
    /// WebSocket session (after upgrade validation).
    Ws,
    /// Lifespan startup/shutdown exchange.
    Lifespan,
}

/// Immutable snapshot of request metadata passed to user code.
#[derive(Clone, Debug)]
pub struct Scope {
    /// Protocol of this dispatch.
    pub protocol: ScopeProtocol,
    /// Negotiated HTTP version.
    pub http_version: Version,
    /// `http` or `https`.
    pub scheme: &'static str,
    /// Request method.
    pub method: Method,
    /// Request path, percent-decoded, lossy UTF-8.
    pub path: String,
    /// Raw query string, no leading `?`.
    pub query_string: String,
    /// Request headers. Multi-valued; lookups through [`HeaderMap`] are
    /// case-insensitive.
    pub headers: HeaderMap,
    /// Peer address.
    pub peer_addr: SocketAddr,
    /// Local server address.
    pub server_addr: SocketAddr,
    /// Whether the connection is TLS.
    pub tls: bool,
    /// `:authority` pseudo-header (HTTP/2) or Host header.
    pub authority: Option<String>,
    /// Per-request view of the lifespan state bag.
    pub state: HashMap<String, serde_json::Value>,
}

impl Scope {
    /// All values for one header, in insertion order.
    #[must_use]
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// Headers as `(name, value)` pairs with duplicates comma-joined, the
    /// form exposed to the synchronous interface.
    #[must_use]
    pub fn headers_joined(&self) -> Vec<(String, String)> {
        let mut seen: Vec<(String, String)> = Vec::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let Ok(value) = value.to_str() else { continue };
            match seen.iter_mut().find(|(n, _)| n == name.as_str()) {
                Some((_, existing)) => {
                    existing.push(',');
                    existing.push_str(value);
                }
                None => seen.push((name.as_str().to_owned(), value.to_owned())),
            }
        }
        seen
    }

    /// Headers as `(name, value)` tuples preserving duplicates, the form
    /// exposed to the async interfaces.
    #[must_use]
    pub fn headers_list(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect()
    }
}

/// Shape of a response body declared by user code.
#[derive(Debug)]
#[non_exhaustive]
pub enum BodyIntent {
    /// No body.
    Empty,
    /// One buffer, sent with `Content-Length`.
    Bytes(Bytes),
    /// Whole file streamed from disk.
    File(PathBuf),
    /// File segment: `len` bytes starting at `start`.
    FileRange {
        /// File to stream from.
        path: PathBuf,
        /// Offset of the first byte.
        start: u64,
        /// Number of bytes to send.
        len: u64,
    },
    /// Producer-driven stream; chunked on HTTP/1, DATA frames on HTTP/2.
    Stream(mpsc::Receiver<Bytes>),
}

/// A complete response declaration from user code.
#[derive(Debug)]
pub struct ResponseIntent {
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Body shape.
    pub body: BodyIntent,
}

impl ResponseIntent {
    /// Empty-body response.
    #[must_use]
    pub fn empty(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            body: BodyIntent::Empty,
        }
    }

    /// Single-buffer response.
    #[must_use]
    pub fn bytes(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body: BodyIntent::Bytes(body),
        }
    }

    /// Whole-file response.
    #[must_use]
    pub fn file(status: StatusCode, headers: HeaderMap, path: impl Into<PathBuf>) -> Self {
        Self {
            status,
            headers,
            body: BodyIntent::File(path.into()),
        }
    }

    /// File-segment response.
    #[must_use]
    pub fn file_range(
        status: StatusCode,
        headers: HeaderMap,
        path: impl Into<PathBuf>,
        start: u64,
        len: u64,
    ) -> Self {
        Self {
            status,
            headers,
            body: BodyIntent::FileRange {
                path: path.into(),
                start,
                len,
            },
        }
    }

    /// Streamed response fed through the returned sender.
    #[must_use]
    pub fn stream(
        status: StatusCode,
        headers: HeaderMap,
        buffer: usize,
    ) -> (Self, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                status,
                headers,
                body: BodyIntent::Stream(rx),
            },
            tx,
        )
    }
}

#[cfg(test)]
mod tests {
    use http::header::{HeaderValue, SET_COOKIE};

    use super::*;

    fn scope_with_headers(headers: HeaderMap) -> Scope {
        Scope {
            protocol: ScopeProtocol::Http,
            http_version: Version::HTTP_11,
            scheme: "http",
            method: Method::GET,
            path: "/".to_owned(),
            query_string: String::new(),
            headers,
            peer_addr: SocketAddr::Unknown,
            server_addr: SocketAddr::Unknown,
            tls: false,
            authority: None,
            state: HashMap::new(),
        }
    }

    #[test]
    fn test_headers_joined_merges_duplicates() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        let scope = scope_with_headers(headers);
        assert_eq!(
            scope.headers_joined(),
            vec![("set-cookie".to_owned(), "a=1,b=2".to_owned())]
        );
    }

    #[test]
    fn test_headers_list_keeps_duplicates() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        let scope = scope_with_headers(headers);
        assert_eq!(scope.headers_list().len(), 2);
    }

    #[test]
    fn test_round_trip_multimap() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        let scope = scope_with_headers(headers.clone());

        let mut rebuilt = HeaderMap::new();
        for (name, value) in scope.headers_list() {
            rebuilt.append(
                name.parse::<http::header::HeaderName>().unwrap(),
                value.parse::<HeaderValue>().unwrap(),
            );
        }
        assert_eq!(rebuilt, headers);
    }
}
