//! Single-file response building with range support.

use std::fs::Metadata;
use std::io::Result as IoResult;
use std::path::PathBuf;

use headers::{HeaderMapExt, LastModified};
use http::header::{
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
    RANGE, VARY,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};

use gantry_core::http::range::{ResolvedRange, parse_range_header, resolve_range};
use gantry_core::scope::{BodyIntent, ResponseIntent};

/// A resolved file ready to be turned into a response.
#[derive(Debug)]
pub struct FileResponder {
    path: PathBuf,
    metadata: Metadata,
    content_type: mime::Mime,
    content_encoding: Option<&'static str>,
    expires: Option<u64>,
}

impl FileResponder {
    /// Open `path` and capture its metadata. `content_type` is derived from
    /// the original asset, not the sidecar actually served.
    pub async fn open(
        path: PathBuf,
        content_type: mime::Mime,
        content_encoding: Option<&'static str>,
        expires: Option<u64>,
    ) -> IoResult<Self> {
        let metadata = tokio::fs::metadata(&path).await?;
        Ok(Self {
            path,
            metadata,
            content_type,
            content_encoding,
            expires,
        })
    }

    fn base_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(self.content_type.as_ref()) {
            headers.insert(CONTENT_TYPE, value);
        }
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if let Some(encoding) = self.content_encoding {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
            headers.insert(VARY, HeaderValue::from_static("accept-encoding"));
        }
        if let Some(expires) = self.expires {
            if let Ok(value) = HeaderValue::from_str(&format!("max-age={expires}")) {
                headers.insert(CACHE_CONTROL, value);
            }
        }
        if let Ok(modified) = self.metadata.modified() {
            headers.typed_insert(LastModified::from(modified));
        }
        headers
    }

    /// Build the response intent for one request.
    #[must_use]
    pub fn respond(self, method: &Method, req_headers: &HeaderMap) -> ResponseIntent {
        let size = self.metadata.len();
        let head = method == Method::HEAD;
        let mut headers = self.base_headers();

        if let Some(range) = req_headers.get(RANGE).and_then(|v| v.to_str().ok()) {
            match parse_range_header(range) {
                Some(specs) if specs.len() == 1 => {
                    match resolve_range(specs[0], size) {
                        ResolvedRange::Satisfiable { start, end } => {
                            let len = end - start + 1;
                            headers.insert(
                                CONTENT_RANGE,
                                range_value(&format!("bytes {start}-{end}/{size}")),
                            );
                            headers.insert(CONTENT_LENGTH, length_value(len));
                            let body = if head {
                                BodyIntent::Empty
                            } else {
                                BodyIntent::FileRange {
                                    path: self.path,
                                    start,
                                    len,
                                }
                            };
                            return ResponseIntent {
                                status: StatusCode::PARTIAL_CONTENT,
                                headers,
                                body,
                            };
                        }
                        ResolvedRange::Unsatisfiable => {
                            return unsatisfiable(headers, size);
                        }
                    }
                }
                // Multipart ranges are not supported.
                Some(_) => return unsatisfiable(headers, size),
                // A malformed header is ignored; the whole entity is served.
                None => {}
            }
        }

        headers.insert(CONTENT_LENGTH, length_value(size));
        let body = if head {
            BodyIntent::Empty
        } else {
            BodyIntent::FileRange {
                path: self.path,
                start: 0,
                len: size,
            }
        };
        ResponseIntent {
            status: StatusCode::OK,
            headers,
            body,
        }
    }
}

fn unsatisfiable(mut headers: HeaderMap, size: u64) -> ResponseIntent {
    headers.insert(CONTENT_RANGE, range_value(&format!("bytes */{size}")));
    ResponseIntent {
        status: StatusCode::RANGE_NOT_SATISFIABLE,
        headers,
        body: BodyIntent::Empty,
    }
}

fn range_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).expect("content-range values are ascii")
}

fn length_value(len: u64) -> HeaderValue {
    HeaderValue::from_str(&len.to_string()).expect("content-length values are ascii")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    async fn responder(content: &[u8]) -> (tempfile::NamedTempFile, FileResponder) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        let responder = FileResponder::open(
            file.path().to_path_buf(),
            mime::APPLICATION_OCTET_STREAM,
            None,
            None,
        )
        .await
        .unwrap();
        (file, responder)
    }

    fn range_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_plain_get_sets_length() {
        let (_file, responder) = responder(&[0u8; 100]).await;
        let intent = responder.respond(&Method::GET, &HeaderMap::new());
        assert_eq!(intent.status, StatusCode::OK);
        assert_eq!(intent.headers.get(CONTENT_LENGTH).unwrap(), "100");
        assert_eq!(intent.headers.get(ACCEPT_RANGES).unwrap(), "bytes");
        assert!(matches!(
            intent.body,
            BodyIntent::FileRange { start: 0, len: 100, .. }
        ));
    }

    #[tokio::test]
    async fn test_head_has_no_body() {
        let (_file, responder) = responder(&[0u8; 100]).await;
        let intent = responder.respond(&Method::HEAD, &HeaderMap::new());
        assert_eq!(intent.status, StatusCode::OK);
        assert_eq!(intent.headers.get(CONTENT_LENGTH).unwrap(), "100");
        assert!(matches!(intent.body, BodyIntent::Empty));
    }

    #[tokio::test]
    async fn test_range_clamped_to_size() {
        let (_file, responder) = responder(&[0u8; 100]).await;
        let intent = responder.respond(&Method::GET, &range_headers("bytes=90-150"));
        assert_eq!(intent.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            intent.headers.get(CONTENT_RANGE).unwrap(),
            "bytes 90-99/100"
        );
        assert_eq!(intent.headers.get(CONTENT_LENGTH).unwrap(), "10");
        assert!(matches!(
            intent.body,
            BodyIntent::FileRange { start: 90, len: 10, .. }
        ));
    }

    #[tokio::test]
    async fn test_range_past_end_is_416() {
        let (_file, responder) = responder(&[0u8; 100]).await;
        let intent = responder.respond(&Method::GET, &range_headers("bytes=150-160"));
        assert_eq!(intent.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(intent.headers.get(CONTENT_RANGE).unwrap(), "bytes */100");
    }

    #[tokio::test]
    async fn test_single_byte_range() {
        let (_file, responder) = responder(&[0u8; 100]).await;
        let intent = responder.respond(&Method::GET, &range_headers("bytes=99-99"));
        assert_eq!(intent.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(intent.headers.get(CONTENT_LENGTH).unwrap(), "1");
    }

    #[tokio::test]
    async fn test_multi_range_is_416() {
        let (_file, responder) = responder(&[0u8; 100]).await;
        let intent = responder.respond(&Method::GET, &range_headers("bytes=0-9,20-29"));
        assert_eq!(intent.status, StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn test_suffix_range() {
        let (_file, responder) = responder(&[0u8; 100]).await;
        let intent = responder.respond(&Method::GET, &range_headers("bytes=-20"));
        assert_eq!(intent.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            intent.headers.get(CONTENT_RANGE).unwrap(),
            "bytes 80-99/100"
        );
    }
}
