//! Static file mounts for the gantry application server.
//!
//! A [`StaticMount`] owns one URL prefix backed by one filesystem root.
//! Request paths are resolved safely (canonicalized paths must stay under
//! the root), pre-compressed sidecar variants are negotiated from
//! `Accept-Encoding`, and single-interval range requests are honored.
#![cfg_attr(docsrs, feature(doc_cfg))]

mod file;

pub use file::FileResponder;

use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode, header};
use serde::{Deserialize, Serialize};

use gantry_core::http::parse_accept_encoding;
use gantry_core::scope::ResponseIntent;
use gantry_core::worker::StaticFiles;

/// Sidecar codecs in server-preferred order.
const CODECS: [(&str, &str); 3] = [("zstd", "zst"), ("br", "br"), ("gzip", "gz")];

/// One static mount: a URL prefix served from a filesystem root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticMount {
    /// URL prefix, normalized to a leading slash and no trailing slash.
    pub url_prefix: String,
    /// Filesystem root of the mount.
    pub root: PathBuf,
    /// `Cache-Control: max-age` seconds, when configured.
    pub expires: Option<u64>,
    /// Serve pre-compressed sidecar variants when the client accepts them.
    pub precompressed: bool,
}

impl StaticMount {
    /// Create a mount serving `root` under `url_prefix`.
    #[must_use]
    pub fn new(url_prefix: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let mut url_prefix = url_prefix.into();
        if !url_prefix.starts_with('/') {
            url_prefix.insert(0, '/');
        }
        while url_prefix.len() > 1 && url_prefix.ends_with('/') {
            url_prefix.pop();
        }
        Self {
            url_prefix,
            root: root.into(),
            expires: None,
            precompressed: false,
        }
    }

    /// Sets the `Cache-Control: max-age` value.
    #[must_use]
    pub fn expires(mut self, seconds: u64) -> Self {
        self.expires = Some(seconds);
        self
    }

    /// Enables pre-compressed sidecar negotiation.
    #[must_use]
    pub fn precompressed(mut self, enabled: bool) -> Self {
        self.precompressed = enabled;
        self
    }

    /// Resolve a decoded request path to a file inside the mount root.
    ///
    /// Returns `None` when the path escapes the root, does not exist, or is
    /// a directory.
    async fn resolve(&self, path: &str) -> Option<PathBuf> {
        let rel = path.strip_prefix(&self.url_prefix)?;
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            return None;
        }
        let root = tokio::fs::canonicalize(&self.root).await.ok()?;
        let resolved = tokio::fs::canonicalize(root.join(rel)).await.ok()?;
        // Canonicalization resolves symlinks, so an escape through one is
        // caught here as well.
        if !resolved.starts_with(&root) {
            tracing::warn!(path = %path, "static path escapes mount root");
            return None;
        }
        if tokio::fs::metadata(&resolved).await.ok()?.is_dir() {
            return None;
        }
        Some(resolved)
    }

    /// Pick the sidecar variant to serve, if any.
    ///
    /// Codecs are ranked by the client's q-value, with explicitly named
    /// codecs beating wildcard matches at equal q and server order breaking
    /// remaining ties. The first ranked codec with q > 0 whose sidecar
    /// exists wins.
    async fn negotiate(
        &self,
        resolved: &Path,
        req_headers: &HeaderMap,
    ) -> Option<(PathBuf, &'static str)> {
        if !self.precompressed {
            return None;
        }
        let accept = req_headers
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if accept.trim().is_empty() {
            return None;
        }
        let entries = parse_accept_encoding(accept);
        let wildcard_q = entries
            .iter()
            .find(|(codec, _)| codec == "*")
            .map(|(_, q)| *q);

        let mut ranked: Vec<(u16, bool, usize)> = CODECS
            .iter()
            .enumerate()
            .filter_map(|(index, (codec, _))| {
                let explicit = entries.iter().find(|(name, _)| name == codec).map(|(_, q)| *q);
                match (explicit, wildcard_q) {
                    (Some(q), _) => Some((q, true, index)),
                    (None, Some(q)) => Some((q, false, index)),
                    (None, None) => None,
                }
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

        for (q, _, index) in ranked {
            if q == 0 {
                continue;
            }
            let (codec, ext) = CODECS[index];
            let mut sidecar = resolved.as_os_str().to_owned();
            sidecar.push(".");
            sidecar.push(ext);
            let sidecar = PathBuf::from(sidecar);
            if tokio::fs::metadata(&sidecar)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                return Some((sidecar, codec));
            }
        }
        None
    }

    async fn respond(
        self,
        method: Method,
        path: String,
        req_headers: HeaderMap,
    ) -> ResponseIntent {
        let Some(resolved) = self.resolve(&path).await else {
            return not_found();
        };

        let content_type = mime_infer::from_path(&resolved).first_or_octet_stream();
        let (serve_path, encoding) = match self.negotiate(&resolved, &req_headers).await {
            Some((sidecar, codec)) => (sidecar, Some(codec)),
            None => (resolved, None),
        };

        match FileResponder::open(serve_path, content_type, encoding, self.expires).await {
            Ok(responder) => responder.respond(&method, &req_headers),
            Err(e) => {
                tracing::error!(error = %e, "static file read failed");
                ResponseIntent::empty(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new())
            }
        }
    }
}

fn not_found() -> ResponseIntent {
    ResponseIntent::empty(StatusCode::NOT_FOUND, HeaderMap::new())
}

impl StaticFiles for StaticMount {
    fn matches(&self, path: &str) -> bool {
        path == self.url_prefix
            || path
                .strip_prefix(&self.url_prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    fn handle(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> BoxFuture<'static, ResponseIntent> {
        let mount = self.clone();
        let method = method.clone();
        let path = path.to_owned();
        let headers = headers.clone();
        Box::pin(mount.respond(method, path, headers))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use http::HeaderValue;
    use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, VARY};

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        mount: StaticMount,
    }

    fn fixture(precompressed: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("asset.txt"), b"plain contents").unwrap();
        fs::write(dir.path().join("asset.txt.gz"), b"gzip contents").unwrap();
        fs::write(dir.path().join("asset.txt.br"), b"br contents").unwrap();
        fs::write(dir.path().join("asset.txt.zst"), b"zstd contents").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/nested.bin"), b"nested").unwrap();
        let mount = StaticMount::new("/static", dir.path()).precompressed(precompressed);
        Fixture { _dir: dir, mount }
    }

    fn accept(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_str(value).unwrap());
        headers
    }

    async fn served_encoding(mount: &StaticMount, headers: HeaderMap) -> Option<String> {
        let intent = mount
            .clone()
            .respond(Method::GET, "/static/asset.txt".to_owned(), headers)
            .await;
        assert_eq!(intent.status, StatusCode::OK);
        intent
            .headers
            .get(CONTENT_ENCODING)
            .map(|v| v.to_str().unwrap().to_owned())
    }

    #[test]
    fn test_prefix_matching() {
        let mount = StaticMount::new("static/", ".");
        assert_eq!(mount.url_prefix, "/static");
        assert!(mount.matches("/static"));
        assert!(mount.matches("/static/a.txt"));
        assert!(!mount.matches("/staticfiles"));
        assert!(!mount.matches("/other"));
    }

    #[tokio::test]
    async fn test_serves_plain_file() {
        let fx = fixture(false);
        let intent = fx
            .mount
            .clone()
            .respond(Method::GET, "/static/asset.txt".to_owned(), HeaderMap::new())
            .await;
        assert_eq!(intent.status, StatusCode::OK);
        assert_eq!(intent.headers.get("content-type").unwrap(), "text/plain");
        assert!(intent.headers.get(CONTENT_ENCODING).is_none());
        assert!(intent.headers.get(VARY).is_none());
    }

    #[tokio::test]
    async fn test_missing_file_404() {
        let fx = fixture(false);
        let intent = fx
            .mount
            .clone()
            .respond(Method::GET, "/static/missing.txt".to_owned(), HeaderMap::new())
            .await;
        assert_eq!(intent.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_directory_404() {
        let fx = fixture(false);
        for path in ["/static", "/static/sub"] {
            let intent = fx
                .mount
                .clone()
                .respond(Method::GET, path.to_owned(), HeaderMap::new())
                .await;
            assert_eq!(intent.status, StatusCode::NOT_FOUND, "{path}");
        }
    }

    #[tokio::test]
    async fn test_escape_attempt_404() {
        let fx = fixture(false);
        let intent = fx
            .mount
            .clone()
            .respond(
                Method::GET,
                "/static/../outside.txt".to_owned(),
                HeaderMap::new(),
            )
            .await;
        assert_eq!(intent.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_expires_sets_cache_control() {
        let fx = fixture(false);
        let mount = fx.mount.clone().expires(86400);
        let intent = mount
            .respond(Method::GET, "/static/asset.txt".to_owned(), HeaderMap::new())
            .await;
        assert_eq!(
            intent.headers.get("cache-control").unwrap(),
            "max-age=86400"
        );
    }

    #[tokio::test]
    async fn test_no_header_no_encoding() {
        let fx = fixture(true);
        assert_eq!(served_encoding(&fx.mount, HeaderMap::new()).await, None);
    }

    #[tokio::test]
    async fn test_gzip_selected() {
        let fx = fixture(true);
        assert_eq!(
            served_encoding(&fx.mount, accept("gzip, deflate")).await,
            Some("gzip".to_owned())
        );
    }

    #[tokio::test]
    async fn test_q_zero_excludes_codec() {
        let fx = fixture(true);
        assert_eq!(
            served_encoding(&fx.mount, accept("gzip;q=0, br")).await,
            Some("br".to_owned())
        );
    }

    #[tokio::test]
    async fn test_wildcard_uses_server_preference() {
        let fx = fixture(true);
        assert_eq!(
            served_encoding(&fx.mount, accept("*")).await,
            Some("zstd".to_owned())
        );
    }

    #[tokio::test]
    async fn test_explicit_zero_beats_wildcard() {
        let fx = fixture(true);
        assert_eq!(
            served_encoding(&fx.mount, accept("zstd;q=0, br;q=0, *")).await,
            Some("gzip".to_owned())
        );
    }

    #[tokio::test]
    async fn test_vary_set_with_sidecar() {
        let fx = fixture(true);
        let intent = fx
            .mount
            .clone()
            .respond(
                Method::GET,
                "/static/asset.txt".to_owned(),
                accept("gzip"),
            )
            .await;
        assert_eq!(intent.headers.get(VARY).unwrap(), "accept-encoding");
        assert_eq!(intent.headers.get(CONTENT_ENCODING).unwrap(), "gzip");
        // Content type still reflects the original asset.
        assert_eq!(intent.headers.get("content-type").unwrap(), "text/plain");
    }

    #[tokio::test]
    async fn test_missing_sidecar_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("only.txt"), b"plain").unwrap();
        let mount = StaticMount::new("/static", dir.path()).precompressed(true);
        let intent = mount
            .respond(Method::GET, "/static/only.txt".to_owned(), accept("gzip, br"))
            .await;
        assert_eq!(intent.status, StatusCode::OK);
        assert!(intent.headers.get(CONTENT_ENCODING).is_none());
    }
}
