//! HTTP types and header utilities.

pub mod body;
pub mod range;
mod settings;

pub use body::ResBody;
pub use http::method::Method;
pub use http::version::Version;
pub use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header, uri};
pub use range::{RangeSpec, ResolvedRange, parse_range_header, resolve_range};
pub use settings::{Http1Settings, Http2Settings, HttpMode};

/// Parse an `Accept-Encoding` header into `(codec, q)` pairs in header order.
///
/// The quality value is scaled to `0..=1000`. A missing `q` counts as 1.0,
/// values above 1 are clamped to 1.0 and negative values to 0, matching how
/// lenient clients in the wild are treated.
#[must_use]
pub fn parse_accept_encoding(header: &str) -> Vec<(String, u16)> {
    header
        .split(',')
        .filter_map(|part| {
            let mut iter = part.trim().split(';');
            let (codec, q) = (iter.next()?, iter.next());
            let codec = codec.trim();
            if codec.is_empty() {
                return None;
            }
            let q = q
                .and_then(|q| {
                    q.trim()
                        .strip_prefix("q=")
                        .and_then(|q| q.trim().parse::<f32>().ok())
                })
                .map_or(1000, |q| (q.clamp(0.0, 1.0) * 1000.0) as u16);
            Some((codec.to_ascii_lowercase(), q))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_encoding_plain() {
        assert_eq!(
            parse_accept_encoding("gzip, br"),
            vec![("gzip".to_owned(), 1000), ("br".to_owned(), 1000)]
        );
    }

    #[test]
    fn test_accept_encoding_q_values() {
        assert_eq!(
            parse_accept_encoding("gzip;q=0.5, br;q=0, zstd"),
            vec![
                ("gzip".to_owned(), 500),
                ("br".to_owned(), 0),
                ("zstd".to_owned(), 1000)
            ]
        );
    }

    #[test]
    fn test_accept_encoding_q_clamped() {
        assert_eq!(parse_accept_encoding("gzip;q=3.0"), vec![("gzip".to_owned(), 1000)]);
        assert_eq!(parse_accept_encoding("gzip;q=-1"), vec![("gzip".to_owned(), 0)]);
    }

    #[test]
    fn test_accept_encoding_empty() {
        assert!(parse_accept_encoding("").is_empty());
        assert!(parse_accept_encoding("  ").is_empty());
    }

    #[test]
    fn test_accept_encoding_wildcard_kept() {
        assert_eq!(
            parse_accept_encoding("*;q=0.1"),
            vec![("*".to_owned(), 100)]
        );
    }
}
