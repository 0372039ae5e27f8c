//! HTTP protocol tunables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which protocols a listener speaks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMode {
    /// HTTP/1 on cleartext; ALPN picks the protocol under TLS.
    #[default]
    Auto,
    /// HTTP/1 only.
    Http1,
    /// HTTP/2 only.
    Http2,
}

/// HTTP/1 connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Http1Settings {
    /// Enable keep-alive.
    pub keep_alive: bool,
    /// Maximum read buffer size in bytes.
    pub max_buffer_size: usize,
    /// Aggregate flushes of pipelined responses.
    pub pipeline_flush: bool,
    /// Time allowed for a client to send its request headers, in
    /// milliseconds.
    pub header_read_timeout: u64,
}

impl Default for Http1Settings {
    fn default() -> Self {
        Self {
            keep_alive: true,
            max_buffer_size: 8192 + 4096 * 100,
            pipeline_flush: false,
            header_read_timeout: 30_000,
        }
    }
}

impl Http1Settings {
    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size < 8192 {
            return Err(Error::config("http1_max_buffer_size"));
        }
        if self.header_read_timeout < 1 || self.header_read_timeout > 60_000 {
            return Err(Error::config("http1_header_read_timeout"));
        }
        Ok(())
    }

    /// Apply onto a hyper HTTP/1 connection builder.
    pub fn apply(&self, builder: &mut hyper::server::conn::http1::Builder) {
        builder
            .keep_alive(self.keep_alive)
            .max_buf_size(self.max_buffer_size)
            .pipeline_flush(self.pipeline_flush)
            .header_read_timeout(Duration::from_millis(self.header_read_timeout));
    }
}

/// HTTP/2 connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Http2Settings {
    /// Let hyper size flow-control windows from observed bandwidth-delay.
    pub adaptive_window: bool,
    /// Connection-level flow control window, bytes.
    pub initial_connection_window_size: u32,
    /// Stream-level flow control window, bytes.
    pub initial_stream_window_size: u32,
    /// Interval between keep-alive pings, seconds. `None` disables pings.
    pub keep_alive_interval: Option<u64>,
    /// Time to wait for a keep-alive pong before closing, seconds.
    pub keep_alive_timeout: u64,
    /// Maximum concurrent streams per connection.
    pub max_concurrent_streams: u32,
    /// Maximum frame payload size, bytes.
    pub max_frame_size: u32,
    /// Maximum accepted size of the decoded header list, bytes.
    pub max_headers_size: u32,
    /// Maximum buffered outgoing bytes per stream.
    pub max_send_buffer_size: usize,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            adaptive_window: false,
            initial_connection_window_size: 1024 * 1024,
            initial_stream_window_size: 1024 * 1024,
            keep_alive_interval: None,
            keep_alive_timeout: 20,
            max_concurrent_streams: 200,
            max_frame_size: 1024 * 16,
            max_headers_size: 16 * 1024 * 1024,
            max_send_buffer_size: 1024 * 400,
        }
    }
}

impl Http2Settings {
    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        // RFC 7540 frame size bounds.
        if self.max_frame_size < 16_384 || self.max_frame_size > 16_777_215 {
            return Err(Error::config("http2_max_frame_size"));
        }
        Ok(())
    }

    /// Apply onto a hyper HTTP/2 connection builder.
    pub fn apply<E>(&self, builder: &mut hyper::server::conn::http2::Builder<E>) {
        builder
            .adaptive_window(self.adaptive_window)
            .initial_connection_window_size(self.initial_connection_window_size)
            .initial_stream_window_size(self.initial_stream_window_size)
            .keep_alive_interval(self.keep_alive_interval.map(Duration::from_secs))
            .keep_alive_timeout(Duration::from_secs(self.keep_alive_timeout))
            .max_concurrent_streams(self.max_concurrent_streams)
            .max_frame_size(self.max_frame_size)
            .max_header_list_size(self.max_headers_size)
            .max_send_buf_size(self.max_send_buffer_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http1_defaults_valid() {
        let settings = Http1Settings::default();
        assert!(settings.validate().is_ok());
        assert!(settings.keep_alive);
        assert_eq!(settings.max_buffer_size, 8192 + 4096 * 100);
    }

    #[test]
    fn test_http1_buffer_floor() {
        let settings = Http1Settings {
            max_buffer_size: 4096,
            ..Http1Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_http1_header_timeout_range() {
        for bad in [0, 60_001] {
            let settings = Http1Settings {
                header_read_timeout: bad,
                ..Http1Settings::default()
            };
            assert!(settings.validate().is_err(), "{bad} should be rejected");
        }
        let settings = Http1Settings {
            header_read_timeout: 60_000,
            ..Http1Settings::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_http2_defaults_valid() {
        let settings = Http2Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.max_concurrent_streams, 200);
        assert_eq!(settings.keep_alive_timeout, 20);
    }

    #[test]
    fn test_http2_frame_size_bounds() {
        let settings = Http2Settings {
            max_frame_size: 8192,
            ..Http2Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
