//! Response body type handed to hyper.

use std::error::Error as StdError;
use std::io::Result as IoResult;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream};
use hyper::body::{Body, Frame, SizeHint};

/// Response body.
#[non_exhaustive]
pub enum ResBody {
    /// Empty body.
    None,
    /// Single buffer body.
    Once(Bytes),
    /// Streamed body; length unknown up front.
    Stream(BoxStream<'static, IoResult<Bytes>>),
}

impl ResBody {
    /// Whether no body is set.
    #[inline]
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(*self, Self::None)
    }

    /// Body size when known.
    #[inline]
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        match self {
            Self::None => Some(0),
            Self::Once(bytes) => Some(bytes.len() as u64),
            Self::Stream(_) => None,
        }
    }
}

impl std::fmt::Debug for ResBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("ResBody::None"),
            Self::Once(bytes) => write!(f, "ResBody::Once({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("ResBody::Stream(..)"),
        }
    }
}

impl Stream for ResBody {
    type Item = IoResult<Bytes>;

    #[inline]
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            Self::None => Poll::Ready(None),
            Self::Once(bytes) => {
                if bytes.is_empty() {
                    Poll::Ready(None)
                } else {
                    let bytes = std::mem::take(bytes);
                    Poll::Ready(Some(Ok(bytes)))
                }
            }
            Self::Stream(stream) => stream.as_mut().poll_next(cx),
        }
    }
}

impl Body for ResBody {
    type Data = Bytes;
    type Error = Box<dyn StdError + Send + Sync>;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::None => true,
            Self::Once(bytes) => bytes.is_empty(),
            Self::Stream(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            Self::None => SizeHint::with_exact(0),
            Self::Once(bytes) => SizeHint::with_exact(bytes.len() as u64),
            Self::Stream(_) => SizeHint::default(),
        }
    }
}

impl From<Bytes> for ResBody {
    #[inline]
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Self::None
        } else {
            Self::Once(bytes)
        }
    }
}
