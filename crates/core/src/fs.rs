//! Chunked file streaming for response bodies.
//!
//! Disk reads run on the blocking pool so the reactor threads never stall on
//! file I/O. Where the platform would allow sendfile, hyper still needs the
//! bytes in userspace to frame them, so buffered chunk reads are used for
//! both protocols.

use std::cmp;
use std::io::{self, Error as IoError, ErrorKind, Read, Result as IoResult, Seek};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};

use crate::http::ResBody;

/// Default read chunk size.
pub const CHUNK_SIZE: u64 = 64 * 1024;

enum ChunkedState {
    File(Option<std::fs::File>),
    Future(tokio::task::JoinHandle<IoResult<(std::fs::File, Bytes)>>),
}

/// A stream of byte chunks read from one region of a file.
pub struct ChunkedFile {
    total_size: u64,
    read_size: u64,
    buffer_size: u64,
    offset: u64,
    state: ChunkedState,
}

impl ChunkedFile {
    /// Stream `len` bytes of `file` starting at `offset`.
    #[must_use]
    pub fn new(file: std::fs::File, offset: u64, len: u64, buffer_size: u64) -> Self {
        Self {
            total_size: len,
            read_size: 0,
            buffer_size: buffer_size.max(1),
            offset,
            state: ChunkedState::File(Some(file)),
        }
    }
}

impl std::fmt::Debug for ChunkedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedFile")
            .field("total_size", &self.total_size)
            .field("read_size", &self.read_size)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl Stream for ChunkedFile {
    type Item = IoResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.total_size == self.read_size {
            return Poll::Ready(None);
        }

        match self.state {
            ChunkedState::File(ref mut file) => {
                let mut file = file.take().expect("ChunkedFile polled after completion");
                let max_bytes = cmp::min(
                    self.total_size.saturating_sub(self.read_size),
                    self.buffer_size,
                ) as usize;
                let offset = self.offset;
                let fut = tokio::task::spawn_blocking(move || {
                    let mut buf = Vec::with_capacity(max_bytes);
                    file.seek(io::SeekFrom::Start(offset))?;
                    let bytes = file.by_ref().take(max_bytes as u64).read_to_end(&mut buf)?;
                    if bytes == 0 {
                        return Err(ErrorKind::UnexpectedEof.into());
                    }
                    Ok((file, Bytes::from(buf)))
                });

                self.state = ChunkedState::Future(fut);
                self.poll_next(cx)
            }
            ChunkedState::Future(ref mut fut) => {
                let (file, bytes) = ready!(Pin::new(fut).poll(cx))
                    .map_err(|_| IoError::other("blocking read task failed"))??;
                self.state = ChunkedState::File(Some(file));

                self.offset += bytes.len() as u64;
                self.read_size += bytes.len() as u64;

                Poll::Ready(Some(Ok(bytes)))
            }
        }
    }
}

/// Open `path` and build a streaming body for `len` bytes from `offset`.
pub async fn file_body(path: &Path, offset: u64, len: u64) -> IoResult<ResBody> {
    let file = tokio::fs::File::open(path).await?;
    let file = file.into_std().await;
    Ok(ResBody::Stream(
        ChunkedFile::new(file, offset, len, CHUNK_SIZE).boxed(),
    ))
}

/// Open `path` and build a streaming body for the whole file, returning its
/// size alongside.
pub async fn whole_file_body(path: &Path) -> IoResult<(ResBody, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let file = file.into_std().await;
    Ok((
        ResBody::Stream(ChunkedFile::new(file, 0, len, CHUNK_SIZE).boxed()),
        len,
    ))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bytes::BytesMut;

    use super::*;

    fn fixture(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_chunked_read_whole_file() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let file = fixture(&payload);

        let mut chunks = ChunkedFile::new(
            file.reopen().unwrap(),
            0,
            payload.len() as u64,
            4096,
        );
        let mut result = BytesMut::new();
        while let Some(chunk) = chunks.next().await {
            result.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(&result[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_chunked_read_range() {
        let file = fixture(b"0123456789");
        let mut chunks = ChunkedFile::new(file.reopen().unwrap(), 2, 5, 2);
        let mut result = BytesMut::new();
        while let Some(chunk) = chunks.next().await {
            result.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(&result[..], b"23456");
    }

    #[tokio::test]
    async fn test_file_body_range_length() {
        let file = fixture(b"abcdefghij");
        let body = file_body(file.path(), 9, 1).await.unwrap();
        let ResBody::Stream(mut stream) = body else {
            panic!("expected stream body");
        };
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"j");
        assert!(stream.next().await.is_none());
    }
}
