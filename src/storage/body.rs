//! Object payloads.
//!
//! [`ObjectBody`] is either a buffer that is already in memory or a
//! stream of chunks of unknown total size.  Backends consume it through
//! [`ObjectBody::into_stream`] or cut it into upload parts with
//! [`PartReader`], so an unbounded payload never has to be held in full.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::fmt;
use std::io;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// Boxed stream of payload chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Content handed to `put`.
pub enum ObjectBody {
    /// Whole payload in memory.
    Buffered(Bytes),
    /// Payload produced chunk by chunk.
    Streamed(ChunkStream),
}

impl ObjectBody {
    /// Wrap a chunk stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        ObjectBody::Streamed(Box::pin(stream))
    }

    /// Stream the contents of an async reader (a file, a socket, ...).
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::from_stream(ReaderStream::new(reader))
    }

    /// Exact length when known up front.
    pub fn known_len(&self) -> Option<u64> {
        match self {
            ObjectBody::Buffered(data) => Some(data.len() as u64),
            ObjectBody::Streamed(_) => None,
        }
    }

    /// Turn the body into a chunk stream.
    pub fn into_stream(self) -> ChunkStream {
        match self {
            ObjectBody::Buffered(data) => {
                Box::pin(futures::stream::iter([Ok::<_, io::Error>(data)]))
            }
            ObjectBody::Streamed(stream) => stream,
        }
    }

    /// Read the whole body into memory.
    pub async fn collect(self) -> io::Result<Bytes> {
        match self {
            ObjectBody::Buffered(data) => Ok(data),
            ObjectBody::Streamed(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectBody::Buffered(data) => f.debug_tuple("Buffered").field(&data.len()).finish(),
            ObjectBody::Streamed(_) => f.write_str("Streamed(..)"),
        }
    }
}

impl From<Bytes> for ObjectBody {
    fn from(data: Bytes) -> Self {
        ObjectBody::Buffered(data)
    }
}

impl From<Vec<u8>> for ObjectBody {
    fn from(data: Vec<u8>) -> Self {
        ObjectBody::Buffered(Bytes::from(data))
    }
}

impl From<String> for ObjectBody {
    fn from(data: String) -> Self {
        ObjectBody::Buffered(Bytes::from(data))
    }
}

impl From<&'static [u8]> for ObjectBody {
    fn from(data: &'static [u8]) -> Self {
        ObjectBody::Buffered(Bytes::from_static(data))
    }
}

impl From<&'static str> for ObjectBody {
    fn from(data: &'static str) -> Self {
        ObjectBody::Buffered(Bytes::from_static(data.as_bytes()))
    }
}

/// Cuts a body into fixed-size parts.
///
/// Every part except the last is exactly `part_size` bytes.  At most one
/// part (plus one incoming chunk) is buffered at a time.
pub struct PartReader {
    stream: ChunkStream,
    part_size: usize,
    pending: BytesMut,
    exhausted: bool,
}

impl PartReader {
    /// Read `body` in parts of `part_size` bytes.
    pub fn new(body: ObjectBody, part_size: usize) -> Self {
        Self {
            stream: body.into_stream(),
            part_size: part_size.max(1),
            pending: BytesMut::new(),
            exhausted: false,
        }
    }

    /// Configured part size.
    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Next part, or `None` once the body is drained.
    pub async fn next_part(&mut self) -> io::Result<Option<Bytes>> {
        while self.pending.len() < self.part_size && !self.exhausted {
            match self.stream.next().await {
                Some(chunk) => self.pending.extend_from_slice(&chunk?),
                None => self.exhausted = true,
            }
        }

        if self.pending.is_empty() {
            return Ok(None);
        }

        let take = self.pending.len().min(self.part_size);
        Ok(Some(self.pending.split_to(take).freeze()))
    }
}

// -- Tests -------------------------------------------------------------------
