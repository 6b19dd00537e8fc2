//! Docker stream multiplexing
//!
//! Non-tty streams prefix every chunk with an 8-byte header:
//! `[stream_type, 0, 0, 0, size_be_u32]`.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Stream identifiers used in the multiplex header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

/// Size of the multiplex header
pub const HEADER_LEN: usize = 8;

/// Encode one multiplexed chunk
pub fn frame(stream: StreamType, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
    buf.put_u8(stream as u8);
    buf.put_bytes(0, 3);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// Write one multiplexed chunk to `w`
pub async fn write_chunk<W>(w: &mut W, stream: StreamType, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(&frame(stream, data)).await
}

/// Split a multiplexed byte stream into `(stream, payload)` chunks.
///
/// Trailing bytes that do not form a complete frame are ignored.
pub fn demux(mut data: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    while data.len() >= HEADER_LEN {
        let size = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if data.len() < HEADER_LEN + size {
            break;
        }
        out.push((data[0], data[HEADER_LEN..HEADER_LEN + size].to_vec()));
        data = &data[HEADER_LEN + size..];
    }
    out
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Cloneable writer over a shared connection half.
///
/// When created with a stream type every write is wrapped in a multiplex
/// frame; raw writers pass bytes through (tty mode).
#[derive(Clone)]
pub struct StreamWriter {
    inner: SharedWriter,
    stream: Option<StreamType>,
}

impl StreamWriter {
    /// Raw writer over `w`
    pub fn raw(w: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(w)),
            stream: None,
        }
    }

    /// stdout/stderr pair sharing `w`; framed unless `tty`
    pub fn pair(w: Box<dyn AsyncWrite + Send + Unpin>, tty: bool) -> (Self, Self) {
        let raw = Self::raw(w);
        if tty {
            return (raw.clone(), raw);
        }
        (
            raw.with_stream(StreamType::Stdout),
            raw.with_stream(StreamType::Stderr),
        )
    }

    /// Same underlying writer, framing as `stream`
    pub fn with_stream(&self, stream: StreamType) -> Self {
        Self {
            inner: self.inner.clone(),
            stream: Some(stream),
        }
    }

    /// Write a chunk, framing it if needed
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut w = self.inner.lock().await;
        match self.stream {
            Some(stream) => write_chunk(&mut *w, stream, data).await?,
            None => w.write_all(data).await?,
        }
        w.flush().await
    }

    /// Shut down the underlying writer
    pub async fn shutdown(&self) -> io::Result<()> {
        self.inner.lock().await.shutdown().await
    }
}
