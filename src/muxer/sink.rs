//! Positioned-write sinks and the coalescing adapter the container writers use

use crate::Error;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Default coalescing buffer size
pub const COALESCE_BYTES: usize = 64 * 1024;

/// Destination for container bytes
///
/// Each call either extends the stream or overwrites bytes a previous call
/// already wrote. Any error is treated as a short write.
pub trait WriteSink: Send {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
}

impl<T: WriteSink + ?Sized> WriteSink for Box<T> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, data)
    }
}

/// One `write_at` call as seen by a [`MemorySink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub offset: u64,
    pub len: usize,
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: Vec<u8>,
    writes: Vec<WriteRecord>,
}

/// Growable in-memory sink
///
/// Clones share the same buffer, so a caller can keep one clone and hand the
/// other to a muxer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the bytes written so far
    pub fn contents(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every write in call order
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }
}

impl WriteSink for MemorySink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "write overflows"))?;

        let mut inner = self.lock();
        if inner.data.len() < end {
            inner.data.resize(end, 0);
        }
        inner.data[start..end].copy_from_slice(data);
        inner.writes.push(WriteRecord {
            offset,
            len: data.len(),
        });
        Ok(())
    }
}

/// Sink over any seekable writer, e.g. a `File`
#[derive(Debug)]
pub struct SeekSink<W> {
    inner: W,
}

impl<W: Write + Seek + Send> SeekSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Seek + Send> WriteSink for SeekSink<W> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(data)?;
        self.inner.flush()
    }
}

/// A sink failure carried through `io::Error` so it survives the mp4 writer
#[derive(Debug, thiserror::Error)]
#[error("sink rejected {len} bytes at offset {offset}")]
pub struct SinkRejected {
    pub offset: u64,
    pub len: usize,
    #[source]
    pub source: io::Error,
}

/// Recover a sink failure from an `io::Error`, anything else becomes a mux error
pub fn sink_error(err: io::Error) -> Error {
    if err
        .get_ref()
        .is_some_and(|inner| inner.is::<SinkRejected>())
    {
        if let Some(inner) = err.into_inner() {
            if let Ok(rejected) = inner.downcast::<SinkRejected>() {
                let SinkRejected {
                    offset,
                    len,
                    source,
                } = *rejected;
                return Error::SinkWriteFailure {
                    offset,
                    len,
                    source,
                };
            }
        }
        return Error::Mux("sink failure lost its context".to_string());
    }
    Error::Mux(format!("I/O error: {}", err))
}

/// `Write + Seek` view of a [`WriteSink`]
///
/// Contiguous writes are coalesced into one buffer; a write at any other
/// position, a full buffer or an explicit flush hands the buffer to the sink.
pub struct SinkWriter {
    sink: Box<dyn WriteSink>,
    pos: u64,
    end: u64,
    pending_offset: u64,
    pending: Vec<u8>,
    capacity: usize,
    sink_calls: u64,
}

impl SinkWriter {
    pub fn new(sink: Box<dyn WriteSink>) -> Self {
        Self::with_capacity(sink, COALESCE_BYTES)
    }

    pub fn with_capacity(sink: Box<dyn WriteSink>, capacity: usize) -> Self {
        Self {
            sink,
            pos: 0,
            end: 0,
            pending_offset: 0,
            pending: Vec::with_capacity(capacity.min(COALESCE_BYTES)),
            capacity: capacity.max(1),
            sink_calls: 0,
        }
    }

    /// Logical length of the stream
    pub fn stream_len(&self) -> u64 {
        self.end
    }

    /// Number of `write_at` calls issued so far
    pub fn sink_calls(&self) -> u64 {
        self.sink_calls
    }

    /// Write straight through to the sink at the current position,
    /// bypassing the buffer
    pub fn write_through(&mut self, data: &[u8]) -> io::Result<()> {
        self.flush_pending()?;
        self.issue(self.pos, data)?;
        self.pos += data.len() as u64;
        self.end = self.end.max(self.pos);
        Ok(())
    }

    fn issue(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        tracing::trace!(offset, len = data.len(), "sink write");
        self.sink_calls += 1;
        self.sink.write_at(offset, data).map_err(|source| {
            io::Error::other(SinkRejected {
                offset,
                len: data.len(),
                source,
            })
        })
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.pending);
        let result = self.issue(self.pending_offset, &data);
        self.pending = data;
        self.pending.clear();
        result
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.pending.is_empty() && self.pending_offset + self.pending.len() as u64 != self.pos {
            self.flush_pending()?;
        }
        if self.pending.is_empty() {
            self.pending_offset = self.pos;
        }
        self.pending.extend_from_slice(buf);
        self.pos += buf.len() as u64;
        self.end = self.end.max(self.pos);
        if self.pending.len() >= self.capacity {
            self.flush_pending()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending()
    }
}

impl Seek for SinkWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.end.checked_add_signed(delta),
        };
        self.pos = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;
        Ok(self.pos)
    }
}

impl std::fmt::Debug for SinkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkWriter")
            .field("pos", &self.pos)
            .field("end", &self.end)
            .field("pending", &self.pending.len())
            .finish()
    }
}
