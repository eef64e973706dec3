//! Byte-stream capability traits and chain plumbing.
//!
//! # Invariants
//! - Real I/O happens only through `Source`/`Sink`; everything above is
//!   composition logic.
//! - The base adapters (`SourceReader`, `SinkWriter`) close their capability
//!   exactly once on every exit path, including early aborts.
//! - `take_raw_delta()` reports raw source/sink bytes moved since the last
//!   call and is propagated unchanged through every chain layer.
//!
//! # Design Notes
//! - `PeekRead` provides the bounded, non-destructive probe window used for
//!   filter and format detection; peeked bytes are replayed on `read`.
//! - `skip` is advisory: a capability that cannot skip reports
//!   `ErrorKind::Unsupported` and the adapter falls back to read-and-discard.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Caller-implemented byte source capability.
///
/// `open` runs once before any read; `close` runs exactly once when the
/// owning context releases the stream. The default `skip` reports
/// `Unsupported`, which makes the context fall back to read-and-discard.
pub trait Source {
    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn skip(&mut self, _n: u64) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "skip unsupported"))
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Caller-implemented byte sink capability.
pub trait Sink {
    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Source for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        // Seeking past EOF is defined for files; clamp to the real length so
        // the contract "never more than n, never past the data" holds.
        let here = self.stream_position()?;
        let len = self.seek(SeekFrom::End(0))?;
        let target = here.saturating_add(n).min(len);
        self.seek(SeekFrom::Start(target))?;
        Ok(target - here)
    }
}

impl Sink for File {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Adapter: any `io::Read` as a `Source` (no skip support).
pub struct IoSource<R: Read>(pub R);

impl<R: Read> Source for IoSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Adapter: any `io::Write` as a `Sink`.
pub struct IoSink<W: Write>(pub W);

impl<W: Write> Sink for IoSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Sink that appends to a caller-visible buffer. Used heavily in tests.
#[derive(Default)]
pub struct VecSink(pub Vec<u8>);

impl Sink for VecSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Read surface presented by every layer of a resolved read chain.
///
/// # Guarantees
/// - `take_raw_delta()` returns raw source bytes consumed since the last
///   call, no matter how many filter stages sit in between.
/// - `close()` cascades to the base `Source` and is idempotent there.
pub trait ChainRead: Read {
    fn take_raw_delta(&mut self) -> u64;

    /// Discard up to `n` bytes of this layer's output, short only at end of
    /// stream. Decoding stages keep the default, which pulls through `read`
    /// so their state advances; the base overrides it with the capability's
    /// native skip.
    fn skip(&mut self, mut n: u64) -> io::Result<u64> {
        let mut tmp = [0u8; 4096];
        let mut done = 0u64;
        while n > 0 {
            let step = (tmp.len() as u64).min(n) as usize;
            let k = read_some(self, &mut tmp[..step])?;
            if k == 0 {
                break;
            }
            done += k as u64;
            n -= k as u64;
        }
        Ok(done)
    }

    fn close(&mut self) -> io::Result<()>;
}

impl<T: ChainRead + ?Sized> ChainRead for Box<T> {
    #[inline(always)]
    fn take_raw_delta(&mut self) -> u64 {
        (**self).take_raw_delta()
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        (**self).skip(n)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Write surface presented by every layer of a resolved write chain.
///
/// `finish()` flushes the codec trailer of this stage and cascades inward;
/// `close()` cascades to the base `Sink` and is idempotent there. Writes
/// after `finish()` are a caller error and fail.
pub trait ChainWrite: Write {
    fn take_raw_delta(&mut self) -> u64;

    fn finish(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

impl<T: ChainWrite + ?Sized> ChainWrite for Box<T> {
    #[inline(always)]
    fn take_raw_delta(&mut self) -> u64 {
        (**self).take_raw_delta()
    }

    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Base of every read chain: owns the `Source`, counts raw bytes, retries
/// `Interrupted`, and closes the capability exactly once.
pub struct SourceReader {
    src: Box<dyn Source>,
    raw: u64,
    closed: bool,
}

impl SourceReader {
    pub fn new(src: Box<dyn Source>) -> Self {
        Self {
            src,
            raw: 0,
            closed: false,
        }
    }
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.src.read(buf) {
                Ok(n) => {
                    self.raw = self.raw.saturating_add(n as u64);
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl ChainRead for SourceReader {
    #[inline]
    fn take_raw_delta(&mut self) -> u64 {
        std::mem::take(&mut self.raw)
    }

    /// Skip `n` source bytes, preferring the capability's own skip.
    fn skip(&mut self, mut n: u64) -> io::Result<u64> {
        let mut tmp = [0u8; 4096];
        let mut done = 0u64;
        while n > 0 {
            match self.src.skip(n) {
                Ok(0) => break,
                Ok(k) => {
                    debug_assert!(k <= n);
                    self.raw = self.raw.saturating_add(k);
                    done += k;
                    n -= k;
                }
                Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                    let step = (tmp.len() as u64).min(n) as usize;
                    let k = read_some(self, &mut tmp[..step])?;
                    if k == 0 {
                        break;
                    }
                    done += k as u64;
                    n -= k as u64;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.src.close()
    }
}

impl Drop for SourceReader {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.src.close();
        }
    }
}

/// Base of every write chain: owns the `Sink`, counts raw bytes, closes once.
pub struct SinkWriter {
    sink: Box<dyn Sink>,
    raw: u64,
    closed: bool,
}

impl SinkWriter {
    pub fn new(sink: Box<dyn Sink>) -> Self {
        Self {
            sink,
            raw: 0,
            closed: false,
        }
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.sink.write(buf) {
                Ok(n) => {
                    self.raw = self.raw.saturating_add(n as u64);
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ChainWrite for SinkWriter {
    #[inline]
    fn take_raw_delta(&mut self) -> u64 {
        std::mem::take(&mut self.raw)
    }

    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sink.close()
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.sink.close();
        }
    }
}

/// Reader that can "peek" a bounded prefix without losing it.
///
/// Probing reads the prefix from the inner stream once; subsequent `read`
/// calls replay the buffered bytes before touching the inner stream again.
pub struct PeekRead<R: ChainRead> {
    inner: R,
    buf: Vec<u8>,
    filled: usize,
    pos: usize,
}

impl<R: ChainRead> PeekRead<R> {
    pub fn with_capacity(inner: R, window: usize) -> Self {
        Self {
            inner,
            buf: vec![0u8; window],
            filled: 0,
            pos: 0,
        }
    }

    /// Fill the peek window up to its capacity (bounded, short on EOF).
    pub fn prefill(&mut self) -> io::Result<usize> {
        let cap = self.buf.len();
        while self.filled < cap {
            let n = read_some(&mut self.inner, &mut self.buf[self.filled..cap])?;
            if n == 0 {
                break;
            }
            self.filled += n;
        }
        Ok(self.filled)
    }

    #[inline]
    pub fn peeked(&self) -> &[u8] {
        &self.buf[..self.filled]
    }
}

impl<R: ChainRead> Read for PeekRead<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.filled {
            let n = (self.filled - self.pos).min(dst.len());
            dst[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.inner.read(dst)
    }
}

impl<R: ChainRead> ChainRead for PeekRead<R> {
    #[inline(always)]
    fn take_raw_delta(&mut self) -> u64 {
        self.inner.take_raw_delta()
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        // Buffered probe bytes count first; only the remainder reaches the
        // inner layer's skip.
        let buffered = ((self.filled - self.pos) as u64).min(n);
        self.pos += buffered as usize;
        if buffered == n {
            return Ok(buffered);
        }
        Ok(buffered + self.inner.skip(n - buffered)?)
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

/// Resolved read chain with position accounting and framing helpers.
///
/// # Invariants
/// - `uncompressed_pos` counts bytes delivered to the format layer.
/// - `raw_pos` counts bytes consumed from the underlying `Source`.
/// - Both are monotonically non-decreasing for the life of the context.
pub struct ChainSource {
    inner: Box<dyn ChainRead>,
    uncompressed: u64,
    raw: u64,
}

impl ChainSource {
    pub fn new(mut inner: Box<dyn ChainRead>) -> Self {
        let raw = inner.take_raw_delta();
        Self {
            inner,
            uncompressed: 0,
            raw,
        }
    }

    #[inline]
    pub fn raw_pos(&self) -> u64 {
        self.raw
    }

    #[inline]
    pub fn uncompressed_pos(&self) -> u64 {
        self.uncompressed
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = read_some(&mut self.inner, buf)?;
        self.uncompressed = self.uncompressed.saturating_add(n as u64);
        self.raw = self.raw.saturating_add(self.inner.take_raw_delta());
        Ok(n)
    }

    /// Read a full buffer, or report clean EOF if nothing was available.
    ///
    /// Returns `Ok(false)` only when EOF hit before the first byte; a short
    /// read mid-buffer is an `UnexpectedEof` error.
    pub fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut off = 0;
        while off < buf.len() {
            let n = self.read(&mut buf[off..])?;
            if n == 0 {
                if off == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated record",
                ));
            }
            off += n;
        }
        Ok(true)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if !self.read_exact_or_eof(buf)? {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated"));
        }
        Ok(())
    }

    /// Discard exactly `n` bytes; error on EOF before `n`.
    ///
    /// Goes through the chain's `skip`, so an identity chain over a seekable
    /// `Source` never reads the discarded bytes.
    pub fn skip_exact(&mut self, mut n: u64) -> io::Result<()> {
        while n > 0 {
            let k = self.inner.skip(n)?;
            self.uncompressed = self.uncompressed.saturating_add(k);
            self.raw = self.raw.saturating_add(self.inner.take_raw_delta());
            if k == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated record",
                ));
            }
            n -= k;
        }
        Ok(())
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

/// Resolved write chain with the dual accounting.
pub struct ChainSink {
    inner: Box<dyn ChainWrite>,
    uncompressed: u64,
    raw: u64,
}

impl ChainSink {
    pub fn new(inner: Box<dyn ChainWrite>) -> Self {
        Self {
            inner,
            uncompressed: 0,
            raw: 0,
        }
    }

    #[inline]
    pub fn raw_pos(&self) -> u64 {
        self.raw
    }

    #[inline]
    pub fn uncompressed_pos(&self) -> u64 {
        self.uncompressed
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)?;
        self.uncompressed = self.uncompressed.saturating_add(buf.len() as u64);
        self.raw = self.raw.saturating_add(self.inner.take_raw_delta());
        Ok(())
    }

    /// Write `n` zero bytes (entry padding, trailers).
    pub fn write_zeros(&mut self, mut n: u64) -> io::Result<()> {
        let zeros = [0u8; 512];
        while n > 0 {
            let step = (zeros.len() as u64).min(n) as usize;
            self.write_all(&zeros[..step])?;
            n -= step as u64;
        }
        Ok(())
    }

    pub fn finish(&mut self) -> io::Result<()> {
        self.inner.finish()?;
        self.raw = self.raw.saturating_add(self.inner.take_raw_delta());
        Ok(())
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

/// `read` with `Interrupted` retried, like the rest of the chain expects.
pub fn read_some<R: Read + ?Sized>(r: &mut R, dst: &mut [u8]) -> io::Result<usize> {
    loop {
        match r.read(dst) {
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
