//! gzip filter stage.
//!
//! # Invariants
//! - The stream is read sequentially; no seeking.
//! - `MultiGzDecoder` treats concatenated members as a single stream.
//!
//! # Design Notes
//! - Raw-byte accounting rides on the chain's `take_raw_delta`, so the
//!   compressed position counter keeps working below the decoder.

use std::io::{self, Read, Write};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::stream::{ChainRead, ChainWrite};

/// gzip magic bytes (RFC 1952).
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[inline(always)]
pub fn is_gzip_magic(header: &[u8]) -> bool {
    header.len() >= 2 && header[0] == GZIP_MAGIC[0] && header[1] == GZIP_MAGIC[1]
}

/// Decompressing read stage over an owned inner stream.
pub struct GzipReadFilter {
    dec: MultiGzDecoder<Box<dyn ChainRead>>,
}

impl GzipReadFilter {
    pub fn new(inner: Box<dyn ChainRead>) -> Self {
        Self {
            dec: MultiGzDecoder::new(inner),
        }
    }
}

impl Read for GzipReadFilter {
    #[inline]
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.dec.read(dst)
    }
}

impl ChainRead for GzipReadFilter {
    #[inline(always)]
    fn take_raw_delta(&mut self) -> u64 {
        self.dec.get_mut().take_raw_delta()
    }

    fn close(&mut self) -> io::Result<()> {
        self.dec.get_mut().close()
    }
}

/// Compressing write stage.
///
/// `finish()` emits the gzip trailer and cascades to the inner stage; the
/// inner stream is retained afterwards so `close()` still reaches the sink.
pub struct GzipWriteFilter {
    enc: Option<GzEncoder<Box<dyn ChainWrite>>>,
    done: Option<Box<dyn ChainWrite>>,
}

impl GzipWriteFilter {
    pub fn new(inner: Box<dyn ChainWrite>) -> Self {
        Self {
            enc: Some(GzEncoder::new(inner, Compression::default())),
            done: None,
        }
    }
}

impl Write for GzipWriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.enc.as_mut() {
            Some(enc) => enc.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after gzip trailer",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.enc.as_mut() {
            Some(enc) => enc.flush(),
            None => Ok(()),
        }
    }
}

impl ChainWrite for GzipWriteFilter {
    #[inline]
    fn take_raw_delta(&mut self) -> u64 {
        match (&mut self.enc, &mut self.done) {
            (Some(enc), _) => enc.get_mut().take_raw_delta(),
            (None, Some(inner)) => inner.take_raw_delta(),
            (None, None) => 0,
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        if let Some(enc) = self.enc.take() {
            let mut inner = enc.finish()?;
            inner.finish()?;
            self.done = Some(inner);
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.finish()?;
        match self.done.as_mut() {
            Some(inner) => inner.close(),
            None => Ok(()),
        }
    }
}
