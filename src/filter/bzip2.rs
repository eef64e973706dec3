//! bzip2 filter stage.
//!
//! Same stage shape as the gzip filter; the codec comes from the `bzip2`
//! crate. Concatenated members are handled by `MultiBzDecoder`.

use std::io::{self, Read, Write};

use bzip2::read::MultiBzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;

use crate::stream::{ChainRead, ChainWrite};

/// "BZh" followed by the block-size digit.
#[inline(always)]
pub fn is_bzip2_magic(header: &[u8]) -> bool {
    header.len() >= 4
        && &header[..3] == b"BZh"
        && header[3].is_ascii_digit()
        && header[3] != b'0'
}

pub struct Bzip2ReadFilter {
    dec: MultiBzDecoder<Box<dyn ChainRead>>,
}

impl Bzip2ReadFilter {
    pub fn new(inner: Box<dyn ChainRead>) -> Self {
        Self {
            dec: MultiBzDecoder::new(inner),
        }
    }
}

impl Read for Bzip2ReadFilter {
    #[inline]
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.dec.read(dst)
    }
}

impl ChainRead for Bzip2ReadFilter {
    #[inline(always)]
    fn take_raw_delta(&mut self) -> u64 {
        self.dec.get_mut().take_raw_delta()
    }

    fn close(&mut self) -> io::Result<()> {
        self.dec.get_mut().close()
    }
}

pub struct Bzip2WriteFilter {
    enc: Option<BzEncoder<Box<dyn ChainWrite>>>,
    done: Option<Box<dyn ChainWrite>>,
}

impl Bzip2WriteFilter {
    pub fn new(inner: Box<dyn ChainWrite>) -> Self {
        Self {
            enc: Some(BzEncoder::new(inner, Compression::default())),
            done: None,
        }
    }
}

impl Write for Bzip2WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.enc.as_mut() {
            Some(enc) => enc.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after bzip2 trailer",
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

impl ChainWrite for Bzip2WriteFilter {
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
