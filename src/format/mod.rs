//! Container format modules and dispatch.
//!
//! # Invariants
//! - Probing is non-destructive: it sees the peek window only and the first
//!   positive match in registration order wins.
//! - Once a format is locked for a context it is never re-probed; the family
//!   half of the code stays fixed while the variant half may change as the
//!   module discovers extensions entry-by-entry.
//! - A module never delivers more body bytes than the current entry's
//!   declared size; trailing physical padding is consumed silently.
//!
//! # Design Notes
//! - The empty format matches zero bytes, so it only works as the last
//!   candidate; `FormatSpec::default_read_set` keeps that ordering.
//! - Body streaming goes through `BodyWindow` so the context can hand out
//!   borrowed blocks with explicit offsets without copying.

pub mod ar;
pub mod cpio;
pub mod empty;
pub mod tar;
pub mod zip;

use serde::{Deserialize, Serialize};

use crate::entry::Entry;
use crate::status::{ArchiveError, Stage, Status};
use crate::stream::{ChainSink, ChainSource};

/// Two-part format identifier: family in the upper 16 bits, variant below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormatCode(pub u32);

impl FormatCode {
    pub const BASE_MASK: u32 = 0xFFFF_0000;

    pub const CPIO: FormatCode = FormatCode(0x10000);
    pub const CPIO_NEWC: FormatCode = FormatCode(0x10000 | 4);
    pub const CPIO_NEWC_CRC: FormatCode = FormatCode(0x10000 | 5);
    pub const SHAR: FormatCode = FormatCode(0x20000);
    pub const TAR: FormatCode = FormatCode(0x30000);
    pub const TAR_USTAR: FormatCode = FormatCode(0x30000 | 1);
    pub const TAR_PAX: FormatCode = FormatCode(0x30000 | 2);
    pub const TAR_GNU: FormatCode = FormatCode(0x30000 | 4);
    pub const ISO9660: FormatCode = FormatCode(0x40000);
    pub const ZIP: FormatCode = FormatCode(0x50000);
    pub const EMPTY: FormatCode = FormatCode(0x60000);
    pub const AR: FormatCode = FormatCode(0x70000);
    pub const AR_GNU: FormatCode = FormatCode(0x70000 | 1);
    pub const AR_BSD: FormatCode = FormatCode(0x70000 | 2);
    pub const MTREE: FormatCode = FormatCode(0x80000);

    #[inline(always)]
    pub fn family(self) -> FormatCode {
        FormatCode(self.0 & Self::BASE_MASK)
    }

    #[inline(always)]
    pub fn variant(self) -> u16 {
        (self.0 & !Self::BASE_MASK) as u16
    }

    pub fn name(self) -> &'static str {
        match self.family() {
            FormatCode::CPIO => "cpio",
            FormatCode::SHAR => "shar",
            FormatCode::TAR => "tar",
            FormatCode::ISO9660 => "iso9660",
            FormatCode::ZIP => "zip",
            FormatCode::EMPTY => "empty",
            FormatCode::AR => "ar",
            FormatCode::MTREE => "mtree",
            _ => "unknown",
        }
    }
}

/// Outcome of a header parse.
pub enum FormatNext {
    Entry(Entry),
    End,
}

/// Read-side contract for one container format.
///
/// Body streaming protocol: `fill` makes bytes available (0 means the body
/// is exhausted), the window accessors expose and consume them. `skip_rest`
/// discards whatever the caller did not read, including physical padding,
/// leaving the stream at the next header.
pub trait FormatReader {
    fn code(&self) -> FormatCode;

    fn next_entry(&mut self, src: &mut ChainSource) -> Result<FormatNext, ArchiveError>;

    fn fill(&mut self, src: &mut ChainSource) -> Result<usize, ArchiveError>;

    fn window(&self) -> &BodyWindow;

    fn window_mut(&mut self) -> &mut BodyWindow;

    fn skip_rest(&mut self, src: &mut ChainSource) -> Result<(), ArchiveError>;

    /// Recoverable degradation noticed since the last call, if any.
    fn take_warning(&mut self) -> Option<ArchiveError> {
        None
    }
}

/// Write-side contract for one container format.
///
/// `write_header` returns the body byte contract for the entry: how many
/// bytes the caller must supply before `finish_entry` (0 when the format
/// encodes the content, e.g. a symlink target, inside the header record).
pub trait FormatWriter {
    fn code(&self) -> FormatCode;

    fn write_header(&mut self, sink: &mut ChainSink, entry: &Entry) -> Result<u64, ArchiveError>;

    /// Per-entry trailer (alignment padding).
    fn finish_entry(&mut self, sink: &mut ChainSink) -> Result<(), ArchiveError>;

    /// Archive trailer.
    fn finish(&mut self, sink: &mut ChainSink) -> Result<(), ArchiveError>;
}

/// A configurable format candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatSpec {
    Tar,
    Cpio,
    Zip,
    Ar,
    Empty,
}

impl FormatSpec {
    /// Default read candidates, most specific first. Empty matches zero
    /// bytes and must stay last.
    pub fn default_read_set() -> Vec<FormatSpec> {
        vec![
            FormatSpec::Tar,
            FormatSpec::Cpio,
            FormatSpec::Zip,
            FormatSpec::Ar,
            FormatSpec::Empty,
        ]
    }

    pub fn family(&self) -> FormatCode {
        match self {
            FormatSpec::Tar => FormatCode::TAR,
            FormatSpec::Cpio => FormatCode::CPIO,
            FormatSpec::Zip => FormatCode::ZIP,
            FormatSpec::Ar => FormatCode::AR,
            FormatSpec::Empty => FormatCode::EMPTY,
        }
    }

    /// Signature check against the peek window.
    pub fn probe(&self, peek: &[u8]) -> bool {
        match self {
            FormatSpec::Tar => tar::probe(peek),
            FormatSpec::Cpio => cpio::probe(peek),
            FormatSpec::Zip => zip::probe(peek),
            FormatSpec::Ar => ar::probe(peek),
            FormatSpec::Empty => peek.is_empty(),
        }
    }

    pub fn new_reader(&self) -> Box<dyn FormatReader> {
        match self {
            FormatSpec::Tar => Box::new(tar::TarReader::new()),
            FormatSpec::Cpio => Box::new(cpio::CpioReader::new()),
            FormatSpec::Zip => Box::new(zip::ZipReader::new()),
            FormatSpec::Ar => Box::new(ar::ArReader::new()),
            FormatSpec::Empty => Box::new(empty::EmptyReader::new()),
        }
    }

    pub fn new_writer(&self) -> Result<Box<dyn FormatWriter>, ArchiveError> {
        match self {
            FormatSpec::Tar => Ok(Box::new(tar::TarWriter::new())),
            FormatSpec::Cpio => Ok(Box::new(cpio::CpioWriter::new())),
            FormatSpec::Ar => Ok(Box::new(ar::ArWriter::new())),
            FormatSpec::Zip | FormatSpec::Empty => Err(ArchiveError::failed(
                Stage::Format,
                format!("{} has no write support", self.family().name()),
            )),
        }
    }
}

/// Buffered view over the current entry's body.
///
/// `offset` is the body offset of the first unconsumed byte; blocks handed
/// out through `take_chunk` are disjoint and strictly increasing.
pub struct BodyWindow {
    buf: Vec<u8>,
    len: usize,
    pos: usize,
    offset: u64,
}

impl BodyWindow {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: vec![0; cap],
            len: 0,
            pos: 0,
            offset: 0,
        }
    }

    /// Start a fresh entry body.
    pub fn reset(&mut self) {
        self.len = 0;
        self.pos = 0;
        self.offset = 0;
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.len - self.pos
    }

    /// The unconsumed bytes currently buffered.
    #[inline]
    pub fn chunk(&self) -> &[u8] {
        &self.buf[self.pos..self.len]
    }

    #[inline]
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.pos += n;
        self.offset += n as u64;
    }

    /// Take the whole buffered remainder with its body offset, marking it
    /// consumed before the borrow is handed out.
    pub fn take_chunk(&mut self) -> (u64, &[u8]) {
        let off = self.offset;
        let start = self.pos;
        let end = self.len;
        self.offset += (end - start) as u64;
        self.pos = end;
        (off, &self.buf[start..end])
    }

    /// Buffer for a refill; only valid when the window is drained.
    pub fn space(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.available(), 0);
        &mut self.buf[..]
    }

    /// Publish `n` freshly filled bytes.
    pub fn filled(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len());
        self.pos = 0;
        self.len = n;
    }
}

/// Shared `fill` for formats whose body is the raw stream: pull up to the
/// declared remainder into the window. Truncation mid-body poisons the
/// stream.
pub(crate) fn fill_raw_body(
    window: &mut BodyWindow,
    remaining: &mut u64,
    src: &mut ChainSource,
) -> Result<usize, ArchiveError> {
    if window.available() > 0 {
        return Ok(window.available());
    }
    if *remaining == 0 {
        return Ok(0);
    }
    let want = (window.space().len() as u64).min(*remaining) as usize;
    let n = src
        .read(&mut window.space()[..want])
        .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read body", &e))?;
    if n == 0 {
        return Err(ArchiveError::fatal(Stage::Format, "truncated entry body"));
    }
    *remaining -= n as u64;
    window.filled(n);
    Ok(n)
}

/// Shared `skip_rest` core: drop buffered bytes, then discard the declared
/// remainder plus `padding` physical bytes from the stream.
pub(crate) fn skip_raw_body(
    window: &mut BodyWindow,
    remaining: &mut u64,
    padding: u64,
    src: &mut ChainSource,
) -> Result<(), ArchiveError> {
    let buffered = window.available();
    if buffered > 0 {
        window.consume(buffered);
    }
    let drop = *remaining + padding;
    *remaining = 0;
    src.skip_exact(drop)
        .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "skip body", &e))
}
