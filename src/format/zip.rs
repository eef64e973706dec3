//! zip format module (streaming local-header reader).
//!
//! # Invariants
//! - The stream is walked forward through local file headers only; reaching
//!   a central-directory or end-of-central-directory signature ends the
//!   archive.
//! - Body framing trusts the local header's compressed size; delivered bytes
//!   never exceed the declared uncompressed size.
//! - CRC mismatches degrade to a warning after the body has streamed; the
//!   bytes were already delivered and the stream stays in sync.
//!
//! # Design Notes
//! - Entries that defer their sizes to a data descriptor (flag bit 3) cannot
//!   be framed in a forward-only stream and poison the context.
//! - Encrypted entries are skipped whole with a warning; their sizes are
//!   known so the stream stays in sync.
//! - Read-only: zip writing is not supported.

use crc32fast::Hasher;
use flate2::{Decompress, FlushDecompress};

use crate::entry::{Entry, EntryType};
use crate::format::{BodyWindow, FormatCode, FormatNext, FormatReader};
use crate::status::{ArchiveError, Stage, Status};
use crate::stream::ChainSource;

const SIG_LFH: u32 = 0x0403_4b50;
const SIG_CDFH: u32 = 0x0201_4b50;
const SIG_EOCD: u32 = 0x0605_4b50;

const FLAG_ENCRYPTED: u16 = 0x0001;
const FLAG_DESCRIPTOR: u16 = 0x0008;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

const BODY_BUF: usize = 64 * 1024;
const IN_BUF: usize = 32 * 1024;

pub fn probe(peek: &[u8]) -> bool {
    if peek.len() < 4 {
        return false;
    }
    let sig = u32::from_le_bytes([peek[0], peek[1], peek[2], peek[3]]);
    sig == SIG_LFH || sig == SIG_EOCD
}

#[inline]
fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

#[inline]
fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

/// Days since the epoch for a civil date (proleptic Gregorian).
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// MS-DOS date/time pair to unix seconds (2-second resolution).
fn dos_time_to_unix(date: u16, time: u16) -> i64 {
    let year = 1980 + i64::from(date >> 9);
    let month = i64::from((date >> 5) & 0xf).clamp(1, 12);
    let day = i64::from(date & 0x1f).max(1);
    let hour = i64::from(time >> 11).min(23);
    let min = i64::from((time >> 5) & 0x3f).min(59);
    let sec = i64::from((time & 0x1f) * 2).min(59);
    days_from_civil(year, month, day) * 86_400 + hour * 3_600 + min * 60 + sec
}

struct DeflateBody {
    dec: Decompress,
    inbuf: Vec<u8>,
    inpos: usize,
    inlen: usize,
    in_remaining: u64,
    out_remaining: u64,
}

enum Body {
    None,
    Stored { remaining: u64 },
    Deflate(Box<DeflateBody>),
}

pub struct ZipReader {
    code: FormatCode,
    window: BodyWindow,
    body: Body,
    crc: Hasher,
    expect_crc: u32,
    crc_pending: bool,
    warning: Option<ArchiveError>,
}

impl ZipReader {
    pub fn new() -> Self {
        Self {
            code: FormatCode::ZIP,
            window: BodyWindow::with_capacity(BODY_BUF),
            body: Body::None,
            crc: Hasher::new(),
            expect_crc: 0,
            crc_pending: false,
            warning: None,
        }
    }

    fn note_warning(&mut self, w: ArchiveError) {
        if self.warning.is_none() {
            self.warning = Some(w);
        }
    }

    /// Runs once when the body drains cleanly; a mismatch is a warning, the
    /// bytes are already with the caller.
    fn check_crc(&mut self) {
        if !self.crc_pending {
            return;
        }
        self.crc_pending = false;
        let got = std::mem::replace(&mut self.crc, Hasher::new()).finalize();
        if got != self.expect_crc {
            self.note_warning(ArchiveError::warn(
                Stage::Format,
                format!("zip crc mismatch: header {:08x}, body {got:08x}", self.expect_crc),
            ));
        }
    }

    fn fill_stored(&mut self, src: &mut ChainSource) -> Result<usize, ArchiveError> {
        let Body::Stored { ref mut remaining } = self.body else {
            unreachable!()
        };
        if self.window.available() > 0 {
            return Ok(self.window.available());
        }
        if *remaining == 0 {
            self.check_crc();
            return Ok(0);
        }
        let want = (self.window.space().len() as u64).min(*remaining) as usize;
        let n = src
            .read(&mut self.window.space()[..want])
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read body", &e))?;
        if n == 0 {
            return Err(ArchiveError::fatal(Stage::Format, "truncated zip body"));
        }
        *remaining -= n as u64;
        self.window.filled(n);
        self.crc.update(self.window.chunk());
        Ok(n)
    }

    fn fill_deflate(&mut self, src: &mut ChainSource) -> Result<usize, ArchiveError> {
        if self.window.available() > 0 {
            return Ok(self.window.available());
        }
        let Body::Deflate(ref mut d) = self.body else {
            unreachable!()
        };
        if d.out_remaining == 0 {
            self.check_crc();
            return Ok(0);
        }
        loop {
            let Body::Deflate(ref mut d) = self.body else {
                unreachable!()
            };
            if d.inpos == d.inlen {
                if d.in_remaining == 0 {
                    return Err(ArchiveError::fatal(Stage::Format, "truncated zip body"));
                }
                let want = (d.inbuf.len() as u64).min(d.in_remaining) as usize;
                let n = src
                    .read(&mut d.inbuf[..want])
                    .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read body", &e))?;
                if n == 0 {
                    return Err(ArchiveError::fatal(Stage::Format, "truncated zip body"));
                }
                d.in_remaining -= n as u64;
                d.inpos = 0;
                d.inlen = n;
            }

            let before_in = d.dec.total_in();
            let before_out = d.dec.total_out();
            let status = {
                let input = &d.inbuf[d.inpos..d.inlen];
                let out = self.window.space();
                d.dec
                    .decompress(input, out, FlushDecompress::None)
                    .map_err(|_| ArchiveError::fatal(Stage::Format, "bad deflate stream"))?
            };
            let consumed = (d.dec.total_in() - before_in) as usize;
            let produced = (d.dec.total_out() - before_out) as usize;
            d.inpos += consumed;

            if produced > 0 {
                // The declared size is authoritative; never deliver past it.
                let deliver = (produced as u64).min(d.out_remaining) as usize;
                d.out_remaining -= deliver as u64;
                self.window.filled(deliver);
                self.crc.update(self.window.chunk());
                return Ok(deliver);
            }
            if status == flate2::Status::StreamEnd {
                let Body::Deflate(ref d) = self.body else {
                    unreachable!()
                };
                if d.out_remaining > 0 {
                    return Err(ArchiveError::fatal(Stage::Format, "short deflate stream"));
                }
                self.check_crc();
                return Ok(0);
            }
        }
    }
}

impl Default for ZipReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatReader for ZipReader {
    fn code(&self) -> FormatCode {
        self.code
    }

    fn next_entry(&mut self, src: &mut ChainSource) -> Result<FormatNext, ArchiveError> {
        self.window.reset();
        self.body = Body::None;
        self.crc = Hasher::new();
        self.crc_pending = false;

        let mut sig = [0u8; 4];
        let got = src
            .read_exact_or_eof(&mut sig)
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read signature", &e))?;
        if !got {
            return Ok(FormatNext::End);
        }
        match u32::from_le_bytes(sig) {
            SIG_LFH => {}
            SIG_CDFH | SIG_EOCD => return Ok(FormatNext::End),
            _ => return Err(ArchiveError::fatal(Stage::Format, "zip stream out of sync")),
        }

        let mut fixed = [0u8; 26];
        src.read_exact(&mut fixed)
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read header", &e))?;
        let flags = le16(&fixed, 2);
        let method = le16(&fixed, 4);
        let modtime = le16(&fixed, 6);
        let moddate = le16(&fixed, 8);
        let crc32 = le32(&fixed, 10);
        let csize = u64::from(le32(&fixed, 14));
        let usize_ = u64::from(le32(&fixed, 18));
        let namelen = le16(&fixed, 22);
        let extralen = le16(&fixed, 24);

        if namelen == 0 {
            return Err(ArchiveError::fatal(Stage::Format, "bad zip name length"));
        }
        let mut name_raw = vec![0u8; namelen as usize];
        src.read_exact(&mut name_raw)
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read name", &e))?;
        src.skip_exact(u64::from(extralen))
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read extra", &e))?;
        let name = String::from_utf8_lossy(&name_raw).into_owned();

        if flags & FLAG_DESCRIPTOR != 0 {
            // Sizes live behind the body; a forward-only stream cannot frame it.
            return Err(ArchiveError::fatal(
                Stage::Format,
                "zip entry uses a data descriptor; not streamable",
            )
            .with_path(&name));
        }
        if csize == u64::from(u32::MAX) || usize_ == u64::from(u32::MAX) {
            return Err(
                ArchiveError::fatal(Stage::Format, "zip64 sizes not supported").with_path(&name),
            );
        }

        let etype = if name.ends_with('/') {
            EntryType::Directory
        } else {
            EntryType::Regular
        };
        let mut e = Entry::new(name.clone(), etype);
        e.set_mode(if etype.is_dir() { 0o755 } else { 0o644 });
        e.set_mtime(dos_time_to_unix(moddate, modtime), 0);

        if flags & FLAG_ENCRYPTED != 0 {
            self.note_warning(
                ArchiveError::warn(Stage::Format, "encrypted zip entry skipped").with_path(&name),
            );
            src.skip_exact(csize)
                .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "skip body", &e))?;
            return Ok(FormatNext::Entry(e));
        }

        e.set_size(usize_);
        self.expect_crc = crc32;
        self.crc_pending = usize_ > 0;
        self.body = match method {
            METHOD_STORED => {
                if csize != usize_ {
                    return Err(ArchiveError::fatal(Stage::Format, "stored size mismatch")
                        .with_path(&name));
                }
                Body::Stored { remaining: csize }
            }
            METHOD_DEFLATE => Body::Deflate(Box::new(DeflateBody {
                dec: Decompress::new(false),
                inbuf: vec![0; IN_BUF],
                inpos: 0,
                inlen: 0,
                in_remaining: csize,
                out_remaining: usize_,
            })),
            other => {
                return Err(ArchiveError::fatal(
                    Stage::Format,
                    format!("zip compression method {other} not supported"),
                )
                .with_path(&name))
            }
        };
        Ok(FormatNext::Entry(e))
    }

    fn fill(&mut self, src: &mut ChainSource) -> Result<usize, ArchiveError> {
        match self.body {
            Body::None => Ok(0),
            Body::Stored { .. } => self.fill_stored(src),
            Body::Deflate(_) => self.fill_deflate(src),
        }
    }

    fn window(&self) -> &BodyWindow {
        &self.window
    }

    fn window_mut(&mut self) -> &mut BodyWindow {
        &mut self.window
    }

    fn skip_rest(&mut self, src: &mut ChainSource) -> Result<(), ArchiveError> {
        let buffered = self.window.available();
        if buffered > 0 {
            self.window.consume(buffered);
        }
        self.crc_pending = false;
        // Compressed bytes already buffered were pulled off the stream; only
        // the unread remainder needs discarding.
        let raw_left = match std::mem::replace(&mut self.body, Body::None) {
            Body::None => 0,
            Body::Stored { remaining } => remaining,
            Body::Deflate(d) => d.in_remaining,
        };
        src.skip_exact(raw_left)
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "skip body", &e))
    }

    fn take_warning(&mut self) -> Option<ArchiveError> {
        self.warning.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{IoSource, SourceReader};
    use std::io::{Cursor, Write};

    fn lfh(name: &str, method: u16, flags: u16, crc: u32, comp: &[u8], usize_: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&SIG_LFH.to_le_bytes());
        v.extend_from_slice(&20u16.to_le_bytes()); // version needed
        v.extend_from_slice(&flags.to_le_bytes());
        v.extend_from_slice(&method.to_le_bytes());
        v.extend_from_slice(&0u16.to_le_bytes()); // modtime
        v.extend_from_slice(&0x2821u16.to_le_bytes()); // moddate 2000-01-01
        v.extend_from_slice(&crc.to_le_bytes());
        v.extend_from_slice(&(comp.len() as u32).to_le_bytes());
        v.extend_from_slice(&usize_.to_le_bytes());
        v.extend_from_slice(&(name.len() as u16).to_le_bytes());
        v.extend_from_slice(&0u16.to_le_bytes()); // extra len
        v.extend_from_slice(name.as_bytes());
        v.extend_from_slice(comp);
        v
    }

    fn eocd() -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&SIG_EOCD.to_le_bytes());
        v.extend_from_slice(&[0u8; 18]);
        v
    }

    fn source_over(bytes: Vec<u8>) -> ChainSource {
        ChainSource::new(Box::new(SourceReader::new(Box::new(IoSource(Cursor::new(
            bytes,
        ))))))
    }

    fn read_body(r: &mut ZipReader, src: &mut ChainSource) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let n = r.fill(src).unwrap();
            if n == 0 {
                break;
            }
            let (_, chunk) = r.window_mut().take_chunk();
            out.extend_from_slice(chunk);
        }
        r.skip_rest(src).unwrap();
        out
    }

    fn crc_of(data: &[u8]) -> u32 {
        let mut h = Hasher::new();
        h.update(data);
        h.finalize()
    }

    #[test]
    fn dos_time_conversion() {
        // 2000-01-01 00:00:00 UTC = 946684800.
        assert_eq!(dos_time_to_unix(0x2821, 0), 946_684_800);
        // 1980-01-01.
        assert_eq!(dos_time_to_unix(0x0021, 0), 315_532_800);
    }

    #[test]
    fn stored_entry_reads_and_verifies() {
        let data = b"hello zip";
        let mut bytes = lfh("a.txt", METHOD_STORED, 0, crc_of(data), data, data.len() as u32);
        bytes.extend_from_slice(&eocd());
        assert!(probe(&bytes));

        let mut src = source_over(bytes);
        let mut r = ZipReader::new();
        let e = match r.next_entry(&mut src).unwrap() {
            FormatNext::Entry(e) => e,
            FormatNext::End => panic!("expected entry"),
        };
        assert_eq!(e.path(), "a.txt");
        assert_eq!(e.size(), data.len() as u64);
        assert_eq!(read_body(&mut r, &mut src), data);
        assert!(r.take_warning().is_none());
        assert!(matches!(r.next_entry(&mut src).unwrap(), FormatNext::End));
    }

    #[test]
    fn deflate_entry_decompresses() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let mut enc =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&data).unwrap();
        let comp = enc.finish().unwrap();

        let mut bytes = lfh(
            "big.txt",
            METHOD_DEFLATE,
            0,
            crc_of(&data),
            &comp,
            data.len() as u32,
        );
        bytes.extend_from_slice(&eocd());

        let mut src = source_over(bytes);
        let mut r = ZipReader::new();
        match r.next_entry(&mut src).unwrap() {
            FormatNext::Entry(e) => assert_eq!(e.size(), data.len() as u64),
            FormatNext::End => panic!("expected entry"),
        }
        assert_eq!(read_body(&mut r, &mut src), data);
        assert!(r.take_warning().is_none());
    }

    #[test]
    fn crc_mismatch_is_a_warning_not_an_error() {
        let data = b"hello zip";
        let mut bytes = lfh("a.txt", METHOD_STORED, 0, 0xdead_beef, data, data.len() as u32);
        bytes.extend_from_slice(&eocd());

        let mut src = source_over(bytes);
        let mut r = ZipReader::new();
        r.next_entry(&mut src).unwrap();
        assert_eq!(read_body(&mut r, &mut src), data);
        let w = r.take_warning().expect("crc mismatch should warn");
        assert_eq!(w.status(), Status::Warn);
    }

    #[test]
    fn data_descriptor_entries_are_rejected() {
        let mut bytes = lfh("d.txt", METHOD_STORED, FLAG_DESCRIPTOR, 0, b"", 0);
        bytes.extend_from_slice(&eocd());

        let mut src = source_over(bytes);
        let mut r = ZipReader::new();
        match r.next_entry(&mut src) {
            Err(e) => assert_eq!(e.status(), Status::Fatal),
            Ok(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn encrypted_entry_skipped_with_warning() {
        let data = b"ciphertextbytes";
        let mut bytes = lfh(
            "secret.txt",
            METHOD_STORED,
            FLAG_ENCRYPTED,
            0,
            data,
            data.len() as u32,
        );
        bytes.extend_from_slice(&lfh("next.txt", METHOD_STORED, 0, crc_of(b"ok"), b"ok", 2));
        bytes.extend_from_slice(&eocd());

        let mut src = source_over(bytes);
        let mut r = ZipReader::new();
        let e = match r.next_entry(&mut src).unwrap() {
            FormatNext::Entry(e) => e,
            FormatNext::End => panic!("expected entry"),
        };
        assert_eq!(e.path(), "secret.txt");
        assert!(r.take_warning().is_some());
        r.skip_rest(&mut src).unwrap();

        let e2 = match r.next_entry(&mut src).unwrap() {
            FormatNext::Entry(e) => e,
            FormatNext::End => panic!("expected second entry"),
        };
        assert_eq!(e2.path(), "next.txt");
        assert_eq!(read_body(&mut r, &mut src), b"ok");
    }
}
