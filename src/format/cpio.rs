//! cpio format module (SVR4 "newc" wire form, CRC variant accepted).
//!
//! # Invariants
//! - Header and name are 4-byte aligned as a unit from the header start;
//!   bodies are 4-byte aligned independently.
//! - A symlink's target travels as the entry body; the reader folds it into
//!   the entry's link field and reports a zero-size body.
//! - The `TRAILER!!!` record ends the archive; trailing block padding after
//!   it is left unread.

use crate::entry::{Entry, EntryType};
use crate::format::{
    fill_raw_body, skip_raw_body, BodyWindow, FormatCode, FormatNext, FormatReader, FormatWriter,
};
use crate::status::{ArchiveError, Stage, Status};
use crate::stream::{ChainSink, ChainSource};

pub const NEWC_MAGIC: &[u8; 6] = b"070701";
pub const NEWC_CRC_MAGIC: &[u8; 6] = b"070702";
const HEADER_LEN: usize = 110;
const TRAILER_NAME: &str = "TRAILER!!!";

/// Paranoia bound; real names are far shorter.
const MAX_NAME: u64 = 64 * 1024;

const BODY_BUF: usize = 64 * 1024;

// File type bits carried in the mode field.
const IFMT: u32 = 0o170000;
const IFREG: u32 = 0o100000;
const IFDIR: u32 = 0o040000;
const IFLNK: u32 = 0o120000;
const IFIFO: u32 = 0o010000;
const IFCHR: u32 = 0o020000;
const IFBLK: u32 = 0o060000;

pub fn probe(peek: &[u8]) -> bool {
    peek.len() >= 6 && (&peek[..6] == NEWC_MAGIC || &peek[..6] == NEWC_CRC_MAGIC)
}

#[inline(always)]
fn pad4(n: u64) -> u64 {
    (4 - (n % 4)) % 4
}

fn parse_hex8(field: &[u8]) -> Option<u64> {
    let mut v: u64 = 0;
    for &d in field {
        let digit = match d {
            b'0'..=b'9' => d - b'0',
            b'a'..=b'f' => d - b'a' + 10,
            b'A'..=b'F' => d - b'A' + 10,
            _ => return None,
        };
        v = (v << 4) | u64::from(digit);
    }
    Some(v)
}

fn write_hex8(field: &mut [u8], value: u32) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    for i in 0..8 {
        field[i] = DIGITS[((value >> ((7 - i) * 4)) & 0xf) as usize];
    }
}

struct NewcHeader {
    ino: u64,
    mode: u32,
    uid: u64,
    gid: u64,
    mtime: i64,
    filesize: u64,
    devmajor: u32,
    devminor: u32,
    rdevmajor: u32,
    rdevminor: u32,
    namesize: u64,
}

fn parse_header(raw: &[u8; HEADER_LEN]) -> Result<NewcHeader, ArchiveError> {
    let field = |i: usize| -> Result<u64, ArchiveError> {
        let off = 6 + i * 8;
        parse_hex8(&raw[off..off + 8])
            .ok_or_else(|| ArchiveError::fatal(Stage::Format, "bad cpio hex field"))
    };
    Ok(NewcHeader {
        ino: field(0)?,
        mode: field(1)? as u32,
        uid: field(2)?,
        gid: field(3)?,
        // nlink at index 4 is parsed for validity but unused.
        mtime: {
            field(4)?;
            field(5)? as i64
        },
        filesize: field(6)?,
        devmajor: field(7)? as u32,
        devminor: field(8)? as u32,
        rdevmajor: field(9)? as u32,
        rdevminor: field(10)? as u32,
        namesize: {
            let n = field(11)?;
            field(12)?; // check field, zero for 070701
            n
        },
    })
}

pub struct CpioReader {
    code: FormatCode,
    window: BodyWindow,
    remaining: u64,
    padding: u64,
    warning: Option<ArchiveError>,
}

impl CpioReader {
    pub fn new() -> Self {
        Self {
            code: FormatCode::CPIO_NEWC,
            window: BodyWindow::with_capacity(BODY_BUF),
            remaining: 0,
            padding: 0,
            warning: None,
        }
    }

    fn note_warning(&mut self, w: ArchiveError) {
        if self.warning.is_none() {
            self.warning = Some(w);
        }
    }
}

impl Default for CpioReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatReader for CpioReader {
    fn code(&self) -> FormatCode {
        self.code
    }

    fn next_entry(&mut self, src: &mut ChainSource) -> Result<FormatNext, ArchiveError> {
        debug_assert_eq!(self.remaining, 0, "body must be drained before next header");
        self.window.reset();

        let mut raw = [0u8; HEADER_LEN];
        let got = src
            .read_exact_or_eof(&mut raw)
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read header", &e))?;
        if !got {
            // Archive ended without a trailer record; tolerated.
            return Ok(FormatNext::End);
        }

        self.code = match &raw[..6] {
            m if m == NEWC_MAGIC => FormatCode::CPIO_NEWC,
            m if m == NEWC_CRC_MAGIC => FormatCode::CPIO_NEWC_CRC,
            _ => return Err(ArchiveError::fatal(Stage::Format, "cpio stream out of sync")),
        };
        let hdr = parse_header(&raw)?;

        if hdr.namesize == 0 || hdr.namesize > MAX_NAME {
            return Err(ArchiveError::fatal(Stage::Format, "bad cpio name size"));
        }
        let mut name_raw = vec![0u8; hdr.namesize as usize];
        src.read_exact(&mut name_raw)
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read name", &e))?;
        src.skip_exact(pad4(HEADER_LEN as u64 + hdr.namesize))
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read name", &e))?;
        if name_raw.last() == Some(&0) {
            name_raw.pop();
        }
        let name = String::from_utf8_lossy(&name_raw).into_owned();

        if name == TRAILER_NAME {
            return Ok(FormatNext::End);
        }

        let etype = match hdr.mode & IFMT {
            IFREG => EntryType::Regular,
            IFDIR => EntryType::Directory,
            IFLNK => EntryType::Symlink,
            IFIFO => EntryType::Fifo,
            IFCHR => EntryType::CharDevice,
            IFBLK => EntryType::BlockDevice,
            other => {
                self.note_warning(ArchiveError::warn(
                    Stage::Format,
                    format!("unknown cpio mode type {other:#o}, treating as regular"),
                ));
                EntryType::Regular
            }
        };

        let mut e = Entry::new(name, etype);
        e.set_mode(hdr.mode & 0o7777);
        e.set_uid(hdr.uid);
        e.set_gid(hdr.gid);
        e.set_mtime(hdr.mtime, 0);
        e.set_dev_ino(
            (u64::from(hdr.devmajor) << 8) | u64::from(hdr.devminor),
            hdr.ino,
        );
        if matches!(etype, EntryType::CharDevice | EntryType::BlockDevice) {
            e.set_rdev(hdr.rdevmajor, hdr.rdevminor);
        }

        if etype == EntryType::Symlink {
            if hdr.filesize > MAX_NAME {
                return Err(ArchiveError::fatal(Stage::Format, "bad cpio symlink size"));
            }
            let mut target = vec![0u8; hdr.filesize as usize];
            src.read_exact(&mut target)
                .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read link", &e))?;
            src.skip_exact(pad4(hdr.filesize))
                .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read link", &e))?;
            e.set_link(String::from_utf8_lossy(&target).into_owned());
            self.remaining = 0;
            self.padding = 0;
        } else {
            e.set_size(hdr.filesize);
            self.remaining = hdr.filesize;
            self.padding = pad4(hdr.filesize);
        }
        Ok(FormatNext::Entry(e))
    }

    fn fill(&mut self, src: &mut ChainSource) -> Result<usize, ArchiveError> {
        fill_raw_body(&mut self.window, &mut self.remaining, src)
    }

    fn window(&self) -> &BodyWindow {
        &self.window
    }

    fn window_mut(&mut self) -> &mut BodyWindow {
        &mut self.window
    }

    fn skip_rest(&mut self, src: &mut ChainSource) -> Result<(), ArchiveError> {
        let pad = self.padding;
        self.padding = 0;
        skip_raw_body(&mut self.window, &mut self.remaining, pad, src)
    }

    fn take_warning(&mut self) -> Option<ArchiveError> {
        self.warning.take()
    }
}

pub struct CpioWriter {
    entry_size: u64,
    next_ino: u32,
}

impl CpioWriter {
    pub fn new() -> Self {
        Self {
            entry_size: 0,
            next_ino: 1,
        }
    }

    fn write_record(
        &mut self,
        sink: &mut ChainSink,
        name: &str,
        mode: u32,
        uid: u64,
        gid: u64,
        mtime: i64,
        filesize: u64,
        rdev: (u32, u32),
    ) -> Result<(), ArchiveError> {
        let mut raw = [0u8; HEADER_LEN];
        raw[..6].copy_from_slice(NEWC_MAGIC);
        let ino = self.next_ino;
        self.next_ino = self.next_ino.wrapping_add(1);
        let fields: [u32; 13] = [
            ino,
            mode,
            uid as u32,
            gid as u32,
            1, // nlink
            mtime.max(0) as u32,
            filesize as u32,
            0, // devmajor
            0, // devminor
            rdev.0,
            rdev.1,
            name.len() as u32 + 1,
            0, // check
        ];
        for (i, v) in fields.iter().enumerate() {
            let off = 6 + i * 8;
            write_hex8(&mut raw[off..off + 8], *v);
        }
        let io_err = |e: &std::io::Error| {
            ArchiveError::io(Status::Fatal, Stage::Format, "write header", e)
        };
        sink.write_all(&raw).map_err(|e| io_err(&e))?;
        sink.write_all(name.as_bytes()).map_err(|e| io_err(&e))?;
        sink.write_all(&[0]).map_err(|e| io_err(&e))?;
        sink.write_zeros(pad4(HEADER_LEN as u64 + name.len() as u64 + 1))
            .map_err(|e| io_err(&e))?;
        Ok(())
    }
}

impl Default for CpioWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatWriter for CpioWriter {
    fn code(&self) -> FormatCode {
        FormatCode::CPIO_NEWC
    }

    fn write_header(&mut self, sink: &mut ChainSink, entry: &Entry) -> Result<u64, ArchiveError> {
        if entry.size() > u64::from(u32::MAX) {
            return Err(
                ArchiveError::failed(Stage::Format, "entry too large for cpio newc")
                    .with_path(entry.path()),
            );
        }
        let etype = entry.entry_type();
        let type_bits = match etype {
            EntryType::Regular | EntryType::Hardlink => IFREG,
            EntryType::Directory => IFDIR,
            EntryType::Symlink => IFLNK,
            EntryType::Fifo => IFIFO,
            EntryType::CharDevice => IFCHR,
            EntryType::BlockDevice => IFBLK,
        };
        let mode = type_bits | (entry.mode() & 0o7777);

        let (filesize, inline_body) = match etype {
            EntryType::Symlink => {
                let target = entry.link().unwrap_or("");
                (target.len() as u64, Some(target.as_bytes().to_vec()))
            }
            EntryType::Regular => (entry.size(), None),
            _ => (0, None),
        };

        self.write_record(
            sink,
            entry.path(),
            mode,
            entry.uid(),
            entry.gid(),
            entry.mtime(),
            filesize,
            entry.rdev(),
        )?;

        if let Some(body) = inline_body {
            sink.write_all(&body)
                .and_then(|()| sink.write_zeros(pad4(body.len() as u64)))
                .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "write link", &e))?;
            self.entry_size = 0;
            return Ok(0);
        }

        self.entry_size = filesize;
        Ok(filesize)
    }

    fn finish_entry(&mut self, sink: &mut ChainSink) -> Result<(), ArchiveError> {
        sink.write_zeros(pad4(self.entry_size))
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "write padding", &e))
    }

    fn finish(&mut self, sink: &mut ChainSink) -> Result<(), ArchiveError> {
        // Trailer record: zero metadata, the magic name, no body.
        let mut raw = [0u8; HEADER_LEN];
        raw[..6].copy_from_slice(NEWC_MAGIC);
        for i in 0..13 {
            let off = 6 + i * 8;
            let v = if i == 11 { TRAILER_NAME.len() as u32 + 1 } else { 0 };
            write_hex8(&mut raw[off..off + 8], v);
        }
        let io_err = |e: &std::io::Error| {
            ArchiveError::io(Status::Fatal, Stage::Format, "write trailer", e)
        };
        sink.write_all(&raw).map_err(|e| io_err(&e))?;
        sink.write_all(TRAILER_NAME.as_bytes()).map_err(|e| io_err(&e))?;
        sink.write_all(&[0]).map_err(|e| io_err(&e))?;
        sink.write_zeros(pad4(HEADER_LEN as u64 + TRAILER_NAME.len() as u64 + 1))
            .map_err(|e| io_err(&e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{IoSource, SinkWriter, SourceReader};
    use std::io::Cursor;

    fn write_archive(f: impl FnOnce(&mut CpioWriter, &mut ChainSink)) -> Vec<u8> {
        let captured = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        struct Capture(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);
        impl crate::stream::Sink for Capture {
            fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(b);
                Ok(b.len())
            }
        }
        let mut sink = ChainSink::new(Box::new(SinkWriter::new(Box::new(Capture(
            captured.clone(),
        )))));
        let mut w = CpioWriter::new();
        f(&mut w, &mut sink);
        w.finish(&mut sink).unwrap();
        sink.finish().unwrap();
        sink.close().unwrap();
        let out = captured.borrow().clone();
        out
    }

    fn source_over(bytes: Vec<u8>) -> ChainSource {
        ChainSource::new(Box::new(SourceReader::new(Box::new(IoSource(Cursor::new(
            bytes,
        ))))))
    }

    #[test]
    fn hex_helpers_round_trip() {
        let mut field = [0u8; 8];
        write_hex8(&mut field, 0xdead_beef);
        assert_eq!(&field, b"deadbeef");
        assert_eq!(parse_hex8(&field), Some(0xdead_beef));
        assert_eq!(parse_hex8(b"0000zzzz"), None);
    }

    #[test]
    fn alignment_math() {
        assert_eq!(pad4(0), 0);
        assert_eq!(pad4(1), 3);
        assert_eq!(pad4(4), 0);
        assert_eq!(pad4(110), 2);
    }

    #[test]
    fn round_trip_regular_entry() {
        let bytes = write_archive(|w, sink| {
            let mut e = Entry::regular("dir/a.txt", 5);
            e.set_mode(0o640).set_uid(7).set_gid(8).set_mtime(1_700_000_000, 0);
            assert_eq!(w.write_header(sink, &e).unwrap(), 5);
            sink.write_all(b"hello").unwrap();
            w.finish_entry(sink).unwrap();
        });
        assert!(probe(&bytes));

        let mut src = source_over(bytes);
        let mut r = CpioReader::new();
        let e = match r.next_entry(&mut src).unwrap() {
            FormatNext::Entry(e) => e,
            FormatNext::End => panic!("expected entry"),
        };
        assert_eq!(e.path(), "dir/a.txt");
        assert_eq!(e.size(), 5);
        assert_eq!(e.mode(), 0o640);
        assert_eq!(e.uid(), 7);

        let mut body = Vec::new();
        loop {
            let n = r.fill(&mut src).unwrap();
            if n == 0 {
                break;
            }
            let (_, chunk) = r.window_mut().take_chunk();
            body.extend_from_slice(chunk);
        }
        assert_eq!(body, b"hello");
        r.skip_rest(&mut src).unwrap();
        assert!(matches!(r.next_entry(&mut src).unwrap(), FormatNext::End));
    }

    #[test]
    fn symlink_target_folds_into_link_field() {
        let bytes = write_archive(|w, sink| {
            let e = Entry::symlink("link", "some/target");
            assert_eq!(w.write_header(sink, &e).unwrap(), 0);
            w.finish_entry(sink).unwrap();
        });

        let mut src = source_over(bytes);
        let mut r = CpioReader::new();
        let e = match r.next_entry(&mut src).unwrap() {
            FormatNext::Entry(e) => e,
            FormatNext::End => panic!("expected entry"),
        };
        assert_eq!(e.entry_type(), EntryType::Symlink);
        assert_eq!(e.link(), Some("some/target"));
        assert_eq!(e.size(), 0);
        r.skip_rest(&mut src).unwrap();
        assert!(matches!(r.next_entry(&mut src).unwrap(), FormatNext::End));
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut bytes = write_archive(|w, sink| {
            let e = Entry::regular("a", 0);
            w.write_header(sink, &e).unwrap();
            w.finish_entry(sink).unwrap();
        });
        bytes[0] = b'9';

        let mut src = source_over(bytes);
        let mut r = CpioReader::new();
        match r.next_entry(&mut src) {
            Err(e) => assert_eq!(e.status(), Status::Fatal),
            Ok(_) => panic!("expected out-of-sync error"),
        }
    }
}
