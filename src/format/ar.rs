//! ar format module (common/GNU/BSD flavors).
//!
//! # Invariants
//! - The 8-byte archive magic is consumed once, before the first member.
//! - Member data is padded to an even offset with a single newline; the pad
//!   byte is never part of the body.
//! - GNU `//` name tables and `/` symbol tables are metadata members,
//!   consumed inline and never surfaced as entries.
//!
//! # Design Notes
//! - BSD `#1/N` names ride at the front of the member body; the declared
//!   size includes them and the reader subtracts them back out.
//! - The writer emits GNU-style short names and falls back to the BSD form
//!   for names that do not fit the 16-byte field.

use memchr::memchr;

use crate::entry::{Entry, EntryType};
use crate::format::{
    fill_raw_body, skip_raw_body, BodyWindow, FormatCode, FormatNext, FormatReader, FormatWriter,
};
use crate::status::{ArchiveError, Stage, Status};
use crate::stream::{ChainSink, ChainSource};

pub const AR_MAGIC: &[u8; 8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;
const NAME_TABLE_CAP: u64 = 1024 * 1024;
const BODY_BUF: usize = 64 * 1024;

pub fn probe(peek: &[u8]) -> bool {
    peek.len() >= AR_MAGIC.len() && &peek[..AR_MAGIC.len()] == AR_MAGIC
}

/// Space-padded decimal; empty parses as 0.
fn parse_decimal_field(field: &[u8]) -> Option<u64> {
    let mut i = 0;
    while i < field.len() && field[i] == b' ' {
        i += 1;
    }
    let mut end = i;
    while end < field.len() && field[end].is_ascii_digit() {
        end += 1;
    }
    if end == i {
        return Some(0);
    }
    let mut v: u64 = 0;
    for &d in &field[i..end] {
        v = v.checked_mul(10)?.checked_add(u64::from(d - b'0'))?;
    }
    Some(v)
}

fn parse_octal_field(field: &[u8]) -> Option<u64> {
    let mut i = 0;
    while i < field.len() && field[i] == b' ' {
        i += 1;
    }
    let mut end = i;
    while end < field.len() && (b'0'..=b'7').contains(&field[end]) {
        end += 1;
    }
    if end == i {
        return Some(0);
    }
    let mut v: u64 = 0;
    for &d in &field[i..end] {
        v = v.checked_mul(8)?.checked_add(u64::from(d - b'0'))?;
    }
    Some(v)
}

fn trim_trailing_spaces(field: &[u8]) -> &[u8] {
    let mut end = field.len();
    while end > 0 && field[end - 1] == b' ' {
        end -= 1;
    }
    &field[..end]
}

pub struct ArReader {
    code: FormatCode,
    magic_read: bool,
    name_table: Vec<u8>,
    window: BodyWindow,
    remaining: u64,
    padding: u64,
    warning: Option<ArchiveError>,
}

impl ArReader {
    pub fn new() -> Self {
        Self {
            code: FormatCode::AR,
            magic_read: false,
            name_table: Vec::new(),
            window: BodyWindow::with_capacity(BODY_BUF),
            remaining: 0,
            padding: 0,
            warning: None,
        }
    }

    fn lookup_gnu_name(&self, offset: u64) -> Option<String> {
        let start = offset as usize;
        if start >= self.name_table.len() {
            return None;
        }
        let rest = &self.name_table[start..];
        let end = memchr(b'\n', rest).unwrap_or(rest.len());
        let mut name = &rest[..end];
        if name.last() == Some(&b'/') {
            name = &name[..name.len() - 1];
        }
        Some(String::from_utf8_lossy(name).into_owned())
    }
}

impl Default for ArReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatReader for ArReader {
    fn code(&self) -> FormatCode {
        self.code
    }

    fn next_entry(&mut self, src: &mut ChainSource) -> Result<FormatNext, ArchiveError> {
        debug_assert_eq!(self.remaining, 0, "body must be drained before next header");
        self.window.reset();

        if !self.magic_read {
            let mut magic = [0u8; 8];
            src.read_exact(&mut magic)
                .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read magic", &e))?;
            if &magic != AR_MAGIC {
                return Err(ArchiveError::fatal(Stage::Format, "bad ar magic"));
            }
            self.magic_read = true;
        }

        loop {
            let mut hdr = [0u8; HEADER_LEN];
            let got = src
                .read_exact_or_eof(&mut hdr)
                .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read header", &e))?;
            if !got {
                return Ok(FormatNext::End);
            }
            if &hdr[58..60] != b"`\n" {
                return Err(ArchiveError::fatal(Stage::Format, "ar stream out of sync"));
            }

            let name_field = trim_trailing_spaces(&hdr[0..16]);
            let mtime = parse_decimal_field(&hdr[16..28])
                .ok_or_else(|| ArchiveError::fatal(Stage::Format, "bad ar mtime"))?;
            let uid = parse_decimal_field(&hdr[28..34]).unwrap_or(0);
            let gid = parse_decimal_field(&hdr[34..40]).unwrap_or(0);
            let mode = parse_octal_field(&hdr[40..48]).unwrap_or(0o644);
            let size = parse_decimal_field(&hdr[48..58])
                .ok_or_else(|| ArchiveError::fatal(Stage::Format, "bad ar size"))?;
            let pad = size & 1;

            // GNU name table: keep it, surface nothing.
            if name_field == b"//" {
                if size > NAME_TABLE_CAP {
                    return Err(ArchiveError::fatal(Stage::Format, "ar name table too large"));
                }
                self.name_table = vec![0u8; size as usize];
                let mut table = std::mem::take(&mut self.name_table);
                src.read_exact(&mut table).map_err(|e| {
                    ArchiveError::io(Status::Fatal, Stage::Format, "read name table", &e)
                })?;
                self.name_table = table;
                src.skip_exact(pad).map_err(|e| {
                    ArchiveError::io(Status::Fatal, Stage::Format, "read name table", &e)
                })?;
                self.code = FormatCode::AR_GNU;
                continue;
            }

            // Symbol table (GNU "/", BSD "__.SYMDEF"): metadata, skip.
            if name_field == b"/" || name_field.starts_with(b"__.SYMDEF") {
                src.skip_exact(size + pad)
                    .map_err(|e| {
                        ArchiveError::io(Status::Fatal, Stage::Format, "skip symbol table", &e)
                    })?;
                continue;
            }

            let (name, body_size) = if let Some(rest) = name_field.strip_prefix(b"#1/") {
                // BSD: the real name leads the body.
                let namelen = parse_decimal_field(rest)
                    .filter(|&n| n > 0 && n <= size)
                    .ok_or_else(|| ArchiveError::fatal(Stage::Format, "bad ar bsd name"))?;
                let mut raw = vec![0u8; namelen as usize];
                src.read_exact(&mut raw).map_err(|e| {
                    ArchiveError::io(Status::Fatal, Stage::Format, "read name", &e)
                })?;
                let end = memchr(0, &raw).unwrap_or(raw.len());
                self.code = FormatCode::AR_BSD;
                (
                    String::from_utf8_lossy(&raw[..end]).into_owned(),
                    size - namelen,
                )
            } else if name_field.starts_with(b"/") && name_field.len() > 1 {
                // GNU reference into the name table.
                let offset = parse_decimal_field(&name_field[1..])
                    .ok_or_else(|| ArchiveError::fatal(Stage::Format, "bad ar name reference"))?;
                let name = self.lookup_gnu_name(offset).ok_or_else(|| {
                    ArchiveError::fatal(Stage::Format, "ar name reference out of range")
                })?;
                self.code = FormatCode::AR_GNU;
                (name, size)
            } else {
                let mut name = name_field;
                if name.last() == Some(&b'/') {
                    name = &name[..name.len() - 1];
                    self.code = FormatCode::AR_GNU;
                }
                (String::from_utf8_lossy(name).into_owned(), size)
            };

            let mut e = Entry::new(name, EntryType::Regular);
            e.set_size(body_size);
            e.set_mode(mode as u32);
            e.set_uid(uid);
            e.set_gid(gid);
            e.set_mtime(mtime as i64, 0);

            self.remaining = body_size;
            self.padding = pad;
            return Ok(FormatNext::Entry(e));
        }
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

pub struct ArWriter {
    code: FormatCode,
    magic_written: bool,
    member_size: u64,
}

impl ArWriter {
    pub fn new() -> Self {
        Self {
            code: FormatCode::AR_GNU,
            magic_written: false,
            member_size: 0,
        }
    }
}

impl Default for ArWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn put_field(hdr: &mut [u8], text: &str) {
    let bytes = text.as_bytes();
    debug_assert!(bytes.len() <= hdr.len());
    hdr[..bytes.len()].copy_from_slice(bytes);
}

impl FormatWriter for ArWriter {
    fn code(&self) -> FormatCode {
        self.code
    }

    fn write_header(&mut self, sink: &mut ChainSink, entry: &Entry) -> Result<u64, ArchiveError> {
        if entry.entry_type() != EntryType::Regular {
            return Err(
                ArchiveError::failed(Stage::Format, "ar archives hold regular files only")
                    .with_path(entry.path()),
            );
        }
        let io_err =
            |e: &std::io::Error| ArchiveError::io(Status::Fatal, Stage::Format, "write header", e);

        if !self.magic_written {
            sink.write_all(AR_MAGIC).map_err(|e| io_err(&e))?;
            self.magic_written = true;
        }

        let name = entry.path();
        let bsd_name = if name.len() + 1 > 16 { Some(name) } else { None };
        let declared = match bsd_name {
            Some(n) => entry.size() + n.len() as u64,
            None => entry.size(),
        };
        if declared > 9_999_999_999 {
            return Err(ArchiveError::failed(Stage::Format, "entry too large for ar")
                .with_path(entry.path()));
        }

        let mut hdr = [b' '; HEADER_LEN];
        match bsd_name {
            Some(n) => put_field(&mut hdr[0..16], &format!("#1/{}", n.len())),
            None => put_field(&mut hdr[0..16], &format!("{name}/")),
        }
        put_field(&mut hdr[16..28], &format!("{}", entry.mtime().max(0)));
        put_field(&mut hdr[28..34], &format!("{}", entry.uid().min(999_999)));
        put_field(&mut hdr[34..40], &format!("{}", entry.gid().min(999_999)));
        put_field(&mut hdr[40..48], &format!("{:o}", entry.mode() & 0o7777));
        put_field(&mut hdr[48..58], &format!("{declared}"));
        hdr[58] = b'`';
        hdr[59] = b'\n';
        sink.write_all(&hdr).map_err(|e| io_err(&e))?;

        if let Some(n) = bsd_name {
            sink.write_all(n.as_bytes()).map_err(|e| io_err(&e))?;
            self.code = FormatCode::AR_BSD;
        }

        self.member_size = declared;
        Ok(entry.size())
    }

    fn finish_entry(&mut self, sink: &mut ChainSink) -> Result<(), ArchiveError> {
        if self.member_size & 1 == 1 {
            sink.write_all(b"\n").map_err(|e| {
                ArchiveError::io(Status::Fatal, Stage::Format, "write padding", &e)
            })?;
        }
        Ok(())
    }

    fn finish(&mut self, _sink: &mut ChainSink) -> Result<(), ArchiveError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{IoSource, SinkWriter, SourceReader};
    use std::io::Cursor;

    fn write_archive(f: impl FnOnce(&mut ArWriter, &mut ChainSink)) -> Vec<u8> {
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
        let mut w = ArWriter::new();
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

    fn read_body(r: &mut ArReader, src: &mut ChainSource) -> Vec<u8> {
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

    #[test]
    fn field_parsers() {
        assert_eq!(parse_decimal_field(b"  1234  "), Some(1234));
        assert_eq!(parse_decimal_field(b"      "), Some(0));
        assert_eq!(parse_octal_field(b"644     "), Some(0o644));
    }

    #[test]
    fn round_trip_short_and_odd_sized_members() {
        let bytes = write_archive(|w, sink| {
            let mut e = Entry::regular("hello.o", 5);
            e.set_mode(0o644).set_mtime(1_700_000_000, 0);
            assert_eq!(w.write_header(sink, &e).unwrap(), 5);
            sink.write_all(b"hello").unwrap();
            w.finish_entry(sink).unwrap();

            let e2 = Entry::regular("b.o", 2);
            w.write_header(sink, &e2).unwrap();
            sink.write_all(b"ok").unwrap();
            w.finish_entry(sink).unwrap();
        });
        assert!(probe(&bytes));
        // Odd member plus pad newline keeps members even-aligned.
        assert_eq!(bytes.len() % 2, 0);

        let mut src = source_over(bytes);
        let mut r = ArReader::new();
        let e = match r.next_entry(&mut src).unwrap() {
            FormatNext::Entry(e) => e,
            FormatNext::End => panic!("expected entry"),
        };
        assert_eq!(e.path(), "hello.o");
        assert_eq!(e.size(), 5);
        assert_eq!(read_body(&mut r, &mut src), b"hello");

        let e2 = match r.next_entry(&mut src).unwrap() {
            FormatNext::Entry(e) => e,
            FormatNext::End => panic!("expected second entry"),
        };
        assert_eq!(e2.path(), "b.o");
        assert_eq!(read_body(&mut r, &mut src), b"ok");
        assert!(matches!(r.next_entry(&mut src).unwrap(), FormatNext::End));
    }

    #[test]
    fn long_name_round_trips_via_bsd_form() {
        let name = "a-rather-long-object-file-name.o";
        let bytes = write_archive(|w, sink| {
            let e = Entry::regular(name, 4);
            assert_eq!(w.write_header(sink, &e).unwrap(), 4);
            assert_eq!(w.code(), FormatCode::AR_BSD);
            sink.write_all(b"data").unwrap();
            w.finish_entry(sink).unwrap();
        });

        let mut src = source_over(bytes);
        let mut r = ArReader::new();
        let e = match r.next_entry(&mut src).unwrap() {
            FormatNext::Entry(e) => e,
            FormatNext::End => panic!("expected entry"),
        };
        assert_eq!(e.path(), name);
        assert_eq!(e.size(), 4);
        assert_eq!(r.code(), FormatCode::AR_BSD);
        assert_eq!(read_body(&mut r, &mut src), b"data");
    }

    #[test]
    fn gnu_name_table_resolves_references() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(AR_MAGIC);
        let table = b"first-long-name.o/\nsecond-long-name.o/\n";
        let mut hdr = [b' '; HEADER_LEN];
        put_field(&mut hdr[0..16], "//");
        put_field(&mut hdr[48..58], &format!("{}", table.len()));
        hdr[58] = b'`';
        hdr[59] = b'\n';
        bytes.extend_from_slice(&hdr);
        bytes.extend_from_slice(table);
        if table.len() % 2 == 1 {
            bytes.push(b'\n');
        }

        let mut hdr2 = [b' '; HEADER_LEN];
        put_field(&mut hdr2[0..16], "/19");
        put_field(&mut hdr2[48..58], "2");
        hdr2[58] = b'`';
        hdr2[59] = b'\n';
        bytes.extend_from_slice(&hdr2);
        bytes.extend_from_slice(b"hi");

        let mut src = source_over(bytes);
        let mut r = ArReader::new();
        let e = match r.next_entry(&mut src).unwrap() {
            FormatNext::Entry(e) => e,
            FormatNext::End => panic!("expected entry"),
        };
        assert_eq!(e.path(), "second-long-name.o");
        assert_eq!(r.code(), FormatCode::AR_GNU);
        assert_eq!(read_body(&mut r, &mut src), b"hi");
    }

    #[test]
    fn rejects_non_regular_entries() {
        let captured = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        struct Capture(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);
        impl crate::stream::Sink for Capture {
            fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(b);
                Ok(b.len())
            }
        }
        let mut sink = ChainSink::new(Box::new(SinkWriter::new(Box::new(Capture(captured)))));
        let mut w = ArWriter::new();
        let err = w
            .write_header(&mut sink, &Entry::directory("d"))
            .expect_err("directories cannot enter ar");
        assert_eq!(err.status(), Status::Failed);
    }
}
