//! Write-side archive context.
//!
//! # Invariants
//! - State machine: `EntryPending <-> EntryOpen -> Closed`, with `Fatal`
//!   absorbing. A new header is rejected while an entry is open.
//! - Body bytes never exceed the size declared by the header; an oversized
//!   `write_data` call is rejected whole, writing nothing.
//! - `finish_entry` zero-fills the gap between bytes written and bytes
//!   declared, then emits the format's alignment padding.
//! - `close` finishes any open entry, writes the end-of-archive marker,
//!   flushes filter trailers inward, and releases the sink exactly once.

use serde::{Deserialize, Serialize};

use crate::entry::Entry;
use crate::filter::{CompressionKind, FilterSpec};
use crate::format::{FormatCode, FormatSpec, FormatWriter};
use crate::stats::ArchiveStats;
use crate::status::{ArchiveError, Stage, Status};
use crate::stream::{ChainSink, ChainWrite, Sink, SinkWriter};

/// Write-side configuration: exactly one format, at most one filter stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriterOptions {
    pub format: FormatSpec,
    pub filter: FilterSpec,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            format: FormatSpec::Tar,
            filter: FilterSpec::None,
        }
    }
}

/// Configures and opens an `ArchiveWriter`.
pub struct WriterBuilder {
    options: WriterOptions,
}

impl WriterBuilder {
    pub fn new(format: FormatSpec) -> Self {
        Self {
            options: WriterOptions {
                format,
                filter: FilterSpec::None,
            },
        }
    }

    pub fn with_options(options: WriterOptions) -> Self {
        Self { options }
    }

    pub fn filter(mut self, filter: FilterSpec) -> Self {
        self.options.filter = filter;
        self
    }

    /// Build the chain over `sink` and enter `EntryPending`.
    pub fn open(self, mut sink: Box<dyn Sink>) -> Result<ArchiveWriter, ArchiveError> {
        // Unsupported write formats fail before the sink is touched.
        let fmt = self.options.format.new_writer()?;

        sink.open()
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Stream, "open sink", &e))?;
        let base: Box<dyn ChainWrite> = Box::new(SinkWriter::new(sink));
        let chain = self
            .options
            .filter
            .wrap_write(base)
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Filter, "resolve filter", &e))?;

        Ok(ArchiveWriter {
            sink: ChainSink::new(chain),
            fmt,
            filter: self.options.filter.kind(),
            state: WriteState::EntryPending,
            declared: 0,
            written: 0,
            status: Status::Ok,
            last_error: None,
            stats: ArchiveStats::default(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteState {
    EntryPending,
    EntryOpen,
    Fatal,
    Closed,
}

/// One open write context: format writer, optional filter stage, and the
/// declared-size accounting for the entry in flight.
pub struct ArchiveWriter {
    sink: ChainSink,
    fmt: Box<dyn FormatWriter>,
    filter: CompressionKind,
    state: WriteState,
    declared: u64,
    written: u64,
    status: Status,
    last_error: Option<ArchiveError>,
    stats: ArchiveStats,
}

impl std::fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("filter", &self.filter)
            .field("state", &self.state)
            .field("declared", &self.declared)
            .field("written", &self.written)
            .field("status", &self.status)
            .field("last_error", &self.last_error)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ArchiveWriter {
    pub fn format_code(&self) -> FormatCode {
        self.fmt.code()
    }

    pub fn filter(&self) -> CompressionKind {
        self.filter
    }

    /// Raw bytes handed to the sink (compressed position).
    pub fn raw_pos(&self) -> u64 {
        self.sink.raw_pos()
    }

    /// Bytes accepted ahead of the filter stage (uncompressed position).
    pub fn uncompressed_pos(&self) -> u64 {
        self.sink.uncompressed_pos()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn last_error(&self) -> Option<&ArchiveError> {
        self.last_error.as_ref()
    }

    pub fn stats(&self) -> &ArchiveStats {
        &self.stats
    }

    fn record(&mut self, e: ArchiveError) -> ArchiveError {
        self.status = e.status();
        if e.is_fatal() {
            self.state = WriteState::Fatal;
        }
        self.last_error = Some(e.clone());
        e
    }

    fn sticky_fatal(&self) -> ArchiveError {
        self.last_error
            .clone()
            .unwrap_or_else(|| ArchiveError::fatal(Stage::State, "context is fatal"))
    }

    /// Emit the header record for `entry` and open its body. The format
    /// decides how many body bytes the header commits the caller to; a
    /// format may fold small payloads (symlink targets) into the record
    /// itself and return 0.
    pub fn write_header(&mut self, entry: &Entry) -> Result<(), ArchiveError> {
        match self.state {
            WriteState::Fatal => return Err(self.sticky_fatal()),
            WriteState::Closed => {
                return Err(self.record(ArchiveError::failed(Stage::State, "context is closed")))
            }
            WriteState::EntryOpen => {
                return Err(self.record(
                    ArchiveError::failed(Stage::State, "previous entry not finished")
                        .with_path(entry.path()),
                ))
            }
            WriteState::EntryPending => {}
        }
        match self.fmt.write_header(&mut self.sink, entry) {
            Ok(declared) => {
                self.status = Status::Ok;
                self.last_error = None;
                self.declared = declared;
                self.written = 0;
                self.state = WriteState::EntryOpen;
                self.stats.entries_written += 1;
                Ok(())
            }
            Err(e) => Err(self.record(e.with_path(entry.path()))),
        }
    }

    /// Append body bytes to the open entry. A call that would overrun the
    /// declared size is rejected whole; nothing from it reaches the sink.
    pub fn write_data(&mut self, buf: &[u8]) -> Result<usize, ArchiveError> {
        match self.state {
            WriteState::Fatal => return Err(self.sticky_fatal()),
            WriteState::EntryOpen => {}
            _ => {
                return Err(self.record(ArchiveError::failed(
                    Stage::State,
                    "write_data without an open entry",
                )))
            }
        }
        let remaining = self.declared - self.written;
        if buf.len() as u64 > remaining {
            return Err(self.record(ArchiveError::failed(
                Stage::State,
                format!(
                    "write of {} bytes exceeds the {} remaining in the declared size",
                    buf.len(),
                    remaining
                ),
            )));
        }
        self.sink.write_all(buf).map_err(|e| {
            let e = ArchiveError::io(Status::Fatal, Stage::Stream, "write body", &e);
            self.record(e)
        })?;
        self.written += buf.len() as u64;
        self.stats.body_bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    /// Close the open entry: zero-fill any shortfall against the declared
    /// size, then write the format's padding.
    pub fn finish_entry(&mut self) -> Result<(), ArchiveError> {
        match self.state {
            WriteState::Fatal => return Err(self.sticky_fatal()),
            WriteState::EntryOpen => {}
            _ => {
                return Err(self.record(ArchiveError::failed(
                    Stage::State,
                    "finish_entry without an open entry",
                )))
            }
        }
        let gap = self.declared - self.written;
        if gap > 0 {
            self.sink.write_zeros(gap).map_err(|e| {
                let e = ArchiveError::io(Status::Fatal, Stage::Stream, "pad body", &e);
                self.record(e)
            })?;
            self.written = self.declared;
        }
        self.fmt
            .finish_entry(&mut self.sink)
            .map_err(|e| self.record(e))?;
        self.state = WriteState::EntryPending;
        Ok(())
    }

    /// Finalize the archive and release the sink. An entry still open is
    /// finished first. Legal from `Fatal`, where only the release happens.
    pub fn close(&mut self) -> Result<(), ArchiveError> {
        match self.state {
            WriteState::Closed => {
                return Err(self.record(ArchiveError::failed(Stage::State, "context already closed")))
            }
            WriteState::Fatal => {
                self.state = WriteState::Closed;
                return self.sink.close().map_err(|e| {
                    ArchiveError::io(Status::Fatal, Stage::Stream, "close sink", &e)
                });
            }
            WriteState::EntryOpen => self.finish_entry()?,
            WriteState::EntryPending => {}
        }
        self.state = WriteState::Closed;
        self.fmt.finish(&mut self.sink).map_err(|e| self.record(e))?;
        self.sink
            .finish()
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Filter, "finish filter", &e))?;
        self.sink
            .close()
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Stream, "close sink", &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ReaderBuilder;
    use crate::stream::IoSource;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    struct Capture(Rc<RefCell<Vec<u8>>>);

    impl Sink for Capture {
        fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(b);
            Ok(b.len())
        }
    }

    fn shared_sink() -> (Rc<RefCell<Vec<u8>>>, Box<dyn Sink>) {
        let buf = Rc::new(RefCell::new(Vec::new()));
        (buf.clone(), Box::new(Capture(buf)))
    }

    #[test]
    fn tar_archive_round_trips_through_reader() {
        let (buf, sink) = shared_sink();
        let mut w = WriterBuilder::new(FormatSpec::Tar).open(sink).unwrap();
        w.write_header(&Entry::regular("a.txt", 5)).unwrap();
        w.write_data(b"hel").unwrap();
        w.write_data(b"lo").unwrap();
        w.finish_entry().unwrap();
        w.close().unwrap();
        assert_eq!(w.stats().entries_written, 1);
        assert_eq!(w.stats().body_bytes_written, 5);

        let bytes = buf.borrow().clone();
        // Header + padded body + two terminator blocks.
        assert_eq!(bytes.len(), 512 * 4);
        let mut r = ReaderBuilder::new()
            .open(Box::new(IoSource(Cursor::new(bytes))))
            .unwrap();
        let e = r.next_header().unwrap().expect("entry");
        assert_eq!(e.path(), "a.txt");
        assert_eq!(e.size(), 5);
        let mut body = [0u8; 8];
        let n = r.read_data(&mut body).unwrap();
        assert_eq!(&body[..n], b"hello");
        assert!(r.next_header().unwrap().is_none());
        r.close().unwrap();
    }

    #[test]
    fn excess_write_is_rejected_whole() {
        let (buf, sink) = shared_sink();
        let mut w = WriterBuilder::new(FormatSpec::Tar).open(sink).unwrap();
        w.write_header(&Entry::regular("a.txt", 4)).unwrap();
        w.write_data(b"ab").unwrap();
        let raw_before = buf.borrow().len();
        let err = w.write_data(b"cde").expect_err("3 bytes into a 2 byte gap");
        assert_eq!(err.status(), Status::Failed);
        // Nothing from the rejected call reached the sink.
        assert_eq!(buf.borrow().len(), raw_before);
        // The entry is still writable up to the declared size.
        w.write_data(b"cd").unwrap();
        w.finish_entry().unwrap();
        w.close().unwrap();
    }

    #[test]
    fn short_entry_is_zero_padded_to_declared_size() {
        let (buf, sink) = shared_sink();
        let mut w = WriterBuilder::new(FormatSpec::Tar).open(sink).unwrap();
        w.write_header(&Entry::regular("a.bin", 10)).unwrap();
        w.write_data(b"xy").unwrap();
        w.finish_entry().unwrap();
        w.close().unwrap();

        let mut r = ReaderBuilder::new()
            .open(Box::new(IoSource(Cursor::new(buf.borrow().clone()))))
            .unwrap();
        r.next_header().unwrap().expect("entry");
        let mut body = Vec::new();
        let mut chunk = [0u8; 16];
        loop {
            let n = r.read_data(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(body, b"xy\0\0\0\0\0\0\0\0");
        r.close().unwrap();
    }

    #[test]
    fn header_while_entry_open_is_rejected() {
        let (_, sink) = shared_sink();
        let mut w = WriterBuilder::new(FormatSpec::Tar).open(sink).unwrap();
        w.write_header(&Entry::regular("a", 1)).unwrap();
        let err = w
            .write_header(&Entry::regular("b", 1))
            .expect_err("entry still open");
        assert_eq!(err.status(), Status::Failed);
        // The open entry survives the misuse.
        w.write_data(b"x").unwrap();
        w.finish_entry().unwrap();
        w.close().unwrap();
    }

    #[test]
    fn close_finishes_an_open_entry() {
        let (buf, sink) = shared_sink();
        let mut w = WriterBuilder::new(FormatSpec::Tar).open(sink).unwrap();
        w.write_header(&Entry::regular("a.txt", 3)).unwrap();
        w.write_data(b"a").unwrap();
        w.close().unwrap();

        let mut r = ReaderBuilder::new()
            .open(Box::new(IoSource(Cursor::new(buf.borrow().clone()))))
            .unwrap();
        let e = r.next_header().unwrap().expect("entry");
        assert_eq!(e.size(), 3);
        assert!(r.next_header().unwrap().is_none());
        r.close().unwrap();
    }

    #[test]
    fn gzip_filter_produces_a_gzip_member() {
        let (buf, sink) = shared_sink();
        let mut w = WriterBuilder::new(FormatSpec::Cpio)
            .filter(FilterSpec::Gzip)
            .open(sink)
            .unwrap();
        w.write_header(&Entry::regular("a.txt", 5)).unwrap();
        w.write_data(b"hello").unwrap();
        w.finish_entry().unwrap();
        w.close().unwrap();

        let bytes = buf.borrow().clone();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        assert!(w.raw_pos() == bytes.len() as u64);
        assert!(w.uncompressed_pos() > 0);

        let mut r = ReaderBuilder::new()
            .open(Box::new(IoSource(Cursor::new(bytes))))
            .unwrap();
        assert_eq!(r.filters(), &[CompressionKind::Gzip]);
        assert_eq!(r.format_code(), FormatCode::CPIO_NEWC);
        let e = r.next_header().unwrap().expect("entry");
        assert_eq!(e.path(), "a.txt");
        r.close().unwrap();
    }

    #[test]
    fn unsupported_write_format_fails_before_open() {
        let (buf, sink) = shared_sink();
        let err = WriterBuilder::new(FormatSpec::Zip)
            .open(sink)
            .expect_err("zip writing unsupported");
        assert_eq!(err.status(), Status::Failed);
        assert!(buf.borrow().is_empty());
    }

    #[test]
    fn double_close_is_an_error() {
        let (_, sink) = shared_sink();
        let mut w = WriterBuilder::new(FormatSpec::Tar).open(sink).unwrap();
        w.close().unwrap();
        assert_eq!(w.close().expect_err("second close").status(), Status::Failed);
    }
}
