//! Read-side archive context.
//!
//! # Invariants
//! - State machine: `HeaderPending <-> BodyStreaming -> End -> Closed`, with
//!   `Fatal` absorbing from any state. Only `close` is legal after `Fatal`.
//! - At most one current entry; `next_header` first discards any unread
//!   remainder of the previous body.
//! - The format is locked at open and never re-probed; the variant half of
//!   its code may still change entry-to-entry.
//! - Zero-copy block offsets are strictly increasing with pairwise disjoint
//!   ranges, and total delivery never exceeds the declared entry size.
//!
//! # Algorithm
//! - Open probes filters innermost-first over a bounded peek window,
//!   re-peeking through each accepted stage (nested compression resolves up
//!   to `max_filter_chain` deep), then probes formats in configured order.
//!
//! # Design Notes
//! - Operations return `Result`; the context mirrors every outcome into
//!   `status()`/`last_error()` so the channel-style accessors stay valid.

use serde::{Deserialize, Serialize};

use crate::entry::Entry;
use crate::filter::{CompressionKind, FilterSpec};
use crate::format::{FormatCode, FormatNext, FormatReader, FormatSpec};
use crate::stats::ArchiveStats;
use crate::status::{ArchiveError, Stage, Status};
use crate::stream::{ChainRead, ChainSource, PeekRead, Source, SourceReader};

/// Read-side configuration.
///
/// Filters are probe candidates; `FilterSpec::None` need not be listed, the
/// identity stage is the implicit fallback. Formats are probed in order, so
/// `Empty` (which matches zero bytes) belongs last.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaderOptions {
    pub filters: Vec<FilterSpec>,
    pub formats: Vec<FormatSpec>,
    pub max_filter_chain: usize,
    pub probe_window: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            filters: vec![FilterSpec::Gzip, FilterSpec::Bzip2, FilterSpec::Compress],
            formats: FormatSpec::default_read_set(),
            max_filter_chain: 4,
            probe_window: 1024,
        }
    }
}

impl ReaderOptions {
    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.formats.is_empty() {
            return Err(ArchiveError::failed(Stage::State, "no formats configured"));
        }
        if self.max_filter_chain == 0 {
            return Err(ArchiveError::failed(Stage::State, "max_filter_chain must be >= 1"));
        }
        if self.probe_window < 512 {
            // tar probing needs a full header block.
            return Err(ArchiveError::failed(Stage::State, "probe_window must be >= 512"));
        }
        Ok(())
    }
}

/// Configures and opens an `ArchiveReader`.
pub struct ReaderBuilder {
    options: ReaderOptions,
}

impl ReaderBuilder {
    pub fn new() -> Self {
        Self {
            options: ReaderOptions::default(),
        }
    }

    pub fn with_options(options: ReaderOptions) -> Self {
        Self { options }
    }

    /// Replace the filter candidate set.
    pub fn filters(mut self, filters: Vec<FilterSpec>) -> Self {
        self.options.filters = filters;
        self
    }

    /// Replace the format candidate set (probed in the given order).
    pub fn formats(mut self, formats: Vec<FormatSpec>) -> Self {
        self.options.formats = formats;
        self
    }

    pub fn max_filter_chain(mut self, depth: usize) -> Self {
        self.options.max_filter_chain = depth;
        self
    }

    /// Resolve the filter chain and format over `src` and enter
    /// `HeaderPending`. The source is closed on every failure path.
    pub fn open(self, mut src: Box<dyn Source>) -> Result<ArchiveReader, ArchiveError> {
        self.options.validate()?;
        src.open()
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Stream, "open source", &e))?;

        // SourceReader owns the close-exactly-once contract from here on,
        // including the error paths below (via Drop).
        let mut chain: Box<dyn ChainRead> = Box::new(SourceReader::new(src));
        let mut applied: Vec<CompressionKind> = Vec::new();

        for _ in 0..self.options.max_filter_chain {
            let mut peek = PeekRead::with_capacity(chain, self.options.probe_window);
            peek.prefill()
                .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Filter, "probe stream", &e))?;
            let matched = self
                .options
                .filters
                .iter()
                .find(|f| f.matches(peek.peeked()))
                .cloned();
            match matched {
                Some(spec) => {
                    applied.push(spec.kind());
                    chain = spec.wrap_read(Box::new(peek)).map_err(|e| {
                        ArchiveError::io(Status::Fatal, Stage::Filter, "resolve filter", &e)
                    })?;
                }
                None => {
                    chain = Box::new(peek);
                    break;
                }
            }
        }

        let mut peek = PeekRead::with_capacity(chain, self.options.probe_window);
        peek.prefill()
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "probe stream", &e))?;
        let spec = self
            .options
            .formats
            .iter()
            .find(|f| f.probe(peek.peeked()))
            .ok_or_else(|| ArchiveError::failed(Stage::Format, "archive format not recognized"))?;
        let fmt = spec.new_reader();

        Ok(ArchiveReader {
            src: ChainSource::new(Box::new(peek)),
            fmt,
            filters: applied,
            state: ReadState::HeaderPending,
            entry: None,
            status: Status::Ok,
            last_error: None,
            stats: ArchiveStats::default(),
        })
    }
}

impl Default for ReaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadState {
    HeaderPending,
    BodyStreaming,
    End,
    Fatal,
    Closed,
}

/// One open read context: resolved filter chain, locked format, current
/// entry, position counters, and the status/error channel.
pub struct ArchiveReader {
    src: ChainSource,
    fmt: Box<dyn FormatReader>,
    filters: Vec<CompressionKind>,
    state: ReadState,
    entry: Option<Entry>,
    status: Status,
    last_error: Option<ArchiveError>,
    stats: ArchiveStats,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("filters", &self.filters)
            .field("state", &self.state)
            .field("status", &self.status)
            .field("last_error", &self.last_error)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ArchiveReader {
    /// Locked format code; the variant half may change entry-to-entry.
    pub fn format_code(&self) -> FormatCode {
        self.fmt.code()
    }

    /// Filter stages applied at open, outermost last.
    pub fn filters(&self) -> &[CompressionKind] {
        &self.filters
    }

    /// Raw source bytes consumed (compressed position).
    pub fn raw_pos(&self) -> u64 {
        self.src.raw_pos()
    }

    /// Bytes delivered by the filter chain (uncompressed position).
    pub fn uncompressed_pos(&self) -> u64 {
        self.src.uncompressed_pos()
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

    /// The entry between the last `next_header` and the next one.
    pub fn current_entry(&self) -> Option<&Entry> {
        self.entry.as_ref()
    }

    fn record(&mut self, e: ArchiveError) -> ArchiveError {
        self.status = e.status();
        if e.is_fatal() {
            self.state = ReadState::Fatal;
        }
        self.last_error = Some(e.clone());
        e
    }

    fn sticky_fatal(&self) -> ArchiveError {
        self.last_error
            .clone()
            .unwrap_or_else(|| ArchiveError::fatal(Stage::State, "context is fatal"))
    }

    fn collect_warning(&mut self) {
        if let Some(w) = self.fmt.take_warning() {
            self.stats.warnings += 1;
            self.status = w.status();
            self.last_error = Some(w);
        }
    }

    /// Advance to the next entry, discarding any unread body remainder.
    /// `Ok(None)` is end-of-archive.
    pub fn next_header(&mut self) -> Result<Option<&Entry>, ArchiveError> {
        match self.state {
            ReadState::Fatal => return Err(self.sticky_fatal()),
            ReadState::Closed => {
                return Err(self.record(ArchiveError::failed(Stage::State, "context is closed")))
            }
            ReadState::End => {
                self.status = Status::Eof;
                return Ok(None);
            }
            ReadState::HeaderPending | ReadState::BodyStreaming => {}
        }

        if self.state == ReadState::BodyStreaming {
            if let Err(e) = self.fmt.skip_rest(&mut self.src) {
                return Err(self.record(e));
            }
        }
        self.entry = None;

        match self.fmt.next_entry(&mut self.src) {
            Ok(FormatNext::Entry(e)) => {
                self.status = Status::Ok;
                self.last_error = None;
                self.collect_warning();
                self.stats.entries_read += 1;
                self.state = ReadState::BodyStreaming;
                self.entry = Some(e);
                Ok(self.entry.as_ref())
            }
            Ok(FormatNext::End) => {
                self.collect_warning();
                self.state = ReadState::End;
                self.status = Status::Eof;
                Ok(None)
            }
            Err(e) => {
                let e = self.record(e.with_path_of(self.entry.as_ref()));
                Err(e)
            }
        }
    }

    /// Copying body read; `Ok(0)` means the body is exhausted.
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<usize, ArchiveError> {
        match self.state {
            ReadState::Fatal => return Err(self.sticky_fatal()),
            ReadState::BodyStreaming => {}
            _ => {
                return Err(self.record(ArchiveError::failed(
                    Stage::State,
                    "read_data without a current entry",
                )))
            }
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self.fmt.window().available() == 0 {
            match self.fmt.fill(&mut self.src) {
                Ok(0) => return Ok(0),
                Ok(_) => {}
                Err(e) => {
                    let e = e.with_path_of(self.entry.as_ref());
                    return Err(self.record(e));
                }
            }
        }
        let n = {
            let w = self.fmt.window_mut();
            let n = w.available().min(buf.len());
            buf[..n].copy_from_slice(&w.chunk()[..n]);
            w.consume(n);
            n
        };
        self.stats.body_bytes_read += n as u64;
        Ok(n)
    }

    /// Zero-copy body read: the next block with its body offset. `None`
    /// means the body is exhausted.
    pub fn read_data_block(&mut self) -> Result<Option<(u64, &[u8])>, ArchiveError> {
        match self.state {
            ReadState::Fatal => return Err(self.sticky_fatal()),
            ReadState::BodyStreaming => {}
            _ => {
                return Err(self.record(ArchiveError::failed(
                    Stage::State,
                    "read_data_block without a current entry",
                )))
            }
        }
        if self.fmt.window().available() == 0 {
            match self.fmt.fill(&mut self.src) {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(e) => {
                    let e = e.with_path_of(self.entry.as_ref());
                    return Err(self.record(e));
                }
            }
        }
        self.stats.body_bytes_read += self.fmt.window().available() as u64;
        Ok(Some(self.fmt.window_mut().take_chunk()))
    }

    /// Discard the remainder of the current body without delivering it.
    pub fn skip_data(&mut self) -> Result<(), ArchiveError> {
        match self.state {
            ReadState::Fatal => return Err(self.sticky_fatal()),
            ReadState::BodyStreaming => {}
            _ => return Ok(()),
        }
        self.fmt
            .skip_rest(&mut self.src)
            .map_err(|e| self.record(e))?;
        self.state = ReadState::HeaderPending;
        Ok(())
    }

    /// Release the chain and the source. Legal from any state, including
    /// `Fatal`; a second call is a caller error.
    pub fn close(&mut self) -> Result<(), ArchiveError> {
        if self.state == ReadState::Closed {
            return Err(self.record(ArchiveError::failed(Stage::State, "context already closed")));
        }
        self.state = ReadState::Closed;
        self.entry = None;
        self.src
            .close()
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Stream, "close source", &e))
    }
}

trait WithEntryPath {
    fn with_path_of(self, entry: Option<&Entry>) -> Self;
}

impl WithEntryPath for ArchiveError {
    fn with_path_of(self, entry: Option<&Entry>) -> Self {
        match entry {
            Some(e) => self.with_path(e.path()),
            None => self,
        }
    }
}
