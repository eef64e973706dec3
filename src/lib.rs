//! Streaming archive read/write core with pluggable filters and formats.
//!
//! ## Scope
//! This crate gives uniform, streaming access to archive containers (tar,
//! cpio, zip, ar) layered beneath compression filters (gzip, bzip2, legacy
//! compress, external program), driven through caller-supplied `Source` and
//! `Sink` byte-stream capabilities. Nothing is seekable: every format and
//! filter works strictly forward.
//!
//! ## Key invariants
//! - A context holds at most one current entry; requesting the next header
//!   discards any unread body remainder.
//! - The container format is locked at open; only its variant may change
//!   from entry to entry.
//! - Declared entry size is the contract: readers deliver exactly that many
//!   bytes (truncating trailing padding), writers zero-fill shortfalls and
//!   reject excess without corrupting what was already written.
//! - `Fatal` poisons a context; only `close` remains legal, and the
//!   underlying stream cleanup runs exactly once on every exit path.
//!
//! ## Read flow
//! `Source -> filter probe chain (innermost first) -> format probe ->
//! next_header / read_data / read_data_block -> close`
//!
//! ## Write flow
//! `write_header -> write_data* -> finish_entry -> ... -> close` (format
//! trailer, then filter trailer, then sink release).
//!
//! ## Notable entry points
//! - `ReaderBuilder` / `ArchiveReader`: probing and streaming reads.
//! - `WriterBuilder` / `ArchiveWriter`: framed streaming writes.
//! - `Extractor` / `ExtractFlags`: materialize a stream onto a filesystem.
//! - `Entry`, `FormatCode`, `Status`, `ArchiveError`: the shared vocabulary.

pub mod entry;
pub mod extract;
pub mod filter;
pub mod format;
pub mod reader;
pub mod stats;
pub mod status;
pub mod stream;
pub mod writer;

pub use entry::{Entry, EntryType};
pub use extract::{ExtractFlags, Extractor};
pub use filter::{CompressionKind, FilterSpec, ProgramSpec};
pub use format::{FormatCode, FormatSpec};
pub use reader::{ArchiveReader, ReaderBuilder, ReaderOptions};
pub use stats::ArchiveStats;
pub use status::{ArchiveError, Stage, Status};
pub use stream::{Sink, Source};
pub use writer::{ArchiveWriter, WriterBuilder, WriterOptions};
