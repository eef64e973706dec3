//! Compression filter stages and chain resolution.
//!
//! # Invariants
//! - A stage exclusively owns the stream it wraps; the chain as a whole owns
//!   the stage sequence.
//! - A stage never exposes more bytes than its inner stream produced; it may
//!   buffer but must not fabricate bytes.
//! - Probing is non-destructive: it operates on the peek window only.
//!
//! # Design Notes
//! - Filters are probed innermost-first against the raw source; the identity
//!   (no compression) stage is the implicit fallback when nothing matches.
//! - Chains may nest (e.g. a recompressed stream); resolution loops until no
//!   candidate matches, bounded by `max_filter_chain`.

pub mod bzip2;
pub mod compress;
pub mod gzip;
#[cfg(unix)]
pub mod program;

use std::io;

use serde::{Deserialize, Serialize};

use crate::stream::{ChainRead, ChainWrite};

/// Compression identifier, stable across the public surface.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionKind {
    None = 0,
    Gzip = 1,
    Bzip2 = 2,
    Compress = 3,
    Program = 4,
}

/// External filter program description.
///
/// On the read side the stage only bids when `magic` is non-empty and the
/// stream starts with it; the write side is explicitly configured so no
/// probing is involved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    pub command: String,
    pub args: Vec<String>,
    pub magic: Vec<u8>,
}

/// A configured filter stage candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterSpec {
    None,
    Gzip,
    Bzip2,
    Compress,
    Program(ProgramSpec),
}

impl FilterSpec {
    pub fn kind(&self) -> CompressionKind {
        match self {
            FilterSpec::None => CompressionKind::None,
            FilterSpec::Gzip => CompressionKind::Gzip,
            FilterSpec::Bzip2 => CompressionKind::Bzip2,
            FilterSpec::Compress => CompressionKind::Compress,
            FilterSpec::Program(_) => CompressionKind::Program,
        }
    }

    /// Probe the peek window. Identity never matches (it is the fallback).
    pub fn matches(&self, peek: &[u8]) -> bool {
        match self {
            FilterSpec::None => false,
            FilterSpec::Gzip => gzip::is_gzip_magic(peek),
            FilterSpec::Bzip2 => bzip2::is_bzip2_magic(peek),
            FilterSpec::Compress => compress::is_compress_magic(peek),
            FilterSpec::Program(spec) => {
                !spec.magic.is_empty() && peek.starts_with(&spec.magic)
            }
        }
    }

    /// Wrap an inner read stream with this stage's decoder.
    pub fn wrap_read(&self, inner: Box<dyn ChainRead>) -> io::Result<Box<dyn ChainRead>> {
        match self {
            FilterSpec::None => Ok(inner),
            FilterSpec::Gzip => Ok(Box::new(gzip::GzipReadFilter::new(inner))),
            FilterSpec::Bzip2 => Ok(Box::new(bzip2::Bzip2ReadFilter::new(inner))),
            FilterSpec::Compress => Ok(Box::new(compress::CompressReadFilter::new(inner))),
            FilterSpec::Program(spec) => {
                #[cfg(unix)]
                {
                    Ok(Box::new(program::ProgramReadFilter::spawn(spec, inner)?))
                }
                #[cfg(not(unix))]
                {
                    let _ = spec;
                    Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "external filter programs require unix",
                    ))
                }
            }
        }
    }

    /// Wrap an inner write stream with this stage's encoder.
    pub fn wrap_write(&self, inner: Box<dyn ChainWrite>) -> io::Result<Box<dyn ChainWrite>> {
        match self {
            FilterSpec::None => Ok(inner),
            FilterSpec::Gzip => Ok(Box::new(gzip::GzipWriteFilter::new(inner))),
            FilterSpec::Bzip2 => Ok(Box::new(bzip2::Bzip2WriteFilter::new(inner))),
            FilterSpec::Compress => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "legacy compress is read-only",
            )),
            FilterSpec::Program(spec) => {
                #[cfg(unix)]
                {
                    Ok(Box::new(program::ProgramWriteFilter::spawn(spec, inner)?))
                }
                #[cfg(not(unix))]
                {
                    let _ = spec;
                    Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "external filter programs require unix",
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_recognizes_known_magics() {
        let gz = FilterSpec::Gzip;
        let bz = FilterSpec::Bzip2;
        let z = FilterSpec::Compress;
        assert!(gz.matches(&[0x1f, 0x8b, 0x08]));
        assert!(!gz.matches(&[0x1f, 0x9d]));
        assert!(bz.matches(b"BZh9xxxx"));
        assert!(!bz.matches(b"BZx9"));
        assert!(z.matches(&[0x1f, 0x9d, 0x90]));
        assert!(!FilterSpec::None.matches(&[0x1f, 0x8b]));
    }

    #[test]
    fn program_bids_only_with_magic_prefix() {
        let spec = FilterSpec::Program(ProgramSpec {
            command: "zcat".into(),
            args: vec![],
            magic: vec![0x1f, 0x9d],
        });
        assert!(spec.matches(&[0x1f, 0x9d, 0x00]));
        assert!(!spec.matches(&[0x1f, 0x8b]));

        let blind = FilterSpec::Program(ProgramSpec {
            command: "cat".into(),
            args: vec![],
            magic: vec![],
        });
        assert!(!blind.matches(b"anything"));
    }
}
