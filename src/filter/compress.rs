//! Legacy compress (.Z) read filter.
//!
//! # Invariants
//! - Codes are read LSB-first at the current width (9..=maxbits).
//! - Width changes and CLEAR resets skip to the next 8-code group boundary,
//!   matching the historical compress(1) encoder's output padding.
//! - The table never exceeds `1 << maxbits` entries; codes beyond the next
//!   free slot (other than the KwKwK case) are corrupt input.
//!
//! # Design Notes
//! - Read-only: nothing in the corpus writes .Z, and neither do we.
//! - Output for one code is materialized in reverse into `pending` and then
//!   served to callers; the buffer is bounded by the table size.

use std::io::{self, Read};

use crate::stream::{ChainRead, read_some};

/// compress magic bytes.
pub const COMPRESS_MAGIC: [u8; 2] = [0x1f, 0x9d];

const BIT_MASK: u8 = 0x1f;
const BLOCK_MODE: u8 = 0x80;
const INIT_WIDTH: u32 = 9;
const CLEAR_CODE: u16 = 256;

#[inline(always)]
pub fn is_compress_magic(header: &[u8]) -> bool {
    header.len() >= 2 && header[0] == COMPRESS_MAGIC[0] && header[1] == COMPRESS_MAGIC[1]
}

pub struct CompressReadFilter {
    inner: Box<dyn ChainRead>,

    inbuf: [u8; 512],
    inpos: usize,
    inlen: usize,
    in_eof: bool,

    bitbuf: u64,
    nbits: u32,
    posbits: u64,

    header_done: bool,
    maxbits: u32,
    block_mode: bool,

    width: u32,
    next: usize,
    prev: Option<u16>,
    first_byte: u8,
    prefix: Vec<u16>,
    suffix: Vec<u8>,

    pending: Vec<u8>,
    pend_pos: usize,
    done: bool,
}

impl CompressReadFilter {
    pub fn new(inner: Box<dyn ChainRead>) -> Self {
        Self {
            inner,
            inbuf: [0; 512],
            inpos: 0,
            inlen: 0,
            in_eof: false,
            bitbuf: 0,
            nbits: 0,
            posbits: 0,
            header_done: false,
            maxbits: 16,
            block_mode: true,
            width: INIT_WIDTH,
            next: 0,
            prev: None,
            first_byte: 0,
            prefix: Vec::new(),
            suffix: Vec::new(),
            pending: Vec::new(),
            pend_pos: 0,
            done: false,
        }
    }

    fn fill_input(&mut self) -> io::Result<usize> {
        if self.inpos < self.inlen {
            return Ok(self.inlen - self.inpos);
        }
        if self.in_eof {
            return Ok(0);
        }
        let n = read_some(&mut self.inner, &mut self.inbuf)?;
        if n == 0 {
            self.in_eof = true;
        }
        self.inpos = 0;
        self.inlen = n;
        Ok(n)
    }

    fn parse_header(&mut self) -> io::Result<()> {
        let mut hdr = [0u8; 3];
        let mut off = 0;
        while off < 3 {
            if self.fill_input()? == 0 {
                return Err(corrupt("truncated compress header"));
            }
            let take = (self.inlen - self.inpos).min(3 - off);
            hdr[off..off + take].copy_from_slice(&self.inbuf[self.inpos..self.inpos + take]);
            self.inpos += take;
            off += take;
        }
        if !is_compress_magic(&hdr) {
            return Err(corrupt("bad compress magic"));
        }
        self.maxbits = u32::from(hdr[2] & BIT_MASK);
        if !(INIT_WIDTH..=16).contains(&self.maxbits) {
            return Err(corrupt("unsupported compress maxbits"));
        }
        self.block_mode = hdr[2] & BLOCK_MODE != 0;
        let table = 1usize << self.maxbits;
        self.prefix = vec![0u16; table];
        self.suffix = vec![0u8; table];
        self.next = if self.block_mode { 257 } else { 256 };
        self.width = INIT_WIDTH;
        self.header_done = true;
        Ok(())
    }

    /// Read the next code, or None at clean end of stream.
    fn read_code(&mut self) -> io::Result<Option<u16>> {
        while self.nbits < self.width {
            if self.fill_input()? == 0 {
                // Trailing partial code is encoder padding, not data.
                return Ok(None);
            }
            self.bitbuf |= u64::from(self.inbuf[self.inpos]) << self.nbits;
            self.inpos += 1;
            self.nbits += 8;
        }
        let code = (self.bitbuf & ((1u64 << self.width) - 1)) as u16;
        self.bitbuf >>= self.width;
        self.nbits -= self.width;
        self.posbits += u64::from(self.width);
        Ok(Some(code))
    }

    /// Discard input up to the next 8-code group boundary at current width.
    fn align_group(&mut self) -> io::Result<()> {
        let group = u64::from(self.width) * 8;
        let rem = self.posbits % group;
        if rem == 0 {
            return Ok(());
        }
        let mut skip = group - rem;
        while skip > 0 {
            if self.nbits == 0 {
                if self.fill_input()? == 0 {
                    // Group padding can be cut short at EOF.
                    self.posbits += skip;
                    return Ok(());
                }
                self.bitbuf |= u64::from(self.inbuf[self.inpos]) << self.nbits;
                self.inpos += 1;
                self.nbits += 8;
            }
            let step = skip.min(u64::from(self.nbits)) as u32;
            self.bitbuf >>= step;
            self.nbits -= step;
            self.posbits += u64::from(step);
            skip -= u64::from(step);
        }
        Ok(())
    }

    /// Decode one code into `pending`. Returns false at end of stream.
    fn step(&mut self) -> io::Result<bool> {
        if !self.header_done {
            self.parse_header()?;
        }

        // Grow the code width once the next free slot needs it.
        if self.width < self.maxbits && self.next > ((1usize << self.width) - 1) {
            self.align_group()?;
            self.width += 1;
        }

        let code = match self.read_code()? {
            Some(c) => c,
            None => return Ok(false),
        };

        if self.block_mode && code == CLEAR_CODE {
            self.align_group()?;
            self.width = INIT_WIDTH;
            self.next = 257;
            self.prev = None;
            return Ok(true);
        }

        self.pending.clear();
        self.pend_pos = 0;

        let mut cur = code;
        if usize::from(code) >= self.next {
            // KwKwK: only valid for exactly the next free code.
            let prev = match self.prev {
                Some(p) if usize::from(code) == self.next => p,
                _ => return Err(corrupt("compress code out of range")),
            };
            self.pending.push(self.first_byte);
            cur = prev;
        }

        while usize::from(cur) >= 256 {
            if self.block_mode && cur == CLEAR_CODE {
                return Err(corrupt("compress chain through clear code"));
            }
            self.pending.push(self.suffix[usize::from(cur)]);
            cur = self.prefix[usize::from(cur)];
        }
        self.pending.push(cur as u8);
        self.pending.reverse();
        let first = self.pending[0];

        if let Some(prev) = self.prev {
            if self.next < (1usize << self.maxbits) {
                self.prefix[self.next] = prev;
                self.suffix[self.next] = first;
                self.next += 1;
            }
        }
        self.prev = Some(code);
        self.first_byte = first;
        Ok(true)
    }
}

impl Read for CompressReadFilter {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pend_pos < self.pending.len() {
                let n = (self.pending.len() - self.pend_pos).min(dst.len());
                dst[..n].copy_from_slice(&self.pending[self.pend_pos..self.pend_pos + n]);
                self.pend_pos += n;
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            if !self.step()? {
                self.done = true;
                return Ok(0);
            }
        }
    }
}

impl ChainRead for CompressReadFilter {
    #[inline(always)]
    fn take_raw_delta(&mut self) -> u64 {
        self.inner.take_raw_delta()
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

fn corrupt(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{IoSource, SourceReader};
    use std::io::Cursor;

    /// Minimal .Z packer used only to exercise the decoder. Emits 9-bit
    /// codes LSB-first; each segment ends at an 8-code group boundary,
    /// mirroring the padding the historical encoder produces around CLEAR.
    fn pack_z(segments: &[&[u16]], block_mode: bool) -> Vec<u8> {
        let mut out = vec![0x1f, 0x9d, if block_mode { 0x90 } else { 0x10 }];
        let mut acc: u64 = 0;
        let mut nbits = 0u32;
        let mut posbits = 0u64;
        let last = segments.len() - 1;
        for (i, codes) in segments.iter().enumerate() {
            for &c in *codes {
                assert!(c < 512);
                acc |= u64::from(c) << nbits;
                nbits += 9;
                posbits += 9;
                while nbits >= 8 {
                    out.push((acc & 0xff) as u8);
                    acc >>= 8;
                    nbits -= 8;
                }
            }
            if i < last {
                // Zero-pad to the next 72-bit (8 codes at 9 bits) boundary.
                while posbits % 72 != 0 {
                    nbits += 1;
                    posbits += 1;
                    if nbits == 8 {
                        out.push((acc & 0xff) as u8);
                        acc >>= 8;
                        nbits = 0;
                    }
                }
            }
        }
        if nbits > 0 {
            out.push((acc & 0xff) as u8);
        }
        out
    }

    fn decode(bytes: Vec<u8>) -> io::Result<Vec<u8>> {
        let base = SourceReader::new(Box::new(IoSource(Cursor::new(bytes))));
        let mut f = CompressReadFilter::new(Box::new(base));
        let mut out = Vec::new();
        f.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn decodes_literals() {
        let z = pack_z(&[&[104, 101, 108, 108, 111]], true);
        assert_eq!(decode(z).unwrap(), b"hello");
    }

    #[test]
    fn decodes_table_references() {
        // a, b define 257 = "ab"; emitting 257 replays it.
        let z = pack_z(&[&[97, 98, 257]], true);
        assert_eq!(decode(z).unwrap(), b"abab");
    }

    #[test]
    fn decodes_kwkwk_case() {
        // 257 arrives before it is defined: "a" then "aa".
        let z = pack_z(&[&[97, 257]], true);
        assert_eq!(decode(z).unwrap(), b"aaa");
    }

    #[test]
    fn clear_code_resets_table() {
        // The segment break supplies the group padding the real encoder
        // emits after CLEAR.
        let z = pack_z(&[&[97, 98, 256], &[97, 98, 257]], true);
        assert_eq!(decode(z).unwrap(), b"ababab");
    }

    #[test]
    fn rejects_out_of_range_code() {
        let z = pack_z(&[&[97, 400]], true);
        assert!(decode(z).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(decode(vec![0x1f, 0x8b, 0x90, 0, 0]).is_err());
    }
}
