//! tar format module (ustar framing, GNU and PAX read extensions).
//!
//! # Invariants
//! - Parsing is sequential; no seeks are performed.
//! - Size fields are untrusted; overflow or short reads are malformed input.
//! - GNU longname/longlink and PAX overrides apply to the next real entry
//!   only and are cleared once consumed.
//!
//! # Algorithm
//! - Read 512-byte header blocks; two zero blocks (or clean EOF at a block
//!   boundary) end the archive.
//! - Metadata records (`L`, `K`, `x`, `g`) are consumed inline and folded
//!   into the following entry; the variant half of the format code tracks
//!   which extension family was seen.
//!
//! # Design Notes
//! - The write side emits ustar framing and falls back to a GNU `L` record
//!   when a path cannot be prefix-split into the ustar fields.

use memchr::memchr;

use crate::entry::{Entry, EntryType};
use crate::format::{
    fill_raw_body, skip_raw_body, BodyWindow, FormatCode, FormatNext, FormatReader, FormatWriter,
};
use crate::status::{ArchiveError, Stage, Status};
use crate::stream::{ChainSink, ChainSource};

pub const TAR_BLOCK_LEN: usize = 512;
pub const USTAR_MAGIC_OFFSET: usize = 257;

/// Longest metadata record (longname, PAX block) retained per entry.
const META_CAP: usize = 64 * 1024;

const BODY_BUF: usize = 64 * 1024;

/// ustar magic, a checksum-valid pre-POSIX header, or a zero terminator
/// block (an archive holding no entries starts with one).
pub fn probe(peek: &[u8]) -> bool {
    if peek.len() >= USTAR_MAGIC_OFFSET + 5
        && &peek[USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + 5] == b"ustar"
    {
        return true;
    }
    if peek.len() < TAR_BLOCK_LEN {
        return false;
    }
    is_zero_block(&peek[..TAR_BLOCK_LEN]) || checksum_matches(&peek[..TAR_BLOCK_LEN])
}

#[inline(always)]
fn tar_pad(size: u64) -> u64 {
    let rem = size % TAR_BLOCK_LEN as u64;
    if rem == 0 {
        0
    } else {
        TAR_BLOCK_LEN as u64 - rem
    }
}

#[inline(always)]
fn is_zero_block(b: &[u8]) -> bool {
    b.iter().all(|&x| x == 0)
}

fn cstr_bytes(field: &[u8]) -> &[u8] {
    match memchr(0, field) {
        Some(i) => &field[..i],
        None => field,
    }
}

/// NUL/space padded octal; empty field parses as 0.
fn parse_octal(field: &[u8]) -> Option<u64> {
    let mut i = 0;
    while i < field.len() && (field[i] == 0 || field[i] == b' ') {
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
        v = v.checked_mul(8)?;
        v = v.checked_add(u64::from(d - b'0'))?;
    }
    Some(v)
}

/// Octal, or GNU base-256 when the top bit of the first byte is set.
fn parse_numeric(field: &[u8]) -> Option<u64> {
    let first = *field.first()?;
    if first & 0x80 == 0 {
        return parse_octal(field);
    }
    let mut v = u64::from(first & 0x7f);
    for &b in &field[1..] {
        v = v.checked_mul(256)?.checked_add(u64::from(b))?;
    }
    Some(v)
}

fn header_checksum(block: &[u8]) -> (u64, i64) {
    let mut unsigned: u64 = 0;
    let mut signed: i64 = 0;
    for (i, &b) in block.iter().enumerate() {
        let v = if (148..156).contains(&i) { b' ' } else { b };
        unsigned += u64::from(v);
        signed += i64::from(v as i8);
    }
    (unsigned, signed)
}

fn checksum_matches(block: &[u8]) -> bool {
    let stored = match parse_octal(&block[148..156]) {
        Some(s) => s,
        None => return false,
    };
    let (unsigned, signed) = header_checksum(block);
    stored == unsigned || stored as i64 == signed
}

/// PAX record values that override the next entry's header fields.
#[derive(Default)]
struct PaxOverrides {
    path: Option<String>,
    link: Option<String>,
    size: Option<u64>,
    mtime: Option<(i64, u32)>,
    uid: Option<u64>,
    gid: Option<u64>,
}

impl PaxOverrides {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn any(&self) -> bool {
        self.path.is_some()
            || self.link.is_some()
            || self.size.is_some()
            || self.mtime.is_some()
            || self.uid.is_some()
            || self.gid.is_some()
    }
}

/// Parse `len key=value\n` records. Malformed framing stops parsing and
/// reports a warning; already-parsed records stay applied.
fn parse_pax_records(data: &[u8], out: &mut PaxOverrides) -> Option<ArchiveError> {
    let mut pos = 0;
    while pos < data.len() {
        let space = match memchr(b' ', &data[pos..]) {
            Some(i) => pos + i,
            None => return Some(ArchiveError::warn(Stage::Format, "pax record missing length")),
        };
        let mut rec_len: usize = 0;
        if space == pos {
            return Some(ArchiveError::warn(Stage::Format, "pax record bad length"));
        }
        for &d in &data[pos..space] {
            if !d.is_ascii_digit() {
                return Some(ArchiveError::warn(Stage::Format, "pax record bad length"));
            }
            rec_len = rec_len.saturating_mul(10).saturating_add((d - b'0') as usize);
        }
        let rec_end = pos.saturating_add(rec_len);
        if rec_len == 0 || rec_end <= space || rec_end > data.len() {
            return Some(ArchiveError::warn(Stage::Format, "pax record bad length"));
        }
        let mut kv = &data[space + 1..rec_end];
        if kv.last() == Some(&b'\n') {
            kv = &kv[..kv.len() - 1];
        }
        if let Some(eq) = memchr(b'=', kv) {
            let key = &kv[..eq];
            let val = &kv[eq + 1..];
            apply_pax_record(key, val, out);
        }
        pos = rec_end;
    }
    None
}

fn apply_pax_record(key: &[u8], val: &[u8], out: &mut PaxOverrides) {
    let text = || String::from_utf8_lossy(val).into_owned();
    match key {
        b"path" => out.path = Some(text()),
        b"linkpath" => out.link = Some(text()),
        b"size" => out.size = parse_decimal(val),
        b"uid" => out.uid = parse_decimal(val),
        b"gid" => out.gid = parse_decimal(val),
        b"mtime" => out.mtime = parse_pax_time(val),
        _ => {}
    }
}

fn parse_decimal(val: &[u8]) -> Option<u64> {
    if val.is_empty() {
        return None;
    }
    let mut v: u64 = 0;
    for &d in val {
        if !d.is_ascii_digit() {
            return None;
        }
        v = v.checked_mul(10)?.checked_add(u64::from(d - b'0'))?;
    }
    Some(v)
}

/// `seconds[.fraction]`, possibly negative.
fn parse_pax_time(val: &[u8]) -> Option<(i64, u32)> {
    let (neg, rest) = match val.first() {
        Some(b'-') => (true, &val[1..]),
        _ => (false, val),
    };
    let dot = memchr(b'.', rest).unwrap_or(rest.len());
    let secs = parse_decimal(&rest[..dot])? as i64;
    let secs = if neg { -secs } else { secs };
    let mut nsec: u32 = 0;
    if dot < rest.len() {
        let frac = &rest[dot + 1..];
        let mut scale = 100_000_000u32;
        for &d in frac.iter().take(9) {
            if !d.is_ascii_digit() {
                return None;
            }
            nsec += u32::from(d - b'0') * scale;
            scale /= 10;
        }
    }
    Some((secs, nsec))
}

pub struct TarReader {
    code: FormatCode,
    hdr: [u8; TAR_BLOCK_LEN],
    zero_blocks: u8,

    gnu_longname: Option<String>,
    gnu_longlink: Option<String>,
    pax: PaxOverrides,

    window: BodyWindow,
    remaining: u64,
    padding: u64,
    warning: Option<ArchiveError>,
}

impl TarReader {
    pub fn new() -> Self {
        Self {
            code: FormatCode::TAR_USTAR,
            hdr: [0; TAR_BLOCK_LEN],
            zero_blocks: 0,
            gnu_longname: None,
            gnu_longlink: None,
            pax: PaxOverrides::default(),
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

    /// Read a metadata payload (longname, PAX block) up to `META_CAP`,
    /// discarding and warning beyond the cap. Consumes the record padding.
    fn read_meta_payload(
        &mut self,
        src: &mut ChainSource,
        size: u64,
        what: &str,
    ) -> Result<Vec<u8>, ArchiveError> {
        let keep = size.min(META_CAP as u64) as usize;
        let mut buf = vec![0u8; keep];
        src.read_exact(&mut buf)
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, what, &e))?;
        if size > keep as u64 {
            self.note_warning(ArchiveError::warn(
                Stage::Format,
                format!("{what} record truncated to {META_CAP} bytes"),
            ));
            src.skip_exact(size - keep as u64)
                .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, what, &e))?;
        }
        src.skip_exact(tar_pad(size))
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, what, &e))?;
        Ok(buf)
    }

    fn build_entry(&mut self, size: u64) -> Entry {
        let typeflag = self.hdr[156];
        let is_ustar = &self.hdr[USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + 5] == b"ustar";

        let mut name = {
            let base = cstr_bytes(&self.hdr[0..100]);
            let prefix = cstr_bytes(&self.hdr[345..500]);
            if is_ustar && !prefix.is_empty() {
                let mut n = Vec::with_capacity(prefix.len() + 1 + base.len());
                n.extend_from_slice(prefix);
                if !n.ends_with(b"/") {
                    n.push(b'/');
                }
                n.extend_from_slice(base);
                String::from_utf8_lossy(&n).into_owned()
            } else {
                String::from_utf8_lossy(base).into_owned()
            }
        };
        if let Some(p) = self.pax.path.take() {
            name = p;
        } else if let Some(p) = self.gnu_longname.take() {
            name = p;
        }

        let mut link = {
            let l = cstr_bytes(&self.hdr[157..257]);
            if l.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(l).into_owned())
            }
        };
        if let Some(l) = self.pax.link.take() {
            link = Some(l);
        } else if let Some(l) = self.gnu_longlink.take() {
            link = Some(l);
        }

        let etype = match typeflag {
            0 | b'0' | b'7' => {
                if name.ends_with('/') {
                    EntryType::Directory
                } else {
                    EntryType::Regular
                }
            }
            b'1' => EntryType::Hardlink,
            b'2' => EntryType::Symlink,
            b'3' => EntryType::CharDevice,
            b'4' => EntryType::BlockDevice,
            b'5' => EntryType::Directory,
            b'6' => EntryType::Fifo,
            other => {
                self.note_warning(ArchiveError::warn(
                    Stage::Format,
                    format!("unknown tar typeflag {:?}, treating as regular", other as char),
                ));
                EntryType::Regular
            }
        };

        let mut e = Entry::new(name, etype);
        e.set_size(size);
        e.set_mode(parse_octal(&self.hdr[100..108]).unwrap_or(0o644) as u32);
        e.set_uid(self.pax.uid.take().unwrap_or_else(|| {
            parse_numeric(&self.hdr[108..116]).unwrap_or(0)
        }));
        e.set_gid(self.pax.gid.take().unwrap_or_else(|| {
            parse_numeric(&self.hdr[116..124]).unwrap_or(0)
        }));
        match self.pax.mtime.take() {
            Some((s, ns)) => {
                e.set_mtime(s, ns);
            }
            None => {
                e.set_mtime(parse_numeric(&self.hdr[136..148]).unwrap_or(0) as i64, 0);
            }
        }
        if let Some(l) = link {
            e.set_link(l);
        }
        if matches!(etype, EntryType::CharDevice | EntryType::BlockDevice) {
            let major = parse_octal(&self.hdr[329..337]).unwrap_or(0) as u32;
            let minor = parse_octal(&self.hdr[337..345]).unwrap_or(0) as u32;
            e.set_rdev(major, minor);
        }
        e
    }
}

impl Default for TarReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatReader for TarReader {
    fn code(&self) -> FormatCode {
        self.code
    }

    fn next_entry(&mut self, src: &mut ChainSource) -> Result<FormatNext, ArchiveError> {
        debug_assert_eq!(self.remaining, 0, "body must be drained before next header");
        self.window.reset();
        loop {
            let mut hdr = self.hdr;
            let got = src
                .read_exact_or_eof(&mut hdr)
                .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "read header", &e))?;
            self.hdr = hdr;
            if !got {
                // Clean EOF at a block boundary; tolerated without trailer.
                return Ok(FormatNext::End);
            }

            if is_zero_block(&self.hdr) {
                self.zero_blocks += 1;
                if self.zero_blocks >= 2 {
                    return Ok(FormatNext::End);
                }
                continue;
            }
            self.zero_blocks = 0;

            if !checksum_matches(&self.hdr) {
                return Err(ArchiveError::fatal(Stage::Format, "bad tar header checksum"));
            }

            let typeflag = self.hdr[156];
            let size = parse_numeric(&self.hdr[124..136])
                .ok_or_else(|| ArchiveError::fatal(Stage::Format, "bad tar size field"))?;

            match typeflag {
                b'L' => {
                    let payload = self.read_meta_payload(src, size, "gnu longname")?;
                    let trimmed = trim_meta(&payload);
                    self.gnu_longname = Some(String::from_utf8_lossy(trimmed).into_owned());
                    self.code = FormatCode::TAR_GNU;
                    continue;
                }
                b'K' => {
                    let payload = self.read_meta_payload(src, size, "gnu longlink")?;
                    let trimmed = trim_meta(&payload);
                    self.gnu_longlink = Some(String::from_utf8_lossy(trimmed).into_owned());
                    self.code = FormatCode::TAR_GNU;
                    continue;
                }
                b'x' => {
                    let payload = self.read_meta_payload(src, size, "pax header")?;
                    if let Some(w) = parse_pax_records(&payload, &mut self.pax) {
                        self.note_warning(w);
                    }
                    self.code = FormatCode::TAR_PAX;
                    continue;
                }
                b'g' => {
                    // Global defaults are parsed for framing but not applied;
                    // applying them can misattribute multi-entry archives.
                    let payload = self.read_meta_payload(src, size, "pax global header")?;
                    let mut ignored = PaxOverrides::default();
                    if let Some(w) = parse_pax_records(&payload, &mut ignored) {
                        self.note_warning(w);
                    }
                    self.code = FormatCode::TAR_PAX;
                    continue;
                }
                _ => {}
            }

            let size = self.pax.size.take().unwrap_or(size);
            if self.pax.any() || self.code == FormatCode::TAR_PAX {
                self.code = FormatCode::TAR_PAX;
            }
            let entry = self.build_entry(size);
            self.pax.clear();
            self.remaining = size;
            self.padding = tar_pad(size);
            return Ok(FormatNext::Entry(entry));
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

fn trim_meta(payload: &[u8]) -> &[u8] {
    let mut end = payload.len();
    while end > 0 && (payload[end - 1] == 0 || payload[end - 1] == b'\n') {
        end -= 1;
    }
    &payload[..end]
}

/// ustar writer with a GNU `L` fallback for unsplittable long paths.
pub struct TarWriter {
    code: FormatCode,
    entry_size: u64,
}

impl TarWriter {
    pub fn new() -> Self {
        Self {
            code: FormatCode::TAR_USTAR,
            entry_size: 0,
        }
    }

    fn write_block(
        &mut self,
        sink: &mut ChainSink,
        block: &[u8; TAR_BLOCK_LEN],
    ) -> Result<(), ArchiveError> {
        sink.write_all(block)
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "write header", &e))
    }

    fn write_longname_record(
        &mut self,
        sink: &mut ChainSink,
        name: &str,
    ) -> Result<(), ArchiveError> {
        let payload = name.as_bytes();
        let size = payload.len() as u64 + 1;
        let mut block = [0u8; TAR_BLOCK_LEN];
        fill_header_common(&mut block, "././@LongLink", size, 0o644, 0, b'L');
        finish_checksum(&mut block);
        self.write_block(sink, &block)?;
        sink.write_all(payload)
            .and_then(|()| sink.write_all(&[0]))
            .and_then(|()| sink.write_zeros(tar_pad(size)))
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "write longname", &e))?;
        self.code = FormatCode::TAR_GNU;
        Ok(())
    }
}

impl Default for TarWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatWriter for TarWriter {
    fn code(&self) -> FormatCode {
        self.code
    }

    fn write_header(&mut self, sink: &mut ChainSink, entry: &Entry) -> Result<u64, ArchiveError> {
        let etype = entry.entry_type();
        let mut name = entry.path().to_string();
        if etype.is_dir() && !name.ends_with('/') {
            name.push('/');
        }

        let typeflag = match etype {
            EntryType::Regular => b'0',
            EntryType::Hardlink => b'1',
            EntryType::Symlink => b'2',
            EntryType::CharDevice => b'3',
            EntryType::BlockDevice => b'4',
            EntryType::Directory => b'5',
            EntryType::Fifo => b'6',
        };

        let body = if etype.is_regular() { entry.size() } else { 0 };
        if body > 0o777_7777_7777 {
            // Octal field limit (8 GiB); base-256 emission is out of scope.
            return Err(ArchiveError::failed(Stage::Format, "entry too large for ustar")
                .with_path(entry.path()));
        }

        let link = entry.link().unwrap_or("");
        if link.len() > 100 {
            return Err(ArchiveError::failed(Stage::Format, "link target too long for ustar")
                .with_path(entry.path()));
        }

        let mut block = [0u8; TAR_BLOCK_LEN];
        match split_ustar_name(&name) {
            Some((prefix, base)) => {
                block[0..base.len()].copy_from_slice(base.as_bytes());
                block[345..345 + prefix.len()].copy_from_slice(prefix.as_bytes());
            }
            None => {
                self.write_longname_record(sink, &name)?;
                let keep = truncate_on_char_boundary(&name, 100);
                block[0..keep.len()].copy_from_slice(keep.as_bytes());
            }
        }

        fill_header_common(&mut block, "", body, entry.mode(), entry.mtime(), typeflag);
        write_octal(&mut block[108..116], entry.uid());
        write_octal(&mut block[116..124], entry.gid());
        block[157..157 + link.len()].copy_from_slice(link.as_bytes());
        if matches!(etype, EntryType::CharDevice | EntryType::BlockDevice) {
            let (major, minor) = entry.rdev();
            write_octal(&mut block[329..337], u64::from(major));
            write_octal(&mut block[337..345], u64::from(minor));
        }
        finish_checksum(&mut block);
        self.write_block(sink, &block)?;

        self.entry_size = body;
        Ok(body)
    }

    fn finish_entry(&mut self, sink: &mut ChainSink) -> Result<(), ArchiveError> {
        sink.write_zeros(tar_pad(self.entry_size))
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "write padding", &e))
    }

    fn finish(&mut self, sink: &mut ChainSink) -> Result<(), ArchiveError> {
        sink.write_zeros(2 * TAR_BLOCK_LEN as u64)
            .map_err(|e| ArchiveError::io(Status::Fatal, Stage::Format, "write trailer", &e))
    }
}

/// Fields shared by real headers and metadata records. Leaves name bytes
/// alone when `name` is empty so callers can place split names themselves.
fn fill_header_common(
    block: &mut [u8; TAR_BLOCK_LEN],
    name: &str,
    size: u64,
    mode: u32,
    mtime: i64,
    typeflag: u8,
) {
    if !name.is_empty() {
        let keep = name.len().min(100);
        block[0..keep].copy_from_slice(&name.as_bytes()[..keep]);
    }
    write_octal(&mut block[100..108], u64::from(mode & 0o7777));
    write_octal(&mut block[124..136], size);
    write_octal(&mut block[136..148], mtime.max(0) as u64);
    block[156] = typeflag;
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");
}

fn finish_checksum(block: &mut [u8; TAR_BLOCK_LEN]) {
    for b in &mut block[148..156] {
        *b = b' ';
    }
    let (sum, _) = header_checksum(block);
    let digits = format!("{sum:06o}");
    block[148..148 + 6].copy_from_slice(digits.as_bytes());
    block[154] = 0;
    block[155] = b' ';
}

/// Zero-terminated octal, right-justified over `field.len() - 1` digits.
fn write_octal(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    field[digits] = 0;
    let mut v = value;
    for i in (0..digits).rev() {
        field[i] = b'0' + ((v & 7) as u8);
        v >>= 3;
    }
}

/// Fit a path into ustar name/prefix fields. Returns None when no split
/// works (then a longname record is needed).
fn split_ustar_name(name: &str) -> Option<(&str, &str)> {
    if name.len() <= 100 {
        return Some(("", name));
    }
    if name.len() > 100 + 1 + 155 {
        return None;
    }
    // Split at a '/' so prefix <= 155 and base <= 100.
    let bytes = name.as_bytes();
    let lo = name.len().saturating_sub(101);
    for cut in (lo..name.len().min(156)).rev() {
        if bytes[cut] == b'/' {
            let (prefix, rest) = name.split_at(cut);
            let base = &rest[1..];
            if prefix.len() <= 155 && !base.is_empty() && base.len() <= 100 {
                return Some((prefix, base));
            }
        }
    }
    None
}

fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
