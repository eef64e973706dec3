//! Entry metadata value object.
//!
//! # Invariants
//! - Produced fresh per header-read by a format module; valid until the next
//!   header-read or context close. On write, caller-supplied and read-only.
//! - `size` is the declared body size and is the contract both state
//!   machines enforce (truncation on read, padding/excess-rejection on
//!   write).
//!
//! # Design Notes
//! - Paths are stored as `String` display bytes; format modules own the
//!   conversion from raw header bytes and keep it lossy-but-stable.

use serde::{Deserialize, Serialize};

/// Kind of filesystem object an entry describes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    #[default]
    Regular = 0,
    Directory = 1,
    Symlink = 2,
    Hardlink = 3,
    CharDevice = 4,
    BlockDevice = 5,
    Fifo = 6,
}

impl EntryType {
    #[inline(always)]
    pub fn is_regular(self) -> bool {
        matches!(self, EntryType::Regular)
    }

    #[inline(always)]
    pub fn is_dir(self) -> bool {
        matches!(self, EntryType::Directory)
    }
}

/// One logical archive member with its metadata.
///
/// Timestamps are seconds + nanoseconds since the epoch. `dev`/`ino` carry
/// the source filesystem identity when known (used for skip-file matching);
/// `rdev_*` carry device numbers for device nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    path: String,
    etype: EntryType,
    size: u64,
    mode: u32,
    uid: u64,
    gid: u64,
    mtime: i64,
    mtime_nsec: u32,
    link: Option<String>,
    dev: u64,
    ino: u64,
    rdev_major: u32,
    rdev_minor: u32,
}

impl Entry {
    pub fn new(path: impl Into<String>, etype: EntryType) -> Self {
        Self {
            path: path.into(),
            etype,
            mode: 0o644,
            ..Self::default()
        }
    }

    pub fn regular(path: impl Into<String>, size: u64) -> Self {
        let mut e = Self::new(path, EntryType::Regular);
        e.size = size;
        e
    }

    pub fn directory(path: impl Into<String>) -> Self {
        let mut e = Self::new(path, EntryType::Directory);
        e.mode = 0o755;
        e
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        let mut e = Self::new(path, EntryType::Symlink);
        e.mode = 0o777;
        e.link = Some(target.into());
        e
    }

    pub fn hardlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        let mut e = Self::new(path, EntryType::Hardlink);
        e.link = Some(target.into());
        e
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn entry_type(&self) -> EntryType {
        self.etype
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Permission bits plus SUID/SGID/sticky (no file-type bits).
    #[inline]
    pub fn mode(&self) -> u32 {
        self.mode
    }

    #[inline]
    pub fn uid(&self) -> u64 {
        self.uid
    }

    #[inline]
    pub fn gid(&self) -> u64 {
        self.gid
    }

    #[inline]
    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    #[inline]
    pub fn mtime_nsec(&self) -> u32 {
        self.mtime_nsec
    }

    /// Symlink target or hardlink destination.
    #[inline]
    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    #[inline]
    pub fn dev(&self) -> u64 {
        self.dev
    }

    #[inline]
    pub fn ino(&self) -> u64 {
        self.ino
    }

    #[inline]
    pub fn rdev(&self) -> (u32, u32) {
        (self.rdev_major, self.rdev_minor)
    }

    pub fn set_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.path = path.into();
        self
    }

    pub fn set_entry_type(&mut self, t: EntryType) -> &mut Self {
        self.etype = t;
        self
    }

    pub fn set_size(&mut self, size: u64) -> &mut Self {
        self.size = size;
        self
    }

    pub fn set_mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode & 0o7777;
        self
    }

    pub fn set_uid(&mut self, uid: u64) -> &mut Self {
        self.uid = uid;
        self
    }

    pub fn set_gid(&mut self, gid: u64) -> &mut Self {
        self.gid = gid;
        self
    }

    pub fn set_mtime(&mut self, sec: i64, nsec: u32) -> &mut Self {
        self.mtime = sec;
        self.mtime_nsec = nsec.min(999_999_999);
        self
    }

    pub fn set_link(&mut self, target: impl Into<String>) -> &mut Self {
        self.link = Some(target.into());
        self
    }

    pub fn set_dev_ino(&mut self, dev: u64, ino: u64) -> &mut Self {
        self.dev = dev;
        self.ino = ino;
        self
    }

    pub fn set_rdev(&mut self, major: u32, minor: u32) -> &mut Self {
        self.rdev_major = major;
        self.rdev_minor = minor;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_sane_defaults() {
        let f = Entry::regular("a.txt", 5);
        assert_eq!(f.entry_type(), EntryType::Regular);
        assert_eq!(f.size(), 5);
        assert_eq!(f.mode(), 0o644);

        let d = Entry::directory("d");
        assert!(d.entry_type().is_dir());
        assert_eq!(d.mode(), 0o755);

        let s = Entry::symlink("l", "a.txt");
        assert_eq!(s.link(), Some("a.txt"));
    }

    #[test]
    fn mode_masks_file_type_bits() {
        let mut e = Entry::regular("x", 0);
        e.set_mode(0o100_644);
        assert_eq!(e.mode(), 0o644);
        e.set_mode(0o4755);
        assert_eq!(e.mode(), 0o4755);
    }
}
