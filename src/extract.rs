//! Filesystem extraction engine.
//!
//! # Invariants
//! - Entry paths are confined to the destination: leading `/` is stripped,
//!   and `..` components are rejected under `SECURE_NODOTDOT`.
//! - A configured skip (dev, ino) pair is never materialized.
//! - Directory permissions and times are applied deepest-first at
//!   `finish()`, never at creation, so restrictive modes cannot block the
//!   entries underneath them.
//!
//! # Design Notes
//! - Without `PERM`, the entry mode is filtered through the process umask
//!   and SUID/SGID/sticky are withheld.
//! - `ACL`/`FFLAGS`/`XATTR` are accepted but inert on plain filesystems;
//!   each one requested is counted in `stats().unsupported_flags` so callers
//!   can tell the capability was dropped.

use std::fs;
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};

use crate::entry::{Entry, EntryType};
use crate::reader::ArchiveReader;
use crate::stats::ArchiveStats;
use crate::status::{ArchiveError, Stage, Status};

/// Behavior flags for one extraction session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtractFlags(pub u32);

impl ExtractFlags {
    pub const OWNER: ExtractFlags = ExtractFlags(0x0001);
    pub const PERM: ExtractFlags = ExtractFlags(0x0002);
    pub const TIME: ExtractFlags = ExtractFlags(0x0004);
    pub const NO_OVERWRITE: ExtractFlags = ExtractFlags(0x0008);
    pub const UNLINK: ExtractFlags = ExtractFlags(0x0010);
    pub const ACL: ExtractFlags = ExtractFlags(0x0020);
    pub const FFLAGS: ExtractFlags = ExtractFlags(0x0040);
    pub const XATTR: ExtractFlags = ExtractFlags(0x0080);
    pub const SECURE_SYMLINKS: ExtractFlags = ExtractFlags(0x0100);
    pub const SECURE_NODOTDOT: ExtractFlags = ExtractFlags(0x0200);
    pub const NO_AUTODIR: ExtractFlags = ExtractFlags(0x0400);
    pub const NO_OVERWRITE_NEWER: ExtractFlags = ExtractFlags(0x0800);

    #[inline]
    pub fn contains(self, other: ExtractFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ExtractFlags {
    type Output = ExtractFlags;

    fn bitor(self, rhs: ExtractFlags) -> ExtractFlags {
        ExtractFlags(self.0 | rhs.0)
    }
}

struct DeferredDir {
    path: PathBuf,
    mode: u32,
    mtime: i64,
    mtime_nsec: u32,
}

/// One extraction session rooted at a destination directory.
pub struct Extractor {
    dest: PathBuf,
    flags: ExtractFlags,
    umask: u32,
    skip: Option<(u64, u64)>,
    deferred: Vec<DeferredDir>,
    stats: ArchiveStats,
}

impl Extractor {
    pub fn new(dest: impl Into<PathBuf>, flags: ExtractFlags) -> Self {
        let mut stats = ArchiveStats::default();
        // ACL/fflags/xattr restoration is not implemented; surface the
        // dropped request instead of silently ignoring it.
        for inert in [ExtractFlags::ACL, ExtractFlags::FFLAGS, ExtractFlags::XATTR] {
            if flags.contains(inert) {
                stats.unsupported_flags += 1;
            }
        }
        Self {
            dest: dest.into(),
            flags,
            umask: process_umask(),
            skip: None,
            deferred: Vec::new(),
            stats,
        }
    }

    /// Exclude one filesystem object by identity. Typically the archive
    /// being read, so an archive stored inside its own destination never
    /// overwrites itself mid-read.
    pub fn set_skip_file(&mut self, dev: u64, ino: u64) -> &mut Self {
        self.skip = Some((dev, ino));
        self
    }

    pub fn stats(&self) -> &ArchiveStats {
        &self.stats
    }

    /// Drain `r` into the destination. Returns the number of entries
    /// materialized; skips are counted in `stats`, not here.
    ///
    /// On a per-entry error the deferred directory metadata is still
    /// applied, so directories created before the failure keep their
    /// declared modes and times; the entry error wins over any flush error.
    pub fn extract_all(&mut self, r: &mut ArchiveReader) -> Result<u64, ArchiveError> {
        match self.extract_entries(r) {
            Ok(done) => {
                self.finish()?;
                Ok(done)
            }
            Err(e) => {
                let _ = self.finish();
                Err(e)
            }
        }
    }

    fn extract_entries(&mut self, r: &mut ArchiveReader) -> Result<u64, ArchiveError> {
        let mut done = 0u64;
        while let Some(entry) = r.next_header()?.cloned() {
            if self.write_entry(&entry, r)? {
                done += 1;
            }
        }
        Ok(done)
    }

    /// Materialize one entry, streaming its body from `r` when it has one.
    /// `Ok(false)` means the entry was skipped by policy.
    pub fn write_entry(
        &mut self,
        entry: &Entry,
        r: &mut ArchiveReader,
    ) -> Result<bool, ArchiveError> {
        if let Some((dev, ino)) = self.skip {
            if entry.dev() == dev && entry.ino() == ino && (dev, ino) != (0, 0) {
                self.stats.entries_skipped += 1;
                r.skip_data()?;
                return Ok(false);
            }
        }
        let path = self.resolve(entry)?;

        if self.flags.contains(ExtractFlags::SECURE_SYMLINKS) {
            self.check_symlink_components(&path, entry)?;
        }
        if !self.flags.contains(ExtractFlags::NO_AUTODIR) {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent).map_err(|e| {
                        ArchiveError::io(Status::Failed, Stage::Extract, "create parent", &e)
                            .with_path(entry.path())
                    })?;
                }
            }
        }
        if !self.clear_target(&path, entry)? {
            self.stats.entries_skipped += 1;
            r.skip_data()?;
            return Ok(false);
        }

        match entry.entry_type() {
            EntryType::Regular => self.write_regular(&path, entry, r)?,
            EntryType::Directory => {
                self.write_directory(&path, entry)?;
                self.stats.entries_extracted += 1;
                return Ok(true);
            }
            EntryType::Symlink => self.write_symlink(&path, entry)?,
            EntryType::Hardlink => self.write_hardlink(&path, entry)?,
            EntryType::Fifo => self.write_fifo(&path, entry)?,
            EntryType::CharDevice | EntryType::BlockDevice => {
                // Device nodes need privileges ordinary callers lack.
                self.stats.entries_skipped += 1;
                return Ok(false);
            }
        }
        self.apply_metadata(&path, entry, entry.entry_type() == EntryType::Symlink)?;
        self.stats.entries_extracted += 1;
        Ok(true)
    }

    /// Apply deferred directory permissions and times, deepest first.
    pub fn finish(&mut self) -> Result<(), ArchiveError> {
        let mut pending = std::mem::take(&mut self.deferred);
        pending.sort_by(|a, b| b.path.as_os_str().len().cmp(&a.path.as_os_str().len()));
        for d in pending {
            if self.flags.contains(ExtractFlags::PERM) {
                set_mode(&d.path, d.mode & 0o7777)
                    .map_err(|e| ArchiveError::io(Status::Failed, Stage::Extract, "restore dir mode", &e))?;
            }
            if self.flags.contains(ExtractFlags::TIME) {
                set_times(&d.path, d.mtime, d.mtime_nsec, false)
                    .map_err(|e| ArchiveError::io(Status::Failed, Stage::Extract, "restore dir time", &e))?;
            }
        }
        Ok(())
    }

    fn resolve(&self, entry: &Entry) -> Result<PathBuf, ArchiveError> {
        let raw = entry.path().trim_start_matches('/');
        if raw.is_empty() {
            return Err(ArchiveError::failed(Stage::Extract, "empty entry path")
                .with_path(entry.path()));
        }
        let rel = Path::new(raw);
        for c in rel.components() {
            match c {
                Component::ParentDir => {
                    if self.flags.contains(ExtractFlags::SECURE_NODOTDOT) {
                        return Err(ArchiveError::failed(
                            Stage::Extract,
                            "path escapes the destination",
                        )
                        .with_path(entry.path()));
                    }
                }
                Component::Prefix(_) | Component::RootDir => {
                    return Err(ArchiveError::failed(Stage::Extract, "non-relative entry path")
                        .with_path(entry.path()))
                }
                _ => {}
            }
        }
        Ok(self.dest.join(rel))
    }

    /// Refuse to write through a symlinked ancestor inside the destination.
    fn check_symlink_components(&self, path: &Path, entry: &Entry) -> Result<(), ArchiveError> {
        let mut probe = self.dest.clone();
        let rel = match path.strip_prefix(&self.dest) {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };
        let mut components = rel.components().peekable();
        while let Some(c) = components.next() {
            if components.peek().is_none() {
                break;
            }
            probe.push(c);
            let meta = match fs::symlink_metadata(&probe) {
                Ok(m) => m,
                Err(_) => break,
            };
            if meta.file_type().is_symlink() {
                return Err(ArchiveError::failed(
                    Stage::Extract,
                    "path traverses a symlink",
                )
                .with_path(entry.path()));
            }
        }
        Ok(())
    }

    /// Resolve the overwrite policy for an existing target.
    /// `Ok(false)` means skip the entry.
    fn clear_target(&mut self, path: &Path, entry: &Entry) -> Result<bool, ArchiveError> {
        let meta = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(_) => return Ok(true),
        };
        if entry.entry_type() == EntryType::Directory && meta.is_dir() {
            return Ok(true);
        }
        if self.flags.contains(ExtractFlags::NO_OVERWRITE) {
            return Ok(false);
        }
        if self.flags.contains(ExtractFlags::NO_OVERWRITE_NEWER) {
            if let Ok(disk_mtime) = meta.modified() {
                let entry_mtime = std::time::UNIX_EPOCH
                    + std::time::Duration::new(entry.mtime().max(0) as u64, entry.mtime_nsec());
                if disk_mtime > entry_mtime {
                    return Ok(false);
                }
            }
        }
        if meta.file_type().is_symlink() && self.flags.contains(ExtractFlags::SECURE_SYMLINKS) {
            return Err(ArchiveError::failed(Stage::Extract, "refusing to replace a symlink")
                .with_path(entry.path()));
        }
        let unlink_needed = self.flags.contains(ExtractFlags::UNLINK)
            || meta.file_type().is_symlink()
            || meta.is_dir() != (entry.entry_type() == EntryType::Directory);
        if unlink_needed {
            let res = if meta.is_dir() {
                fs::remove_dir(path)
            } else {
                fs::remove_file(path)
            };
            res.map_err(|e| {
                ArchiveError::io(Status::Failed, Stage::Extract, "remove existing target", &e)
                    .with_path(entry.path())
            })?;
        }
        Ok(true)
    }

    fn write_regular(
        &mut self,
        path: &Path,
        entry: &Entry,
        r: &mut ArchiveReader,
    ) -> Result<(), ArchiveError> {
        let mut f = fs::File::create(path).map_err(|e| {
            ArchiveError::io(Status::Failed, Stage::Extract, "create file", &e)
                .with_path(entry.path())
        })?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = r.read_data(&mut buf)?;
            if n == 0 {
                break;
            }
            f.write_all(&buf[..n]).map_err(|e| {
                ArchiveError::io(Status::Failed, Stage::Extract, "write file", &e)
                    .with_path(entry.path())
            })?;
        }
        Ok(())
    }

    fn write_directory(&mut self, path: &Path, entry: &Entry) -> Result<(), ArchiveError> {
        if !path.is_dir() {
            fs::create_dir(path).map_err(|e| {
                ArchiveError::io(Status::Failed, Stage::Extract, "create directory", &e)
                    .with_path(entry.path())
            })?;
        }
        // Mode and time land at finish(); until then the directory stays
        // traversable for the entries underneath it.
        self.deferred.push(DeferredDir {
            path: path.to_path_buf(),
            mode: self.effective_mode(entry),
            mtime: entry.mtime(),
            mtime_nsec: entry.mtime_nsec(),
        });
        if self.flags.contains(ExtractFlags::OWNER) {
            set_owner(path, entry.uid(), entry.gid())
                .map_err(|e| {
                    ArchiveError::io(Status::Failed, Stage::Extract, "restore owner", &e)
                        .with_path(entry.path())
                })?;
        }
        Ok(())
    }

    fn write_symlink(&mut self, path: &Path, entry: &Entry) -> Result<(), ArchiveError> {
        let target = entry.link().ok_or_else(|| {
            ArchiveError::failed(Stage::Extract, "symlink entry without a target")
                .with_path(entry.path())
        })?;
        make_symlink(target, path).map_err(|e| {
            ArchiveError::io(Status::Failed, Stage::Extract, "create symlink", &e)
                .with_path(entry.path())
        })
    }

    fn write_hardlink(&mut self, path: &Path, entry: &Entry) -> Result<(), ArchiveError> {
        let target = entry.link().ok_or_else(|| {
            ArchiveError::failed(Stage::Extract, "hardlink entry without a target")
                .with_path(entry.path())
        })?;
        let original = self.dest.join(target.trim_start_matches('/'));
        fs::hard_link(&original, path).map_err(|e| {
            ArchiveError::io(Status::Failed, Stage::Extract, "create hardlink", &e)
                .with_path(entry.path())
        })
    }

    fn write_fifo(&mut self, path: &Path, entry: &Entry) -> Result<(), ArchiveError> {
        make_fifo(path, self.effective_mode(entry)).map_err(|e| {
            ArchiveError::io(Status::Failed, Stage::Extract, "create fifo", &e)
                .with_path(entry.path())
        })
    }

    /// Entry mode under the session policy: verbatim with `PERM`, otherwise
    /// umask-filtered with the privileged bits withheld.
    fn effective_mode(&self, entry: &Entry) -> u32 {
        if self.flags.contains(ExtractFlags::PERM) {
            entry.mode()
        } else {
            entry.mode() & !self.umask & 0o777
        }
    }

    fn apply_metadata(
        &mut self,
        path: &Path,
        entry: &Entry,
        is_symlink: bool,
    ) -> Result<(), ArchiveError> {
        if self.flags.contains(ExtractFlags::OWNER) {
            set_owner(path, entry.uid(), entry.gid()).map_err(|e| {
                ArchiveError::io(Status::Failed, Stage::Extract, "restore owner", &e)
                    .with_path(entry.path())
            })?;
        }
        if !is_symlink {
            set_mode(path, self.effective_mode(entry)).map_err(|e| {
                ArchiveError::io(Status::Failed, Stage::Extract, "restore mode", &e)
                    .with_path(entry.path())
            })?;
        }
        if self.flags.contains(ExtractFlags::TIME) {
            set_times(path, entry.mtime(), entry.mtime_nsec(), is_symlink).map_err(|e| {
                ArchiveError::io(Status::Failed, Stage::Extract, "restore time", &e)
                    .with_path(entry.path())
            })?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn process_umask() -> u32 {
    // umask can only be read by setting it; write the old value straight back.
    unsafe {
        let m = libc::umask(0);
        libc::umask(m);
        m as u32
    }
}

#[cfg(not(unix))]
fn process_umask() -> u32 {
    0o022
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_owner(path: &Path, uid: u64, gid: u64) -> std::io::Result<()> {
    let c = cpath(path)?;
    let rc = unsafe { libc::lchown(c.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_owner(_path: &Path, _uid: u64, _gid: u64) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_times(path: &Path, sec: i64, nsec: u32, symlink: bool) -> std::io::Result<()> {
    let c = cpath(path)?;
    let times = [
        libc::timespec {
            tv_sec: sec as libc::time_t,
            tv_nsec: nsec as libc::c_long,
        },
        libc::timespec {
            tv_sec: sec as libc::time_t,
            tv_nsec: nsec as libc::c_long,
        },
    ];
    let flags = if symlink { libc::AT_SYMLINK_NOFOLLOW } else { 0 };
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), flags) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_times(_path: &Path, _sec: i64, _nsec: u32, _symlink: bool) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(not(unix))]
fn make_symlink(_target: &str, _path: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks unsupported on this platform",
    ))
}

#[cfg(unix)]
fn make_fifo(path: &Path, mode: u32) -> std::io::Result<()> {
    let c = cpath(path)?;
    let rc = unsafe { libc::mkfifo(c.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "fifos unsupported on this platform",
    ))
}

#[cfg(unix)]
fn cpath(path: &Path) -> std::io::Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL"))
}
