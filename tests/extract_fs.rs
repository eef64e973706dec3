//! Filesystem extraction against real temporary directories.

#![cfg(unix)]

use std::cell::RefCell;
use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::rc::Rc;

use arcio::{
    ArchiveReader, Entry, ExtractFlags, Extractor, FilterSpec, FormatSpec, ReaderBuilder, Sink,
    Source, Status, WriterBuilder,
};

struct Capture(Rc<RefCell<Vec<u8>>>);

impl Sink for Capture {
    fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(b);
        Ok(b.len())
    }
}

struct MemSource(Cursor<Vec<u8>>);

impl Source for MemSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::Read::read(&mut self.0, buf)
    }
}

fn tar_archive(entries: &[(Entry, &[u8])]) -> Vec<u8> {
    let buf = Rc::new(RefCell::new(Vec::new()));
    let mut w = WriterBuilder::new(FormatSpec::Tar)
        .filter(FilterSpec::None)
        .open(Box::new(Capture(buf.clone())))
        .unwrap();
    for (entry, body) in entries {
        w.write_header(entry).unwrap();
        if !body.is_empty() {
            w.write_data(body).unwrap();
        }
        w.finish_entry().unwrap();
    }
    w.close().unwrap();
    let out = buf.borrow().clone();
    out
}

fn open_reader(bytes: Vec<u8>) -> ArchiveReader {
    ReaderBuilder::new()
        .open(Box::new(MemSource(Cursor::new(bytes))))
        .unwrap()
}

#[test]
fn extracts_files_dirs_and_symlinks() {
    let mut dir = Entry::directory("d");
    dir.set_mode(0o750).set_mtime(1_600_000_000, 0);
    let bytes = tar_archive(&[
        (dir, b"".as_slice()),
        (Entry::regular("d/a.txt", 5), b"hello"),
        (Entry::symlink("d/link", "a.txt"), b""),
        (Entry::hardlink("d/also-a", "d/a.txt"), b""),
    ]);

    let dest = tempfile::tempdir().unwrap();
    let mut x = Extractor::new(dest.path(), ExtractFlags::PERM | ExtractFlags::TIME);
    let mut r = open_reader(bytes);
    let done = x.extract_all(&mut r).unwrap();
    r.close().unwrap();
    assert_eq!(done, 4);
    assert_eq!(x.stats().entries_extracted, 4);

    let root = dest.path();
    assert_eq!(std::fs::read(root.join("d/a.txt")).unwrap(), b"hello");
    assert_eq!(
        std::fs::read_link(root.join("d/link")).unwrap(),
        std::path::PathBuf::from("a.txt")
    );
    assert_eq!(std::fs::read(root.join("d/also-a")).unwrap(), b"hello");

    let dir_meta = std::fs::metadata(root.join("d")).unwrap();
    assert!(dir_meta.is_dir());
    // Deferred directory mode applied at finish().
    assert_eq!(dir_meta.permissions().mode() & 0o7777, 0o750);
}

#[test]
fn restores_file_mode_with_perm_flag() {
    let mut exe = Entry::regular("run.sh", 3);
    exe.set_mode(0o755);
    let bytes = tar_archive(&[(exe, b"#!x")]);

    let dest = tempfile::tempdir().unwrap();
    let mut r = open_reader(bytes);
    let mut x = Extractor::new(dest.path(), ExtractFlags::PERM);
    x.extract_all(&mut r).unwrap();
    r.close().unwrap();

    let mode = std::fs::metadata(dest.path().join("run.sh"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o7777, 0o755);
}

#[test]
fn no_overwrite_skips_existing_files() {
    let bytes = tar_archive(&[(Entry::regular("keep.txt", 3), b"new")]);
    let dest = tempfile::tempdir().unwrap();
    std::fs::write(dest.path().join("keep.txt"), b"old").unwrap();

    let mut r = open_reader(bytes);
    let mut x = Extractor::new(dest.path(), ExtractFlags::NO_OVERWRITE);
    let done = x.extract_all(&mut r).unwrap();
    r.close().unwrap();

    assert_eq!(done, 0);
    assert_eq!(x.stats().entries_skipped, 1);
    assert_eq!(std::fs::read(dest.path().join("keep.txt")).unwrap(), b"old");
}

#[test]
fn overwrites_by_default() {
    let bytes = tar_archive(&[(Entry::regular("keep.txt", 3), b"new")]);
    let dest = tempfile::tempdir().unwrap();
    std::fs::write(dest.path().join("keep.txt"), b"old").unwrap();

    let mut r = open_reader(bytes);
    let mut x = Extractor::new(dest.path(), ExtractFlags::default());
    x.extract_all(&mut r).unwrap();
    r.close().unwrap();
    assert_eq!(std::fs::read(dest.path().join("keep.txt")).unwrap(), b"new");
}

#[test]
fn dotdot_entry_is_rejected_when_secured() {
    let bytes = tar_archive(&[(Entry::regular("../escape.txt", 2), b"no")]);
    let dest = tempfile::tempdir().unwrap();

    let mut r = open_reader(bytes);
    let mut x = Extractor::new(dest.path(), ExtractFlags::SECURE_NODOTDOT);
    let err = x.extract_all(&mut r).expect_err("escape must fail");
    r.close().unwrap();
    assert_eq!(err.status(), Status::Failed);
    assert!(!dest.path().parent().unwrap().join("escape.txt").exists());
}

#[test]
fn deferred_dir_modes_survive_a_failing_entry() {
    let mut dir = Entry::directory("locked");
    dir.set_mode(0o750);
    let bytes = tar_archive(&[
        (dir, b"".as_slice()),
        (Entry::regular("locked/ok.txt", 2), b"ok"),
        (Entry::regular("../escape.txt", 2), b"no"),
    ]);
    let dest = tempfile::tempdir().unwrap();

    let mut r = open_reader(bytes);
    let mut x = Extractor::new(
        dest.path(),
        ExtractFlags::PERM | ExtractFlags::SECURE_NODOTDOT,
    );
    let err = x.extract_all(&mut r).expect_err("escape must fail");
    r.close().unwrap();
    assert_eq!(err.status(), Status::Failed);

    // The failure aborts the walk, but directories already created keep
    // their declared mode.
    let mode = std::fs::metadata(dest.path().join("locked"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o7777, 0o750);
    assert_eq!(
        std::fs::read(dest.path().join("locked/ok.txt")).unwrap(),
        b"ok"
    );
}

#[test]
fn absolute_paths_are_rerooted_at_the_destination() {
    let bytes = tar_archive(&[(Entry::regular("/abs/file.txt", 2), b"ok")]);
    let dest = tempfile::tempdir().unwrap();

    let mut r = open_reader(bytes);
    let mut x = Extractor::new(dest.path(), ExtractFlags::default());
    x.extract_all(&mut r).unwrap();
    r.close().unwrap();
    assert_eq!(
        std::fs::read(dest.path().join("abs/file.txt")).unwrap(),
        b"ok"
    );
}

#[test]
fn skip_file_identity_is_never_extracted() {
    let mut marked = Entry::directory("self");
    marked.set_dev_ino(42, 4242);
    let dest = tempfile::tempdir().unwrap();

    // An empty input still yields a valid reader for entries with no body.
    let mut r = open_reader(Vec::new());
    let mut x = Extractor::new(dest.path(), ExtractFlags::default());
    x.set_skip_file(42, 4242);
    let written = x.write_entry(&marked, &mut r).unwrap();
    r.close().unwrap();

    assert!(!written);
    assert_eq!(x.stats().entries_skipped, 1);
    assert!(!dest.path().join("self").exists());
}

#[test]
fn fifo_entries_are_materialized() {
    let fifo = Entry::new("pipe", arcio::EntryType::Fifo);
    let bytes = tar_archive(&[(fifo, b"")]);
    let dest = tempfile::tempdir().unwrap();

    let mut r = open_reader(bytes);
    let mut x = Extractor::new(dest.path(), ExtractFlags::default());
    x.extract_all(&mut r).unwrap();
    r.close().unwrap();

    use std::os::unix::fs::FileTypeExt;
    let meta = std::fs::symlink_metadata(dest.path().join("pipe")).unwrap();
    assert!(meta.file_type().is_fifo());
}

#[test]
fn no_autodir_fails_without_parents() {
    let bytes = tar_archive(&[(Entry::regular("deep/nested/file", 1), b"x")]);
    let dest = tempfile::tempdir().unwrap();

    let mut r = open_reader(bytes);
    let mut x = Extractor::new(dest.path(), ExtractFlags::NO_AUTODIR);
    let err = x.extract_all(&mut r).expect_err("parent missing");
    r.close().unwrap();
    assert_eq!(err.status(), Status::Failed);
}
