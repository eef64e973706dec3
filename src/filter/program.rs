//! External filter program stage (unix only).
//!
//! # Invariants
//! - One child process per stage; stdin carries the stage's input side and
//!   stdout its output side. stderr is discarded.
//! - Both pipe ends run nonblocking and a `poll(2)` loop pumps them from the
//!   calling thread; no helper threads are spawned.
//! - A nonzero child exit status fails the stage at drain time.
//!
//! # Design Notes
//! - On the read side the stage only participates in probing when the spec
//!   carries a magic prefix; a magic-less program can still be forced by
//!   explicit configuration on the write side.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use crate::filter::ProgramSpec;
use crate::stream::{ChainRead, ChainWrite, read_some};

const PUMP_BUF: usize = 16 * 1024;

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn poll_fds(fds: &mut [libc::pollfd]) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn spawn_child(spec: &ProgramSpec) -> io::Result<Child> {
    Command::new(&spec.command)
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
}

fn check_exit(child: &mut Child, command: &str) -> io::Result<()> {
    let status = child.wait()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("filter program '{command}' exited with {status}"),
        ))
    }
}

/// Decoding stage: feeds raw stream bytes to the child and serves its
/// stdout to the caller.
pub struct ProgramReadFilter {
    inner: Box<dyn ChainRead>,
    child: Child,
    command: String,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    feed: Vec<u8>,
    feed_pos: usize,
    feed_len: usize,
    in_eof: bool,
    reaped: bool,
}

impl ProgramReadFilter {
    pub fn spawn(spec: &ProgramSpec, inner: Box<dyn ChainRead>) -> io::Result<Self> {
        let mut child = spawn_child(spec)?;
        let stdin = child.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "filter program has no stdin")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "filter program has no stdout")
        })?;
        set_nonblocking(stdin.as_raw_fd())?;
        set_nonblocking(stdout.as_raw_fd())?;
        Ok(Self {
            inner,
            child,
            command: spec.command.clone(),
            stdin: Some(stdin),
            stdout,
            feed: vec![0; PUMP_BUF],
            feed_pos: 0,
            feed_len: 0,
            in_eof: false,
            reaped: false,
        })
    }

    /// Push pending raw bytes toward the child; closes its stdin at source
    /// EOF so the child can flush its trailer.
    fn pump_stdin(&mut self) -> io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        loop {
            if self.feed_pos == self.feed_len {
                if self.in_eof {
                    self.stdin = None;
                    return Ok(());
                }
                let n = read_some(&mut self.inner, &mut self.feed)?;
                if n == 0 {
                    self.in_eof = true;
                    self.stdin = None;
                    return Ok(());
                }
                self.feed_pos = 0;
                self.feed_len = n;
            }
            match stdin.write(&self.feed[self.feed_pos..self.feed_len]) {
                Ok(0) => {
                    // Child stopped reading; let stdout drain decide fate.
                    self.stdin = None;
                    return Ok(());
                }
                Ok(n) => self.feed_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    self.stdin = None;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn wait_ready(&mut self) -> io::Result<()> {
        let mut fds = Vec::with_capacity(2);
        fds.push(libc::pollfd {
            fd: self.stdout.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        if let Some(stdin) = &self.stdin {
            if self.feed_pos < self.feed_len || !self.in_eof {
                fds.push(libc::pollfd {
                    fd: stdin.as_raw_fd(),
                    events: libc::POLLOUT,
                    revents: 0,
                });
            }
        }
        poll_fds(&mut fds)
    }

    fn reap(&mut self) -> io::Result<()> {
        if self.reaped {
            return Ok(());
        }
        self.reaped = true;
        self.stdin = None;
        check_exit(&mut self.child, &self.command)
    }
}

impl Read for ProgramReadFilter {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        loop {
            match self.stdout.read(dst) {
                Ok(0) => {
                    self.reap()?;
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            self.pump_stdin()?;
            self.wait_ready()?;
        }
    }
}

impl ChainRead for ProgramReadFilter {
    #[inline(always)]
    fn take_raw_delta(&mut self) -> u64 {
        self.inner.take_raw_delta()
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.reaped {
            self.reaped = true;
            self.stdin = None;
            // Discard the exit status; the stream was abandoned mid-flight.
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        self.inner.close()
    }
}

impl Drop for ProgramReadFilter {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Encoding stage: caller bytes go to the child, child stdout goes to the
/// inner write stage.
pub struct ProgramWriteFilter {
    inner: Box<dyn ChainWrite>,
    child: Child,
    command: String,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    finished: bool,
}

impl ProgramWriteFilter {
    pub fn spawn(spec: &ProgramSpec, inner: Box<dyn ChainWrite>) -> io::Result<Self> {
        let mut child = spawn_child(spec)?;
        let stdin = child.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "filter program has no stdin")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "filter program has no stdout")
        })?;
        set_nonblocking(stdin.as_raw_fd())?;
        set_nonblocking(stdout.as_raw_fd())?;
        Ok(Self {
            inner,
            child,
            command: spec.command.clone(),
            stdin: Some(stdin),
            stdout: Some(stdout),
            finished: false,
        })
    }

    /// Move whatever the child has produced so far into the inner stage.
    fn drain_ready(&mut self) -> io::Result<()> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(());
        };
        let mut buf = [0u8; PUMP_BUF];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => {
                    self.stdout = None;
                    return Ok(());
                }
                Ok(n) => self.inner.write_all(&buf[..n])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn wait_writable(&mut self) -> io::Result<()> {
        let mut fds = Vec::with_capacity(2);
        if let Some(stdin) = &self.stdin {
            fds.push(libc::pollfd {
                fd: stdin.as_raw_fd(),
                events: libc::POLLOUT,
                revents: 0,
            });
        }
        if let Some(stdout) = &self.stdout {
            fds.push(libc::pollfd {
                fd: stdout.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }
        poll_fds(&mut fds)
    }
}

impl Write for ProgramWriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let Some(stdin) = self.stdin.as_mut() else {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "write after filter stage finished",
                ));
            };
            match stdin.write(buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "filter program stopped reading",
                    ))
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            self.drain_ready()?;
            self.wait_writable()?;
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_ready()?;
        self.inner.flush()
    }
}

impl ChainWrite for ProgramWriteFilter {
    #[inline]
    fn take_raw_delta(&mut self) -> u64 {
        self.inner.take_raw_delta()
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        // EOF on stdin tells the child to flush and exit.
        self.stdin = None;
        while self.stdout.is_some() {
            self.drain_ready()?;
            if self.stdout.is_some() {
                self.wait_writable()?;
            }
        }
        check_exit(&mut self.child, &self.command)?;
        self.inner.finish()
    }

    fn close(&mut self) -> io::Result<()> {
        self.finish()?;
        self.inner.close()
    }
}

impl Drop for ProgramWriteFilter {
    fn drop(&mut self) {
        if !self.finished {
            self.stdin = None;
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{ChainSink, ChainSource, IoSource, SinkWriter, SourceReader, VecSink};
    use std::io::Cursor;

    fn cat_spec() -> ProgramSpec {
        ProgramSpec {
            command: "cat".into(),
            args: vec![],
            magic: vec![],
        }
    }

    #[test]
    fn read_side_pipes_through_cat() {
        let data = b"hello through a pipe".to_vec();
        let base = SourceReader::new(Box::new(IoSource(Cursor::new(data.clone()))));
        let filter = ProgramReadFilter::spawn(&cat_spec(), Box::new(base)).unwrap();
        let mut chain = ChainSource::new(Box::new(filter));
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = chain.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
        assert_eq!(chain.raw_pos(), data.len() as u64);
        chain.close().unwrap();
    }

    #[test]
    fn read_side_survives_pipe_buffer_pressure() {
        // Larger than a default pipe buffer so the poll pump must alternate.
        let data: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
        let base = SourceReader::new(Box::new(IoSource(Cursor::new(data.clone()))));
        let mut filter = ProgramReadFilter::spawn(&cat_spec(), Box::new(base)).unwrap();
        let mut out = Vec::new();
        filter.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn write_side_pipes_through_cat() {
        let base = SinkWriter::new(Box::new(VecSink::default()));
        let filter = ProgramWriteFilter::spawn(&cat_spec(), Box::new(base)).unwrap();
        let mut chain = ChainSink::new(Box::new(filter));
        chain.write_all(b"written through a pipe").unwrap();
        chain.finish().unwrap();
        assert_eq!(chain.uncompressed_pos(), 22);
        assert_eq!(chain.raw_pos(), 22);
        chain.close().unwrap();
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let spec = ProgramSpec {
            command: "definitely-not-a-real-binary".into(),
            args: vec![],
            magic: vec![],
        };
        let base = SourceReader::new(Box::new(IoSource(Cursor::new(Vec::new()))));
        assert!(ProgramReadFilter::spawn(&spec, Box::new(base)).is_err());
    }
}
