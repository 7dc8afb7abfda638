//! Pipe handles with rolling read/write deadlines.
//!
//! A deadline is an absolute instant stored on the handle and applied to the
//! next read or write. When it passes before the operation completes, the
//! operation fails with a `TimedOut` error (see [`is_deadline_exceeded`]).
//! Whether a descriptor can carry a deadline at all is decided once, when the
//! handle is constructed: only pipes and FIFOs can be registered with the
//! reactor, so anything else is rejected there.

use std::future::Future;
use std::io;
use std::os::fd::OwnedFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::time::Instant;

const DEADLINE_EXCEEDED: &str = "i/o deadline exceeded";

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, DEADLINE_EXCEEDED)
}

/// True when `err` was produced by an expired deadline.
pub fn is_deadline_exceeded(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

async fn with_deadline<T, F>(deadline: Option<Instant>, op: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, op)
            .await
            .unwrap_or_else(|_| Err(deadline_exceeded())),
        None => op.await,
    }
}

/// Read end of a pipe with a settable read deadline.
#[derive(Debug)]
pub struct DeadlineReader {
    inner: pipe::Receiver,
    deadline: Option<Instant>,
}

impl DeadlineReader {
    /// Register a pipe read end with the reactor. Fails if `fd` is not a pipe
    /// or FIFO open for reading.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            inner: pipe::Receiver::from_owned_fd(fd)?,
            deadline: None,
        })
    }

    pub fn set_read_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` on a non-empty buffer is EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let inner = &mut self.inner;
        with_deadline(self.deadline, inner.read(buf)).await
    }
}

/// A write that failed after `written` bytes had been accepted.
#[derive(Debug)]
pub struct ShortWrite {
    pub written: usize,
    pub source: io::Error,
}

impl ShortWrite {
    pub fn is_deadline_exceeded(&self) -> bool {
        is_deadline_exceeded(&self.source)
    }
}

impl std::fmt::Display for ShortWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "write failed after {} bytes: {}", self.written, self.source)
    }
}

impl std::error::Error for ShortWrite {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Write end of a pipe with a settable write deadline.
#[derive(Debug)]
pub struct DeadlineWriter {
    inner: pipe::Sender,
    deadline: Option<Instant>,
}

impl DeadlineWriter {
    /// Register a pipe write end with the reactor. Fails if `fd` is not a pipe
    /// or FIFO open for writing; this is the capability probe used by the sink
    /// adapter.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            inner: pipe::Sender::from_owned_fd(fd)?,
            deadline: None,
        })
    }

    pub fn set_write_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Write all of `buf` before the current deadline.
    ///
    /// On failure the returned [`ShortWrite`] reports how many bytes the pipe
    /// accepted before the error or the deadline.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), ShortWrite> {
        let mut written = 0;
        let inner = &mut self.inner;
        let result = with_deadline(self.deadline, async {
            while written < buf.len() {
                match inner.write(&buf[written..]).await {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
        .await;
        result.map_err(|source| ShortWrite { written, source })
    }
}
