//! Deadline-capable sink adapter.
//!
//! The relay needs to put a deadline on every write. Pipes and FIFOs support
//! that directly. Anything else (a regular file, a tty, `/dev/null`) is fed
//! through an in-process pipe whose read end is copied to the real sink by a
//! blocking task with no deadline on the copy.

use crate::deadline::DeadlineWriter;
use crate::supervisor::{Fatal, TaskReport, TaskResult};
use std::fs::File;
use std::io::{self, PipeReader, Write};
use std::os::fd::OwnedFd;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Return a handle on which write deadlines always work.
///
/// If `out` itself can take a deadline it is returned as-is. Otherwise a
/// copy task is spawned onto `tasks`; its failure surfaces there as
/// [`Fatal::SinkCopy`].
pub fn wrap(
    out: OwnedFd,
    probe_timeout: Duration,
    tasks: &mut JoinSet<TaskResult>,
) -> io::Result<DeadlineWriter> {
    match out.try_clone().and_then(DeadlineWriter::from_owned_fd) {
        Ok(mut direct) => {
            direct.set_write_deadline(Instant::now() + probe_timeout);
            tracing::debug!("sink supports write deadlines");
            return Ok(direct);
        }
        Err(e) => {
            tracing::debug!(error = %e, "sink rejects write deadlines, copying through a pipe");
        }
    }

    let (reader, writer) = std::io::pipe()?;
    let mut relayed = DeadlineWriter::from_owned_fd(writer.into())?;
    relayed.set_write_deadline(Instant::now() + probe_timeout);

    let out = File::from(out);
    tasks.spawn_blocking(move || copy_to_sink(reader, out));
    Ok(relayed)
}

fn copy_to_sink(mut reader: PipeReader, mut out: File) -> TaskResult {
    let copied = io::copy(&mut reader, &mut out).and_then(|bytes| {
        out.flush()?;
        Ok(bytes)
    });
    copied
        .map(|bytes| TaskReport::SinkCopy { bytes })
        .map_err(|e| Fatal::SinkCopy { source: e })
}
