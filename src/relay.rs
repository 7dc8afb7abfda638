/// Stall-guarded relay: copy the producer's stdout to the sink one chunk at a
/// time, re-arming an inactivity deadline before every read and every write.
///
/// A read that misses its deadline means the producer went silent: the
/// producer is killed and the relay stops. A write that misses its deadline
/// means the consumer went silent: the producer is killed but the loop keeps
/// going, so the next read drains what is left and then sees EOF.
use crate::config::RelayConfig;
use crate::deadline::{is_deadline_exceeded, DeadlineReader, DeadlineWriter};
use crate::session::ChildKiller;
use crate::supervisor::Fatal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Running total of bytes read from the producer.
///
/// Written only by the relay; any number of readers may load it.
#[derive(Debug, Clone, Default)]
pub struct Progress(Arc<AtomicU64>);

impl Progress {
    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// How a relay that did not hit a fatal condition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Producer reached EOF with every write delivered in time.
    Completed,
    /// Producer was silent past the deadline and was killed.
    SourceStalled,
    /// A write missed its deadline; the producer was killed and the loop ran to EOF.
    SinkStalled,
    /// A read failed for a reason other than the deadline.
    ReadFailed,
}

pub struct Relay {
    source: DeadlineReader,
    sink: DeadlineWriter,
    killer: ChildKiller,
    progress: Progress,
    chunk_size: usize,
    inactivity_timeout: Duration,
}

impl Relay {
    pub fn new(
        source: DeadlineReader,
        sink: DeadlineWriter,
        killer: ChildKiller,
        progress: Progress,
        config: &RelayConfig,
    ) -> Self {
        Self {
            source,
            sink,
            killer,
            progress,
            chunk_size: config.chunk_size,
            inactivity_timeout: config.inactivity_timeout(),
        }
    }

    /// Drive the copy loop until EOF, a stall, or a fatal condition.
    ///
    /// The sink is closed when this returns, whatever the outcome.
    pub async fn run(self) -> Result<RelayOutcome, Fatal> {
        let Relay {
            mut source,
            mut sink,
            killer,
            progress,
            chunk_size,
            inactivity_timeout,
        } = self;

        let mut buf = vec![0u8; chunk_size];
        let mut sink_stalled = false;

        loop {
            source.set_read_deadline(Instant::now() + inactivity_timeout);
            let n = match source.read(&mut buf).await {
                // An empty buffer can never observe EOF.
                Ok(0) if buf.is_empty() => return Err(Fatal::ShortRead),
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if is_deadline_exceeded(&e) => {
                    warn!(
                        bytes = progress.total(),
                        pid = killer.pid(),
                        "timeout on read, killing process after {} successful bytes read",
                        progress.total()
                    );
                    kill(&killer)?;
                    return Ok(RelayOutcome::SourceStalled);
                }
                Err(e) => {
                    warn!(error = %e, bytes = progress.total(), "read from producer failed");
                    return Ok(RelayOutcome::ReadFailed);
                }
            };

            progress.add(n as u64);

            sink.set_write_deadline(Instant::now() + inactivity_timeout);
            if let Err(e) = sink.write_all(&buf[..n]).await {
                if !e.is_deadline_exceeded() {
                    return Err(Fatal::ShortWrite {
                        written: e.written,
                        expected: n,
                        source: e.source,
                    });
                }
                warn!(
                    written = e.written,
                    expected = n,
                    pid = killer.pid(),
                    "timeout on write, killing process"
                );
                kill(&killer)?;
                sink_stalled = true;
            }
        }

        drop(sink);
        debug!(bytes = progress.total(), sink_stalled, "producer reached end of stream");
        Ok(if sink_stalled {
            RelayOutcome::SinkStalled
        } else {
            RelayOutcome::Completed
        })
    }
}

fn kill(killer: &ChildKiller) -> Result<(), Fatal> {
    killer.kill().map_err(|e| Fatal::Kill {
        pid: killer.pid(),
        source: e,
    })
}
