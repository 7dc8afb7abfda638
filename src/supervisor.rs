//! Session wiring and exit coordination.
//!
//! [`run`] starts the producer, wraps the sink, spawns the relay and then
//! hands everything to [`supervise`], which joins the background tasks,
//! reaps the producer and turns its exit status into ours. Background tasks
//! never exit the process themselves: an unrecoverable condition comes back
//! as a [`Fatal`] and the first one observed decides the exit code.

use crate::config::{ConfigError, SendConfig};
use crate::relay::{Progress, Relay, RelayOutcome};
use crate::session::{self, LaunchedChild, SessionError};
use crate::sink;
use std::ffi::OsString;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tokio::process::Child;
use tokio::task::JoinSet;

/// Exit code for any fatal condition without a reserved code of its own.
pub const FATAL_EXIT_CODE: u8 = 1;
/// Exit code reserved for a broken sink-copy stage.
pub const SINK_COPY_EXIT_CODE: u8 = 11;

/// What a background task reports when it finishes without a fatal error.
#[derive(Debug)]
pub enum TaskReport {
    Relay(RelayOutcome),
    SinkCopy { bytes: u64 },
}

pub type TaskResult = Result<TaskReport, Fatal>;

/// Conditions that end the program immediately.
#[derive(Debug)]
pub enum Fatal {
    Config(ConfigError),
    Launch(SessionError),
    /// The sink could not be made deadline-capable.
    Sink(std::io::Error),
    /// A read returned no data without reaching EOF.
    ShortRead,
    /// A write failed for a reason other than its deadline.
    ShortWrite {
        written: usize,
        expected: usize,
        source: std::io::Error,
    },
    /// The producer could not be signalled.
    Kill { pid: i32, source: nix::errno::Errno },
    /// Copying from the in-process pipe to the real sink failed.
    SinkCopy { source: std::io::Error },
    /// Waiting on the producer failed.
    Wait(std::io::Error),
    TaskPanicked(String),
}

impl Fatal {
    pub fn exit_code(&self) -> u8 {
        match self {
            Fatal::SinkCopy { .. } => SINK_COPY_EXIT_CODE,
            _ => FATAL_EXIT_CODE,
        }
    }
}

impl std::fmt::Display for Fatal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fatal::Config(e) => write!(f, "{}", e),
            Fatal::Launch(e) => write!(f, "{}", e),
            Fatal::Sink(e) => write!(f, "failed setting write deadline on sink: {}", e),
            Fatal::ShortRead => write!(f, "short read"),
            Fatal::ShortWrite {
                written,
                expected,
                source,
            } => write!(f, "short write ({} of {} bytes): {}", written, expected, source),
            Fatal::Kill { pid, source } => write!(f, "failed to kill process {}: {}", pid, source),
            Fatal::SinkCopy { source } => write!(f, "copy to sink failed: {}", source),
            Fatal::Wait(e) => write!(f, "failed to wait for process: {}", e),
            Fatal::TaskPanicked(msg) => write!(f, "background task failed: {}", msg),
        }
    }
}

impl std::error::Error for Fatal {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Fatal::Config(e) => Some(e),
            Fatal::Launch(e) => Some(e),
            Fatal::Sink(e) | Fatal::Wait(e) => Some(e),
            Fatal::ShortWrite { source, .. } | Fatal::SinkCopy { source } => Some(source),
            Fatal::Kill { source, .. } => Some(source),
            Fatal::ShortRead | Fatal::TaskPanicked(_) => None,
        }
    }
}

/// Final disposition of a session.
#[derive(Debug)]
pub enum Verdict {
    /// The producer was reaped; carries its exit code.
    Exited(u8),
    Aborted(Fatal),
}

impl Verdict {
    pub fn code(&self) -> u8 {
        match self {
            Verdict::Exited(code) => *code,
            Verdict::Aborted(fatal) => fatal.exit_code(),
        }
    }
}

/// Map a child's exit status to our own: its code when it exited, or
/// `128 + signal` when a signal ended it.
pub fn exit_code(status: ExitStatus) -> u8 {
    match (status.code(), status.signal()) {
        (Some(code), _) => (code & 0xff) as u8,
        (None, Some(signal)) => (128 + signal).clamp(0, 255) as u8,
        (None, None) => FATAL_EXIT_CODE,
    }
}

/// Wait for every task in `tasks`, then for the producer.
///
/// The first fatal result aborts immediately: the producer is killed and the
/// remaining tasks are left behind.
pub async fn supervise(mut tasks: JoinSet<TaskResult>, child: &mut Child) -> Verdict {
    while let Some(joined) = tasks.join_next().await {
        let fatal = match joined {
            Ok(Ok(TaskReport::Relay(outcome))) => {
                tracing::debug!(?outcome, "relay finished");
                continue;
            }
            Ok(Ok(TaskReport::SinkCopy { bytes })) => {
                tracing::debug!(bytes, "sink copy stage finished");
                continue;
            }
            Ok(Err(fatal)) => fatal,
            Err(e) => Fatal::TaskPanicked(e.to_string()),
        };
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "producer already gone");
        }
        return Verdict::Aborted(fatal);
    }

    match child.wait().await {
        Ok(status) => {
            let code = exit_code(status);
            tracing::debug!(%status, code, "producer exited");
            Verdict::Exited(code)
        }
        Err(e) => Verdict::Aborted(Fatal::Wait(e)),
    }
}

/// Run one session: producer stdout relayed to `out` under stall deadlines.
pub async fn run(config: &SendConfig, passthrough: &[OsString], out: OwnedFd) -> Verdict {
    let LaunchedChild {
        mut child,
        output,
        killer,
    } = match session::launch(&config.child, passthrough) {
        Ok(launched) => launched,
        Err(e) => return Verdict::Aborted(Fatal::Launch(e)),
    };

    let mut tasks = JoinSet::new();
    let sink = match sink::wrap(out, config.relay.probe_timeout(), &mut tasks) {
        Ok(sink) => sink,
        Err(e) => {
            let _ = child.start_kill();
            return Verdict::Aborted(Fatal::Sink(e));
        }
    };

    let progress = Progress::default();
    let relay = Relay::new(output, sink, killer, progress.clone(), &config.relay);
    tasks.spawn(async move { relay.run().await.map(TaskReport::Relay) });

    let verdict = supervise(tasks, &mut child).await;
    tracing::debug!(bytes = progress.total(), code = verdict.code(), "session finished");
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChildConfig, RelayConfig};
    use std::fs::File;
    use std::io::Read;

    fn sh_config(inactivity_timeout_ms: u64) -> SendConfig {
        SendConfig {
            child: ChildConfig {
                command: "sh".to_string(),
                leading_args: vec!["-c".to_string()],
            },
            relay: RelayConfig {
                inactivity_timeout_ms,
                ..RelayConfig::default()
            },
        }
    }

    fn script(s: &str) -> Vec<OsString> {
        vec![OsString::from(s)]
    }

    #[test]
    fn test_exit_code_passes_through_normal_exit() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(42 << 8)), 42);
    }

    #[test]
    fn test_exit_code_for_signal_follows_shell_convention() {
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code(ExitStatus::from_raw(15)), 143);
    }

    #[test]
    fn test_fatal_exit_codes() {
        let copy = Fatal::SinkCopy {
            source: std::io::Error::other("broken"),
        };
        assert_eq!(copy.exit_code(), SINK_COPY_EXIT_CODE);
        assert_eq!(Fatal::ShortRead.exit_code(), FATAL_EXIT_CODE);
        assert_eq!(Verdict::Aborted(Fatal::ShortRead).code(), 1);
        assert_eq!(Verdict::Exited(7).code(), 7);
    }

    #[tokio::test]
    async fn test_supervise_propagates_child_exit_code() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "exit 7"])
            .spawn()
            .unwrap();
        let mut tasks = JoinSet::new();
        tasks.spawn(async { Ok(TaskReport::SinkCopy { bytes: 0 }) });

        let verdict = supervise(tasks, &mut child).await;
        assert!(matches!(verdict, Verdict::Exited(7)));
    }

    #[tokio::test]
    async fn test_supervise_aborts_on_fatal_and_kills_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let mut tasks = JoinSet::new();
        tasks.spawn(async {
            Err(Fatal::SinkCopy {
                source: std::io::Error::other("broken pipe"),
            })
        });

        let verdict = supervise(tasks, &mut child).await;
        assert_eq!(verdict.code(), SINK_COPY_EXIT_CODE);
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(9));
    }

    async fn exploding_task() -> TaskResult {
        panic!("relay blew up")
    }

    #[tokio::test]
    async fn test_supervise_treats_panic_as_fatal() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let mut tasks = JoinSet::new();
        tasks.spawn(exploding_task());

        let verdict = supervise(tasks, &mut child).await;
        assert!(matches!(verdict, Verdict::Aborted(Fatal::TaskPanicked(_))));
        assert_eq!(verdict.code(), FATAL_EXIT_CODE);
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_run_burst_into_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        let out = File::create(&path).unwrap();

        let verdict = run(
            &sh_config(10_000),
            &script("exec head -c 10485760 /dev/zero"),
            out.into(),
        )
        .await;

        assert!(matches!(verdict, Verdict::Exited(0)));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_run_into_pipe_sink() {
        let (mut reader, writer) = std::io::pipe().unwrap();
        let drain = std::thread::spawn(move || {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            out
        });

        let verdict = run(&sh_config(10_000), &script("printf 'pool/ds@snap'"), writer.into()).await;

        assert_eq!(verdict.code(), 0);
        assert_eq!(drain.join().unwrap(), b"pool/ds@snap");
    }

    #[tokio::test]
    async fn test_run_silent_producer_exits_with_kill_status() {
        let dir = tempfile::tempdir().unwrap();
        let out = File::create(dir.path().join("stream.bin")).unwrap();

        let verdict = run(&sh_config(300), &script("printf x; exec sleep 30"), out.into()).await;

        assert!(matches!(verdict, Verdict::Exited(137)));
    }

    #[tokio::test]
    async fn test_run_immediate_failure_propagates_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        let out = File::create(&path).unwrap();

        let verdict = run(&sh_config(10_000), &script("exit 4"), out.into()).await;

        assert!(matches!(verdict, Verdict::Exited(4)));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_run_spawn_failure_is_fatal() {
        let mut config = sh_config(10_000);
        config.child.command = "nonexistent-binary-xyz".to_string();
        let dir = tempfile::tempdir().unwrap();
        let out = File::create(dir.path().join("stream.bin")).unwrap();

        let verdict = run(&config, &[], out.into()).await;

        assert!(matches!(verdict, Verdict::Aborted(Fatal::Launch(_))));
        assert_eq!(verdict.code(), FATAL_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_run_broken_sink_copy_uses_reserved_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readonly.bin");
        std::fs::write(&path, b"").unwrap();
        let read_only = File::open(&path).unwrap();

        let verdict = run(&sh_config(10_000), &script("printf hello"), read_only.into()).await;

        assert!(matches!(verdict, Verdict::Aborted(Fatal::SinkCopy { .. })));
        assert_eq!(verdict.code(), SINK_COPY_EXIT_CODE);
    }
}
