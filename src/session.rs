/// Producer lifecycle: create the output pipe, spawn the producer with the pipe
/// as its stdout, and hand back the pipe's read end plus a way to kill it.
use crate::config::ChildConfig;
use crate::deadline::DeadlineReader;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// A started producer.
#[derive(Debug)]
pub struct LaunchedChild {
    /// Owned by the coordinator, which is the only place the child is reaped.
    pub child: Child,
    /// Read end of the producer's stdout pipe.
    pub output: DeadlineReader,
    pub killer: ChildKiller,
}

/// Sends SIGKILL to the producer by pid.
///
/// Safe to use until the coordinator waits on the child: an unreaped child
/// keeps its pid even after it has exited.
#[derive(Debug, Clone, Copy)]
pub struct ChildKiller {
    pid: Pid,
}

impl ChildKiller {
    pub fn new(pid: u32) -> Self {
        Self {
            pid: Pid::from_raw(pid as i32),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn kill(&self) -> nix::Result<()> {
        kill(self.pid, Signal::SIGKILL)
    }
}

/// Errors that can occur while starting the producer.
#[derive(Debug)]
pub enum SessionError {
    /// Failed to create the stdout pipe.
    Pipe { source: std::io::Error },
    /// Failed to register the pipe's read end for timed reads.
    Register { source: std::io::Error },
    /// Failed to spawn the producer.
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Pipe { source } => {
                write!(f, "failed to create output pipe: {}", source)
            }
            SessionError::Register { source } => {
                write!(f, "failed setting read deadline on output pipe: {}", source)
            }
            SessionError::Spawn { command, source } => {
                write!(f, "failed to spawn {}: {}", command, source)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Pipe { source } => Some(source),
            SessionError::Register { source } => Some(source),
            SessionError::Spawn { source, .. } => Some(source),
        }
    }
}

/// Leading arguments followed by the pass-through arguments, verbatim.
fn build_args(config: &ChildConfig, passthrough: &[OsString]) -> Vec<OsString> {
    config
        .leading_args
        .iter()
        .map(OsString::from)
        .chain(passthrough.iter().cloned())
        .collect()
}

/// Spawn the producer with stdin and stderr inherited and stdout on a fresh pipe.
///
/// Must be called from within a tokio runtime.
pub fn launch(config: &ChildConfig, passthrough: &[OsString]) -> Result<LaunchedChild, SessionError> {
    let (reader, writer) = std::io::pipe().map_err(|e| SessionError::Pipe { source: e })?;
    let output = DeadlineReader::from_owned_fd(reader.into())
        .map_err(|e| SessionError::Register { source: e })?;

    let args = build_args(config, passthrough);
    tracing::debug!(command = %config.command, args = ?args, "spawning producer");

    let mut command = Command::new(&config.command);
    command
        .args(&args)
        .stdin(Stdio::inherit())
        .stdout(writer)
        .stderr(Stdio::inherit());

    let child = command.spawn().map_err(|e| SessionError::Spawn {
        command: config.command.clone(),
        source: e,
    })?;
    // The command still holds our copy of the write end. Close it so the
    // reader sees EOF as soon as the child closes its stdout.
    drop(command);

    let pid = child.id().ok_or_else(|| SessionError::Spawn {
        command: config.command.clone(),
        source: std::io::Error::other("child was reaped before its pid was read"),
    })?;
    tracing::debug!(pid, "producer started");

    Ok(LaunchedChild {
        child,
        output,
        killer: ChildKiller::new(pid),
    })
}
