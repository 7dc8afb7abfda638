mod config;
mod deadline;
mod relay;
mod session;
mod sink;
mod supervisor;

use clap::Parser;
use config::SendConfig;
use std::ffi::OsString;
use std::os::fd::AsFd;
use supervisor::{Fatal, Verdict};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter (e.g. `debug`, `zfssend=warn`).
const LOG_ENV: &str = "ZFSSEND_LOG";

/// Run `zfs send` with the given arguments and relay its stream to stdout,
/// killing it if either the stream or the consumer stalls.
///
/// Every argument is passed through to `zfs send` unchanged.
#[derive(Parser, Debug)]
#[command(
    name = "zfssend",
    about,
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct Cli {
    /// Arguments appended to `zfs send`
    #[arg(
        value_name = "ZFS_SEND_ARGS",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    args: Vec<OsString>,
}

fn init_logging() {
    // stdout carries the stream, so diagnostics go to stderr.
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

async fn run_main(cli: &Cli) -> Verdict {
    let config = match SendConfig::load() {
        Ok(config) => config,
        Err(e) => return Verdict::Aborted(Fatal::Config(e)),
    };
    tracing::debug!(?config, ?cli, "resolved configuration");

    let out = match std::io::stdout().as_fd().try_clone_to_owned() {
        Ok(fd) => fd,
        Err(e) => return Verdict::Aborted(Fatal::Sink(e)),
    };
    supervisor::run(&config, &cli.args, out).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let verdict = run_main(&cli).await;
    if let Verdict::Aborted(fatal) = &verdict {
        tracing::error!(error = %fatal, "aborting");
    }
    // Exit without waiting on a copy stage that may still be blocked on the sink.
    std::process::exit(i32::from(verdict.code()));
}
