//! CLI entrypoint for the tether operator tool.
//!
//! The binary delegates to [`tether_cli::run`], which parses arguments,
//! installs telemetry, and drives the requested plugin lifecycle command.

use std::io::{self, StderrLock, StdoutLock};
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut stdout: StdoutLock<'_> = io::stdout().lock();
    let mut stderr: StderrLock<'_> = io::stderr().lock();
    tether_cli::run(std::env::args_os(), &mut stdout, &mut stderr)
}
