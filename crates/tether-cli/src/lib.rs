//! Operator tool for tether plugins.
//!
//! `tether launch` starts a plugin binary, completes the handshake, and
//! writes the plugin's reattach descriptor as JSON. `tether probe` and
//! `tether stop` read such a descriptor back, reattach to the running
//! plugin, and report on it or shut it down. The operator never needs to
//! know the plugin's capabilities: the tool only speaks the built-in
//! control service every plugin exposes.

mod cli;
mod commands;
mod errors;
pub mod telemetry;

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;

use clap::Parser;

use crate::cli::{Cli, Command};
use crate::errors::AppError;

/// Exit status clap uses for usage errors.
const USAGE_EXIT: u8 = 2;

/// Parses `args`, installs telemetry, and runs the requested command.
///
/// Descriptors and status lines go to `stdout`; diagnostics go to `stderr`.
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) if error.use_stderr() => {
            write!(stderr, "{error}").ok();
            return ExitCode::from(USAGE_EXIT);
        }
        Err(error) => {
            write!(stdout, "{error}").ok();
            return ExitCode::SUCCESS;
        }
    };
    match execute(&cli, stdout) {
        Ok(code) => code,
        Err(error) => {
            writeln!(stderr, "tether: {error}").ok();
            ExitCode::FAILURE
        }
    }
}

fn execute<W: Write>(cli: &Cli, stdout: &mut W) -> Result<ExitCode, AppError> {
    telemetry::initialise(&cli.log_filter, cli.log_format)?;
    match &cli.command {
        Command::Launch(args) => commands::launch(args, cli.log_format, stdout),
        Command::Probe { descriptor } => commands::probe(descriptor, stdout),
        Command::Stop { descriptor } => commands::stop(descriptor, stdout),
    }
}
