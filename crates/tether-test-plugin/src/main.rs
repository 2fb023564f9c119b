//! Binary entrypoint for the tether test plugin.

use std::io::{self, IsTerminal, Write};
use std::process::ExitCode;

use tether_config::{LogFormat, env};
use tether_test_plugin::{Mode, run};
use tracing_subscriber::EnvFilter;

/// Variable overriding the plugin's log filter.
const LOG_ENV: &str = "TETHER_TEST_PLUGIN_LOG";

fn main() -> ExitCode {
    // Stdout carries the handshake, so logs go to stderr where the host
    // forwards them.
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match LogFormat::requested(std::env::var(env::LOG_FORMAT).ok().as_deref()) {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.with_ansi(io::stderr().is_terminal()).init(),
    }

    let raw = std::env::args().nth(1).unwrap_or_else(|| "serve".to_owned());
    let mode = match raw.parse::<Mode>() {
        Ok(mode) => mode,
        Err(error) => {
            writeln!(io::stderr().lock(), "{error}").ok();
            return ExitCode::from(2);
        }
    };
    match run(mode, &mut io::stdout().lock()) {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            writeln!(io::stderr().lock(), "{error}").ok();
            ExitCode::FAILURE
        }
    }
}
