//! Command-line interface definitions for the `tether` operator tool.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use tether_config::LogFormat;

/// Operator tool for launching, probing, and stopping tether plugins.
#[derive(Parser, Debug)]
#[command(name = "tether", disable_help_subcommand = true)]
pub(crate) struct Cli {
    /// Tracing filter directive for the tool's own logs.
    #[arg(long, global = true, default_value = "info")]
    pub(crate) log_filter: String,
    /// Log output format.
    #[arg(long, global = true, default_value_t = LogFormat::Compact)]
    pub(crate) log_format: LogFormat,
    /// The lifecycle command to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Lifecycle commands.
#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Starts a plugin and writes its reattach descriptor.
    Launch(LaunchArgs),
    /// Reattaches to a plugin and reports whether it answers.
    Probe {
        /// Path to a descriptor written by `launch`.
        descriptor: Utf8PathBuf,
    },
    /// Reattaches to a plugin and shuts it down.
    Stop {
        /// Path to a descriptor written by `launch`.
        descriptor: Utf8PathBuf,
    },
}

/// Arguments for `tether launch`.
#[derive(Args, Debug, Clone)]
pub(crate) struct LaunchArgs {
    /// Leave the plugin running in its own session and exit immediately.
    #[arg(long)]
    pub(crate) detach: bool,
    /// Application protocol version the host speaks.
    #[arg(long, default_value_t = 1)]
    pub(crate) app_version: u32,
    /// Environment variable carrying the magic cookie.
    #[arg(long, requires = "cookie_value")]
    pub(crate) cookie_key: Option<String>,
    /// Value of the magic cookie.
    #[arg(long, requires = "cookie_key")]
    pub(crate) cookie_value: Option<String>,
    /// Write the descriptor here instead of stdout.
    #[arg(long)]
    pub(crate) output: Option<Utf8PathBuf>,
    /// Append the plugin's stderr to this file instead of relaying it.
    #[arg(long)]
    pub(crate) plugin_log: Option<Utf8PathBuf>,
    /// Milliseconds to wait for the plugin's handshake.
    #[arg(long)]
    pub(crate) startup_timeout_ms: Option<u64>,
    /// Plugin program followed by its arguments.
    #[arg(
        value_name = "PROGRAM",
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub(crate) command: Vec<String>,
}
