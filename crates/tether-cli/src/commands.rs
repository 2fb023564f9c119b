//! Implementations of the `launch`, `probe`, and `stop` commands.

use std::any::Any;
use std::fs;
use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8Path;
use tether::rpc::CONTROL_SERVICE;
use tether::{
    Client, ClientConfig, ClientError, Context, HandshakeConfig, Plugin, PluginCommand,
    PluginSet, ReattachConfig, RpcCaller, Timeouts,
};
use tether_config::{LogFormat, env};
use tracing::info;

use crate::cli::LaunchArgs;
use crate::errors::AppError;

const COMMAND_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::commands");

/// How often `launch` checks for signals while the plugin runs.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Dispenses a bare caller for the control service.
struct ControlCapability;

impl Plugin for ControlCapability {
    fn client(&self, caller: RpcCaller) -> Box<dyn Any + Send> {
        Box::new(caller)
    }
}

fn operator_plugins() -> PluginSet {
    PluginSet::new().with(CONTROL_SERVICE, ControlCapability)
}

pub(crate) fn launch<W: Write>(
    args: &LaunchArgs,
    log_format: LogFormat,
    stdout: &mut W,
) -> Result<ExitCode, AppError> {
    let Some((program, rest)) = args.command.split_first() else {
        return Err(AppError::MissingProgram);
    };
    let handshake = HandshakeConfig::new(
        args.app_version,
        args.cookie_key.clone().unwrap_or_default(),
        args.cookie_value.clone().unwrap_or_default(),
    );
    let timeouts = args
        .startup_timeout_ms
        .map_or_else(Timeouts::default, |ms| {
            Timeouts::default().with_startup(Duration::from_millis(ms))
        });
    let command = PluginCommand::new(program)
        .args(rest)
        .env(env::LOG_FORMAT, log_format.to_string());
    let mut config = ClientConfig::for_command(command)
        .with_handshake(handshake)
        .with_plugins(operator_plugins())
        .with_timeouts(timeouts)
        .with_detached_session(args.detach);
    if let Some(log) = &args.plugin_log {
        config = config.with_stderr_log(log.clone());
    }

    let client = Client::new(config);
    client.start(&Context::background())?;
    let outcome = client
        .reattach_config()
        .ok_or(AppError::MissingDescriptor)
        .and_then(|descriptor| {
            let owned = descriptor.with_ownership(args.detach);
            write_descriptor(&owned, args.output.as_deref(), stdout)?;
            Ok(owned)
        });
    let descriptor = match outcome {
        Ok(descriptor) => descriptor,
        Err(error) => {
            client.kill(&Context::background());
            return Err(error);
        }
    };

    if args.detach {
        info!(target: COMMAND_TARGET, pid = descriptor.pid(), "plugin left running");
        return Ok(ExitCode::SUCCESS);
    }
    let waited = wait_for_shutdown(&client);
    client.kill(&Context::background());
    waited?;
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn probe<W: Write>(path: &Utf8Path, stdout: &mut W) -> Result<ExitCode, AppError> {
    let descriptor = read_descriptor(path)?.with_ownership(false);
    let client = Client::new(reattach_config(&descriptor));
    match client.start(&Context::background()) {
        Ok(rpc) => {
            let answered = rpc.ping();
            client.kill(&Context::background());
            answered.map_err(ClientError::from)?;
            writeln!(
                stdout,
                "plugin {} is alive at {} (protocol {}, app version {})",
                descriptor.pid(),
                descriptor.endpoint(),
                descriptor.protocol(),
                descriptor.app_version()
            )?;
            Ok(ExitCode::SUCCESS)
        }
        Err(ClientError::ProcessNotAlive { pid }) => {
            writeln!(stdout, "plugin {pid} is not running")?;
            Ok(ExitCode::FAILURE)
        }
        Err(error) => Err(error.into()),
    }
}

pub(crate) fn stop<W: Write>(path: &Utf8Path, stdout: &mut W) -> Result<ExitCode, AppError> {
    let descriptor = read_descriptor(path)?.with_ownership(true);
    let client = Client::new(reattach_config(&descriptor));
    match client.start(&Context::background()) {
        Ok(_) => {
            client.kill(&Context::background());
            writeln!(stdout, "stopped plugin {}", descriptor.pid())?;
        }
        Err(ClientError::ProcessNotAlive { pid }) => {
            writeln!(stdout, "plugin {pid} is not running")?;
        }
        Err(error) => return Err(error.into()),
    }
    Ok(ExitCode::SUCCESS)
}

fn reattach_config(descriptor: &ReattachConfig) -> ClientConfig {
    ClientConfig::for_reattach(descriptor.clone())
        .with_versioned_plugins(descriptor.app_version(), operator_plugins())
}

fn read_descriptor(path: &Utf8Path) -> Result<ReattachConfig, AppError> {
    let raw = fs::read_to_string(path).map_err(|source| AppError::ReadDescriptor {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| AppError::ParseDescriptor {
        path: path.to_owned(),
        source,
    })
}

fn write_descriptor<W: Write>(
    descriptor: &ReattachConfig,
    output: Option<&Utf8Path>,
    stdout: &mut W,
) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(descriptor).map_err(AppError::SerialiseDescriptor)?;
    if let Some(path) = output {
        return fs::write(path, format!("{json}\n")).map_err(|source| AppError::WriteDescriptor {
            path: path.to_owned(),
            source,
        });
    }
    writeln!(stdout, "{json}")?;
    stdout.flush()?;
    Ok(())
}

/// Blocks until the plugin exits or the operator sends SIGINT or SIGTERM.
#[cfg(unix)]
fn wait_for_shutdown(client: &Client) -> Result<(), AppError> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(AppError::Signals)?;
    loop {
        if client.wait_exited(SHUTDOWN_POLL) {
            info!(target: COMMAND_TARGET, "plugin exited on its own");
            return Ok(());
        }
        if let Some(signal) = signals.pending().next() {
            info!(target: COMMAND_TARGET, signal, "shutdown signal received");
            return Ok(());
        }
    }
}

#[cfg(not(unix))]
fn wait_for_shutdown(client: &Client) -> Result<(), AppError> {
    client.wait();
    Ok(())
}
