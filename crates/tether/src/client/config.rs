//! Client configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Command;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tether_config::{Timeouts, env};

use crate::error::ConfigError;
use crate::handshake::{CORE_PROTOCOL_VERSION, HandshakeConfig, ProtocolKind};
use crate::negotiator::{DialPolicy, TlsUpgrade};
use crate::reattach::ReattachConfig;
use crate::registry::ClientRegistry;
use crate::rpc::PluginSet;
use crate::session::{Detacher, NoDetach, platform_detacher};
use crate::supervisor::{LivenessProbe, OutputSink, OutputSinks, SignalProbe};

/// Command template for spawning a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    current_dir: Option<Utf8PathBuf>,
}

impl PluginCommand {
    /// Runs `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the plugin. Applied after the
    /// negotiation variables, so it can override them.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Program to run.
    #[must_use]
    pub const fn program(&self) -> &str {
        self.program.as_str()
    }
}

/// Configuration for one [`Client`](super::Client).
///
/// Exactly one of a [`PluginCommand`] and a [`ReattachConfig`] must be set.
///
/// # Example
///
/// ```
/// use tether::{ClientConfig, PluginCommand, PluginSet};
/// use tether::handshake::HandshakeConfig;
///
/// let config = ClientConfig::for_command(PluginCommand::new("/usr/libexec/kv-plugin"))
///     .with_handshake(HandshakeConfig::new(1, "KV_PLUGIN", "a8c1f0"))
///     .with_plugins(PluginSet::new());
/// assert!(config.validate().is_err(), "an empty plugin set is rejected");
/// ```
#[derive(Clone, Default)]
pub struct ClientConfig {
    command: Option<PluginCommand>,
    reattach: Option<ReattachConfig>,
    handshake: HandshakeConfig,
    plugins: Option<PluginSet>,
    versioned_plugins: BTreeMap<u32, PluginSet>,
    allowed_protocols: Option<Vec<ProtocolKind>>,
    core_versions: Option<Vec<u32>>,
    timeouts: Timeouts,
    detach_session: bool,
    detacher: Option<Arc<dyn Detacher>>,
    liveness_probe: Option<Arc<dyn LivenessProbe>>,
    sinks: OutputSinks,
    skip_host_env: bool,
    registry: Option<ClientRegistry>,
    port_range: Option<(u16, u16)>,
    unix_socket_dir: Option<Utf8PathBuf>,
    tls: Option<Arc<dyn TlsUpgrade>>,
}

impl ClientConfig {
    /// A client that spawns `command`.
    #[must_use]
    pub fn for_command(command: PluginCommand) -> Self {
        Self::default().with_command(command)
    }

    /// A client that attaches to the plugin described by `reattach`.
    #[must_use]
    pub fn for_reattach(reattach: ReattachConfig) -> Self {
        Self::default().with_reattach(reattach)
    }

    /// Sets the command to spawn.
    #[must_use]
    pub fn with_command(mut self, command: PluginCommand) -> Self {
        self.command = Some(command);
        self
    }

    /// Sets the reattach descriptor.
    #[must_use]
    pub fn with_reattach(mut self, reattach: ReattachConfig) -> Self {
        self.reattach = Some(reattach);
        self
    }

    /// Sets the handshake policy.
    #[must_use]
    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    /// Plugins understood at the handshake's application version.
    #[must_use]
    pub fn with_plugins(mut self, plugins: PluginSet) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Plugins understood at a specific application version. Once any
    /// versioned set is given, [`ClientConfig::with_plugins`] is ignored.
    #[must_use]
    pub fn with_versioned_plugins(mut self, app_version: u32, plugins: PluginSet) -> Self {
        self.versioned_plugins.insert(app_version, plugins);
        self
    }

    /// Protocols the host accepts. Defaults to JSON-lines RPC only.
    #[must_use]
    pub fn with_allowed_protocols(mut self, protocols: impl Into<Vec<ProtocolKind>>) -> Self {
        self.allowed_protocols = Some(protocols.into());
        self
    }

    /// Core protocol versions the host accepts.
    #[must_use]
    pub fn with_core_versions(mut self, versions: impl Into<Vec<u32>>) -> Self {
        self.core_versions = Some(versions.into());
        self
    }

    /// Overrides the timing policy.
    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Starts the plugin in its own session so it can outlive the host.
    #[must_use]
    pub const fn with_detached_session(mut self, detach: bool) -> Self {
        self.detach_session = detach;
        self
    }

    /// Replaces the platform detacher.
    #[must_use]
    pub fn with_detacher(mut self, detacher: Arc<dyn Detacher>) -> Self {
        self.detacher = Some(detacher);
        self
    }

    /// Replaces the signal probe used for reattached processes.
    #[must_use]
    pub fn with_liveness_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.liveness_probe = Some(probe);
        self
    }

    /// Copies plugin stdout lines after the handshake into `sink`.
    #[must_use]
    pub fn with_stdout_sink(mut self, sink: OutputSink) -> Self {
        self.sinks.stdout = Some(sink);
        self
    }

    /// Copies plugin stderr lines into `sink`.
    #[must_use]
    pub fn with_stderr_sink(mut self, sink: OutputSink) -> Self {
        self.sinks.stderr = Some(sink);
        self
    }

    /// Writes plugin stderr straight to the file at `path`, appending, instead
    /// of piping it through the host. Stderr sinks see nothing in that case.
    /// Detached plugins that keep logging after the host exits want this.
    #[must_use]
    pub fn with_stderr_log(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.sinks.stderr_log = Some(path.into());
        self
    }

    /// Starts the plugin without inheriting the host environment.
    #[must_use]
    pub const fn with_skip_host_env(mut self, skip: bool) -> Self {
        self.skip_host_env = skip;
        self
    }

    /// Registers the client in `registry` once it connects.
    #[must_use]
    pub fn with_registry(mut self, registry: ClientRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Restricts the ports a TCP plugin may bind.
    #[must_use]
    pub const fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.port_range = Some((min, max));
        self
    }

    /// Directory a Unix socket plugin should listen in.
    #[must_use]
    pub fn with_unix_socket_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.unix_socket_dir = Some(dir.into());
        self
    }

    /// TLS upgrade used when the plugin announces a certificate.
    #[must_use]
    pub fn with_tls(mut self, tls: Arc<dyn TlsUpgrade>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Checks the configuration without starting anything.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.command, &self.reattach) {
            (None, None) => return Err(ConfigError::MissingSource),
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingSource),
            _ => {}
        }
        if self.plugin_sets().values().all(PluginSet::is_empty) {
            return Err(ConfigError::EmptyPluginSet);
        }
        if self.allowed_protocols().is_empty() {
            return Err(ConfigError::NoAllowedProtocols);
        }
        if self.core_versions().is_empty() {
            return Err(ConfigError::NoCoreVersions);
        }
        if let Some((min, max)) = self.port_range
            && min > max
        {
            return Err(ConfigError::InvalidPortRange { min, max });
        }
        Ok(())
    }

    /// Handshake policy.
    #[must_use]
    pub const fn handshake(&self) -> &HandshakeConfig {
        &self.handshake
    }

    /// Timing policy.
    #[must_use]
    pub const fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Reattach descriptor, if the client attaches rather than spawns.
    #[must_use]
    pub const fn reattach(&self) -> Option<&ReattachConfig> {
        self.reattach.as_ref()
    }

    pub(crate) const fn command(&self) -> Option<&PluginCommand> {
        self.command.as_ref()
    }

    pub(crate) const fn registry(&self) -> Option<&ClientRegistry> {
        self.registry.as_ref()
    }

    pub(crate) const fn sinks(&self) -> &OutputSinks {
        &self.sinks
    }

    pub(crate) fn allowed_protocols(&self) -> &[ProtocolKind] {
        self.allowed_protocols
            .as_deref()
            .unwrap_or(&[ProtocolKind::NetRpc])
    }

    pub(crate) fn core_versions(&self) -> &[u32] {
        self.core_versions
            .as_deref()
            .unwrap_or(&[CORE_PROTOCOL_VERSION])
    }

    /// Plugin sets keyed by application version.
    pub(crate) fn plugin_sets(&self) -> BTreeMap<u32, PluginSet> {
        if !self.versioned_plugins.is_empty() {
            return self.versioned_plugins.clone();
        }
        self.plugins
            .iter()
            .map(|plugins| (self.handshake.app_version(), plugins.clone()))
            .collect()
    }

    pub(crate) fn detacher(&self) -> Arc<dyn Detacher> {
        match (&self.detacher, self.detach_session) {
            (Some(detacher), _) => Arc::clone(detacher),
            (None, true) => platform_detacher(),
            (None, false) => Arc::new(NoDetach),
        }
    }

    pub(crate) fn liveness_probe(&self) -> Arc<dyn LivenessProbe> {
        self.liveness_probe
            .clone()
            .unwrap_or_else(|| Arc::new(SignalProbe))
    }

    pub(crate) fn dial_policy(&self) -> DialPolicy {
        DialPolicy::from_timeouts(&self.timeouts).with_tls(self.tls.clone())
    }

    /// Builds the OS command for `plugin`, injecting the negotiation
    /// environment.
    pub(crate) fn build_command(&self, plugin: &PluginCommand) -> Command {
        let mut command = Command::new(&plugin.program);
        command.args(&plugin.args);
        if self.skip_host_env {
            command.env_clear();
        }
        if self.handshake.has_cookie() {
            command.env(
                self.handshake.magic_cookie_key(),
                self.handshake.magic_cookie_value(),
            );
        }
        command.env(
            env::CORE_PROTOCOL_VERSIONS,
            env::join_versions(self.core_versions()),
        );
        let app_versions: Vec<u32> = self.plugin_sets().into_keys().rev().collect();
        command.env(env::APP_PROTOCOL_VERSIONS, env::join_versions(&app_versions));
        if let Some((min, max)) = self.port_range {
            command.env(env::MIN_PORT, min.to_string());
            command.env(env::MAX_PORT, max.to_string());
        }
        if let Some(dir) = &self.unix_socket_dir {
            command.env(env::UNIX_SOCKET_DIR, dir.as_str());
        }
        command.envs(plugin.env.iter().map(|(key, value)| (key, value)));
        if let Some(dir) = &plugin.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("command", &self.command)
            .field("reattach", &self.reattach)
            .field("handshake", &self.handshake)
            .field("plugins", &self.plugin_sets())
            .field("allowed_protocols", &self.allowed_protocols())
            .field("core_versions", &self.core_versions())
            .field("timeouts", &self.timeouts)
            .field("detach_session", &self.detach_session)
            .field("skip_host_env", &self.skip_host_env)
            .field("port_range", &self.port_range)
            .field("unix_socket_dir", &self.unix_socket_dir)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}
