//! Host-side capability stubs.
//!
//! A [`Plugin`] describes one named capability. When the host dispenses it,
//! the plugin builds a typed stub around an [`RpcCaller`] bound to the
//! capability's service name.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{RpcClient, RpcError};

/// Named capability a plugin process may expose.
pub trait Plugin: Send + Sync {
    /// Builds the host-side stub for this capability.
    ///
    /// The returned value is what [`RpcClient::dispense`] hands out; callers
    /// usually retrieve it with [`RpcClient::dispense_as`].
    fn client(&self, caller: RpcCaller) -> Box<dyn Any + Send>;
}

/// RPC handle bound to one service on one connection.
#[derive(Clone)]
pub struct RpcCaller {
    client: Arc<RpcClient>,
    service: String,
}

impl RpcCaller {
    pub(crate) fn new(client: Arc<RpcClient>, service: impl Into<String>) -> Self {
        Self {
            client,
            service: service.into(),
        }
    }

    /// Service this caller addresses.
    #[must_use]
    pub const fn service(&self) -> &str {
        self.service.as_str()
    }

    /// Calls `method` with raw JSON parameters.
    ///
    /// # Errors
    ///
    /// Returns an [`RpcError`] when the transport fails or the plugin
    /// reports an error.
    pub fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.client.call(&self.service, method, params)
    }

    /// Calls `method`, serialising `params` and decoding the result.
    ///
    /// # Errors
    ///
    /// Returns an [`RpcError`] when encoding, the transport, the plugin, or
    /// decoding fails.
    pub fn call_as<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.client.call_as(&self.service, method, params)
    }
}

impl fmt::Debug for RpcCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCaller")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

/// Capabilities a host understands for one application protocol version.
#[derive(Clone, Default)]
pub struct PluginSet {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
}

impl PluginSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a capability, replacing any previous one of the same name.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, plugin: impl Plugin + 'static) -> Self {
        self.insert(name, plugin);
        self
    }

    /// Adds a capability in place.
    pub fn insert(&mut self, name: impl Into<String>, plugin: impl Plugin + 'static) {
        self.plugins.insert(name.into(), Arc::new(plugin));
    }

    /// Looks up a capability by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    /// Capability names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    /// Number of capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.plugins.keys()).finish()
    }
}
