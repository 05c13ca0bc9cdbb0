//! Endpoint registry keyed by virtual IP.
//!
//! Inbound plaintext packets are routed to the endpoint whose virtual IP
//! matches the destination; anything else lands on the default endpoint.
//! Every membership change fires the `changed` signal so the router knows
//! to rebuild its wait set.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ring::Signal;

use super::endpoint::TunEndpoint;

#[derive(Default)]
pub struct TunRegistry {
    endpoints: RwLock<HashMap<IpAddr, Arc<TunEndpoint>>>,
    default: RwLock<Option<Arc<TunEndpoint>>>,
    changed: Signal,
}

impl TunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal fired on every registration change. The router waits on this
    /// alongside the per-endpoint signals.
    pub fn changed(&self) -> Signal {
        self.changed.clone()
    }

    /// Install the fallback endpoint for destinations no entry matches.
    pub fn set_default(&self, endpoint: Arc<TunEndpoint>) {
        debug!(device = %endpoint.name(), "default endpoint set");
        *self.default.write() = Some(endpoint);
        self.changed.raise();
    }

    /// Remove the fallback endpoint. Only expected during full teardown.
    pub fn clear_default(&self) -> Option<Arc<TunEndpoint>> {
        let previous = self.default.write().take();
        if previous.is_some() {
            self.changed.raise();
        }
        previous
    }

    pub fn default_endpoint(&self) -> Option<Arc<TunEndpoint>> {
        self.default.read().clone()
    }

    /// Add an endpoint under its virtual IP. Replacing an existing entry
    /// returns the displaced endpoint so the caller can close it.
    pub fn register(&self, endpoint: Arc<TunEndpoint>) -> Result<Option<Arc<TunEndpoint>>> {
        let address = endpoint.address().ok_or_else(|| {
            Error::InvalidConfig(format!(
                "endpoint '{}' has no virtual IP to register under",
                endpoint.name()
            ))
        })?;
        let displaced = self.endpoints.write().insert(address, endpoint.clone());
        debug!(device = %endpoint.name(), %address, "endpoint registered");
        self.changed.raise();
        Ok(displaced)
    }

    pub fn unregister(&self, address: &IpAddr) -> Option<Arc<TunEndpoint>> {
        let removed = self.endpoints.write().remove(address);
        if let Some(endpoint) = &removed {
            debug!(device = %endpoint.name(), %address, "endpoint unregistered");
            self.changed.raise();
        }
        removed
    }

    /// Endpoint for a destination address: the exact entry if one exists,
    /// the default endpoint otherwise.
    pub fn lookup(&self, address: &IpAddr) -> Option<Arc<TunEndpoint>> {
        if let Some(endpoint) = self.endpoints.read().get(address) {
            return Some(endpoint.clone());
        }
        self.default.read().clone()
    }

    /// Consistent view of every endpoint the router should wait on, the
    /// default first. Taken under the read locks; the caller must not hold
    /// it across a membership change without re-snapshotting.
    pub fn snapshot(&self) -> Vec<Arc<TunEndpoint>> {
        let default = self.default.read().clone();
        let endpoints = self.endpoints.read();
        let mut all = Vec::with_capacity(endpoints.len() + 1);
        if let Some(default) = default {
            all.push(default);
        }
        all.extend(endpoints.values().cloned());
        all
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}

impl std::fmt::Debug for TunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunRegistry")
            .field("registered", &self.len())
            .field("has_default", &self.default.read().is_some())
            .finish()
    }
}
