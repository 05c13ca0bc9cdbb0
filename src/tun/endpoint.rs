//! TUN endpoint over a shared-memory ring pair.
//!
//! A [`TunEndpoint`] owns one virtual device plus the two rings that carry
//! packets across the driver boundary: the Send ring (driver to process,
//! packets arriving from the network stack) and the Receive ring (process to
//! driver, packets injected back into the stack). Device creation and the
//! register-rings control call live behind [`DeviceProvisioner`] so tests
//! and the demo binary can run the full data path without a kernel driver.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result, RingError, TunError};
use crate::ring::{
    valid_capacity, ChannelRing, PacketRing, RingDescriptor, SharedRing, Signal,
    DEFAULT_RING_CAPACITY,
};

/// Which ring implementation backs an endpoint.
///
/// `Shared` is the driver-interop layout; `Channel` is the in-process queue
/// used by byte-stream device backends and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingBackend {
    #[default]
    Shared,
    Channel,
}

/// Endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointOptions {
    /// Device name. On some platforms a hint; the driver may pick another.
    #[serde(default = "default_device_name")]
    pub name: String,

    /// MTU for the virtual interface.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Virtual IP assigned to this endpoint, if any. The router keys
    /// inbound delivery on this address.
    #[serde(default)]
    pub address: Option<IpAddr>,

    /// Prefix length for the virtual IP.
    #[serde(default = "default_prefix")]
    pub prefix: u8,

    /// Per-direction ring capacity in bytes. Power of two.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Ring implementation.
    #[serde(default)]
    pub backend: RingBackend,
}

fn default_device_name() -> String {
    "ringtun0".to_string()
}

fn default_mtu() -> u16 {
    super::DEFAULT_TUN_MTU
}

fn default_prefix() -> u8 {
    32
}

fn default_ring_capacity() -> usize {
    DEFAULT_RING_CAPACITY
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            mtu: default_mtu(),
            address: None,
            prefix: default_prefix(),
            ring_capacity: default_ring_capacity(),
            backend: RingBackend::default(),
        }
    }
}

/// Opaque handle to a provisioned device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub id: u64,
    pub name: String,
}

/// The two rings registered with a device, as the driver side sees them.
#[derive(Clone)]
pub struct RingPair {
    /// Driver to process. The driver writes arriving packets here.
    pub send: Arc<dyn PacketRing>,
    /// Process to driver. The driver drains injected packets from here.
    pub recv: Arc<dyn PacketRing>,
}

/// External collaborator that creates devices and wires rings to them.
///
/// `register_rings` stands in for the driver's register-rings control call:
/// after it returns the driver co-owns both rings until `destroy_device`.
/// A failure is fatal to the endpoint being built; the caller releases
/// everything acquired so far.
pub trait DeviceProvisioner: Send + Sync {
    fn create_device(&self, options: &EndpointOptions) -> Result<DeviceHandle>;
    fn register_rings(&self, device: &DeviceHandle, rings: RingPair) -> Result<()>;
    fn destroy_device(&self, device: &DeviceHandle);
}

/// Concrete ring pair. Keeps the concrete types so the shared backend can
/// hand out descriptors and the test hooks can reach the raw layout.
enum Rings {
    Shared {
        send: Arc<SharedRing>,
        recv: Arc<SharedRing>,
    },
    Channel {
        send: Arc<ChannelRing>,
        recv: Arc<ChannelRing>,
    },
}

impl Rings {
    fn allocate(options: &EndpointOptions, send_ready: &Signal, recv_ready: &Signal) -> Result<Self> {
        match options.backend {
            RingBackend::Shared => Ok(Rings::Shared {
                send: Arc::new(SharedRing::new(options.ring_capacity, send_ready.clone())?),
                recv: Arc::new(SharedRing::new(options.ring_capacity, recv_ready.clone())?),
            }),
            RingBackend::Channel => {
                if !valid_capacity(options.ring_capacity) {
                    return Err(Error::InvalidConfig(format!(
                        "ring capacity {} is not a power of two within bounds",
                        options.ring_capacity
                    )));
                }
                Ok(Rings::Channel {
                    send: Arc::new(ChannelRing::new(options.ring_capacity, send_ready.clone())),
                    recv: Arc::new(ChannelRing::new(options.ring_capacity, recv_ready.clone())),
                })
            }
        }
    }

    fn send(&self) -> Arc<dyn PacketRing> {
        match self {
            Rings::Shared { send, .. } => send.clone(),
            Rings::Channel { send, .. } => send.clone(),
        }
    }

    fn recv(&self) -> Arc<dyn PacketRing> {
        match self {
            Rings::Shared { recv, .. } => recv.clone(),
            Rings::Channel { recv, .. } => recv.clone(),
        }
    }

    fn pair(&self) -> RingPair {
        RingPair {
            send: self.send(),
            recv: self.recv(),
        }
    }

    /// Region descriptors for the register-rings control call. Only the
    /// shared layout has a memory region to describe.
    fn descriptors(&self) -> Option<(RingDescriptor, RingDescriptor)> {
        match self {
            Rings::Shared { send, recv } => Some((send.descriptor(), recv.descriptor())),
            Rings::Channel { .. } => None,
        }
    }
}

/// One virtual TUN device with its ring pair.
pub struct TunEndpoint {
    device: DeviceHandle,
    options: EndpointOptions,
    provisioner: Arc<dyn DeviceProvisioner>,
    /// `None` once the endpoint is closed.
    rings: RwLock<Option<Rings>>,
    /// Data-ready signals. Stable across restarts so waiters and the
    /// router's wait set never hold a stale handle.
    send_ready: Signal,
    recv_ready: Signal,
    restarts: AtomicU64,
}

impl TunEndpoint {
    /// Provision a device and register a fresh ring pair with it.
    ///
    /// Acquisition order is device, rings, registration; any failure
    /// releases what was already acquired before returning.
    pub fn create(
        provisioner: Arc<dyn DeviceProvisioner>,
        options: EndpointOptions,
    ) -> Result<Arc<Self>> {
        let send_ready = Signal::new();
        let recv_ready = Signal::new();

        let device = provisioner.create_device(&options)?;
        let rings = match Rings::allocate(&options, &send_ready, &recv_ready) {
            Ok(rings) => rings,
            Err(e) => {
                provisioner.destroy_device(&device);
                return Err(e);
            }
        };
        if let Some((send, recv)) = rings.descriptors() {
            debug!(device = %device.name, ?send, ?recv, "ring regions allocated");
        }
        if let Err(e) = provisioner.register_rings(&device, rings.pair()) {
            provisioner.destroy_device(&device);
            return Err(e);
        }

        info!(
            device = %device.name,
            address = ?options.address,
            mtu = options.mtu,
            ring_capacity = options.ring_capacity,
            backend = ?options.backend,
            "endpoint up"
        );

        Ok(Arc::new(Self {
            device,
            options,
            provisioner,
            rings: RwLock::new(Some(rings)),
            send_ready,
            recv_ready,
            restarts: AtomicU64::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.device.name
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn address(&self) -> Option<IpAddr> {
        self.options.address
    }

    pub fn prefix(&self) -> u8 {
        self.options.prefix
    }

    pub fn mtu(&self) -> u16 {
        self.options.mtu
    }

    /// Signal fired whenever the driver puts a packet on the Send ring.
    pub fn send_ready(&self) -> Signal {
        self.send_ready.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.rings.read().is_none()
    }

    /// How many times the ring pair has been rebuilt.
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    fn send_ring(&self) -> Result<Arc<dyn PacketRing>> {
        self.rings
            .read()
            .as_ref()
            .map(Rings::send)
            .ok_or_else(|| Error::Tun(TunError::Closed(self.device.name.clone())))
    }

    fn recv_ring(&self) -> Result<Arc<dyn PacketRing>> {
        self.rings
            .read()
            .as_ref()
            .map(Rings::recv)
            .ok_or_else(|| Error::Tun(TunError::Closed(self.device.name.clone())))
    }

    /// Mark the Send ring alertable (or not). The router flips this for
    /// every endpoint it is about to wait on.
    pub fn set_alertable(&self, alertable: bool) -> Result<()> {
        self.send_ring()?.set_alertable(alertable);
        Ok(())
    }

    /// Escalate a ring failure to the endpoint level. Corruption becomes a
    /// restart demand carrying the device name; backpressure passes through.
    fn ring_failure(&self, error: RingError) -> Error {
        if error.needs_restart() {
            Error::Tun(TunError::NeedsRestart {
                name: self.device.name.clone(),
                reason: error,
            })
        } else {
            error.into()
        }
    }

    /// Pop one packet arriving from the device, without blocking.
    ///
    /// `Ok(None)` when the ring is empty. A corrupt ring surfaces as
    /// [`TunError::NeedsRestart`]; the endpoint must be
    /// [restarted](TunEndpoint::restart) before further reads.
    pub fn read_packet(&self) -> Result<Option<Vec<u8>>> {
        self.send_ring()?.read().map_err(|e| self.ring_failure(e))
    }

    /// Pop one packet arriving from the device, waiting for one if the ring
    /// is empty.
    ///
    /// The wait protocol matches the driver contract: declare intent to
    /// block, re-check, then sleep on the ring's signal. The re-check closes
    /// the window where the producer wrote between the first pop and the
    /// alertable store.
    pub async fn recv_packet(&self) -> Result<Vec<u8>> {
        loop {
            let ring = self.send_ring()?;
            if let Some(packet) = ring.read().map_err(|e| self.ring_failure(e))? {
                return Ok(packet);
            }
            ring.set_alertable(true);
            match ring.read() {
                Ok(Some(packet)) => {
                    ring.set_alertable(false);
                    return Ok(packet);
                }
                Ok(None) => {}
                Err(e) => {
                    ring.set_alertable(false);
                    return Err(self.ring_failure(e));
                }
            }
            self.send_ready.wait().await;
            ring.set_alertable(false);
            // Loop: re-fetch the ring in case a restart swapped it.
        }
    }

    /// Push one packet toward the device.
    ///
    /// A full ring surfaces as `Err`; the caller decides whether that is a
    /// drop or a retry. Never blocks, never partially writes.
    pub fn write_packet(&self, packet: &[u8]) -> Result<()> {
        Ok(self.recv_ring()?.write(packet)?)
    }

    /// Tear down the ring pair and register a fresh one on the same device.
    ///
    /// Packets in flight on the old rings are lost. If re-registration
    /// fails the endpoint is closed; the device is unusable without rings.
    pub fn restart(&self) -> Result<()> {
        let fresh = {
            let guard = self.rings.read();
            if guard.is_none() {
                return Err(Error::Tun(TunError::Closed(self.device.name.clone())));
            }
            Rings::allocate(&self.options, &self.send_ready, &self.recv_ready)?
        };

        if let Err(e) = self.provisioner.register_rings(&self.device, fresh.pair()) {
            warn!(device = %self.device.name, error = %e, "ring re-registration failed, closing endpoint");
            self.close();
            return Err(e);
        }

        *self.rings.write() = Some(fresh);
        self.restarts.fetch_add(1, Ordering::Relaxed);
        info!(device = %self.device.name, "endpoint rings rebuilt");

        // Wake anything blocked on the old rings so it re-fetches.
        self.send_ready.raise();
        self.recv_ready.raise();
        Ok(())
    }

    /// Release the device and the ring memory. Idempotent.
    ///
    /// The driver's co-ownership of the ring region ends with
    /// `destroy_device`, so the rings are dropped only after it returns.
    pub fn close(&self) {
        let rings = self.rings.write().take();
        if rings.is_some() {
            self.provisioner.destroy_device(&self.device);
            debug!(device = %self.device.name, "endpoint closed");
            drop(rings);
            // Unblock any reader waiting on a now-dead ring.
            self.send_ready.raise();
            self.recv_ready.raise();
        }
    }

    /// Corrupt the Send ring's next length header in place. Only meaningful
    /// for the shared backend.
    #[cfg(test)]
    pub(crate) fn corrupt_send_ring(&self) {
        if let Some(Rings::Shared { send, .. }) = self.rings.read().as_ref() {
            send.poke_head_header(u32::MAX);
        }
    }
}

impl Drop for TunEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TunEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunEndpoint")
            .field("device", &self.device)
            .field("address", &self.options.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}
