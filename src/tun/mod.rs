//! Virtual TUN devices and the packet router on top of them.
//!
//! The data path: packets the host sends into a TUN device show up on that
//! endpoint's Send ring; the [`router::PacketRouter`] drains every
//! registered endpoint and hands the plaintext to the encryption pipeline.
//! Decrypted packets come back through [`router::PacketRouter::deliver_plain`],
//! which looks up the owning endpoint by destination address and pushes the
//! packet onto its Receive ring for the driver to re-inject.

pub mod endpoint;
#[cfg(unix)]
pub mod fd;
pub mod loopback;
pub mod packet;
pub mod registry;
pub mod router;

pub use endpoint::{
    DeviceHandle, DeviceProvisioner, EndpointOptions, RingBackend, RingPair, TunEndpoint,
};
#[cfg(unix)]
pub use fd::FdDriver;
pub use loopback::LoopbackDriver;
pub use packet::{IpPacket, IpVersion};
pub use registry::TunRegistry;
pub use router::{EspPipeline, PacketRouter, PlainPacket, RouterStats, StatsSnapshot};

/// Default MTU for new endpoints. Leaves room for ESP and outer headers.
pub const DEFAULT_TUN_MTU: u16 = 1400;
