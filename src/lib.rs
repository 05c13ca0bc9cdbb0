//! # ringtun
//!
//! Shared-memory ring transport for TUN devices plus a multi-device packet
//! router, the host side of a wintun-style split: the kernel driver and this
//! process exchange IP packets through lock-free ring buffers instead of
//! read/write syscalls.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  IPsec pipeline (collaborator)                  │
//! │          queue_outbound ▲             deliver_plain │           │
//! ├──────────────────────────┼──────────────────────────┼───────────┤
//! │                     PacketRouter (one task)         ▼           │
//! │        wait set: shutdown + membership + endpoint signals       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │     TunRegistry: virtual IP → TunEndpoint, default fallback     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  TunEndpoint: device handle + Send ring + Receive ring          │
//! │  ┌───────────────────┐              ┌───────────────────┐       │
//! │  │ Send ring         │              │ Receive ring      │       │
//! │  │ driver → process  │              │ process → driver  │       │
//! │  └───────────────────┘              └───────────────────┘       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │           Driver (kernel, or LoopbackDriver in tests)           │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)] // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)] // Ring constants read better raw
#![allow(clippy::cast_possible_truncation)] // Cursors fit in u32 by contract
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional
#![allow(clippy::option_if_let_else)]
#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::ignored_unit_patterns)]

pub mod config;
pub mod error;
pub mod ring;
pub mod tun;

pub use config::Config;
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::ring::{ChannelRing, PacketRing, SharedRing, Signal};
    pub use crate::tun::{
        DeviceProvisioner, EndpointOptions, EspPipeline, LoopbackDriver, PacketRouter,
        PlainPacket, TunEndpoint, TunRegistry,
    };
}
