//! Error types for ringtun.

use std::io;

use thiserror::Error;

/// Result type alias for ringtun operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ringtun.
#[derive(Error, Debug)]
pub enum Error {
    // Ring transport errors
    #[error("ring error: {0}")]
    Ring(#[from] RingError),

    // TUN endpoint errors
    #[error("tun error: {0}")]
    Tun(#[from] TunError),

    // Packet parsing errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Ring buffer transfer errors.
///
/// `Full` is ordinary backpressure; `Corrupt` means the ring contents can no
/// longer be trusted and the owning endpoint has to re-establish its driver
/// connection before any further reads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("ring full: {needed} bytes needed, {available} available")]
    Full { needed: usize, available: usize },

    #[error("packet exceeds maximum size: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("ring corrupted: {0}")]
    Corrupt(CorruptKind),
}

/// What exactly tripped a ring corruption guard.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptKind {
    #[error("cursor out of range")]
    CursorOutOfRange,

    #[error("incomplete packet header")]
    TruncatedHeader,

    #[error("declared packet size exceeds maximum")]
    OversizedPacket,

    #[error("declared packet extends past written data")]
    TruncatedPacket,
}

/// TUN endpoint lifecycle errors.
#[derive(Error, Debug)]
pub enum TunError {
    #[error("failed to create device '{name}': {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("failed to register rings with driver: {0}")]
    RegisterRings(String),

    #[error("endpoint '{name}' needs restart: {reason}")]
    NeedsRestart { name: String, reason: RingError },

    #[error("endpoint '{0}' is closed")]
    Closed(String),

    #[error("device backend not supported on this platform")]
    Unsupported,
}

/// IP packet parsing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty packet")]
    EmptyPacket,

    #[error("unknown IP version: {0}")]
    UnknownVersion(u8),

    #[error("truncated header: {got} bytes, need {need}")]
    TruncatedHeader { got: usize, need: usize },

    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

impl Error {
    /// Check if the error is transient backpressure (caller may retry after
    /// the remote side drains the ring).
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::Ring(RingError::Full { .. }))
    }

    /// Check if the error requires the owning endpoint's driver connection
    /// to be torn down and re-established.
    pub fn needs_restart(&self) -> bool {
        matches!(
            self,
            Error::Ring(RingError::Corrupt(_)) | Error::Tun(TunError::NeedsRestart { .. })
        )
    }
}

impl RingError {
    /// Corruption means the consumer must not trust anything else in the
    /// ring; everything short of that is recoverable.
    pub fn needs_restart(&self) -> bool {
        matches!(self, RingError::Corrupt(_))
    }
}
