//! Error kinds the core engine distinguishes, mirroring the transport error
//! hierarchy of the teacher's `MiniDSPError`.

use thiserror::Error;

/// Errors surfaced by the transport/registry engine.
///
/// Parsing errors never travel through this type -- they're recovered
/// locally (the malformed frame is dropped and logged). This enum covers
/// the outcomes a caller of [`crate::router::Router::dispatch`] or a
/// transport's `send` needs to distinguish.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The UDP socket never bound (port already in use, or bind denied).
    #[error("the network transport is disabled (bind failed)")]
    TransportDisabled,

    /// The device has never been discovered, or its route was evicted by a
    /// liveness timeout.
    #[error("no route to device (IP unknown)")]
    NoRoute,

    /// The device is configured for USB but has no serial port assigned.
    #[error("device has no serial port configured")]
    NotConfigured,

    /// No registry entry exists for the requested device id.
    #[error("unknown device id")]
    UnknownDevice,

    /// A telemetry or discovery frame failed to parse.
    #[error("malformed frame: {0}")]
    FrameMalformed(String),

    /// A per-send OS error that is expected to be transient.
    #[error("transient I/O error: {0}")]
    IoTransient(String),

    /// The serial port is gone or disconnected mid-read; the owning
    /// listener has terminated.
    #[error("fatal I/O error: {0}")]
    IoFatal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
