// src/error.rs
//
// Adapter error taxonomy, hand-rolled rather than thiserror/anyhow-based:
// one enum, a constructor per device-tagged kind, manual Display/Error.

use std::fmt;

/// An error kind covering the adapter's failure modes, from protocol
/// desync to device I/O to resource exhaustion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Caller-visible precondition failure (null buffer, dlc too big, ...).
    InvalidArgument(String),
    /// Destination buffer cannot hold the result.
    BufferTooSmall,
    /// Incoming socketcand line is malformed.
    InvalidSyntax(String),
    /// Remote end closed, or the stream hit a hard error.
    Disconnected,
    /// Line reader overflowed; the reader is poisoned.
    FrameTooLarge,
    /// The first byte of a new frame wasn't '<'.
    Desync,
    /// No free broker slot.
    Exhausted,
    /// Bus transmit deadline exceeded.
    Timeout,
    /// CAN controller entered bus-off.
    BusOff,
    /// CAN controller is stopped.
    Stopped,
    /// An invariant the implementation believes unreachable.
    Internal(String),
    /// I/O failure talking to a device, tagged with the device name.
    Io { device: String, message: String },
}

impl AdapterError {
    pub fn io(device: impl Into<String>, message: impl fmt::Display) -> Self {
        AdapterError::Io {
            device: device.into(),
            message: message.to_string(),
        }
    }

    /// True if this error should terminate the owning session.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            AdapterError::Disconnected
                | AdapterError::FrameTooLarge
                | AdapterError::Desync
                | AdapterError::InvalidSyntax(_)
        )
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            AdapterError::BufferTooSmall => write!(f, "buffer too small"),
            AdapterError::InvalidSyntax(msg) => write!(f, "invalid socketcand syntax: {msg}"),
            AdapterError::Disconnected => write!(f, "disconnected"),
            AdapterError::FrameTooLarge => write!(f, "frame too large for reader buffer"),
            AdapterError::Desync => write!(f, "line reader desynchronised (expected '<')"),
            AdapterError::Exhausted => write!(f, "no free broker slot"),
            AdapterError::Timeout => write!(f, "operation timed out"),
            AdapterError::BusOff => write!(f, "CAN controller is bus-off"),
            AdapterError::Stopped => write!(f, "CAN controller is stopped"),
            AdapterError::Internal(msg) => write!(f, "internal error: {msg}"),
            AdapterError::Io { device, message } => write!(f, "{device}: {message}"),
        }
    }
}

impl std::error::Error for AdapterError {}
