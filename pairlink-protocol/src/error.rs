//! Error handling for the Pairlink protocol
//!
//! A single error type covers every failure the engine can report. Errors are
//! always scoped to one peer or one session; nothing here is fatal to the
//! process.
//!
//! ## Error Categories
//!
//! ### Framing
//! - `MalformedPacket`: a line that is not a valid packet. Dropped by the
//!   session read loop until the consecutive-failure threshold is reached.
//! - `PacketSizeExceeded`: a line grew past the maximum without a terminator.
//!
//! ### Transport
//! - `Io`, `Transport`, `Timeout`, `ConnectionRefused`: the session is closed
//!   and the peer is picked up again by the next discovery sighting.
//! - `TlsHandshake`: the peer is considered unreachable until it is seen again.
//!
//! ### Trust
//! - `TrustViolation`: a known device presented a different certificate. This
//!   is the only security event and must reach the user-facing collaborator.
//! - `PairingTimedOut`, `PairingRejected`, `PairingInProgress`: recoverable,
//!   the user may try again.
//!
//! ### Session
//! - `SessionClosed`: returned to late callers of `send`.
//!
//! ## Usage
//!
//! ```rust
//! use pairlink_protocol::ProtocolError;
//!
//! let error = ProtocolError::PairingTimedOut("1000".to_string());
//! assert!(error.is_recoverable());
//! assert!(!error.is_security_event());
//! ```

use crate::Fingerprint;
use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS protocol error reported by rustls
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate generation error
    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// Certificate could not be parsed or loaded
    #[error("Certificate validation error: {0}")]
    CertificateValidation(String),

    /// A line on the wire is not a valid packet
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// A single line grew past the maximum allowed size
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),

    /// The transport failed or was closed underneath us
    #[error("Transport error: {0}")]
    Transport(String),

    /// TLS handshake did not complete
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// A trusted device presented a certificate with a different fingerprint
    #[error("Trust violation for device {device_id}: expected {expected}, presented {presented}")]
    TrustViolation {
        /// Device identifier the record belongs to
        device_id: String,
        /// Fingerprint currently trusted for the device
        expected: Fingerprint,
        /// Fingerprint the peer presented
        presented: Fingerprint,
    },

    /// No pairing response within the timeout
    #[error("Pairing timed out: {0}")]
    PairingTimedOut(String),

    /// The peer or the local user rejected pairing
    #[error("Pairing rejected: {0}")]
    PairingRejected(String),

    /// Another pairing attempt for the same device is active
    #[error("Pairing already in progress for device {0}")]
    PairingInProgress(String),

    /// The requested pairing state transition is not allowed
    #[error("Invalid pairing transition: {0}")]
    InvalidTransition(String),

    /// Operation on a session that has been closed
    #[error("Session closed")]
    SessionClosed,

    /// The local device is not the side that should perform this operation
    #[error("Role conflict: {0}")]
    RoleConflict(String),

    /// Peer identity changed between handshake stages
    #[error("Identity mismatch: {0}")]
    IdentityMismatch(String),

    /// Protocol version mismatch
    #[error("Protocol version mismatch: {0}")]
    ProtocolVersionMismatch(String),

    /// Device not known to the engine
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Plugin registration or dispatch error
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Trust store persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Connection timeout
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Connection refused by the remote device
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific network error
    ///
    /// ```rust
    /// use pairlink_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "connection timeout");
    /// let error = ProtocolError::from_io_error(io_error, "connecting to device");
    ///
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::Transport(format!(
                "{}: connection interrupted ({})",
                context, error
            )),
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is recoverable
    ///
    /// Everything except a trust violation is scoped to one attempt and may
    /// succeed when the peer is seen again.
    pub fn is_recoverable(&self) -> bool {
        !self.is_security_event()
    }

    /// Check if this error must be surfaced to the user as a security event
    pub fn is_security_event(&self) -> bool {
        matches!(self, ProtocolError::TrustViolation { .. })
    }

    /// Get a user-friendly error message suitable for display in UI
    ///
    /// ```rust
    /// use pairlink_protocol::ProtocolError;
    ///
    /// assert_eq!(
    ///     ProtocolError::SessionClosed.user_message(),
    ///     "Device disconnected."
    /// );
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::TrustViolation { device_id, .. } => format!(
                "Device '{}' presented an unexpected certificate. The connection was refused; \
                 unpair and pair again only if you trust this device.",
                device_id
            ),
            ProtocolError::PairingTimedOut(_) => {
                "Pairing request timed out. Try again.".to_string()
            }
            ProtocolError::PairingRejected(_) => "Pairing request was declined.".to_string(),
            ProtocolError::PairingInProgress(id) => {
                format!("A pairing request for '{}' is already pending.", id)
            }
            ProtocolError::SessionClosed => "Device disconnected.".to_string(),
            ProtocolError::TlsHandshake(_) => {
                "Secure connection could not be established.".to_string()
            }
            ProtocolError::ProtocolVersionMismatch(msg) => {
                format!("Incompatible protocol version: {}. Update both devices.", msg)
            }
            ProtocolError::Timeout(msg) => {
                format!("Connection timeout: {}. Check network connection.", msg)
            }
            ProtocolError::ConnectionRefused(_) => {
                "Connection refused. Check that the other device is running.".to_string()
            }
            ProtocolError::DeviceNotFound(id) => format!("Device '{}' not found.", id),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::DeviceNotFound("test-device".to_string());
        assert_eq!(error.to_string(), "Device not found: test-device");

        let error = ProtocolError::SessionClosed;
        assert_eq!(error.to_string(), "Session closed");

        let error = ProtocolError::MalformedPacket("bad format".to_string());
        assert_eq!(error.to_string(), "Malformed packet: bad format");
    }

    #[test]
    fn test_io_error_mapping() {
        use std::io::{Error, ErrorKind};

        let error = ProtocolError::from_io_error(Error::new(ErrorKind::BrokenPipe, "gone"), "send");
        assert!(matches!(error, ProtocolError::Transport(_)));

        let error = ProtocolError::from_io_error(Error::new(ErrorKind::NotFound, "nope"), "read");
        assert!(matches!(error, ProtocolError::Io(_)));
    }

    #[test]
    fn test_trust_violation_is_security_event() {
        let error = ProtocolError::TrustViolation {
            device_id: "1000".to_string(),
            expected: Fingerprint::from_bytes(vec![1; 32]),
            presented: Fingerprint::from_bytes(vec![2; 32]),
        };
        assert!(error.is_security_event());
        assert!(!error.is_recoverable());
        assert!(error.user_message().contains("1000"));

        assert!(ProtocolError::PairingRejected("x".into()).is_recoverable());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{\"bad").unwrap_err();
        let protocol_error: ProtocolError = json_error.into();
        assert!(matches!(protocol_error, ProtocolError::Json(_)));
    }
}
