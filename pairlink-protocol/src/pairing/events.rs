//! Pairing Event System
//!
//! Events emitted while pairing attempts progress, for UI layers.

use crate::Fingerprint;

/// Events emitted by the pairing service
#[derive(Debug, Clone, PartialEq)]
pub enum PairingEvent {
    /// Pairing request was sent to a device
    RequestSent {
        device_id: String,
        device_name: String,
        /// Our certificate fingerprint, for the user to compare
        our_fingerprint: Fingerprint,
    },

    /// Pairing request was received from a device
    RequestReceived {
        device_id: String,
        device_name: String,
        /// Peer certificate fingerprint, for the user to compare
        their_fingerprint: Fingerprint,
    },

    /// Pairing was accepted (by us or by peer) and the peer is now trusted
    Accepted {
        device_id: String,
        device_name: String,
        fingerprint: Fingerprint,
    },

    /// Pairing was rejected (by us or by peer)
    Rejected {
        device_id: String,
        reason: Option<String>,
    },

    /// No answer arrived in time, or the engine stopped
    TimedOut { device_id: String },

    /// Trust for the device was removed
    Unpaired { device_id: String },
}

impl PairingEvent {
    pub fn is_request_received(&self) -> bool {
        matches!(self, PairingEvent::RequestReceived { .. })
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, PairingEvent::Accepted { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, PairingEvent::Rejected { .. })
    }

    /// Device the event refers to
    pub fn device_id(&self) -> &str {
        match self {
            PairingEvent::RequestSent { device_id, .. }
            | PairingEvent::RequestReceived { device_id, .. }
            | PairingEvent::Accepted { device_id, .. }
            | PairingEvent::Rejected { device_id, .. }
            | PairingEvent::TimedOut { device_id }
            | PairingEvent::Unpaired { device_id } => device_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_checking() {
        let request_received = PairingEvent::RequestReceived {
            device_id: "1000".to_string(),
            device_name: "alpha".to_string(),
            their_fingerprint: Fingerprint::from_bytes(vec![0xAA; 32]),
        };
        assert!(request_received.is_request_received());
        assert!(!request_received.is_accepted());

        let rejected = PairingEvent::Rejected {
            device_id: "1000".to_string(),
            reason: None,
        };
        assert!(rejected.is_rejected());
        assert!(!rejected.is_accepted());
    }

    #[test]
    fn test_device_id_extraction() {
        let event = PairingEvent::TimedOut {
            device_id: "device_123".to_string(),
        };
        assert_eq!(event.device_id(), "device_123");
    }
}
