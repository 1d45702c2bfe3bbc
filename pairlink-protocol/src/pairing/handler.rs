//! Pairing state machine
//!
//! One [`PairingHandler`] tracks one pairing attempt with one peer. It is a
//! pure state machine: it produces the packets to send and consumes the
//! packets received, but never touches the network or the trust store.
//!
//! ```text
//!             request_pairing()                 peer pair:true
//!   Unpaired ───────────────────► OutgoingRequestSent ───────────► Accepted
//!      │                                 │  peer pair:false
//!      │ peer pair:true                  └───────────────────────► Rejected
//!      ▼
//!   IncomingRequestReceived ── accept() ──► Accepted
//!                           ── reject() / peer pair:false ──► Rejected
//!
//!   any non-terminal state ── time_out() ──► TimedOut
//! ```
//!
//! `Accepted`, `Rejected` and `TimedOut` are terminal. A new attempt starts
//! with a fresh handler.

use crate::packet::PACKET_TYPE_PAIR;
use crate::{Packet, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default pairing timeout
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// State of one pairing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    Unpaired,
    /// We asked the peer and are waiting for its answer
    OutgoingRequestSent,
    /// The peer asked us and the local approver has not decided yet
    IncomingRequestReceived,
    Accepted,
    Rejected,
    TimedOut,
}

impl PairingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PairingState::Accepted | PairingState::Rejected | PairingState::TimedOut
        )
    }

    /// Waiting on the peer or on the local approver
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            PairingState::OutgoingRequestSent | PairingState::IncomingRequestReceived
        )
    }
}

/// Pairing request/response packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingPacket {
    /// `true` requests or accepts pairing, `false` rejects or cancels it
    pub pair: bool,
}

impl PairingPacket {
    pub fn request() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": true }))
    }

    pub fn accept() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": true }))
    }

    pub fn reject() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": false }))
    }

    /// Parse a pairing packet
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_PAIR) {
            return Err(ProtocolError::MalformedPacket(format!(
                "expected pairing packet, got {}",
                packet.packet_type
            )));
        }

        let pair = packet
            .get_body_field::<bool>("pair")
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing pair field".to_string()))?;

        Ok(Self { pair })
    }
}

/// Pairing state machine for one attempt with one peer
#[derive(Debug)]
pub struct PairingHandler {
    device_id: String,
    state: PairingState,
    /// When the current pending state was entered
    pending_since: Option<Instant>,
}

impl PairingHandler {
    /// Create a handler in `Unpaired` for the peer `device_id`
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state: PairingState::Unpaired,
            pending_since: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    fn transition(&mut self, to: PairingState) {
        debug!(
            "Pairing with {}: {:?} -> {:?}",
            self.device_id, self.state, to
        );
        self.state = to;
        self.pending_since = if to.is_pending() {
            Some(Instant::now())
        } else {
            None
        };
    }

    fn invalid(&self, action: &str) -> ProtocolError {
        ProtocolError::InvalidTransition(format!(
            "cannot {} while {:?} with {}",
            action, self.state, self.device_id
        ))
    }

    /// Start an outgoing attempt; returns the request packet to send
    pub fn request_pairing(&mut self) -> Result<Packet> {
        if self.state != PairingState::Unpaired {
            return Err(self.invalid("request pairing"));
        }
        self.transition(PairingState::OutgoingRequestSent);
        info!("Requesting pairing with {}", self.device_id);
        Ok(PairingPacket::request())
    }

    /// Feed a received pairing packet; returns the resulting state
    pub fn handle_pairing_packet(&mut self, packet: &Packet) -> Result<PairingState> {
        let pairing = PairingPacket::from_packet(packet)?;

        match (self.state, pairing.pair) {
            (PairingState::Unpaired, true) => {
                info!("Received pairing request from {}", self.device_id);
                self.transition(PairingState::IncomingRequestReceived);
            }
            (PairingState::OutgoingRequestSent, true) => {
                info!("Pairing accepted by {}", self.device_id);
                self.transition(PairingState::Accepted);
            }
            (PairingState::OutgoingRequestSent, false) => {
                info!("Pairing rejected by {}", self.device_id);
                self.transition(PairingState::Rejected);
            }
            (PairingState::IncomingRequestReceived, true) => {
                warn!("Duplicate pairing request from {}", self.device_id);
            }
            (PairingState::IncomingRequestReceived, false) => {
                info!("Pairing request from {} was cancelled", self.device_id);
                self.transition(PairingState::Rejected);
            }
            (_, pair) => {
                return Err(self.invalid(if pair {
                    "handle pairing request"
                } else {
                    "handle pairing rejection"
                }));
            }
        }

        Ok(self.state)
    }

    /// Accept an incoming request; returns the response packet to send
    pub fn accept(&mut self) -> Result<Packet> {
        if self.state != PairingState::IncomingRequestReceived {
            return Err(self.invalid("accept"));
        }
        self.transition(PairingState::Accepted);
        info!("Accepted pairing with {}", self.device_id);
        Ok(PairingPacket::accept())
    }

    /// Reject an incoming request; returns the response packet to send
    pub fn reject(&mut self) -> Result<Packet> {
        if self.state != PairingState::IncomingRequestReceived {
            return Err(self.invalid("reject"));
        }
        self.transition(PairingState::Rejected);
        info!("Rejected pairing with {}", self.device_id);
        Ok(PairingPacket::reject())
    }

    /// Abandon a non-terminal attempt
    pub fn time_out(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.invalid("time out"));
        }
        warn!("Pairing with {} timed out in {:?}", self.device_id, self.state);
        self.transition(PairingState::TimedOut);
        Ok(())
    }

    /// Whether the pending state has lasted at least `timeout`
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.pending_since
            .map(|since| since.elapsed() >= timeout)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_packet_creation() {
        let request = PairingPacket::request();
        assert!(request.is_type(PACKET_TYPE_PAIR));
        assert_eq!(request.get_body_field::<bool>("pair"), Some(true));

        let reject = PairingPacket::reject();
        assert!(!PairingPacket::from_packet(&reject).unwrap().pair);
    }

    #[test]
    fn test_pairing_packet_parsing_errors() {
        let wrong_type = Packet::new("ping", json!({ "pair": true }));
        assert!(PairingPacket::from_packet(&wrong_type).is_err());

        let missing = Packet::new(PACKET_TYPE_PAIR, json!({}));
        assert!(matches!(
            PairingPacket::from_packet(&missing),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_outgoing_accepted() {
        let mut handler = PairingHandler::new("2000");
        let request = handler.request_pairing().unwrap();
        assert!(request.is_type(PACKET_TYPE_PAIR));
        assert_eq!(handler.state(), PairingState::OutgoingRequestSent);

        let state = handler
            .handle_pairing_packet(&PairingPacket::accept())
            .unwrap();
        assert_eq!(state, PairingState::Accepted);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_outgoing_rejected() {
        let mut handler = PairingHandler::new("2000");
        handler.request_pairing().unwrap();
        let state = handler
            .handle_pairing_packet(&PairingPacket::reject())
            .unwrap();
        assert_eq!(state, PairingState::Rejected);
    }

    #[test]
    fn test_incoming_accept_and_reject() {
        let mut handler = PairingHandler::new("1000");
        handler
            .handle_pairing_packet(&PairingPacket::request())
            .unwrap();
        assert_eq!(handler.state(), PairingState::IncomingRequestReceived);

        // A repeated request does not change anything
        handler
            .handle_pairing_packet(&PairingPacket::request())
            .unwrap();
        assert_eq!(handler.state(), PairingState::IncomingRequestReceived);

        let response = handler.accept().unwrap();
        assert_eq!(response.get_body_field::<bool>("pair"), Some(true));
        assert_eq!(handler.state(), PairingState::Accepted);

        let mut handler = PairingHandler::new("1000");
        handler
            .handle_pairing_packet(&PairingPacket::request())
            .unwrap();
        let response = handler.reject().unwrap();
        assert_eq!(response.get_body_field::<bool>("pair"), Some(false));
        assert_eq!(handler.state(), PairingState::Rejected);
    }

    #[test]
    fn test_incoming_cancelled_by_peer() {
        let mut handler = PairingHandler::new("1000");
        handler
            .handle_pairing_packet(&PairingPacket::request())
            .unwrap();
        handler
            .handle_pairing_packet(&PairingPacket::reject())
            .unwrap();
        assert_eq!(handler.state(), PairingState::Rejected);
        assert!(handler.accept().is_err());
    }

    #[test]
    fn test_terminal_states_are_terminal() {
        let mut handler = PairingHandler::new("2000");
        handler.request_pairing().unwrap();
        handler.time_out().unwrap();
        assert_eq!(handler.state(), PairingState::TimedOut);

        assert!(matches!(
            handler.handle_pairing_packet(&PairingPacket::accept()),
            Err(ProtocolError::InvalidTransition(_))
        ));
        assert!(handler.request_pairing().is_err());
        assert!(handler.time_out().is_err());
        assert_eq!(handler.state(), PairingState::TimedOut);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut handler = PairingHandler::new("2000");
        assert!(handler.accept().is_err());
        assert!(handler.reject().is_err());
        assert!(handler
            .handle_pairing_packet(&PairingPacket::reject())
            .is_err());

        handler.request_pairing().unwrap();
        assert!(handler.request_pairing().is_err());
        assert!(handler.accept().is_err());
    }

    #[test]
    fn test_expiry_tracks_pending_state() {
        let mut handler = PairingHandler::new("2000");
        assert!(!handler.is_expired(Duration::ZERO));

        handler.request_pairing().unwrap();
        assert!(handler.is_expired(Duration::ZERO));
        assert!(!handler.is_expired(Duration::from_secs(3600)));

        handler
            .handle_pairing_packet(&PairingPacket::accept())
            .unwrap();
        assert!(!handler.is_expired(Duration::ZERO));
    }
}
