//! Pairlink Protocol Implementation
//!
//! Secure device pairing and message exchange for devices on the same local
//! network. Two devices that have never met discover each other over UDP,
//! pair by exchanging self-signed certificates over TLS, and then exchange
//! typed, capability-gated packets that drive pluggable features.
//!
//! The [`Engine`] runs everything; the components it is built from are
//! public for embedding and testing:
//!
//! - [`codec`]: newline-delimited JSON packet framing
//! - [`trust`]: device id to certificate fingerprint store
//! - [`discovery`]: UDP identity broadcasts
//! - [`connection`]: TLS role assignment and the connection handshake
//! - [`pairing`]: pairing state machine and the service that drives it
//! - [`session`]: live connection to one trusted peer
//! - [`plugins`]: packet routing to feature handlers

pub mod codec;
pub mod connection;
pub mod device;
pub mod discovery;
pub mod engine;
pub mod packet;
pub mod pairing;
pub mod plugins;
pub mod session;
pub mod transport;
pub mod trust;

mod error;

#[cfg(test)]
mod testing;

pub use device::{ConnectionState, Device, DeviceInfo, DeviceManager, DeviceType, TrustState};
pub use engine::{Engine, EngineConfig, EngineEvent, LocalIdentity};
pub use error::{ProtocolError, Result};
pub use packet::{current_timestamp, Packet};
pub use pairing::{FixedDecision, PairingDecision, PairingDelegate, PairingEvent};
pub use plugins::{Capability, PacketHandler, PeerContext, PluginDispatcher};
pub use transport::{CertificateInfo, Fingerprint};
pub use trust::{TrustRecord, TrustStore};

/// Protocol version we implement
///
/// Peers are compatible only when their versions are equal.
pub const PROTOCOL_VERSION: u32 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 8);
        let info = DeviceInfo::new("Test", DeviceType::Laptop, 1739);
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert!(info.is_compatible());
    }
}
