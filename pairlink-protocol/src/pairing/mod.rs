//! Device Pairing
//!
//! Trust-on-first-use pairing over an already encrypted but untrusted link.
//!
//! ## Pairing Protocol
//!
//! 1. **Negotiation**: the connection negotiator reports `PairingRequired`
//! 2. **Pairing Request**: the connecting side sends `pairlink.pair` with `pair: true`
//! 3. **User Verification**: the listening side shows the peer fingerprint to its approver
//! 4. **Pairing Response**: `pair: true` (accept) or `pair: false` (reject)
//! 5. **Trust Storage**: both sides record the peer fingerprint before any
//!    application packet is exchanged
//!
//! Pending states time out after 30 seconds by default.

pub mod events;
pub mod handler;
pub mod service;

pub use events::PairingEvent;
pub use handler::{PairingHandler, PairingPacket, PairingState, PAIRING_TIMEOUT};
pub use service::{
    FixedDecision, PairingConfig, PairingDecision, PairingDelegate, PairingGuard,
    PairingOutcome, PairingRegistry, PairingService,
};
