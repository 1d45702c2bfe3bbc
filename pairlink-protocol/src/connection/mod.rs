//! Connection establishment
//!
//! Role assignment and the handshake that turns a byte stream into an
//! identified, fingerprint-classified link.

pub mod negotiator;
pub mod role;

pub use negotiator::{
    bind_listener, ConnectionConfig, EstablishedLink, Negotiated, Negotiator,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PORT_RANGE,
};
pub use role::{determine_role, is_tls_server, should_initiate_connection, TlsRole};
