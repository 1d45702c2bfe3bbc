//! Pairlink Transport Layer
//!
//! Certificates, TLS configuration and the stream abstraction the
//! negotiator and sessions run over.

pub mod certificate;
pub mod stream;
pub mod tls;

pub use certificate::{CertificateInfo, Fingerprint};
pub use stream::{AsyncStream, BoxedStream, TransportAddress};
pub use tls::TlsConfig;
