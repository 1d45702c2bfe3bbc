//! Shared fixtures for unit tests

use crate::connection::{ConnectionConfig, EstablishedLink, Negotiator};
use crate::transport::{TlsConfig, TransportAddress};
use crate::trust::TrustStore;
use crate::{CertificateInfo, DeviceInfo, DeviceType};
use std::sync::Arc;

pub(crate) struct TestPeer {
    pub info: DeviceInfo,
    pub cert: CertificateInfo,
    pub trust: Arc<TrustStore>,
}

impl TestPeer {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            info: DeviceInfo::with_id(id, name, DeviceType::Desktop, 1739),
            cert: CertificateInfo::generate(id).unwrap(),
            trust: Arc::new(TrustStore::in_memory()),
        }
    }

    pub fn negotiator(&self) -> Negotiator {
        Negotiator::new(
            self.info.clone(),
            TlsConfig::new(&self.cert).unwrap(),
            self.trust.clone(),
            ConnectionConfig::loopback(),
        )
    }
}

/// Negotiate an in-memory link; `client` must have the smaller device id
pub(crate) async fn linked_pair(
    client: &TestPeer,
    server: &TestPeer,
) -> (EstablishedLink, EstablishedLink) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client_neg = client.negotiator();
    let server_neg = server.negotiator();

    let (c, s) = tokio::join!(
        client_neg.negotiate_outbound(client_io, TransportAddress::Memory, &server.info),
        server_neg.negotiate_inbound(server_io, TransportAddress::Memory),
    );
    (c.unwrap().into_link(), s.unwrap().into_link())
}
