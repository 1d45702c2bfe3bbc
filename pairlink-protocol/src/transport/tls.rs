//! TLS configuration for device links
//!
//! Both roles present the local device certificate and both accept any peer
//! certificate whose handshake signature verifies. Whether the peer is
//! *trusted* is decided afterwards by fingerprint through the trust store.

use crate::{CertificateInfo, Fingerprint, ProtocolError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Client and server TLS configuration for one local certificate
#[derive(Clone)]
pub struct TlsConfig {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Build both configurations around `our_cert`
    pub fn new(our_cert: &CertificateInfo) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let client = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                provider: provider.clone(),
            }))
            .with_client_auth_cert(vec![our_cert.certificate_der()], our_cert.private_key_der())?;

        let server = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert { provider }))
            .with_single_cert(vec![our_cert.certificate_der()], our_cert.private_key_der())?;

        debug!(
            "TLS config created for device {} ({})",
            our_cert.device_id, our_cert.fingerprint
        );

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client.clone())
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server.clone())
    }
}

/// Server name used for the client handshake
///
/// Device certificates carry no subject alternative names, so this only
/// feeds SNI; it is never matched against the certificate.
pub fn server_name_for(ip: IpAddr) -> ServerName<'static> {
    ServerName::IpAddress(ip.into())
}

/// Fingerprint of the end-entity certificate presented by the peer
pub fn peer_fingerprint(certs: Option<&[CertificateDer<'_>]>) -> Result<Fingerprint> {
    certs
        .and_then(|chain| chain.first())
        .map(|cert| Fingerprint::of_certificate(cert.as_ref()))
        .ok_or_else(|| ProtocolError::TlsHandshake("peer presented no certificate".to_string()))
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_create_tls_config() {
        let cert = CertificateInfo::generate("test_device").unwrap();
        assert!(TlsConfig::new(&cert).is_ok());
    }

    #[tokio::test]
    async fn test_mutual_handshake_with_self_signed_certs() {
        let client_cert = CertificateInfo::generate("1000").unwrap();
        let server_cert = CertificateInfo::generate("2000").unwrap();
        let client_tls = TlsConfig::new(&client_cert).unwrap();
        let server_tls = TlsConfig::new(&server_cert).unwrap();

        let (client_io, server_io) = duplex(16 * 1024);
        let server_name = server_name_for("127.0.0.1".parse().unwrap());

        let server = tokio::spawn(async move {
            let mut stream = server_tls.acceptor().accept(server_io).await.unwrap();
            let fingerprint = peer_fingerprint(stream.get_ref().1.peer_certificates()).unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            fingerprint
        });

        let mut stream = client_tls
            .connector()
            .connect(server_name, client_io)
            .await
            .unwrap();
        let seen_by_client = peer_fingerprint(stream.get_ref().1.peer_certificates()).unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();

        let seen_by_server = server.await.unwrap();
        assert_eq!(seen_by_client, server_cert.fingerprint);
        assert_eq!(seen_by_server, client_cert.fingerprint);
    }

    #[test]
    fn test_peer_fingerprint_requires_certificate() {
        assert!(matches!(
            peer_fingerprint(None),
            Err(ProtocolError::TlsHandshake(_))
        ));
    }
}
