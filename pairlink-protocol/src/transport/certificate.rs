//! Device certificates and fingerprints
//!
//! Every device owns one self-signed certificate whose Common Name is its
//! device id. There is no certificate authority: peers remember each other's
//! certificate by SHA-256 fingerprint once pairing succeeds.

use crate::{ProtocolError, Result};
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Certificate file name inside the certificate directory
pub const CERT_FILE_NAME: &str = "device_cert.pem";

/// Private key file name inside the certificate directory
pub const KEY_FILE_NAME: &str = "device_key.pem";

const CERT_ORG: &str = "Pairlink";

/// SHA-256 fingerprint of a DER-encoded certificate
///
/// Displayed as colon-separated upper-case hex, serialized as plain
/// lower-case hex.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    /// Fingerprint of a DER-encoded certificate
    pub fn of_certificate(cert_der: &[u8]) -> Self {
        Self(Sha256::digest(cert_der).to_vec())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Parse a hex fingerprint, with or without colon separators
    pub fn from_hex(s: &str) -> Result<Self> {
        let compact: String = s.chars().filter(|c| *c != ':').collect();
        hex::decode(compact)
            .map(Self)
            .map_err(|e| ProtocolError::CertificateValidation(format!("invalid fingerprint: {}", e)))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        f.write_str(&parts.join(":"))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Device certificate information
#[derive(Clone)]
pub struct CertificateInfo {
    /// Device ID (used as Common Name)
    pub device_id: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// DER-encoded PKCS#8 private key
    pub private_key: Vec<u8>,

    /// SHA-256 fingerprint of the certificate
    pub fingerprint: Fingerprint,
}

impl fmt::Debug for CertificateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateInfo")
            .field("device_id", &self.device_id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl CertificateInfo {
    /// Generate a new self-signed certificate for a device
    ///
    /// ```
    /// use pairlink_protocol::CertificateInfo;
    ///
    /// let cert_info = CertificateInfo::generate("test_device_id").unwrap();
    /// println!("Fingerprint: {}", cert_info.fingerprint);
    /// ```
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params
            .distinguished_name
            .push(DnType::OrganizationName, CERT_ORG);
        params
            .distinguished_name
            .push(DnType::CommonName, device_id.as_str());

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        let certificate = cert.der().to_vec();
        let fingerprint = Fingerprint::of_certificate(&certificate);

        info!(
            "Generated certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key: key_pair.serialize_der(),
            fingerprint,
        })
    }

    /// Save certificate and private key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)?;
        }

        let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", self.certificate.clone()));
        fs::write(cert_path, cert_pem)?;

        let key_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", self.private_key.clone()));
        fs::write(key_path, key_pem)?;

        info!(
            "Saved certificate to {:?} and private key to {:?}",
            cert_path, key_path
        );

        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(
        device_id: impl Into<String>,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let device_id = device_id.into();
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!("Loading certificate from {:?}", cert_path);

        let certificate = read_pem(cert_path, "CERTIFICATE")?;
        let private_key = read_pem(key_path, "PRIVATE KEY")?;
        let fingerprint = Fingerprint::of_certificate(&certificate);

        info!(
            "Loaded certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Load the device certificate from `dir`, generating and saving one on
    /// first use
    pub fn load_or_generate(dir: impl AsRef<Path>, device_id: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let cert_path = dir.join(CERT_FILE_NAME);
        let key_path = dir.join(KEY_FILE_NAME);

        if cert_path.exists() && key_path.exists() {
            Self::load_from_files(device_id, &cert_path, &key_path)
        } else {
            info!("Generating new certificate for device {}", device_id);
            let cert = Self::generate(device_id)?;
            cert.save_to_files(&cert_path, &key_path)?;
            Ok(cert)
        }
    }

    /// Certificate in the form rustls expects
    pub fn certificate_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.certificate.clone())
    }

    /// Private key in the form rustls expects
    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key.clone()))
    }
}

fn read_pem(path: &Path, expected_tag: &str) -> Result<Vec<u8>> {
    let data = fs::read(path)?;
    let parsed = pem::parse(data).map_err(|e| {
        ProtocolError::CertificateValidation(format!("{}: {}", path.display(), e))
    })?;

    if parsed.tag() != expected_tag {
        return Err(ProtocolError::CertificateValidation(format!(
            "{}: expected {} block, found {}",
            path.display(),
            expected_tag,
            parsed.tag()
        )));
    }

    Ok(parsed.into_contents())
}
