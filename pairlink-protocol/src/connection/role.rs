//! TLS role assignment
//!
//! Both peers compute the role independently from the two device ids; no
//! message is exchanged to decide it. The device whose id is greater,
//! comparing the UTF-8 bytes of the id case-sensitively, is the TLS server
//! and listens; the other one connects.

use crate::{ProtocolError, Result};
use std::cmp::Ordering;

/// Which side of the TLS handshake the local device takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// Role of the local device in a connection with `peer_id`
///
/// Equal ids have no role; such a connection is refused.
pub fn determine_role(local_id: &str, peer_id: &str) -> Result<TlsRole> {
    match local_id.as_bytes().cmp(peer_id.as_bytes()) {
        Ordering::Greater => Ok(TlsRole::Server),
        Ordering::Less => Ok(TlsRole::Client),
        Ordering::Equal => Err(ProtocolError::RoleConflict(format!(
            "peer claims our own device id {}",
            peer_id
        ))),
    }
}

/// Whether the local device listens for `peer_id`
pub fn is_tls_server(local_id: &str, peer_id: &str) -> bool {
    matches!(determine_role(local_id, peer_id), Ok(TlsRole::Server))
}

/// Whether the local device connects to `peer_id`
pub fn should_initiate_connection(local_id: &str, peer_id: &str) -> bool {
    matches!(determine_role(local_id, peer_id), Ok(TlsRole::Client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greater_id_is_server() {
        assert_eq!(determine_role("2000", "1000").unwrap(), TlsRole::Server);
        assert_eq!(determine_role("1000", "2000").unwrap(), TlsRole::Client);
        assert!(is_tls_server("2000", "1000"));
        assert!(should_initiate_connection("1000", "2000"));
    }

    #[test]
    fn test_exactly_one_side_serves() {
        let ids = [
            "1000",
            "2000",
            "a",
            "B",
            "b",
            "740bd4b9_b418_4ee4_97d6_caf1da8151be",
            "740bd4b9_b418_4ee4_97d6_caf1da8151bF",
            "ä",
            "",
        ];

        for a in ids {
            for b in ids {
                if a == b {
                    continue;
                }
                assert_ne!(
                    is_tls_server(a, b),
                    is_tls_server(b, a),
                    "roles for ({:?}, {:?}) are not complementary",
                    a,
                    b
                );
                assert_eq!(
                    determine_role(a, b).unwrap() == TlsRole::Server,
                    determine_role(b, a).unwrap() == TlsRole::Client
                );
            }
        }
    }

    #[test]
    fn test_comparison_is_case_sensitive_bytes() {
        // 'B' (0x42) sorts before 'a' (0x61)
        assert!(is_tls_server("a", "B"));
        assert!(is_tls_server("abc", "ab"));
    }

    #[test]
    fn test_equal_ids_conflict() {
        assert!(matches!(
            determine_role("1000", "1000"),
            Err(ProtocolError::RoleConflict(_))
        ));
        assert!(!is_tls_server("1000", "1000"));
        assert!(!should_initiate_connection("1000", "1000"));
    }
}
