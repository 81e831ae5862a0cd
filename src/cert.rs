//! X.509 certificate generation and SAN-based identity/permission encoding.
//!
//! A sensor's analyzer id and granted permissions travel in the peer
//! certificate's Subject Alternative Name as DNS-name-shaped strings:
//! exactly one `analyzer-id-<u64>` entry and zero or more
//! `idmef-perm-<FLAG>` entries. This lets a minimal certificate carry
//! everything the authenticator needs without a side-channel directory
//! lookup.

use anyhow::{anyhow, Context, Result};
use rcgen::{CertificateParams, KeyPair, PKCS_ED25519};
use rustls_pki_types::PrivatePkcs8KeyDer;
use time::{Duration, OffsetDateTime};
use tracing::debug;
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509Certificate};

use crate::identity::Identity;
use crate::permissions::{Permission, PermissionSet};

const ANALYZER_ID_PREFIX: &str = "analyzer-id-";
const PERM_PREFIX: &str = "idmef-perm-";

/// Fixed ASN.1 DER prefix for an Ed25519 PKCS#8 v1 private key (RFC 8410).
/// Total DER = 16 prefix bytes + 32 raw key bytes = 48 bytes.
const ED25519_PKCS8_V1_PREFIX: [u8; 16] = [
    0x30, 0x2E, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2B, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

fn ed25519_to_pkcs8_der(secret: &[u8; 32]) -> Vec<u8> {
    let mut der = Vec::with_capacity(48);
    der.extend_from_slice(&ED25519_PKCS8_V1_PREFIX);
    der.extend_from_slice(secret);
    der
}

/// SAN DNS-name entries a certificate should carry for a given analyzer
/// id and permission set.
pub fn san_entries(analyzer_id: u64, perms: &PermissionSet) -> Vec<String> {
    let mut entries = vec![format!("{ANALYZER_ID_PREFIX}{analyzer_id}")];
    for perm in perms.iter() {
        entries.push(format!("{PERM_PREFIX}{}", perm.as_flag()));
    }
    entries
}

/// Generate a self-signed certificate for `analyzer_id` carrying `perms`
/// in its SAN. Used both by the `gen-cert` CLI subcommand (to mint sensor
/// certificates) and by the manager itself (to mint its own listener
/// certificate, with an empty permission set).
pub fn generate_self_signed_cert(
    identity: &Identity,
    analyzer_id: u64,
    perms: &PermissionSet,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let san = san_entries(analyzer_id, perms);
    debug!(analyzer_id, san_count = san.len(), "generating self-signed certificate");

    let pkcs8_der = ed25519_to_pkcs8_der(&identity.signing_key().to_bytes());
    let pkcs8_ref = PrivatePkcs8KeyDer::from(pkcs8_der.as_slice());
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8_ref, &PKCS_ED25519)
        .context("failed to build rcgen key pair from Ed25519 PKCS#8 DER")?;

    let mut params =
        CertificateParams::new(san).context("failed to create certificate parameters")?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, format!("analyzer-{analyzer_id}"));

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3652);

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign certificate")?;

    Ok((cert.der().to_vec(), pkcs8_der))
}

/// Decoded identity carried by a peer certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerCredentials {
    pub analyzer_id: u64,
    pub permissions: PermissionSet,
}

/// Extract the analyzer id and permission set from a DER-encoded peer
/// certificate's SAN.
///
/// Rejects a certificate missing `analyzer-id-*`, or carrying it more
/// than once — both are `AuthRejected` conditions at the call site.
pub fn extract_peer_credentials(cert_der: &[u8]) -> Result<PeerCredentials> {
    let (_, cert) =
        X509Certificate::from_der(cert_der).map_err(|e| anyhow!("failed to parse certificate: {e}"))?;

    let mut analyzer_id: Option<u64> = None;
    let mut permissions = PermissionSet::new();

    for ext in cert.extensions() {
        let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() else {
            continue;
        };
        for name in &san.general_names {
            let dns = match name {
                GeneralName::DNSName(dns) => *dns,
                GeneralName::RFC822Name(name) => *name,
                _ => continue,
            };
            if let Some(id_str) = dns.strip_prefix(ANALYZER_ID_PREFIX) {
                let id: u64 = id_str
                    .parse()
                    .map_err(|_| anyhow!("analyzer-id SAN entry is not a valid u64: {id_str}"))?;
                if analyzer_id.replace(id).is_some() {
                    return Err(anyhow!("certificate carries more than one analyzer-id- SAN entry"));
                }
            } else if let Some(flag) = dns.strip_prefix(PERM_PREFIX) {
                if let Some(perm) = Permission::from_flag(flag) {
                    permissions.insert(perm);
                }
            }
        }
    }

    let analyzer_id =
        analyzer_id.ok_or_else(|| anyhow!("certificate missing analyzer-id- SAN entry"))?;

    Ok(PeerCredentials {
        analyzer_id,
        permissions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_extract_round_trip() {
        let identity = Identity::generate();
        let mut perms = PermissionSet::new();
        perms.insert(Permission::IdmefWrite);

        let (cert_der, key_der) = generate_self_signed_cert(&identity, 42, &perms).unwrap();
        assert_eq!(key_der.len(), 48);

        let creds = extract_peer_credentials(&cert_der).unwrap();
        assert_eq!(creds.analyzer_id, 42);
        assert!(creds.permissions.contains(Permission::IdmefWrite));
        assert!(!creds.permissions.contains(Permission::IdmefRead));
    }

    #[test]
    fn missing_analyzer_id_is_rejected() {
        let key_pair = KeyPair::generate_for(&PKCS_ED25519).unwrap();
        let params = CertificateParams::new(vec!["idmef-perm-IDMEF_WRITE".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let result = extract_peer_credentials(&cert.der().to_vec());
        assert!(result.is_err());
    }

    #[test]
    fn empty_permission_set_still_extracts_analyzer_id() {
        let identity = Identity::generate();
        let (cert_der, _) =
            generate_self_signed_cert(&identity, 7, &PermissionSet::new()).unwrap();

        let creds = extract_peer_credentials(&cert_der).unwrap();
        assert_eq!(creds.analyzer_id, 7);
        assert!(creds.permissions.is_empty());
    }
}
