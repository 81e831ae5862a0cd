//! mTLS configuration for the sensor-facing listener.
//!
//! TLS 1.3 only, client certificates mandatory. Certificate *chain*
//! verification is intentionally permissive: analyzer identity and
//! permissions are carried in the certificate's own SAN (see
//! [`crate::cert`]) and checked at the application layer by the
//! authenticator, the same split the peer-facing TLS stack already uses
//! elsewhere in this codebase for endpoint identity.

use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, Error, ServerConfig, SignatureScheme};

/// ALPN protocol identifier for the sensor-to-manager link.
const ALPN_IDMEF_LINK: &[u8] = b"idmef/1";

#[derive(Debug)]
struct AcceptAnyClientCert {
    supported_schemes: Vec<SignatureScheme>,
}

impl AcceptAnyClientCert {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            supported_schemes: provider.signature_verification_algorithms.supported_schemes(),
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

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
    ) -> Result<ClientCertVerified, Error> {
        // CA-chain verification is skipped here; the authenticator checks
        // the SAN-encoded analyzer id and permission set after handshake.
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_schemes.clone()
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    supported_schemes: Vec<SignatureScheme>,
}

impl AcceptAnyServerCert {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            supported_schemes: provider.signature_verification_algorithms.supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_schemes.clone()
    }
}

/// Build the manager's TLS 1.3 server config: mandatory client certs, no
/// chain verification, `idmef/1` ALPN.
pub fn build_server_config(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<ServerConfig> {
    let provider = default_provider();
    let verifier = Arc::new(AcceptAnyClientCert::new(&provider));

    let cert = CertificateDer::from(cert_der);
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_der));

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to pin TLS 1.3")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![cert], key)
        .context("failed to configure server certificate")?;

    config.alpn_protocols = vec![ALPN_IDMEF_LINK.to_vec()];
    Ok(config)
}

/// Build a TLS client config for `gen-cert`-minted test sensors and for
/// peer-manager relay connections.
pub fn build_client_config(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<ClientConfig> {
    let provider = default_provider();
    let verifier = Arc::new(AcceptAnyServerCert::new(&provider));

    let cert = CertificateDer::from(cert_der);
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_der));

    let mut config = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to pin TLS 1.3")?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(vec![cert], key)
        .context("failed to configure client certificate")?;

    config.alpn_protocols = vec![ALPN_IDMEF_LINK.to_vec()];
    Ok(config)
}
