//! The authenticator: derives a session's analyzer identity and
//! permission set from its already-completed TLS handshake, and emits the
//! `AUTH` wire record reporting the outcome.
//!
//! The handshake itself is a single `await` on
//! [`tokio_rustls::TlsAcceptor::accept`]; the runtime's own scheduler
//! handles the read/write readiness bookkeeping a manually driven
//! handshake state machine would otherwise need.

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cert::{extract_peer_credentials, PeerCredentials};
use crate::error::SessionError;
use crate::wire::{encode_auth_payload, write_message, AuthResult, Tag};

/// Pull the peer's leaf certificate out of an accepted server-side TLS
/// stream and derive its analyzer id and permission set from the SAN.
///
/// Rejects: no client certificate, an unparseable certificate, a
/// missing/duplicated `analyzer-id-` entry, or an empty permission set.
pub fn derive_credentials<IO>(
    stream: &tokio_rustls::server::TlsStream<IO>,
) -> Result<PeerCredentials, SessionError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (_, conn) = stream.get_ref();
    let certs = conn
        .peer_certificates()
        .ok_or_else(|| SessionError::AuthRejected("no client certificate presented".into()))?;
    let leaf: &CertificateDer<'_> = certs
        .first()
        .ok_or_else(|| SessionError::AuthRejected("empty client certificate chain".into()))?;

    let creds = extract_peer_credentials(leaf.as_ref())
        .map_err(|e| SessionError::AuthRejected(e.to_string()))?;

    if creds.permissions.is_empty() {
        return Err(SessionError::AuthRejected(format!(
            "analyzer {} presented no idmef-perm- grants",
            creds.analyzer_id
        )));
    }

    Ok(creds)
}

/// Write the `AUTH{SUCCEED|FAILED, manager-analyzer-id}` record that
/// closes out the handshake from the manager's side.
pub async fn emit_result<W>(
    io: &mut W,
    result: AuthResult,
    manager_analyzer_id: u64,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let payload = encode_auth_payload(result, manager_analyzer_id);
    write_message(io, Tag::Auth, &payload)
        .await
        .map_err(SessionError::Protocol)
}
