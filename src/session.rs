//! The per-connection client session: accept → authenticate → accepted →
//! closing/closed, realized as an explicit state field driving a
//! normalizer and handing completed events to the fan-out engine.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::audit::{AuditEntry, AuditEventType, AuditLog};
use crate::cert::PeerCredentials;
use crate::decode::DecodeRegistry;
use crate::error::SessionError;
use crate::fanout::FanoutEngine;
use crate::idmef::Analyzer;
use crate::normalizer::Normalizer;
use crate::permissions::PermissionSet;
use crate::wire::read_message;

/// Any transport a session can be driven over once authenticated: a raw
/// TCP/UNIX socket, or a TLS stream wrapping one. A blanket impl means
/// every `AsyncRead + AsyncWrite + Unpin + Send` type already qualifies —
/// no sealed marker methods to implement per transport.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticating,
    Accepted,
    Closing,
    Closed,
}

/// Per-connection identity and lifecycle state. The IO handle itself is
/// threaded through [`ClientSession::run`] rather than stored here, since
/// its concrete type (TLS-over-TCP, TLS-over-UNIX pre-downgrade, or raw
/// UNIX post-downgrade) varies per listener.
pub struct ClientSession {
    pub remote_addr: String,
    pub state: SessionState,
    pub analyzer_id: Option<u64>,
    pub permissions: Option<PermissionSet>,
}

impl ClientSession {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            state: SessionState::Authenticating,
            analyzer_id: None,
            permissions: None,
        }
    }

    /// Record a successful authentication and move to `accepted`. Never
    /// called with an empty permission set: the authenticator rejects
    /// that case before this is reached.
    pub fn mark_accepted(&mut self, creds: PeerCredentials) {
        info!(
            remote = %self.remote_addr,
            analyzer_id = creds.analyzer_id,
            permissions = creds.permissions.len(),
            "session accepted"
        );
        self.analyzer_id = Some(creds.analyzer_id);
        self.permissions = Some(creds.permissions);
        self.state = SessionState::Accepted;
    }

    pub fn mark_closing(&mut self) {
        self.state = SessionState::Closing;
    }

    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn is_accepted(&self) -> bool {
        self.state == SessionState::Accepted
    }
}

/// Shared, read-only context every session needs: the manager's own
/// analyzer identity, the decode plugin registry, the fan-out engine, and
/// the audit trail.
pub struct SessionContext {
    pub manager_analyzer: Analyzer,
    pub decode_registry: Arc<DecodeRegistry>,
    pub fanout: Arc<FanoutEngine>,
    pub audit: Arc<AuditLog>,
}

/// Drive an already-`accepted` session's read loop to completion: read
/// wire records, normalize them, and dispatch completed events to the
/// fan-out engine, until the peer closes or a fatal protocol error
/// occurs. No bytes are read here until the caller has transitioned
/// `session` to `Accepted`; that ordering, not a check inside this loop,
/// is what keeps pre-auth bytes from ever reaching the normalizer.
pub async fn run<IO>(
    session: &mut ClientSession,
    io: &mut IO,
    ctx: &SessionContext,
) -> Result<(), SessionError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    debug_assert!(session.is_accepted(), "run() requires an accepted session");

    let mut normalizer = Normalizer::new(ctx.manager_analyzer.clone(), ctx.decode_registry.clone());

    loop {
        let msg = match read_message(io).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                session.mark_closing();
                return Err(SessionError::Protocol(e));
            }
        };

        if let Err(e) = normalizer.feed(&msg) {
            warn!(remote = %session.remote_addr, error = %e, "protocol error, closing session");
            session.mark_closing();
            return Err(SessionError::Protocol(e));
        }

        for event in normalizer.take_ready() {
            ctx.fanout.dispatch(&event).await;
        }
    }

    normalizer.flush_pending();
    for event in normalizer.take_ready() {
        ctx.fanout.dispatch(&event).await;
    }

    session.mark_closing();
    session.mark_closed();
    ctx.audit
        .log(AuditEntry::new(AuditEventType::SessionClosed).with_analyzer_id(
            session.analyzer_id.unwrap_or_default(),
        ))
        .await;
    Ok(())
}

/// Drop the TLS layer after authentication, handing back the raw
/// transport. Permitted only for UNIX-domain sessions; callers must not
/// invoke this for a TCP session.
///
/// No extra plaintext draining is needed: the wire protocol is
/// request/response during the handshake (the sensor waits for the
/// manager's `AUTH` record before sending any application record), so no
/// application data can already be buffered inside the TLS connection at
/// the point of downgrade.
pub fn downgrade_to_plaintext<IO>(tls: tokio_rustls::server::TlsStream<IO>) -> IO
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (io, _connection) = tls.into_inner();
    io
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::fanout::{FanoutEngine, SinkEntry, DEFAULT_RETRY_PERIOD};
    use crate::filter::FilterChain;
    use crate::idmef::{Alert, Classification, EventCore};
    use crate::permissions::Permission;
    use crate::sink::RecorderSink;
    use crate::spool::Spool;
    use crate::wire::{encode_message_at, Tag};
    use chrono::Utc;
    use tempfile::tempdir;
    use tokio::io::duplex;

    fn sample_creds() -> PeerCredentials {
        let mut perms = PermissionSet::new();
        perms.insert(Permission::IdmefWrite);
        PeerCredentials {
            analyzer_id: 42,
            permissions: perms,
        }
    }

    async fn make_context(dir: &std::path::Path, sink: Arc<RecorderSink>) -> SessionContext {
        let spool = Spool::open(Spool::path_for(dir, sink.name(), sink.instance_name()), 100)
            .await
            .unwrap();
        let entry = SinkEntry::new(sink, FilterChain::new(), spool, DEFAULT_RETRY_PERIOD).await;
        let audit = Arc::new(AuditLog::open(dir.join("audit.jsonl")).await.unwrap());
        let fanout = Arc::new(FanoutEngine::new(FilterChain::new(), vec![entry], audit.clone()));

        SessionContext {
            manager_analyzer: Analyzer::with_id(1),
            decode_registry: Arc::new(DecodeRegistry::new()),
            fanout,
            audit,
        }
    }

    #[tokio::test]
    async fn accepted_session_dispatches_alerts_to_fanout() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(RecorderSink::new("recorder", "default"));
        let ctx = make_context(dir.path(), sink.clone()).await;

        let (mut client, mut server) = duplex(8192);
        let alert = Alert {
            core: EventCore::new(Utc::now()),
            detect_time: None,
            assessment: None,
            classification: Classification {
                ident: 0,
                text: "portscan".into(),
            },
        };
        let payload = serde_json::to_vec(&alert).unwrap();
        let frame = encode_message_at(Tag::Alert, &payload, Utc::now()).unwrap();

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(&frame).await.unwrap();
            drop(client);
        });

        let mut session = ClientSession::new("127.0.0.1:5555");
        session.mark_accepted(sample_creds());
        run(&mut session, &mut server, &ctx).await.unwrap();
        writer.await.unwrap();

        assert_eq!(sink.received_count(), 1);
        assert_eq!(session.state, SessionState::Closed);
    }

    #[tokio::test]
    async fn protocol_error_closes_session_without_dispatch() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(RecorderSink::new("recorder", "default"));
        let ctx = make_context(dir.path(), sink.clone()).await;

        let (mut client, mut server) = duplex(8192);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            // Declares an unsupported protocol version in the header.
            client.write_all(&[99, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();
            drop(client);
        });

        let mut session = ClientSession::new("127.0.0.1:5555");
        session.mark_accepted(sample_creds());
        let result = run(&mut session, &mut server, &ctx).await;
        writer.await.unwrap();

        assert!(result.is_err());
        assert_eq!(sink.received_count(), 0);
    }
}
