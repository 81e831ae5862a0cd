//! The connection reactor: binds the configured listen endpoints, drives
//! the TLS handshake and authentication for each accepted connection, and
//! hands authenticated sessions off to the normalizer/fan-out pipeline.
//!
//! One task per accepted connection, rather than a fixed worker pool
//! driven by a manual readiness poller: the runtime's own scheduler
//! already does that bookkeeping, a spawned task can only be making
//! progress on one `.await` at a time by construction, and the task's own
//! exit is its deregistration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEntry, AuditEventType, AuditLog};
use crate::auth;
use crate::cert::generate_self_signed_cert;
use crate::config::ManagerConfig;
use crate::decode::DecodeRegistry;
use crate::error::SessionError;
use crate::fanout::{run_recovery_loop, FanoutEngine, ShutdownFlag};
use crate::identity::Identity;
use crate::idmef::Analyzer;
use crate::permissions::PermissionSet;
use crate::session::{self, ClientSession, SessionContext};
use crate::sink::{Sink, XmlFileSink};
use crate::spool::Spool;
use crate::tls::build_server_config;
use crate::wire::AuthResult;

/// How often the recovery loop checks every sink's retry timer.
const RECOVERY_TICK: Duration = Duration::from_secs(5);

/// Backlog passed to `listen(2)` for every TCP listener.
const TCP_BACKLOG: u32 = 1024;

/// The running manager: everything needed to accept connections and feed
/// them into the event-processing fabric, assembled once at startup.
pub struct Manager {
    config: ManagerConfig,
    tls_acceptor: TlsAcceptor,
    session_ctx: Arc<SessionContext>,
    fanout: Arc<FanoutEngine>,
    audit: Arc<AuditLog>,
    shutdown: Arc<ShutdownFlag>,
}

impl Manager {
    /// Assemble the manager from its configuration: load or generate the
    /// manager's own TLS identity, build the sink registry and fan-out
    /// engine (opening every sink's spool and scheduling immediate
    /// recovery for any that resume non-empty), and build the TLS
    /// acceptor sensors will handshake against.
    pub async fn new(config: ManagerConfig) -> Result<Self> {
        let identity = Identity::load_or_generate(&config.identity.private_key_path)
            .context("failed to load or generate manager TLS identity")?;

        let (cert_der, key_der) = generate_self_signed_cert(
            &identity,
            config.identity.analyzer_id,
            &PermissionSet::new(),
        )
        .context("failed to generate manager's self-signed certificate")?;
        let tls_config =
            build_server_config(cert_der, key_der).context("failed to build TLS server config")?;
        let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let audit = Arc::new(
            AuditLog::open(config.spool.directory.join("audit.jsonl"))
                .await
                .context("failed to open audit log")?,
        );

        let sinks = build_sinks(&config).await.context("failed to build sink registry")?;
        let fanout = Arc::new(FanoutEngine::new(
            crate::filter::FilterChain::new(),
            sinks,
            audit.clone(),
        ));

        let session_ctx = Arc::new(SessionContext {
            manager_analyzer: Analyzer::with_id(config.identity.analyzer_id),
            decode_registry: Arc::new(DecodeRegistry::new()),
            fanout: fanout.clone(),
            audit: audit.clone(),
        });

        Ok(Self {
            config,
            tls_acceptor,
            session_ctx,
            fanout,
            audit,
            shutdown: Arc::new(ShutdownFlag::new()),
        })
    }

    /// Run until a shutdown signal arrives: binds every configured
    /// listener, spawns the failover recovery loop, and accepts
    /// connections until `SIGINT`/`SIGTERM` (or, on non-Unix targets,
    /// `Ctrl-C`) sets the shutdown flag.
    pub async fn run(self) -> Result<()> {
        let manager = Arc::new(self);
        let notify = Arc::new(Notify::new());

        tokio::spawn(watch_for_shutdown(manager.shutdown.clone(), notify.clone()));
        tokio::spawn(run_recovery_loop(
            manager.fanout.clone(),
            manager.shutdown.clone(),
            RECOVERY_TICK,
        ));

        let mut accept_tasks = Vec::new();

        if let Some(path) = manager.config.listen.unix_path.clone() {
            let listener = bind_unix(&path).await?;
            info!(path = %path.display(), "listening on UNIX socket");
            accept_tasks.push(tokio::spawn(accept_unix_loop(
                listener,
                manager.clone(),
                notify.clone(),
            )));
        }

        for addr in manager.config.listen.tcp_addrs.clone() {
            let listener = bind_tcp(&addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
            info!(%addr, "listening on TCP");
            accept_tasks.push(tokio::spawn(accept_tcp_loop(
                listener,
                manager.clone(),
                notify.clone(),
            )));
        }

        if accept_tasks.is_empty() {
            anyhow::bail!("no listen endpoints bound (config validation should have caught this)");
        }

        for task in accept_tasks {
            let _ = task.await;
        }

        info!("manager shut down cleanly");
        Ok(())
    }
}

/// Wait for `SIGTERM` (or `SIGINT` on every platform) and set the
/// process-wide shutdown flag, waking every accept loop selecting on
/// `notify`.
async fn watch_for_shutdown(shutdown: Arc<ShutdownFlag>, notify: Arc<Notify>) {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sig) => sig,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received, draining accept loops");
    shutdown.set();
    notify.notify_waiters();
}

/// Build the configured sink registry, opening each sink's failover
/// spool (which itself decides whether the sink starts in `live` or
/// `failover` mode). Unknown `kind` values name an external
/// plugin this manager doesn't build in; they are logged and skipped
/// rather than treated as a fatal config error, since plugin loading
/// itself is an external collaborator's responsibility.
async fn build_sinks(config: &ManagerConfig) -> Result<Vec<crate::fanout::SinkEntry>> {
    let mut entries = Vec::with_capacity(config.sinks.len());

    for sink_cfg in &config.sinks {
        let sink: Arc<dyn Sink> = match sink_cfg.kind.as_str() {
            "xml-file" => {
                let path = sink_cfg
                    .params
                    .get("path")
                    .and_then(|v| v.as_str())
                    .map(PathBuf::from)
                    .unwrap_or_else(|| {
                        config
                            .spool
                            .directory
                            .join(format!("{}[{}].xml", sink_cfg.name, sink_cfg.instance))
                    });
                Arc::new(XmlFileSink::new(sink_cfg.instance.clone(), path))
            }
            other => {
                warn!(
                    kind = other,
                    name = %sink_cfg.name,
                    instance = %sink_cfg.instance,
                    "unrecognized sink kind, skipping (external sink plugins are not loaded by this manager)"
                );
                continue;
            }
        };

        let spool_path = Spool::path_for(&config.spool.directory, &sink_cfg.name, &sink_cfg.instance);
        let quota = config.quota_for(&sink_cfg.name, &sink_cfg.instance);
        let retry_period = config.retry_period_for(&sink_cfg.name, &sink_cfg.instance);
        let spool = Spool::open(spool_path, quota)
            .await
            .with_context(|| format!("failed to open spool for {}[{}]", sink_cfg.name, sink_cfg.instance))?;

        entries.push(
            crate::fanout::SinkEntry::new(sink, crate::filter::FilterChain::new(), spool, retry_period)
                .await,
        );
    }

    Ok(entries)
}

/// Bind a TCP listener with `SO_REUSEADDR` set before `bind(2)`, per §6.
fn bind_tcp_socket(addr: std::net::SocketAddr) -> Result<tokio::net::TcpSocket> {
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()
    } else {
        tokio::net::TcpSocket::new_v6()
    }
    .context("failed to create TCP socket")?;
    socket.set_reuseaddr(true).context("failed to set SO_REUSEADDR")?;
    socket.bind(addr).with_context(|| format!("failed to bind {addr}"))?;
    Ok(socket)
}

async fn bind_tcp(addr: &str) -> Result<TcpListener> {
    let socket_addr: std::net::SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid TCP listen address: {addr}"))?;
    let socket = bind_tcp_socket(socket_addr)?;
    socket.listen(TCP_BACKLOG).context("failed to listen")
}

/// Set `SO_KEEPALIVE` on an accepted stream. Applied per-connection
/// rather than on the listening socket, since that is the option's
/// actual scope on every platform tokio targets.
fn enable_keepalive(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    if let Err(e) = sock_ref.set_keepalive(true) {
        debug!(error = %e, "failed to set SO_KEEPALIVE on accepted socket");
    }
}

/// Bind the UNIX listener at `path`, first unlinking a stale socket file
/// left behind by a prior crash. A `connect()` probe distinguishes
/// "stale" from "another instance is already listening here": only the
/// former is unlinked, per §6.
async fn bind_unix(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        match UnixStream::connect(path).await {
            Ok(_) => {
                anyhow::bail!(
                    "UNIX socket {} is already in use by a running instance",
                    path.display()
                );
            }
            Err(_) => {
                debug!(path = %path.display(), "removing stale UNIX socket file");
                std::fs::remove_file(path)
                    .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
            }
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let listener = UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // World-accessible: the security boundary is the filesystem path,
        // not socket permission bits.
        let perms = std::fs::Permissions::from_mode(0o777);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to chmod {}", path.display()))?;
    }

    Ok(listener)
}

async fn accept_tcp_loop(listener: TcpListener, manager: Arc<Manager>, notify: Arc<Notify>) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = notify.notified() => None,
            result = listener.accept() => Some(result),
        };

        if manager.shutdown.is_set() {
            return;
        }

        let Some(result) = accepted else { continue };
        let (stream, peer_addr) = match result {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "failed to accept TCP connection");
                continue;
            }
        };

        enable_keepalive(&stream);
        let manager = manager.clone();
        let remote = peer_addr.to_string();
        tokio::spawn(async move {
            let acceptor = manager.tls_acceptor.clone();
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(remote = %remote, error = %e, "TLS handshake failed");
                    return;
                }
            };
            handle_tls_session(tls_stream, remote, manager, false).await;
        });
    }
}

async fn accept_unix_loop(listener: UnixListener, manager: Arc<Manager>, notify: Arc<Notify>) {
    let remote_label = format!(
        "unix:{}",
        manager
            .config
            .listen
            .unix_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    );

    loop {
        let accepted = tokio::select! {
            biased;
            _ = notify.notified() => None,
            result = listener.accept() => Some(result),
        };

        if manager.shutdown.is_set() {
            return;
        }

        let Some(result) = accepted else { continue };
        let (stream, _addr) = match result {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "failed to accept UNIX connection");
                continue;
            }
        };

        let manager = manager.clone();
        let remote = remote_label.clone();
        tokio::spawn(async move {
            let acceptor = manager.tls_acceptor.clone();
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(remote = %remote, error = %e, "TLS handshake failed");
                    return;
                }
            };
            handle_tls_session(tls_stream, remote, manager, true).await;
        });
    }
}

/// Drive one accepted, handshaken connection from authentication through
/// to session close. `is_unix` selects the post-auth plaintext downgrade;
/// it is only ever taken here because this function is only called from
/// the UNIX accept loop with `true`.
async fn handle_tls_session<IO>(
    mut stream: tokio_rustls::server::TlsStream<IO>,
    remote: String,
    manager: Arc<Manager>,
    is_unix: bool,
) where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut session = ClientSession::new(remote.clone());

    let creds = match auth::derive_credentials(&stream) {
        Ok(creds) => creds,
        Err(SessionError::AuthRejected(reason)) => {
            warn!(remote = %remote, reason = %reason, "authentication rejected");
            // One opportunistic final write attempting to tell the peer
            // why, per the bounded-retry resolution of the `closing`
            // open question; its own failure is not escalated further.
            let _ = auth::emit_result(
                &mut stream,
                AuthResult::Failed,
                manager.session_ctx.manager_analyzer.analyzerid,
            )
            .await;
            manager
                .audit
                .log(
                    AuditEntry::new(AuditEventType::SessionRejected)
                        .with_remote_addr(remote)
                        .with_reason(reason),
                )
                .await;
            return;
        }
        Err(e) => {
            warn!(remote = %remote, error = %e, "authentication failed");
            return;
        }
    };

    let analyzer_id = creds.analyzer_id;
    if let Err(e) = auth::emit_result(
        &mut stream,
        AuthResult::Succeed,
        manager.session_ctx.manager_analyzer.analyzerid,
    )
    .await
    {
        warn!(remote = %remote, error = %e, "failed to write AUTH success record");
        return;
    }

    session.mark_accepted(creds);
    manager
        .audit
        .log(
            AuditEntry::new(AuditEventType::SessionAuthenticated)
                .with_analyzer_id(analyzer_id)
                .with_remote_addr(remote.clone()),
        )
        .await;

    let result = if is_unix {
        let mut plain = session::downgrade_to_plaintext(stream);
        session::run(&mut session, &mut plain, &manager.session_ctx).await
    } else {
        session::run(&mut session, &mut stream, &manager.session_ctx).await
    };

    if let Err(e) = result {
        debug!(remote = %remote, error = %e, "session ended with error");
    }
}
