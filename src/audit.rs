//! Structured audit logging for the IDMEF event manager.
//!
//! Every security- or operations-relevant occurrence (session
//! authentication, sink mode transitions, administrative credential
//! actions) is appended as a single JSON line to an audit log file. The
//! log uses `tokio::sync::Mutex` to serialize writes and
//! `tokio::fs::OpenOptions` in append mode for crash safety.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Categories of auditable events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A TLS connection was accepted and the peer's analyzer identity
    /// and permissions extracted from its certificate.
    SessionAuthenticated,
    /// A connection was rejected during handshake or authentication.
    SessionRejected,
    /// A session was closed, cleanly or due to an error.
    SessionClosed,
    /// A sink transitioned from live delivery into failover spooling.
    SinkFailover,
    /// A sink's spool drained and it returned to live delivery.
    SinkRecovered,
    /// An administrative credential request (gen-cert) was served.
    CredentialIssued,
    /// An administrative credential destroy request was served.
    CredentialDestroyed,
}

/// A single audit log record. Fields not applicable to a given event
/// type are left `None` and omitted from the serialized line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub event_type: AuditEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyzer_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEntry {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            analyzer_id: None,
            remote_addr: None,
            sink: None,
            instance: None,
            reason: None,
        }
    }

    pub fn with_analyzer_id(mut self, analyzer_id: u64) -> Self {
        self.analyzer_id = Some(analyzer_id);
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn sink_failover(sink: &str, instance: &str) -> Self {
        Self::new(AuditEventType::SinkFailover)
            .with_sink(sink, instance)
    }

    pub fn sink_recovered(sink: &str, instance: &str) -> Self {
        Self::new(AuditEventType::SinkRecovered)
            .with_sink(sink, instance)
    }

    fn with_sink(mut self, sink: &str, instance: &str) -> Self {
        self.sink = Some(sink.to_string());
        self.instance = Some(instance.to_string());
        self
    }
}

/// Append-only audit log backed by a JSON-lines file.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
}

impl AuditLog {
    /// Open (or create) the audit log file at `path` in append mode,
    /// creating any missing parent directories.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create audit log directory: {}", parent.display()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open audit log: {}", path.display()))?;

        debug!(path = %path.display(), "audit log opened");

        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Append a single audit entry as a JSON line. Failures are logged by
    /// the caller but deliberately not allowed to interrupt the
    /// operation being audited — the audit trail is best-effort alongside
    /// the authoritative `tracing` log, not a transactional ledger.
    pub async fn log(&self, entry: AuditEntry) {
        if let Err(e) = self.try_log(entry).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
    }

    async fn try_log(&self, entry: AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry).context("failed to serialize audit entry")?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write to audit log: {}", self.path.display()))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed to flush audit log: {}", self.path.display()))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_json_line_per_entry() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(path.clone()).await.unwrap();

        log.log(
            AuditEntry::new(AuditEventType::SessionAuthenticated)
                .with_analyzer_id(42)
                .with_remote_addr("127.0.0.1:5555"),
        )
        .await;
        log.log(AuditEntry::sink_failover("sql", "primary")).await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);

        let parsed: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.event_type, AuditEventType::SessionAuthenticated);
        assert_eq!(parsed.analyzer_id, Some(42));

        let parsed2: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed2.event_type, AuditEventType::SinkFailover);
        assert_eq!(parsed2.sink.as_deref(), Some("sql"));
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        let log = AuditLog::open(path.clone()).await.unwrap();
        log.log(AuditEntry::new(AuditEventType::SessionClosed)).await;
        assert!(path.exists());
    }
}
