//! The reporting sink plugin contract, plus two reference sinks kept in
//! tree for testability: an XML file sink and an in-memory recorder used
//! by the scenario tests. Real deployments add a SQL sink, a mail
//! notifier, and so on — those are external collaborators per the scope
//! note in the top-level design and are not implemented here.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::SinkError;
use crate::idmef::{Event, Severity};

/// A reporting sink: persists or forwards normalized events.
///
/// `run` is invoked single-threaded per instance — the fan-out engine
/// never calls `run` on the same sink concurrently with itself. `commit`
/// is only required of sinks that want to participate in failover
/// recovery (see [`Sink::supports_failover`]); a sink that returns `false`
/// there may never be placed in failover mode per the spool invariant
/// that un-recoverable sinks cannot be spooled.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    fn instance_name(&self) -> &str;

    async fn run(&self, event: &Event) -> Result<(), SinkError>;

    /// Reopen files, reconnect, whatever the sink needs to resume after an
    /// outage. Sinks that don't support failover just never have this
    /// called (see `supports_failover`).
    async fn commit(&self) -> Result<(), SinkError> {
        Err(SinkError::NotSupported)
    }

    fn supports_failover(&self) -> bool {
        false
    }

    async fn destroy(&self) {}
}

// ---------------------------------------------------------------------------
// Reference sink: XML file
// ---------------------------------------------------------------------------

/// Emits one IDMEF-shaped XML element per line to an append-only file.
///
/// Helper methods (`emit_optional_attr`, `emit_child_text`) replace the
/// macro-generated serialization the original XML writer used — each is a
/// small typed function parametrized on the output buffer, not a textual
/// macro expansion.
pub struct XmlFileSink {
    name: String,
    instance: String,
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl XmlFileSink {
    pub fn new(instance: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: "xml-file".to_string(),
            instance: instance.into(),
            path,
            file: Mutex::new(None),
        }
    }

    async fn ensure_open(&self) -> Result<(), SinkError> {
        let mut guard = self.file.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SinkError::Transient(format!("create dir: {e}")))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| SinkError::Transient(format!("open {}: {e}", self.path.display())))?;
        *guard = Some(file);
        Ok(())
    }

    fn render(event: &Event) -> String {
        let mut xml = String::new();
        let tag = match event {
            Event::Alert(_) => "Alert",
            Event::Heartbeat(_) => "Heartbeat",
        };
        let _ = write!(xml, "<{tag}");
        emit_optional_attr(&mut xml, "ident", non_zero_ident(event));
        let _ = write!(xml, ">");

        if let Event::Alert(alert) = event {
            emit_child_text(&mut xml, "Classification", &alert.classification.text);
            if let Some(assessment) = &alert.assessment {
                if let Some(sev) = assessment.severity {
                    emit_child_text(&mut xml, "Severity", severity_label(sev));
                }
            }
        }

        if let Some(analyzer) = event.last_analyzer() {
            emit_child_text(&mut xml, "Analyzer", &analyzer.analyzerid.to_string());
        }

        let _ = write!(xml, "</{tag}>\n");
        xml
    }
}

fn non_zero_ident(event: &Event) -> Option<u64> {
    let ident = event.core().ident;
    (ident != 0).then_some(ident)
}

fn severity_label(sev: Severity) -> &'static str {
    match sev {
        Severity::Info => "info",
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
    }
}

/// Write `name="value"` into `out` if `value` is present; a no-op typed
/// helper replacing a variadic attribute-emitting macro.
fn emit_optional_attr<T: std::fmt::Display>(out: &mut String, name: &str, value: Option<T>) {
    if let Some(value) = value {
        let _ = write!(out, " {name}=\"{value}\"");
    }
}

/// Write `<Tag>text</Tag>` into `out`; a typed helper replacing a
/// macro-generated child-element emitter.
fn emit_child_text(out: &mut String, tag: &str, text: &str) {
    let _ = write!(out, "<{tag}>{}</{tag}>", escape_xml_text(text));
}

fn escape_xml_text(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[async_trait]
impl Sink for XmlFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn instance_name(&self) -> &str {
        &self.instance
    }

    async fn run(&self, event: &Event) -> Result<(), SinkError> {
        self.ensure_open().await?;
        let xml = Self::render(event);
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().expect("ensure_open populated this");
        file.write_all(xml.as_bytes())
            .await
            .map_err(|e| SinkError::Transient(format!("write: {e}")))?;
        file.flush().await.map_err(|e| SinkError::Transient(format!("flush: {e}")))
    }

    async fn commit(&self) -> Result<(), SinkError> {
        // Close and let the next `run` reopen the file; this is what
        // recovers from a deleted or rotated log file.
        *self.file.lock().await = None;
        self.ensure_open().await
    }

    fn supports_failover(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Reference sink: in-memory recorder (tests only, but not cfg(test) since
// the scenario tests under tests/ also construct it)
// ---------------------------------------------------------------------------

/// Controllable in-memory sink for unit and scenario tests: records every
/// event it receives and can be told to fail the next N `run` calls.
pub struct RecorderSink {
    name: String,
    instance: String,
    received: StdMutex<Vec<Event>>,
    fail_next: StdMutex<usize>,
    permanent: bool,
}

impl RecorderSink {
    pub fn new(name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: instance.into(),
            received: StdMutex::new(Vec::new()),
            fail_next: StdMutex::new(0),
            permanent: false,
        }
    }

    /// A sink with no `commit` hook: any failure is `SinkPermanent`.
    pub fn without_commit(name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            permanent: true,
            ..Self::new(name, instance)
        }
    }

    pub fn fail_next_n(&self, n: usize) {
        *self.fail_next.lock().unwrap() = n;
    }

    pub fn received(&self) -> Vec<Event> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

#[async_trait]
impl Sink for RecorderSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn instance_name(&self) -> &str {
        &self.instance
    }

    async fn run(&self, event: &Event) -> Result<(), SinkError> {
        let mut remaining = self.fail_next.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(if self.permanent {
                SinkError::Permanent("recorder sink instructed to fail".into())
            } else {
                SinkError::Transient("recorder sink instructed to fail".into())
            });
        }
        drop(remaining);
        self.received.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<(), SinkError> {
        if self.permanent {
            return Err(SinkError::NotSupported);
        }
        Ok(())
    }

    fn supports_failover(&self) -> bool {
        !self.permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmef::{Classification, EventCore};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample_event() -> Event {
        Event::Alert(crate::idmef::Alert {
            core: EventCore::new(Utc::now()),
            detect_time: None,
            assessment: None,
            classification: Classification {
                ident: 0,
                text: "portscan".into(),
            },
        })
    }

    #[tokio::test]
    async fn xml_sink_appends_one_line_per_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alerts.xml");
        let sink = XmlFileSink::new("default", path.clone());

        sink.run(&sample_event()).await.unwrap();
        sink.run(&sample_event()).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("portscan"));
    }

    #[tokio::test]
    async fn recorder_sink_fails_then_recovers() {
        let sink = RecorderSink::new("sql", "primary");
        sink.fail_next_n(1);

        let err = sink.run(&sample_event()).await.unwrap_err();
        assert!(matches!(err, SinkError::Transient(_)));
        assert_eq!(sink.received_count(), 0);

        sink.run(&sample_event()).await.unwrap();
        assert_eq!(sink.received_count(), 1);
    }

    #[tokio::test]
    async fn sink_without_commit_reports_permanent_failure() {
        let sink = RecorderSink::without_commit("sql", "primary");
        assert!(!sink.supports_failover());
        sink.fail_next_n(1);
        let err = sink.run(&sample_event()).await.unwrap_err();
        assert!(matches!(err, SinkError::Permanent(_)));
    }
}
