//! The event normalizer: turns wire records into canonical IDMEF events.
//!
//! `ALERT` and `HEARTBEAT` records each carry a complete JSON-encoded
//! [`Alert`](crate::idmef::Alert)/[`Heartbeat`](crate::idmef::Heartbeat)
//! payload and start a new event under construction. `PROPRIETARY` records
//! attach vendor-private data to whichever event is currently under
//! construction via a decode plugin keyed by a one-byte sub-tag; an event
//! is considered complete — and handed to the caller via [`Normalizer::take_ready`]
//! — when the next `ALERT`/`HEARTBEAT` record starts, or when the session
//! ends and calls [`Normalizer::flush_pending`] explicitly.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::decode::DecodeRegistry;
use crate::error::ProtocolError;
use crate::idmef::{Alert, Analyzer, Event, Heartbeat};
use crate::wire::{Tag, WireMessage};

pub struct Normalizer {
    manager_analyzer: Analyzer,
    decode_registry: Arc<DecodeRegistry>,
    pending: Option<Event>,
    ready: VecDeque<Event>,
}

impl Normalizer {
    /// `decode_registry` is shared (not owned) because every concurrent
    /// session needs the same, read-only set of decode plugins.
    pub fn new(manager_analyzer: Analyzer, decode_registry: Arc<DecodeRegistry>) -> Self {
        Self {
            manager_analyzer,
            decode_registry,
            pending: None,
            ready: VecDeque::new(),
        }
    }

    /// Process one wire record. Completed events accumulate in an internal
    /// queue, drained with [`Normalizer::take_ready`]; this keeps the
    /// flush-on-next-record rule from requiring two return values here.
    pub fn feed(&mut self, msg: &WireMessage) -> Result<(), ProtocolError> {
        match msg.tag {
            Tag::Alert => {
                let alert: Alert = serde_json::from_slice(&msg.payload)?;
                self.start_event(Event::Alert(alert), msg.timestamp);
            }
            Tag::Heartbeat => {
                let heartbeat: Heartbeat = serde_json::from_slice(&msg.payload)?;
                self.start_event(Event::Heartbeat(heartbeat), msg.timestamp);
            }
            Tag::Proprietary => self.apply_proprietary(&msg.payload)?,
            Tag::Auth => {
                warn!("AUTH record received outside handshake, ignoring");
            }
            Tag::Unknown(byte) => {
                warn!(tag = byte, "unknown record tag, skipping");
            }
        }
        Ok(())
    }

    fn start_event(&mut self, mut event: Event, timestamp: DateTime<Utc>) {
        self.flush_pending();
        if event.analyzer_time().is_none() {
            event.set_analyzer_time(timestamp);
        }
        event.ensure_manager_tail(self.manager_analyzer.clone());
        self.pending = Some(event);
    }

    fn apply_proprietary(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let decode_id = *payload
            .first()
            .ok_or_else(|| ProtocolError::Malformed("empty proprietary payload".into()))?;
        let rest = &payload[1..];
        let declared = rest.len();

        let plugin = self
            .decode_registry
            .find(decode_id)
            .ok_or(ProtocolError::UnknownDecodeId(decode_id))?;

        let event = self.pending.as_mut().ok_or(ProtocolError::NoPendingEvent)?;
        let consumed = plugin
            .run(rest, event)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        if consumed != declared {
            // The event under construction is no longer trustworthy; per
            // the decode-length-agreement property, nothing from this
            // record is delivered.
            self.pending = None;
            return Err(ProtocolError::DecodeLengthMismatch {
                decode_id,
                consumed,
                declared,
            });
        }
        Ok(())
    }

    /// Move any event under construction into the ready queue. Called by
    /// the session when a connection closes, so a trailing event with no
    /// following `ALERT`/`HEARTBEAT` to trigger its flush isn't lost.
    pub fn flush_pending(&mut self) {
        if let Some(event) = self.pending.take() {
            self.ready.push_back(event);
        }
    }

    /// Drain every event completed so far.
    pub fn take_ready(&mut self) -> Vec<Event> {
        self.ready.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::VendorTextDecoder;
    use crate::idmef::{Classification, EventCore};
    use crate::wire::{encode_message_at, read_message, Tag};
    use chrono::TimeZone;

    fn manager() -> Analyzer {
        Analyzer::with_id(999)
    }

    fn sample_alert_payload() -> Vec<u8> {
        let alert = Alert {
            core: EventCore::new(Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()),
            detect_time: None,
            assessment: None,
            classification: Classification {
                ident: 0,
                text: "portscan".into(),
            },
        };
        serde_json::to_vec(&alert).unwrap()
    }

    async fn decode_frame(tag: Tag, payload: &[u8]) -> WireMessage {
        let frame = encode_message_at(tag, payload, Utc::now()).unwrap();
        let mut cursor = &frame[..];
        read_message(&mut cursor).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn alert_gains_manager_as_tail_analyzer() {
        let mut normalizer = Normalizer::new(manager(), Arc::new(DecodeRegistry::new()));
        let msg = decode_frame(Tag::Alert, &sample_alert_payload()).await;
        normalizer.feed(&msg).unwrap();
        normalizer.flush_pending();

        let ready = normalizer.take_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].last_analyzer().unwrap().analyzerid, 999);
    }

    #[tokio::test]
    async fn second_alert_flushes_the_first_as_ready() {
        let mut normalizer = Normalizer::new(manager(), Arc::new(DecodeRegistry::new()));
        let msg = decode_frame(Tag::Alert, &sample_alert_payload()).await;
        normalizer.feed(&msg).unwrap();
        normalizer.feed(&msg).unwrap();

        assert_eq!(normalizer.take_ready().len(), 1);
        normalizer.flush_pending();
        assert_eq!(normalizer.take_ready().len(), 1);
    }

    #[tokio::test]
    async fn proprietary_with_no_pending_event_is_an_error() {
        let mut normalizer = Normalizer::new(manager(), Arc::new(DecodeRegistry::new()));
        let msg = decode_frame(Tag::Proprietary, &[7, 1, b'x']).await;
        assert!(matches!(
            normalizer.feed(&msg),
            Err(ProtocolError::NoPendingEvent)
        ));
    }

    #[tokio::test]
    async fn proprietary_attaches_to_pending_event() {
        let mut registry = DecodeRegistry::new();
        registry.register(Box::new(VendorTextDecoder::new(7, "vendor-context")));
        let mut normalizer = Normalizer::new(manager(), Arc::new(registry));

        let alert_msg = decode_frame(Tag::Alert, &sample_alert_payload()).await;
        normalizer.feed(&alert_msg).unwrap();

        let mut payload = vec![7u8, 5];
        payload.extend_from_slice(b"hello");
        let prop_msg = decode_frame(Tag::Proprietary, &payload).await;
        normalizer.feed(&prop_msg).unwrap();

        normalizer.flush_pending();
        let ready = normalizer.take_ready();
        assert_eq!(ready[0].core().additional_data.len(), 1);
    }

    // decode_length_mismatch_discards_pending_event moved to
    // tests/fanout_scenarios.rs as the S6 end-to-end scenario.

    #[tokio::test]
    async fn unknown_tag_is_skipped_not_fatal() {
        let mut normalizer = Normalizer::new(manager(), Arc::new(DecodeRegistry::new()));
        let msg = decode_frame(Tag::Unknown(250), b"anything").await;
        assert!(normalizer.feed(&msg).is_ok());
    }
}
