//! The canonical in-memory IDMEF event representation.
//!
//! Everything the normalizer, filter pipeline, fan-out engine, and spool
//! operate on is one of these two variants. The analyzer chain is an owned
//! `Vec` ordered sensor-first, manager-last — appending the local manager
//! is a single `push`, never a pointer walk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A discriminated canonical event. `Alert` and `Heartbeat` share the same
/// core fields (analyzer chain, timestamps, sources/targets, additional
/// data); only alerts carry a detect-time, assessment, and classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    Alert(Alert),
    Heartbeat(Heartbeat),
}

impl Event {
    pub fn core(&self) -> &EventCore {
        match self {
            Event::Alert(a) => &a.core,
            Event::Heartbeat(h) => &h.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut EventCore {
        match self {
            Event::Alert(a) => &mut a.core,
            Event::Heartbeat(h) => &mut h.core,
        }
    }

    /// The innermost (sensor) analyzer, if any.
    pub fn sensor_analyzer(&self) -> Option<&Analyzer> {
        self.core().analyzer.first()
    }

    /// The outermost analyzer in the chain — after normalization this is
    /// always the local manager.
    pub fn last_analyzer(&self) -> Option<&Analyzer> {
        self.core().analyzer.last()
    }

    /// Append the local manager's analyzer descriptor at the tail of the
    /// chain, unless it is already there.
    pub fn ensure_manager_tail(&mut self, manager: Analyzer) {
        let already_present = self
            .core()
            .analyzer
            .last()
            .is_some_and(|a| a.analyzerid == manager.analyzerid);
        if !already_present {
            self.core_mut().analyzer.push(manager);
        }
    }

    pub fn analyzer_time(&self) -> Option<DateTime<Utc>> {
        self.core().analyzer_time
    }

    pub fn set_analyzer_time(&mut self, when: DateTime<Utc>) {
        self.core_mut().analyzer_time = Some(when);
    }
}

/// Fields common to both `Alert` and `Heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventCore {
    #[serde(skip_serializing_if = "is_unset_ident", default)]
    pub ident: u64,
    /// Ordered sensor -> ... -> manager. Never empty after normalization.
    pub analyzer: Vec<Analyzer>,
    pub create_time: DateTime<Utc>,
    pub analyzer_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: Vec<Source>,
    #[serde(default)]
    pub target: Vec<Target>,
    #[serde(default)]
    pub additional_data: Vec<AdditionalData>,
}

impl EventCore {
    pub fn new(create_time: DateTime<Utc>) -> Self {
        Self {
            ident: 0,
            analyzer: Vec::new(),
            create_time,
            analyzer_time: None,
            source: Vec::new(),
            target: Vec::new(),
            additional_data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub core: EventCore,
    pub detect_time: Option<DateTime<Utc>>,
    pub assessment: Option<Assessment>,
    pub classification: Classification,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub core: EventCore,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Analyzer {
    pub analyzerid: u64,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
    pub class: Option<String>,
    pub ostype: Option<String>,
    pub osversion: Option<String>,
}

impl Analyzer {
    /// A minimal analyzer descriptor carrying only an id, as produced when
    /// the manager fills in its own identity during normalization.
    pub fn with_id(analyzerid: u64) -> Self {
        Self {
            analyzerid,
            name: None,
            manufacturer: None,
            model: None,
            version: None,
            class: None,
            ostype: None,
            osversion: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AddressCategory {
    Ipv4Addr,
    Ipv6Addr,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Address {
    #[serde(skip_serializing_if = "is_unset_ident", default)]
    pub ident: u64,
    pub address: String,
    pub category: AddressCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    #[serde(skip_serializing_if = "is_unset_ident", default)]
    pub ident: u64,
    pub name: Option<String>,
    #[serde(default)]
    pub address: Vec<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    #[serde(skip_serializing_if = "is_unset_ident", default)]
    pub ident: u64,
    pub node: Option<Node>,
    #[serde(default)]
    pub spoofed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    #[serde(skip_serializing_if = "is_unset_ident", default)]
    pub ident: u64,
    pub node: Option<Node>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Completion {
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assessment {
    pub severity: Option<Severity>,
    pub completion: Option<Completion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    #[serde(skip_serializing_if = "is_unset_ident", default)]
    pub ident: u64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AdditionalDataValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdditionalData {
    #[serde(skip_serializing_if = "is_unset_ident", default)]
    pub ident: u64,
    pub meaning: Option<String>,
    pub data: AdditionalDataValue,
}

/// `0` means "unset" per the ident invariant — omit it on serialization
/// instead of writing a meaningless zero out to disk or the wire.
fn is_unset_ident(ident: &u64) -> bool {
    *ident == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_alert() -> Event {
        Event::Alert(Alert {
            core: EventCore::new(Utc::now()),
            detect_time: None,
            assessment: None,
            classification: Classification {
                ident: 0,
                text: "portscan".into(),
            },
        })
    }

    #[test]
    fn ensure_manager_tail_appends_once() {
        let mut event = sample_alert();
        event.core_mut().analyzer.push(Analyzer::with_id(111));

        let manager = Analyzer::with_id(999);
        event.ensure_manager_tail(manager.clone());
        assert_eq!(event.last_analyzer().unwrap().analyzerid, 999);

        // Idempotent: calling again with the same manager id doesn't duplicate.
        event.ensure_manager_tail(manager);
        assert_eq!(event.core().analyzer.len(), 2);
    }

    #[test]
    fn zero_ident_is_omitted_from_json() {
        let classification = Classification {
            ident: 0,
            text: "x".into(),
        };
        let json = serde_json::to_string(&classification).unwrap();
        assert!(!json.contains("ident"));

        let classification = Classification {
            ident: 7,
            text: "x".into(),
        };
        let json = serde_json::to_string(&classification).unwrap();
        assert!(json.contains("\"ident\":7"));
    }

    #[test]
    fn round_trips_through_json() {
        let event = sample_alert();
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
