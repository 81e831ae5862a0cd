//! The filter pipeline: ordered, pure predicates consulted before an event
//! reaches the fan-out engine (category filters) or a specific sink
//! (per-sink filters). First veto wins; filters never mutate the event.

use crate::idmef::Event;

/// The outcome of evaluating a single filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Veto,
}

/// Where in the pipeline a filter is being consulted.
#[derive(Debug, Clone)]
pub enum FilterContext<'a> {
    /// Consulted once per event, before fan-out begins.
    Category,
    /// Consulted once per sink, immediately before that sink would be
    /// invoked (or spooled).
    Sink { name: &'a str, instance: &'a str },
}

/// A single ordered predicate. Implementors must be pure with respect to
/// the event: no filter may mutate state visible to a later sink.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, event: &Event, ctx: &FilterContext<'_>) -> Verdict;
}

/// An ordered sequence of filters, evaluated first-veto-wins.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self { filters: Vec::new() }
    }

    pub fn push(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    /// Run every filter in order against `event` at `ctx`. Returns the
    /// name of the first filter to veto, or `None` if all allowed.
    pub fn run(&self, event: &Event, ctx: &FilterContext<'_>) -> Option<&str> {
        for filter in &self.filters {
            if filter.evaluate(event, ctx) == Verdict::Veto {
                return Some(filter.name());
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// A filter that vetoes every alert below a configured minimum severity.
/// Heartbeats, which carry no severity, are always allowed through.
pub struct MinSeverityFilter {
    name: String,
    minimum: crate::idmef::Severity,
}

impl MinSeverityFilter {
    pub fn new(minimum: crate::idmef::Severity) -> Self {
        Self {
            name: "min-severity".to_string(),
            minimum,
        }
    }

    fn rank(sev: crate::idmef::Severity) -> u8 {
        use crate::idmef::Severity::*;
        match sev {
            Info => 0,
            Low => 1,
            Medium => 2,
            High => 3,
        }
    }
}

impl Filter for MinSeverityFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, event: &Event, _ctx: &FilterContext<'_>) -> Verdict {
        match event {
            Event::Alert(alert) => match alert.assessment.as_ref().and_then(|a| a.severity) {
                Some(sev) if Self::rank(sev) < Self::rank(self.minimum) => Verdict::Veto,
                _ => Verdict::Allow,
            },
            Event::Heartbeat(_) => Verdict::Allow,
        }
    }
}

/// A filter that vetoes delivery to a named sink instance outright —
/// useful for temporarily muting one sink without unregistering it.
pub struct MuteSinkFilter {
    name: String,
    muted_sink: String,
    muted_instance: String,
}

impl MuteSinkFilter {
    pub fn new(sink: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            name: "mute-sink".to_string(),
            muted_sink: sink.into(),
            muted_instance: instance.into(),
        }
    }
}

impl Filter for MuteSinkFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, _event: &Event, ctx: &FilterContext<'_>) -> Verdict {
        match ctx {
            FilterContext::Sink { name, instance } => {
                if *name == self.muted_sink && *instance == self.muted_instance {
                    Verdict::Veto
                } else {
                    Verdict::Allow
                }
            }
            FilterContext::Category => Verdict::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmef::{Assessment, Classification, Completion, Event, EventCore, Severity};
    use chrono::Utc;

    fn alert_with_severity(sev: Option<Severity>) -> Event {
        Event::Alert(crate::idmef::Alert {
            core: EventCore::new(Utc::now()),
            detect_time: None,
            assessment: sev.map(|severity| Assessment {
                severity: Some(severity),
                completion: Some(Completion::Succeeded),
            }),
            classification: Classification {
                ident: 0,
                text: "x".into(),
            },
        })
    }

    #[test]
    fn empty_chain_allows_everything() {
        let chain = FilterChain::new();
        let event = alert_with_severity(Some(Severity::Low));
        assert_eq!(chain.run(&event, &FilterContext::Category), None);
    }

    #[test]
    fn first_veto_wins_and_short_circuits() {
        let mut chain = FilterChain::new();
        chain.push(Box::new(MinSeverityFilter::new(Severity::High)));
        let low = alert_with_severity(Some(Severity::Low));
        assert_eq!(chain.run(&low, &FilterContext::Category), Some("min-severity"));

        let high = alert_with_severity(Some(Severity::High));
        assert_eq!(chain.run(&high, &FilterContext::Category), None);
    }

    #[test]
    fn mute_sink_filter_only_vetoes_its_own_sink() {
        let filter = MuteSinkFilter::new("sql", "primary");
        let event = alert_with_severity(None);

        let muted_ctx = FilterContext::Sink {
            name: "sql",
            instance: "primary",
        };
        assert_eq!(filter.evaluate(&event, &muted_ctx), Verdict::Veto);

        let other_ctx = FilterContext::Sink {
            name: "sql",
            instance: "secondary",
        };
        assert_eq!(filter.evaluate(&event, &other_ctx), Verdict::Allow);
    }

    #[test]
    fn heartbeats_are_never_vetoed_by_severity_filter() {
        let filter = MinSeverityFilter::new(Severity::High);
        let heartbeat = Event::Heartbeat(crate::idmef::Heartbeat {
            core: EventCore::new(Utc::now()),
        });
        assert_eq!(filter.evaluate(&heartbeat, &FilterContext::Category), Verdict::Allow);
    }
}
