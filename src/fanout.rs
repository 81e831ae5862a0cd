//! The reliable fan-out engine: delivers each normalized event to every
//! registered sink, with per-sink failover spooling and timed recovery.
//!
//! This is the piece the rest of the system exists to feed: the reactor,
//! session, and normalizer all funnel into [`FanoutEngine::dispatch`], and
//! every sink sees exactly one of {delivered, filter-vetoed, spooled} for
//! each event that reaches it — never both, never neither.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEntry, AuditLog};
use crate::error::SinkError;
use crate::filter::{FilterChain, FilterContext};
use crate::idmef::Event;
use crate::sink::Sink;
use crate::spool::Spool;

/// Default time between failover recovery attempts for a sink: 10 minutes.
/// Overridable per sink in config.
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    Live,
    Failover,
}

/// One registered sink plus everything the engine needs to manage it:
/// its per-sink filter chain, its durable spool, and its recovery timer.
pub struct SinkEntry {
    pub sink: Arc<dyn Sink>,
    pub filter: FilterChain,
    mode: AsyncMutex<SinkMode>,
    spool: Spool,
    retry_period: Duration,
    next_retry_at: StdMutex<Option<Instant>>,
}

impl SinkEntry {
    /// Build a registration, deciding the initial mode from the spool: a
    /// sink that starts with a non-empty spool (recovered from a prior
    /// run) begins in failover with an immediate recovery scheduled.
    pub async fn new(
        sink: Arc<dyn Sink>,
        filter: FilterChain,
        spool: Spool,
        retry_period: Duration,
    ) -> Self {
        let starts_in_failover = !spool.is_empty().await;
        let entry = Self {
            sink,
            filter,
            mode: AsyncMutex::new(if starts_in_failover {
                SinkMode::Failover
            } else {
                SinkMode::Live
            }),
            spool,
            retry_period,
            next_retry_at: StdMutex::new(None),
        };
        if starts_in_failover {
            info!(
                sink = entry.sink.name(),
                instance = entry.sink.instance_name(),
                available = entry.spool.available_count().await,
                "sink starting in failover mode with pending spool"
            );
            entry.arm_immediate();
        }
        entry
    }

    pub fn key(&self) -> (&str, &str) {
        (self.sink.name(), self.sink.instance_name())
    }

    pub async fn mode(&self) -> SinkMode {
        *self.mode.lock().await
    }

    pub async fn available_count(&self) -> usize {
        self.spool.available_count().await
    }

    pub async fn deleted_count(&self) -> u64 {
        self.spool.deleted_count().await
    }

    fn arm(&self) {
        *self.next_retry_at.lock().unwrap() = Some(Instant::now() + self.retry_period);
    }

    fn arm_immediate(&self) {
        *self.next_retry_at.lock().unwrap() = Some(Instant::now());
    }

    fn disarm(&self) {
        *self.next_retry_at.lock().unwrap() = None;
    }

    fn is_due(&self, now: Instant) -> bool {
        matches!(*self.next_retry_at.lock().unwrap(), Some(at) if at <= now)
    }
}

/// Holds the set of subscribed sinks and the category filter consulted
/// once per event before fan-out begins.
pub struct FanoutEngine {
    category_filter: FilterChain,
    sinks: Vec<SinkEntry>,
    audit: Arc<AuditLog>,
}

impl FanoutEngine {
    pub fn new(category_filter: FilterChain, sinks: Vec<SinkEntry>, audit: Arc<AuditLog>) -> Self {
        Self {
            category_filter,
            sinks,
            audit,
        }
    }

    pub fn sinks(&self) -> &[SinkEntry] {
        &self.sinks
    }

    /// Dispatch `event` to every registered sink per the fan-out
    /// algorithm: category filter, then per-sink filter, then either a
    /// live `run` or a spool append. A single sink failure never aborts
    /// fan-out to the remaining sinks.
    pub async fn dispatch(&self, event: &Event) {
        if self.category_filter.run(event, &FilterContext::Category).is_some() {
            debug!("event vetoed by category filter");
            return;
        }

        for entry in &self.sinks {
            let (name, instance) = entry.key();
            let ctx = FilterContext::Sink { name, instance };
            if entry.filter.run(event, &ctx).is_some() {
                debug!(sink = name, instance, "event vetoed by per-sink filter");
                continue;
            }

            let already_failing_over = *entry.mode.lock().await == SinkMode::Failover;
            if already_failing_over {
                self.spool_event(entry, event).await;
                continue;
            }

            match entry.sink.run(event).await {
                Ok(()) => {}
                Err(err) => self.handle_sink_failure(entry, event, err).await,
            }
        }
    }

    async fn handle_sink_failure(&self, entry: &SinkEntry, event: &Event, err: SinkError) {
        let (name, instance) = entry.key();
        let recoverable = entry.sink.supports_failover() && !matches!(err, SinkError::Permanent(_));

        if !recoverable {
            error!(sink = name, instance, error = %err, "sink failed permanently, event dropped for this sink");
            return;
        }

        warn!(sink = name, instance, error = %err, "sink transitioned to failover");
        *entry.mode.lock().await = SinkMode::Failover;
        entry.arm();
        self.audit
            .log(AuditEntry::sink_failover(name, instance))
            .await;
        self.spool_event(entry, event).await;
    }

    async fn spool_event(&self, entry: &SinkEntry, event: &Event) {
        let (name, instance) = entry.key();
        match serde_json::to_vec(event) {
            Ok(bytes) => {
                if let Err(e) = entry.spool.append(Bytes::from(bytes)).await {
                    error!(sink = name, instance, error = %e, "failed to append to spool");
                }
            }
            Err(e) => {
                error!(sink = name, instance, error = %e, "failed to serialize event for spool");
            }
        }
    }

    /// Run one recovery attempt for the sink at `index`: commit, then
    /// drain the FIFO until empty or a failure, then decide live/failover.
    pub async fn recover_sink(&self, index: usize) {
        let Some(entry) = self.sinks.get(index) else {
            return;
        };
        let (name, instance) = entry.key();

        if let Err(e) = entry.sink.commit().await {
            debug!(sink = name, instance, error = %e, "recovery commit failed, rearming timer");
            entry.arm();
            return;
        }

        loop {
            let Some(record) = entry.spool.peek_front().await else {
                *entry.mode.lock().await = SinkMode::Live;
                entry.disarm();
                info!(sink = name, instance, "sink recovered, spool drained");
                self.audit.log(AuditEntry::sink_recovered(name, instance)).await;
                return;
            };

            let event: Event = match serde_json::from_slice(&record) {
                Ok(event) => event,
                Err(e) => {
                    // Unparseable record: drop it so one bad entry can't
                    // wedge recovery forever, and keep draining.
                    error!(sink = name, instance, error = %e, "dropping unparseable spool record");
                    let _ = entry.spool.pop_front().await;
                    continue;
                }
            };

            match entry.sink.run(&event).await {
                Ok(()) => {
                    let _ = entry.spool.pop_front().await;
                }
                Err(e) => {
                    debug!(sink = name, instance, error = %e, "recovery drain stopped, rearming timer");
                    entry.arm();
                    return;
                }
            }
        }
    }

    /// Indices of sinks whose retry timer is currently due, as of `now`.
    pub fn due_sinks(&self, now: Instant) -> Vec<usize> {
        self.sinks
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_due(now))
            .map(|(i, _)| i)
            .collect()
    }
}

/// A process-wide flag a running recovery loop selects against so it can
/// be stopped promptly at shutdown without waiting for its next tick.
#[derive(Default)]
pub struct ShutdownFlag(AtomicBool);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Background task: periodically checks every sink's retry timer and
/// attempts recovery for any that are due, until `shutdown` is set.
pub async fn run_recovery_loop(engine: Arc<FanoutEngine>, shutdown: Arc<ShutdownFlag>, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    loop {
        interval.tick().await;
        if shutdown.is_set() {
            return;
        }
        let now = Instant::now();
        for index in engine.due_sinks(now) {
            engine.recover_sink(index).await;
        }
    }
}
