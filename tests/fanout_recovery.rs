//! Exercises the periodic recovery loop itself (not just a single manual
//! `recover_sink` call), and the config-driven retry/quota override lookup
//! that decides how that loop is parametrized per sink.

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use idmef_manager::audit::AuditLog;
use idmef_manager::config::{ManagerConfig, SinkSpoolOverride};
use idmef_manager::fanout::{run_recovery_loop, FanoutEngine, ShutdownFlag, SinkEntry};
use idmef_manager::filter::FilterChain;
use idmef_manager::idmef::{Classification, Event, EventCore};
use idmef_manager::sink::RecorderSink;
use idmef_manager::spool::Spool;

fn alert(text: &str) -> Event {
    Event::Alert(idmef_manager::idmef::Alert {
        core: EventCore::new(chrono::Utc::now()),
        detect_time: None,
        assessment: None,
        classification: Classification {
            ident: 0,
            text: text.into(),
        },
    })
}

#[tokio::test(start_paused = true)]
async fn background_recovery_loop_drains_a_failed_sink_without_manual_intervention() {
    let dir = tempdir().unwrap();
    let sink = Arc::new(RecorderSink::new("sql", "default"));
    sink.fail_next_n(1);

    let spool = Spool::open(Spool::path_for(dir.path(), "sql", "default"), 100)
        .await
        .unwrap();
    let entry = SinkEntry::new(sink.clone(), FilterChain::new(), spool, Duration::from_secs(1)).await;

    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
    let engine = Arc::new(FanoutEngine::new(FilterChain::new(), vec![entry], audit));

    engine.dispatch(&alert("portscan")).await;
    assert_eq!(engine.sinks()[0].available_count().await, 1);

    let shutdown = Arc::new(ShutdownFlag::new());
    let loop_handle = tokio::spawn(run_recovery_loop(
        engine.clone(),
        shutdown.clone(),
        Duration::from_millis(100),
    ));

    tokio::time::advance(Duration::from_secs(2)).await;
    // Yield so the now-due recovery tick actually runs.
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_millis(200)).await;
    tokio::task::yield_now().await;

    assert_eq!(engine.sinks()[0].available_count().await, 0);
    assert_eq!(sink.received_count(), 1);

    shutdown.set();
    loop_handle.abort();
}

#[test]
fn per_sink_retry_and_quota_overrides_are_keyed_by_name_and_instance() {
    let mut config = ManagerConfig::default();
    config.spool.default_retry_secs = 600;
    config.spool.default_quota = 10_000;
    config.spool.overrides.insert(
        "sql[primary]".to_string(),
        SinkSpoolOverride {
            quota: Some(500),
            retry_secs: Some(15),
        },
    );

    assert_eq!(
        config.retry_period_for("sql", "primary"),
        Duration::from_secs(15)
    );
    assert_eq!(config.quota_for("sql", "primary"), 500);

    // A different instance of the same sink name falls back to the
    // process-wide defaults.
    assert_eq!(
        config.retry_period_for("sql", "secondary"),
        Duration::from_secs(600)
    );
    assert_eq!(config.quota_for("sql", "secondary"), 10_000);
}
