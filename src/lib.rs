//! idmef-manager -- sensor-facing IDMEF event manager.
//!
//! Accepts mutually-authenticated TLS connections from analyzer sensors,
//! normalizes the incoming IDMEF wire stream into structured events, and
//! fans each event out to a configurable set of reporting sinks with
//! per-sink failover spooling.

pub mod audit;
pub mod auth;
pub mod cert;
pub mod config;
pub mod decode;
pub mod error;
pub mod fanout;
pub mod filter;
pub mod identity;
pub mod idmef;
pub mod normalizer;
pub mod permissions;
pub mod server;
pub mod session;
pub mod sink;
pub mod spool;
pub mod tls;
pub mod wire;

use anyhow::{Context, Result};

use crate::config::ManagerConfig;
use crate::server::Manager;

/// Build the manager from `config` and run it until shutdown.
pub async fn run(config: ManagerConfig) -> Result<()> {
    let manager = Manager::new(config)
        .await
        .context("failed to assemble manager")?;
    manager.run().await
}
