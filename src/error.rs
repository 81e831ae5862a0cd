//! Domain error vocabulary shared by the wire, session, and fan-out layers.
//!
//! Each variant corresponds to one of the error kinds named in the design
//! (`IoFatal`, `ProtocolError`, `AuthRejected`, ...). `IoWouldBlock` has no
//! variant here: under `tokio` it is not an error at all, it is simply a
//! `Poll::Pending` the runtime resumes from, so it never needs to surface
//! through a `Result`.

use std::io;

use thiserror::Error;

/// Errors that terminate a single client session.
///
/// A `SessionError` never propagates past the task that owns the session:
/// the server's per-connection task logs it and tears down that one
/// connection, leaving every other session untouched.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed wire framing: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("plaintext downgrade failed: {0}")]
    DowngradeFailed(String),
}

/// Framing and decode errors, surfaced while parsing wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame exceeds maximum size ({len} > {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown record tag {0}")]
    UnknownTag(u8),

    #[error("decode plugin {decode_id} reported {consumed} bytes consumed, record declared {declared}")]
    DecodeLengthMismatch {
        decode_id: u8,
        consumed: usize,
        declared: usize,
    },

    #[error("no decode plugin registered for sub-tag {0}")]
    UnknownDecodeId(u8),

    #[error("proprietary record received with no event under construction")]
    NoPendingEvent,

    #[error("malformed record payload: {0}")]
    Malformed(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("connection closed mid-frame")]
    Truncated,
}

/// Errors reported by a reporting sink's `run`/`commit` hooks.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Recoverable: the sink should move to failover and be retried later.
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// A sink with no `commit` hook failed; nothing can be spooled for it.
    #[error("permanent sink failure (no commit hook): {0}")]
    Permanent(String),

    /// `commit` was invoked on a sink that never declared failover support.
    #[error("sink does not support failover recovery")]
    NotSupported,
}

/// Errors at startup: configuration, certificate, or bind failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("duplicate sink instance name: {sink} [{instance}]")]
    DuplicateSinkInstance { sink: String, instance: String },

    #[error("no listen endpoints configured")]
    NoListeners,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
