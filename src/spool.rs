//! Per-sink failover spool: an append-only, strictly-FIFO on-disk queue.
//!
//! One file per sink instance at `<spool-dir>/<sink-name>[<instance-name>]`.
//! Records are length-prefixed serialized [`Event`](crate::idmef::Event)s.
//! The in-memory `VecDeque` mirrors the file exactly; every mutation
//! rewrites the file in full to a temp path and renames it into place, so
//! a crash mid-write either leaves the old file intact or the fully
//! written new one — never a half-written file. That rewrite is O(n) in
//! spool depth, which is the right trade for a structure meant to hold a
//! sink's backlog during an outage, not to serve as a general queue.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::{Buf, Bytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default per-sink quota when none is configured: 10,000 spooled events.
pub const DEFAULT_QUOTA: usize = 10_000;

struct SpoolState {
    records: VecDeque<Bytes>,
    deleted_count: u64,
}

/// A single sink's durable failover queue.
pub struct Spool {
    path: PathBuf,
    quota: usize,
    state: Mutex<SpoolState>,
}

impl Spool {
    /// Build the on-disk path for a `(sink, instance)` pair under `dir`.
    pub fn path_for(dir: &Path, sink_name: &str, instance_name: &str) -> PathBuf {
        dir.join(format!("{sink_name}[{instance_name}]"))
    }

    /// Open (or create) the spool file at `path`, replaying any records
    /// and the lifetime eviction count already on disk into memory.
    pub async fn open(path: PathBuf, quota: usize) -> Result<Self> {
        let (records, deleted_count) = if path.exists() {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read spool file {}", path.display()))?;
            decode_records(&bytes)?
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create spool directory {}", parent.display())
                })?;
            }
            (VecDeque::new(), 0)
        };

        if !records.is_empty() {
            debug!(path = %path.display(), count = records.len(), "spool opened with pending records");
        }

        Ok(Self {
            path,
            quota,
            state: Mutex::new(SpoolState {
                records,
                deleted_count,
            }),
        })
    }

    /// Append a serialized event to the tail of the spool, evicting the
    /// oldest record(s) if doing so would exceed quota.
    pub async fn append(&self, record: Bytes) -> Result<()> {
        let mut state = self.state.lock().await;
        state.records.push_back(record);
        while state.records.len() > self.quota {
            state.records.pop_front();
            state.deleted_count += 1;
            warn!(path = %self.path.display(), "spool quota exceeded, oldest record discarded");
        }
        self.persist(&state).await
    }

    /// Remove and return the record at the head of the queue, if any.
    /// Used after a sink has successfully replayed it during recovery.
    pub async fn pop_front(&self) -> Result<Option<Bytes>> {
        let mut state = self.state.lock().await;
        let popped = state.records.pop_front();
        if popped.is_some() {
            self.persist(&state).await?;
        }
        Ok(popped)
    }

    /// The record at the head of the queue without removing it.
    pub async fn peek_front(&self) -> Option<Bytes> {
        self.state.lock().await.records.front().cloned()
    }

    pub async fn available_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn deleted_count(&self) -> u64 {
        self.state.lock().await.deleted_count
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.records.is_empty()
    }

    async fn persist(&self, state: &SpoolState) -> Result<()> {
        let encoded = encode_records(&state.records, state.deleted_count);
        let tmp_path = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(&encoded).await?;
        file.flush().await?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("failed to install spool file {}", self.path.display()))?;
        Ok(())
    }
}

/// On-disk layout: an 8-byte big-endian lifetime eviction counter, followed
/// by the FIFO record stream (`[len: u32][bytes; len]` per record). The
/// counter has to live alongside the records it counts, not as a separate
/// file, so a single rename keeps both in sync with one write.
fn encode_records(records: &VecDeque<Bytes>, deleted_count: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + records.iter().map(|r| 4 + r.len()).sum::<usize>());
    buf.extend_from_slice(&deleted_count.to_be_bytes());
    for record in records {
        buf.extend_from_slice(&(record.len() as u32).to_be_bytes());
        buf.extend_from_slice(record);
    }
    buf
}

fn decode_records(bytes: &[u8]) -> Result<(VecDeque<Bytes>, u64)> {
    let mut cursor = bytes;
    if cursor.len() < 8 {
        anyhow::bail!("spool file truncated in eviction counter");
    }
    let deleted_count = cursor.get_u64();

    let mut records = VecDeque::new();
    while !cursor.is_empty() {
        if cursor.len() < 4 {
            anyhow::bail!("spool file truncated in length prefix");
        }
        let len = cursor.get_u32() as usize;
        if cursor.len() < len {
            anyhow::bail!("spool file truncated in record body");
        }
        let record = Bytes::copy_from_slice(&cursor[..len]);
        cursor.advance(len);
        records.push_back(record);
    }
    Ok((records, deleted_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(s: &str) -> Bytes {
        Bytes::from(s.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn append_and_drain_is_fifo() {
        let dir = tempdir().unwrap();
        let spool = Spool::open(dir.path().join("sql[primary]"), DEFAULT_QUOTA)
            .await
            .unwrap();

        spool.append(rec("e1")).await.unwrap();
        spool.append(rec("e2")).await.unwrap();
        spool.append(rec("e3")).await.unwrap();

        assert_eq!(spool.available_count().await, 3);
        assert_eq!(spool.pop_front().await.unwrap(), Some(rec("e1")));
        assert_eq!(spool.pop_front().await.unwrap(), Some(rec("e2")));
        assert_eq!(spool.available_count().await, 1);
    }

    #[tokio::test]
    async fn partial_drain_preserves_remaining_suffix() {
        let dir = tempdir().unwrap();
        let spool = Spool::open(dir.path().join("sql[primary]"), DEFAULT_QUOTA)
            .await
            .unwrap();
        for e in ["e1", "e2", "e3"] {
            spool.append(rec(e)).await.unwrap();
        }

        // Simulate recovery: e1 succeeds, e2 fails and draining stops.
        assert_eq!(spool.pop_front().await.unwrap(), Some(rec("e1")));

        assert_eq!(spool.available_count().await, 2);
        assert_eq!(spool.peek_front().await, Some(rec("e2")));
    }

    #[tokio::test]
    async fn quota_eviction_discards_oldest_and_counts_it() {
        let dir = tempdir().unwrap();
        let spool = Spool::open(dir.path().join("sql[primary]"), 2).await.unwrap();

        spool.append(rec("e1")).await.unwrap();
        spool.append(rec("e2")).await.unwrap();
        spool.append(rec("e3")).await.unwrap();

        assert_eq!(spool.available_count().await, 2);
        assert_eq!(spool.deleted_count().await, 1);
        assert_eq!(spool.peek_front().await, Some(rec("e2")));
    }

    #[tokio::test]
    async fn reopening_replays_persisted_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sql[primary]");
        {
            let spool = Spool::open(path.clone(), DEFAULT_QUOTA).await.unwrap();
            spool.append(rec("e1")).await.unwrap();
            spool.append(rec("e2")).await.unwrap();
        }

        let reopened = Spool::open(path, DEFAULT_QUOTA).await.unwrap();
        assert_eq!(reopened.available_count().await, 2);
        assert_eq!(reopened.peek_front().await, Some(rec("e1")));
    }

    #[tokio::test]
    async fn reopening_replays_the_lifetime_eviction_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sql[primary]");
        {
            let spool = Spool::open(path.clone(), 2).await.unwrap();
            spool.append(rec("e1")).await.unwrap();
            spool.append(rec("e2")).await.unwrap();
            spool.append(rec("e3")).await.unwrap();
            assert_eq!(spool.deleted_count().await, 1);
        }

        let reopened = Spool::open(path, 2).await.unwrap();
        assert_eq!(reopened.deleted_count().await, 1);
    }

    #[tokio::test]
    async fn empty_spool_opens_cleanly() {
        let dir = tempdir().unwrap();
        let spool = Spool::open(dir.path().join("xml-file[default]"), DEFAULT_QUOTA)
            .await
            .unwrap();
        assert!(spool.is_empty().await);
        assert_eq!(spool.pop_front().await.unwrap(), None);
    }
}
