// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process directory with etcd-like revision, lease and watch semantics.
//!
//! Every mutation bumps a global revision and is appended to a bounded
//! history, so watches can be resumed from a revision exactly like etcd.
//! Leases expire when not refreshed; expiry deletes the attached keys and
//! closes every keepalive stream for the lease.
//!
//! The fault hooks ([`MemoryDirectory::revoke`],
//! [`MemoryDirectory::interrupt_watches`], [`MemoryDirectory::compact`],
//! [`MemoryDirectory::set_available`]) make the failure paths of the
//! registry reproducible without a live cluster.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    Directory, DirectoryError, KeepAlive, KeepAliveStream, KeyValue, LeaseId, Watch, WatchEvent,
    WatchEventKind,
};
use crate::Result;

/// Number of events retained for watch resumption.
const HISTORY_LIMIT: usize = 10_000;

/// How often expired leases are reaped in the background.
const REAP_INTERVAL: Duration = Duration::from_millis(50);

const KEEPALIVE_BUFFER: usize = 16;

type WatchSender = mpsc::UnboundedSender<std::result::Result<WatchEvent, DirectoryError>>;

#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    revision: i64,
    compact_revision: i64,
    kvs: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease: LeaseId,
    grants: u64,
    history: VecDeque<WatchEvent>,
    watchers: Vec<Watcher>,
    unavailable: bool,
    reaper_started: bool,
}

struct StoredValue {
    value: Vec<u8>,
    mod_revision: i64,
    lease: LeaseId,
}

struct LeaseRecord {
    ttl: Duration,
    expires_at: Instant,
    keepalives: Vec<mpsc::Sender<KeepAlive>>,
}

struct Watcher {
    prefix: String,
    tx: WatchSender,
}

impl MemoryState {
    fn ensure_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(DirectoryError::Unavailable("memory directory is offline".into()).into());
        }
        Ok(())
    }

    fn key_value(key: &str, stored: &StoredValue) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: stored.value.clone(),
            mod_revision: stored.mod_revision,
            lease: stored.lease,
        }
    }

    fn prefix_keys(&self, prefix: &str) -> Vec<String> {
        self.kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn emit(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            if event.kv.key.starts_with(&watcher.prefix) {
                let _ = watcher.tx.send(Ok(event.clone()));
            }
        }

        self.history.push_back(event);
        while self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.compact_revision = dropped.revision();
            }
        }
    }

    fn put(&mut self, key: &str, value: &[u8], lease: LeaseId) -> i64 {
        self.revision += 1;
        let stored = StoredValue {
            value: value.to_vec(),
            mod_revision: self.revision,
            lease,
        };
        let kv = Self::key_value(key, &stored);
        self.kvs.insert(key.to_string(), stored);
        self.emit(WatchEvent {
            kind: WatchEventKind::Put,
            kv,
        });
        self.revision
    }

    fn delete(&mut self, key: &str) -> bool {
        if self.kvs.remove(key).is_none() {
            return false;
        }
        self.revision += 1;
        let kv = KeyValue {
            key: key.to_string(),
            value: Vec::new(),
            mod_revision: self.revision,
            lease: 0,
        };
        self.emit(WatchEvent {
            kind: WatchEventKind::Delete,
            kv,
        });
        true
    }

    /// Drop the lease, its keys and its keepalive streams.
    fn revoke(&mut self, lease: LeaseId) -> bool {
        if self.leases.remove(&lease).is_none() {
            return false;
        }
        let attached: Vec<String> = self
            .kvs
            .iter()
            .filter(|(_, v)| v.lease == lease)
            .map(|(k, _)| k.clone())
            .collect();
        for key in attached {
            self.delete(&key);
        }
        true
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, record)| record.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            tracing::debug!(lease_id = %format!("{lease:x}"), "memory directory lease expired");
            self.revoke(lease);
        }
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revoke a lease as if it had expired: attached keys are deleted and
    /// keepalive streams are closed.
    pub fn revoke(&self, lease: LeaseId) -> bool {
        self.state.lock().revoke(lease)
    }

    /// End every open watch stream, as a directory restart would.
    pub fn interrupt_watches(&self) {
        self.state.lock().watchers.clear();
    }

    /// Discard history before `revision`.
    pub fn compact(&self, revision: i64) {
        let mut state = self.state.lock();
        while state
            .history
            .front()
            .is_some_and(|event| event.revision() < revision)
        {
            state.history.pop_front();
        }
        state.compact_revision = state.compact_revision.max(revision - 1);
    }

    /// Toggle availability. While offline every call fails with
    /// [`DirectoryError::Unavailable`]; leases keep ageing.
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// Every stored key, in order.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().kvs.keys().cloned().collect()
    }

    /// Lease attached to `key`, zero for unleased keys.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.state.lock().kvs.get(key).map(|v| v.lease)
    }

    /// Number of leases ever granted.
    pub fn grant_count(&self) -> u64 {
        self.state.lock().grants
    }

    pub fn live_leases(&self) -> Vec<LeaseId> {
        let mut leases: Vec<LeaseId> = self.state.lock().leases.keys().copied().collect();
        leases.sort_unstable();
        leases
    }

    fn start_reaper(&self, state: &mut MemoryState) {
        if state.reaper_started {
            return;
        }
        state.reaper_started = true;

        let weak = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REAP_INTERVAL).await;
                let Some(state) = weak.upgrade() else {
                    break;
                };
                state.lock().expire(Instant::now());
            }
        });
    }

    fn start_refresher(weak: Weak<Mutex<MemoryState>>, lease: LeaseId, interval: Duration) {
        tokio::spawn(async move {
            loop {
                {
                    let Some(state) = weak.upgrade() else {
                        break;
                    };
                    let mut state = state.lock();
                    // refreshes are lost while offline; the lease keeps ageing
                    if !state.unavailable {
                        let Some(record) = state.leases.get_mut(&lease) else {
                            break;
                        };
                        record.expires_at = Instant::now() + record.ttl;
                        let ack = KeepAlive {
                            lease,
                            ttl: record.ttl.as_secs() as i64,
                        };
                        record.keepalives.retain(|tx| !tx.is_closed());
                        if record.keepalives.is_empty() {
                            break;
                        }
                        for tx in &record.keepalives {
                            let _ = tx.try_send(ack);
                        }
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
    }
}

impl fmt::Debug for MemoryDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryDirectory")
            .field("revision", &state.revision)
            .field("keys", &state.kvs.len())
            .field("leases", &state.leases.len())
            .finish()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        state.expire(Instant::now());
        Ok(state
            .kvs
            .get(key)
            .map(|stored| MemoryState::key_value(key, stored)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        state.expire(Instant::now());
        Ok(state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, stored)| MemoryState::key_value(k, stored))
            .collect())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<i64> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        state.expire(Instant::now());

        let lease = lease.unwrap_or_default();
        if lease != 0 && !state.leases.contains_key(&lease) {
            return Err(DirectoryError::LeaseNotFound(lease).into());
        }
        Ok(state.put(key, value.as_bytes(), lease))
    }

    async fn delete(&self, key: &str) -> Result<i64> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        state.expire(Instant::now());
        Ok(i64::from(state.delete(key)))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<i64> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        state.expire(Instant::now());

        let mut deleted = 0;
        for key in state.prefix_keys(prefix) {
            if state.delete(&key) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        if ttl.as_secs() == 0 {
            crate::raise!("lease ttl must be at least one second, got {ttl:?}");
        }

        let mut state = self.state.lock();
        state.ensure_available()?;
        self.start_reaper(&mut state);

        state.next_lease += 1;
        state.grants += 1;
        let lease = 0x7e00 + state.next_lease;
        state.leases.insert(
            lease,
            LeaseRecord {
                ttl,
                expires_at: Instant::now() + ttl,
                keepalives: Vec::new(),
            },
        );
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let (tx, rx) = mpsc::channel(KEEPALIVE_BUFFER);

        let mut state = self.state.lock();
        state.ensure_available()?;
        state.expire(Instant::now());

        let Some(record) = state.leases.get_mut(&lease) else {
            return Err(DirectoryError::LeaseNotFound(lease).into());
        };
        record.keepalives.retain(|tx| !tx.is_closed());
        let start_refresher = record.keepalives.is_empty();
        record.keepalives.push(tx);

        if start_refresher {
            let interval = (record.ttl / 3).max(Duration::from_millis(10));
            Self::start_refresher(Arc::downgrade(&self.state), lease, interval);
        }
        Ok(rx)
    }

    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> Result<Watch> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        state.ensure_available()?;
        state.expire(Instant::now());

        let mut read_revision = state.revision;
        let incipient = match from_revision {
            Some(revision) if revision <= state.compact_revision => {
                let _ = tx.send(Err(DirectoryError::Compacted {
                    compact_revision: state.compact_revision,
                }));
                // the stream ends right after the error, like a cancelled etcd watch
                return Ok(Watch {
                    incipient: Vec::new(),
                    revision: revision - 1,
                    events: Box::pin(UnboundedReceiverStream::new(rx)),
                });
            }
            Some(revision) => {
                read_revision = revision - 1;
                for event in state.history.iter() {
                    if event.revision() >= revision && event.kv.key.starts_with(prefix) {
                        let _ = tx.send(Ok(event.clone()));
                    }
                }
                Vec::new()
            }
            None => state
                .kvs
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, stored)| MemoryState::key_value(k, stored))
                .collect(),
        };

        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(Watch {
            incipient,
            revision: read_revision,
            events: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }
}
