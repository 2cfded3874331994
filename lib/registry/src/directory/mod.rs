// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The shared directory the registry is built on.
//!
//! A [`Directory`] is a strongly consistent, prefix-keyed key-value store with
//! revisions, TTL leases and ordered watches. Two backends are provided:
//!
//! - **Etcd**: [`EtcdDirectory`] over `etcd-client` (feature: `etcd`)
//! - **Memory**: [`MemoryDirectory`], an in-process store with the same
//!   revision/lease/watch semantics, for tests and local development

use async_trait::async_trait;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::Result;

mod error;
mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use error::DirectoryError;
pub(crate) use error::is_transient_error;
pub use memory::MemoryDirectory;

#[cfg(feature = "etcd")]
pub use etcd::EtcdDirectory;

/// Opaque lease handle. Zero means "no lease".
pub type LeaseId = i64;

/// A stored key with the revision of its last modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
    pub lease: LeaseId,
}

impl KeyValue {
    pub fn value_str(&self) -> &str {
        std::str::from_utf8(&self.value).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// One change observed by a watch. Delete events carry an empty value and
/// the revision of the deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub kv: KeyValue,
}

impl WatchEvent {
    pub fn revision(&self) -> i64 {
        self.kv.mod_revision
    }
}

/// Ordered stream of watch events. It ends when the directory drops the
/// watch (restart, compaction, connection loss).
pub type WatchStream = Pin<Box<dyn Stream<Item = std::result::Result<WatchEvent, DirectoryError>> + Send>>;

/// An established watch.
pub struct Watch {
    /// Keys under the prefix when the watch started. Empty when the watch was
    /// resumed from an explicit revision.
    pub incipient: Vec<KeyValue>,
    /// Revision the incipient key-values were read at. For a resumed watch,
    /// the revision just before the requested one.
    pub revision: i64,
    pub events: WatchStream,
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("incipient", &self.incipient.len())
            .field("revision", &self.revision)
            .finish()
    }
}

/// Acknowledgment of a lease refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub lease: LeaseId,
    /// Remaining TTL in seconds after the refresh.
    pub ttl: i64,
}

/// Keepalive acknowledgments for one lease. The channel closes when the
/// lease is revoked or expires.
pub type KeepAliveStream = mpsc::Receiver<KeepAlive>;

/// Capability set the registry consumes from the directory service.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the registry calls them from its
/// background tasks and from callers concurrently.
#[async_trait]
pub trait Directory: Send + Sync + fmt::Debug {
    /// Backend name, used as the registry kind.
    fn kind(&self) -> &'static str;

    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Read every key under `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Write a key, optionally attached to a lease. Returns the new revision.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<i64>;

    /// Delete a key. Returns the number of keys deleted.
    async fn delete(&self, key: &str) -> Result<i64>;

    /// Delete every key under `prefix`. Returns the number of keys deleted.
    async fn delete_prefix(&self, prefix: &str) -> Result<i64>;

    /// Grant a lease bound to `ttl`.
    async fn grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Start refreshing `lease` and stream the acknowledgments.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Watch `prefix`.
    ///
    /// With `from_revision == None` the current key-values are returned as
    /// [`Watch::incipient`] and events start after them. With
    /// `Some(revision)` no incipient set is read and every event at or after
    /// `revision` is replayed.
    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> Result<Watch>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_value_value_str() {
        let kv = KeyValue {
            key: "k".into(),
            value: b"{\"a\":1}".to_vec(),
            mod_revision: 3,
            lease: 0,
        };
        assert_eq!(kv.value_str(), "{\"a\":1}");

        let binary = KeyValue {
            value: vec![0xff, 0xfe],
            ..kv
        };
        assert_eq!(binary.value_str(), "");
    }
}
