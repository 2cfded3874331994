// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Etcd v3 directory backend.

use async_trait::async_trait;
use etcd_client::{
    ConnectOptions, DeleteOptions, EventType, GetOptions, PutOptions, WatchOptions,
};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::error::classify_message;
use super::{
    Directory, DirectoryError, KeepAlive, KeepAliveStream, KeyValue, LeaseId, Watch, WatchEvent,
    WatchEventKind,
};
use crate::config::EtcdRegistryConfig;
use crate::{ErrorContext, Result, error};

const KEEPALIVE_BUFFER: usize = 16;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// [`Directory`] over an etcd v3 cluster.
///
/// Clones share one client. A call that fails with a transport error swaps
/// in a fresh connection and is retried once.
#[derive(Clone)]
pub struct EtcdDirectory {
    client: Arc<RwLock<etcd_client::Client>>,
    endpoints: Arc<[String]>,
    options: ConnectOptions,
    reconnect_window: Duration,
}

impl std::fmt::Debug for EtcdDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdDirectory")
            .field("endpoints", &self.endpoints)
            .field("reconnect_window", &self.reconnect_window)
            .finish()
    }
}

impl EtcdDirectory {
    /// Connect using the endpoints, timeouts and credentials in `config`.
    pub async fn connect(config: &EtcdRegistryConfig) -> Result<Self> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.connect_timeout())
            .with_timeout(config.read_timeout());
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let endpoints: Arc<[String]> = config.endpoints.clone().into();
        let client = open(&endpoints, &options).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
            endpoints,
            options,
            reconnect_window: config.connect_timeout(),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// A clone of the current client; clones share the underlying channel.
    fn client(&self) -> etcd_client::Client {
        self.client.read().clone()
    }

    /// Replace the client with a fresh connection, backing off between
    /// attempts for at most the reconnect window.
    async fn reconnect(&self) -> Result<()> {
        tracing::warn!(endpoints = ?self.endpoints, "reconnecting to etcd");

        for delay in reconnect_delays(self.reconnect_window, INITIAL_BACKOFF, MAX_BACKOFF) {
            sleep(delay).await;
            match open(&self.endpoints, &self.options).await {
                Ok(client) => {
                    tracing::info!("reconnected to etcd");
                    *self.client.write() = client;
                    return Ok(());
                }
                Err(e) => tracing::warn!(?delay, error = %e, "etcd reconnection failed"),
            }
        }
        Err(error!(
            "unable to reconnect to etcd within {:?}",
            self.reconnect_window
        ))
    }

    /// Run `op` against the current client. A transport failure triggers one
    /// reconnect and a single retry.
    async fn call<T, F, Fut>(&self, lease: Option<LeaseId>, op: F) -> Result<T>
    where
        F: Fn(etcd_client::Client) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<T, etcd_client::Error>> + Send,
        T: Send,
    {
        match op(self.client()).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = map_etcd_error(e, lease);
                if !matches!(err, DirectoryError::Unavailable(_)) {
                    return Err(err.into());
                }

                if let Err(reconnect) = self.reconnect().await {
                    tracing::warn!(error = %reconnect, "etcd call failed and reconnect did not succeed");
                    return Err(err.into());
                }
                op(self.client())
                    .await
                    .map_err(|e| map_etcd_error(e, lease).into())
            }
        }
    }
}

async fn open(endpoints: &[String], options: &ConnectOptions) -> Result<etcd_client::Client> {
    etcd_client::Client::connect(endpoints, Some(options.clone()))
        .await
        .with_context(|| format!("unable to connect to etcd at {}", endpoints.join(", ")))
}

/// Backoff schedule for one reconnect: doubling from `initial`, capped at
/// `max`, and never sleeping longer than `window` in total.
fn reconnect_delays(window: Duration, initial: Duration, max: Duration) -> Vec<Duration> {
    let mut delays = Vec::new();
    let mut remaining = window;
    let mut next = initial.min(max);
    while !next.is_zero() && next <= remaining {
        delays.push(next);
        remaining -= next;
        next = (next * 2).min(max);
    }
    delays
}

fn map_etcd_error(err: etcd_client::Error, lease: Option<LeaseId>) -> DirectoryError {
    classify_message(&err.to_string(), lease)
        .unwrap_or_else(|| DirectoryError::Backend(anyhow::Error::new(err)))
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        mod_revision: kv.mod_revision(),
        lease: kv.lease(),
    }
}

#[async_trait]
impl Directory for EtcdDirectory {
    fn kind(&self) -> &'static str {
        crate::registry::KIND_ETCD
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let resp = self
            .call(None, |mut client| async move { client.get(key, None).await })
            .await?;
        Ok(resp.kvs().first().map(convert_kv))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let resp = self
            .call(None, |mut client| async move {
                client
                    .get(prefix, Some(GetOptions::new().with_prefix()))
                    .await
            })
            .await?;
        Ok(resp.kvs().iter().map(convert_kv).collect())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<i64> {
        let resp = self
            .call(lease, |mut client| async move {
                let options = lease.map(|id| PutOptions::new().with_lease(id));
                client.put(key, value, options).await
            })
            .await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<i64> {
        let resp = self
            .call(None, |mut client| async move { client.delete(key, None).await })
            .await?;
        Ok(resp.deleted())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<i64> {
        let resp = self
            .call(None, |mut client| async move {
                client
                    .delete(prefix, Some(DeleteOptions::new().with_prefix()))
                    .await
            })
            .await?;
        Ok(resp.deleted())
    }

    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        let ttl_secs = ttl.as_secs() as i64;
        let resp = self
            .call(None, |mut client| async move {
                client.lease_grant(ttl_secs, None).await
            })
            .await?;
        tracing::debug!(lease_id = %format!("{:x}", resp.id()), ttl_secs, "granted etcd lease");
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let mut client = self.client();
        let (mut keeper, mut responses) = client
            .lease_keep_alive(lease)
            .await
            .map_err(|e| map_etcd_error(e, Some(lease)))?;

        let (tx, rx) = mpsc::channel(KEEPALIVE_BUFFER);
        tokio::spawn(async move {
            let mut interval = Duration::from_secs(1);
            loop {
                if let Err(e) = keeper.keep_alive().await {
                    tracing::debug!(lease_id = %format!("{lease:x}"), error = %e, "keepalive request failed");
                    break;
                }

                match responses.message().await {
                    Ok(Some(resp)) => {
                        if resp.ttl() <= 0 {
                            tracing::debug!(lease_id = %format!("{lease:x}"), "lease expired on server");
                            break;
                        }
                        interval = Duration::from_secs((resp.ttl() / 3).max(1) as u64);
                        let ack = KeepAlive {
                            lease: resp.id(),
                            ttl: resp.ttl(),
                        };
                        if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(ack) {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(lease_id = %format!("{lease:x}"), error = %e, "keepalive stream failed");
                        break;
                    }
                }

                tokio::select! {
                    _ = tx.closed() => break,
                    _ = sleep(interval) => {}
                }
            }
        });

        Ok(rx)
    }

    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> Result<Watch> {
        let (incipient, revision) = match from_revision {
            Some(revision) => (Vec::new(), revision - 1),
            None => {
                let resp = self
                    .call(None, |mut client| async move {
                        client
                            .get(prefix, Some(GetOptions::new().with_prefix()))
                            .await
                    })
                    .await?;
                let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
                (resp.kvs().iter().map(convert_kv).collect(), revision)
            }
        };

        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1);
        let mut client = self.client();
        let (watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(|e| map_etcd_error(e, None))?;

        let events = async_stream::stream! {
            // dropping the watcher cancels the server-side watch
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            if resp.compact_revision() > 0 {
                                yield Err(DirectoryError::Compacted {
                                    compact_revision: resp.compact_revision(),
                                });
                            } else {
                                yield Err(DirectoryError::Unavailable(format!(
                                    "watch cancelled: {}",
                                    resp.cancel_reason()
                                )));
                            }
                            break;
                        }
                        for event in resp.events() {
                            let Some(kv) = event.kv() else {
                                continue;
                            };
                            let kind = match event.event_type() {
                                EventType::Put => WatchEventKind::Put,
                                EventType::Delete => WatchEventKind::Delete,
                            };
                            yield Ok(WatchEvent { kind, kv: convert_kv(kv) });
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(map_etcd_error(e, None));
                        break;
                    }
                }
            }
        };

        Ok(Watch {
            incipient,
            revision,
            events: Box::pin(events),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delays_fit_window() {
        let delays = reconnect_delays(
            Duration::from_secs(10),
            Duration::from_millis(500),
            Duration::from_secs(2),
        );
        let millis: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
        assert_eq!(millis, vec![500, 1000, 2000, 2000, 2000]);
        assert!(delays.iter().sum::<Duration>() <= Duration::from_secs(10));
    }

    #[test]
    fn test_reconnect_delays_short_window() {
        assert!(
            reconnect_delays(
                Duration::from_millis(100),
                Duration::from_millis(500),
                Duration::from_secs(5)
            )
            .is_empty()
        );
        assert!(
            reconnect_delays(Duration::from_secs(1), Duration::ZERO, Duration::from_secs(5))
                .is_empty()
        );
    }
}
