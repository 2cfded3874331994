// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Directory-backed registry that keeps its keys alive under one TTL lease.
//!
//! Registered key-values are remembered independently of the lease. A single
//! background loop renews the lease and, whenever the lease is lost,
//! re-grants it and re-registers every remembered key under the new lease:
//!
//! ```text
//!            ┌──── grant + re-register all (bounded by register timeout) ───┐
//!            │                                                              ▼
//!        NoLease ◄──────── keepalive stream closed (expired/revoked) ──── Leased
//! ```
//!
//! A registration racing a lease change is re-put under the lease that is
//! current once it completes, so no registration is stranded on a dead lease.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use validator::Validate;

use super::{LeaseState, Registry};
use crate::config::EtcdRegistryConfig;
use crate::directory::{Directory, LeaseId, is_transient_error};
use crate::error::RegistryError;
use crate::synchronizer::EndpointSynchronizer;
use crate::utils::retry;
use crate::{Endpoints, Result, ServiceInfo, raise};

/// Per-key deadline for the unregistration sweep on close.
const CLOSE_UNREGISTER_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct LeaseRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    directory: Arc<dyn Directory>,
    config: EtcdRegistryConfig,
    /// `None` when leasing is disabled.
    lease: Option<LeaseState>,
    /// Registered key to serialized value.
    kvs: Mutex<BTreeMap<String, String>>,
    keepalive_started: Once,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl LeaseRegistry {
    /// Build a registry over `directory`. Fails on invalid configuration.
    pub fn new(directory: Arc<dyn Directory>, config: EtcdRegistryConfig) -> Result<Self> {
        config.validate()?;
        let lease = config.service_ttl().map(LeaseState::new);

        Ok(Self {
            inner: Arc::new(Inner {
                directory,
                config,
                lease,
                kvs: Mutex::new(BTreeMap::new()),
                keepalive_started: Once::new(),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        })
    }

    /// Currently held lease, zero when none is held or leasing is disabled.
    pub fn lease_id(&self) -> LeaseId {
        self.inner.lease.as_ref().map(LeaseState::current).unwrap_or(0)
    }

    /// Keys this registry is keeping alive.
    pub fn registered_keys(&self) -> Vec<String> {
        self.inner.kvs.lock().keys().cloned().collect()
    }

    pub fn config(&self) -> &EtcdRegistryConfig {
        &self.inner.config
    }
}

impl fmt::Debug for LeaseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseRegistry")
            .field("directory", &self.inner.directory)
            .field("lease_id", &format_args!("{:x}", self.lease_id()))
            .field("keys", &self.inner.kvs.lock().len())
            .finish()
    }
}

impl Inner {
    async fn register_kv(self: &Arc<Self>, key: &str, value: &str) -> Result<()> {
        let Some(lease) = &self.lease else {
            self.directory.put(key, value, None).await?;
            self.kvs.lock().insert(key.to_string(), value.to_string());
            return Ok(());
        };

        let id = lease.get_or_grant(self.directory.as_ref()).await?;
        self.start_keepalive();

        self.directory.put(key, value, Some(id)).await?;
        self.kvs.lock().insert(key.to_string(), value.to_string());

        // A lease granted while the put was in flight may have been swept
        // before this key was remembered.
        let current = lease.current();
        if current != 0 && current != id {
            tracing::debug!(
                key,
                stale = %format!("{id:x}"),
                current = %format!("{current:x}"),
                "lease changed during registration; re-registering"
            );
            self.directory.put(key, value, Some(current)).await?;
        }
        Ok(())
    }

    fn start_keepalive(self: &Arc<Self>) {
        self.keepalive_started.call_once(|| {
            let inner = self.clone();
            self.tasks.spawn(async move { inner.keepalive_loop().await });
        });
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let Some(lease) = &self.lease else {
            return;
        };

        loop {
            if lease.current() == 0 {
                let register_timeout = self.config.register_timeout();
                let outcome = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    outcome = tokio::time::timeout(register_timeout, self.register_all(lease)) => outcome,
                };

                let failure = match outcome {
                    Ok(Ok(count)) => {
                        tracing::info!(
                            lease_id = %format!("{:x}", lease.current()),
                            count,
                            "registrations restored under new lease"
                        );
                        None
                    }
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!("timed out after {register_timeout:?}")),
                };

                if let Some(reason) = failure {
                    tracing::warn!(reason = %reason, "re-registration failed; retrying");
                    lease.invalidate(lease.current());
                    if !self.pause(self.config.retry_interval()).await {
                        return;
                    }
                    continue;
                }
            }

            let id = lease.current();
            if id == 0 {
                continue;
            }

            let mut acks = match self.directory.keep_alive(id).await {
                Ok(acks) => acks,
                Err(e) => {
                    if is_transient_error(&e) {
                        tracing::warn!(lease_id = %format!("{id:x}"), error = %e, "failed to start lease keepalive");
                    } else {
                        tracing::error!(lease_id = %format!("{id:x}"), error = %e, "failed to start lease keepalive");
                    }
                    lease.invalidate(id);
                    if !self.pause(self.config.register_timeout()).await {
                        return;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    ack = acks.recv() => match ack {
                        Some(ack) => {
                            tracing::trace!(lease_id = %format!("{:x}", ack.lease), ttl = ack.ttl, "lease refreshed");
                        }
                        None => {
                            tracing::warn!(lease_id = %format!("{id:x}"), "lease lost; re-registering");
                            lease.invalidate(id);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Grant a lease (or reuse one granted concurrently) and re-put every
    /// remembered key under it.
    async fn register_all(&self, lease: &LeaseState) -> Result<usize> {
        let id = lease.get_or_grant(self.directory.as_ref()).await?;

        // snapshot after the grant so later registrations see the new lease
        let entries: Vec<(String, String)> = self
            .kvs
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let attempts = self.config.retry_times;
        let interval = self.config.retry_interval();
        let results = join_all(entries.iter().map(|(key, value)| async move {
            let result = retry(attempts, interval, || self.reput(key, value, id)).await;
            (key, result)
        }))
        .await;

        let mut failed = 0;
        for (key, result) in results {
            if let Err(e) = result {
                tracing::warn!(key = %key, error = %e, "re-registration failed");
                failed += 1;
            }
        }
        if failed > 0 {
            raise!("{failed} of {} registrations failed", entries.len());
        }
        Ok(entries.len())
    }

    /// Put `key` under `id` unless it was unregistered meanwhile. A key
    /// unregistered while the put was in flight is deleted again.
    async fn reput(&self, key: &str, value: &str, id: LeaseId) -> Result<()> {
        if !self.kvs.lock().contains_key(key) {
            return Ok(());
        }
        self.directory.put(key, value, Some(id)).await?;
        if !self.kvs.lock().contains_key(key) {
            tracing::debug!(key, "key unregistered during re-registration; removing");
            self.directory.delete(key).await?;
        }
        Ok(())
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn delete_with_timeout(&self, key: &str, after: Duration, op: &'static str) -> Result<()> {
        // forget first so a concurrent re-registration cannot put it back
        let value = self.kvs.lock().remove(key);
        let result = match tokio::time::timeout(after, self.directory.delete(key)).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RegistryError::Timeout { op, after }.into()),
        };
        if let Some(value) = value {
            self.kvs.lock().entry(key.to_string()).or_insert(value);
        }
        result
    }
}

#[async_trait]
impl Registry for LeaseRegistry {
    async fn register_service(&self, info: &ServiceInfo) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(RegistryError::Closed.into());
        }
        info.ensure_routable()?;

        let key = info.registry_key();
        let value = info.to_json()?;
        self.inner.register_kv(&key, &value).await?;

        tracing::debug!(key = %key, lease_id = %format!("{:x}", self.lease_id()), "service registered");
        Ok(())
    }

    async fn unregister_service(&self, info: &ServiceInfo) -> Result<()> {
        let key = info.registry_key();
        let after = self.inner.config.read_timeout();
        match self
            .inner
            .delete_with_timeout(&key, after, "unregister_service")
            .await
        {
            Ok(()) => {
                tracing::debug!(key = %key, "service unregistered");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to unregister service");
                Err(e)
            }
        }
    }

    async fn get_service(&self, key: &str) -> Result<ServiceInfo> {
        let after = self.inner.config.read_timeout();
        let kv = tokio::time::timeout(after, self.inner.directory.get(key))
            .await
            .map_err(|_| RegistryError::Timeout {
                op: "get_service",
                after,
            })??
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        ServiceInfo::from_json(&kv.value)
    }

    async fn list_services(&self, prefix: &str) -> Result<Vec<ServiceInfo>> {
        let after = self.inner.config.read_timeout();
        let kvs = tokio::time::timeout(after, self.inner.directory.get_prefix(prefix))
            .await
            .map_err(|_| RegistryError::Timeout {
                op: "list_services",
                after,
            })??;

        let mut services = Vec::with_capacity(kvs.len());
        for kv in kvs {
            match ServiceInfo::from_json(&kv.value) {
                Ok(info) => services.push(info),
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "skipping malformed service entry");
                }
            }
        }
        Ok(services)
    }

    async fn watch_services(&self, prefix: &str) -> Result<mpsc::Receiver<Endpoints>> {
        if self.inner.cancel.is_cancelled() {
            return Err(RegistryError::Closed.into());
        }

        let (rx, handle) = EndpointSynchronizer::new(
            self.inner.directory.clone(),
            prefix,
            &self.inner.config,
            self.inner.cancel.child_token(),
        )
        .start()
        .await?;

        self.inner.tasks.spawn(async move {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "endpoint synchronizer task failed");
            }
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let keys = self.registered_keys();
        let results = join_all(keys.iter().map(|key| {
            self.inner
                .delete_with_timeout(key, CLOSE_UNREGISTER_TIMEOUT, "close")
        }))
        .await;

        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(key = %key, error = %e, "failed to unregister on close");
            }
        }

        tracing::debug!(remaining = self.inner.kvs.lock().len(), "registry closed");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        self.inner.directory.kind()
    }
}
