// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Turns a directory watch into a stream of [`Endpoints`] snapshots.
//!
//! The first snapshot (the incipient set) is always delivered. Later
//! snapshots are published with a non-blocking send. When the consumer lags
//! and the buffer is full, intermediate snapshots are dropped with a warning
//! and the latest state is delivered as soon as the consumer frees a slot,
//! so the consumer always ends up holding the current state.
//!
//! A broken watch is re-established after a fixed backoff, resuming from the
//! revision after the last applied event so nothing is missed. If that
//! revision has been compacted, the synchronizer re-reads the prefix and
//! reconciles the snapshot against it. Neither case is visible to the
//! consumer beyond the snapshots themselves.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Endpoints;
use crate::config::EtcdRegistryConfig;
use crate::directory::{Directory, DirectoryError, Watch, is_transient_error};
use crate::{ErrorContext, Result};

pub struct EndpointSynchronizer {
    directory: Arc<dyn Directory>,
    prefix: String,
    backoff: Duration,
    buffer: usize,
    cancel: CancellationToken,
}

impl EndpointSynchronizer {
    pub fn new(
        directory: Arc<dyn Directory>,
        prefix: impl Into<String>,
        config: &EtcdRegistryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            directory,
            prefix: prefix.into(),
            backoff: config.watch_backoff(),
            buffer: config.watch_buffer.max(1),
            cancel,
        }
    }

    /// Establish the watch and spawn the consumption loop.
    ///
    /// Fails only if the initial watch cannot be established. The loop runs
    /// until the token is cancelled or the receiver is dropped.
    pub async fn start(self) -> Result<(mpsc::Receiver<Endpoints>, JoinHandle<()>)> {
        let watch = self
            .directory
            .watch(&self.prefix, None)
            .await
            .with_context(|| format!("failed to watch prefix {:?}", self.prefix))?;

        let mut endpoints = Endpoints::new();
        for kv in &watch.incipient {
            endpoints.insert_kv(&self.prefix, kv);
        }

        tracing::debug!(
            prefix = %self.prefix,
            revision = watch.revision,
            endpoints = endpoints.len(),
            "endpoint watch established"
        );

        let (tx, rx) = mpsc::channel(self.buffer);
        tx.send(endpoints.clone())
            .await
            .context("initial endpoint snapshot could not be delivered")?;

        let handle = tokio::spawn(self.run(watch, endpoints, tx));
        Ok((rx, handle))
    }

    async fn run(self, mut watch: Watch, mut endpoints: Endpoints, tx: mpsc::Sender<Endpoints>) {
        let mut last_revision = watch.revision;
        // set while the latest snapshot is still owed to a lagging consumer
        let mut pending = false;

        loop {
            let resync = loop {
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tx.closed() => {
                        tracing::debug!(prefix = %self.prefix, "endpoint receiver dropped; stopping watch");
                        return;
                    }
                    permit = tx.reserve(), if pending => {
                        let Ok(permit) = permit else {
                            return;
                        };
                        permit.send(endpoints.clone());
                        pending = false;
                        continue;
                    }
                    next = watch.events.next() => next,
                };

                match next {
                    Some(Ok(event)) => {
                        last_revision = last_revision.max(event.revision());
                        if endpoints.apply(&self.prefix, &event) {
                            pending = !self.publish(&tx, &endpoints);
                        }
                    }
                    Some(Err(DirectoryError::Compacted { compact_revision })) => {
                        tracing::warn!(
                            prefix = %self.prefix,
                            last_revision,
                            compact_revision,
                            "watch history compacted; resynchronizing"
                        );
                        break true;
                    }
                    Some(Err(e)) if e.is_transient() => {
                        tracing::warn!(prefix = %self.prefix, error = %e, "watch interrupted");
                        break false;
                    }
                    Some(Err(e)) => {
                        tracing::error!(prefix = %self.prefix, error = %e, "watch failed");
                        break false;
                    }
                    None => {
                        tracing::debug!(prefix = %self.prefix, last_revision, "watch stream ended");
                        break false;
                    }
                }
            };

            let from_revision = (!resync).then_some(last_revision + 1);
            let Some(next) = self.rewatch(from_revision).await else {
                return;
            };
            watch = next;

            if resync {
                last_revision = watch.revision;
                if endpoints.reconcile(&self.prefix, &watch.incipient) {
                    pending = !self.publish(&tx, &endpoints);
                }
            }
        }
    }

    /// Re-establish the watch after the backoff, retrying until it succeeds.
    /// Returns `None` once cancelled.
    async fn rewatch(&self, from_revision: Option<i64>) -> Option<Watch> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.backoff) => {}
            }

            match self.directory.watch(&self.prefix, from_revision).await {
                Ok(watch) => {
                    tracing::debug!(prefix = %self.prefix, ?from_revision, "endpoint watch resumed");
                    return Some(watch);
                }
                Err(e) if is_transient_error(&e) => {
                    tracing::warn!(prefix = %self.prefix, error = %e, "failed to re-establish watch");
                }
                Err(e) => {
                    tracing::error!(prefix = %self.prefix, error = %e, "failed to re-establish watch");
                }
            }
        }
    }

    /// Returns `false` when the buffer was full and the snapshot is still owed.
    fn publish(&self, tx: &mpsc::Sender<Endpoints>, endpoints: &Endpoints) -> bool {
        match tx.try_send(endpoints.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    prefix = %self.prefix,
                    "endpoint consumer is slow; dropping snapshot"
                );
                false
            }
        }
    }
}
