// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Service registration surface and its backends.

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

use crate::{Endpoints, Result, ServiceInfo};

mod handle;
mod lease;
mod lease_registry;
mod nop;

pub use handle::RegistryHandle;
pub use lease::LeaseState;
pub use lease_registry::LeaseRegistry;
pub use nop::LocalRegistry;

/// Kind of the directory-backed registry.
pub const KIND_ETCD: &str = "etcdv3";

/// Kind of the no-op registry.
pub const KIND_LOCAL: &str = "local";

/// Register services and discover their peers.
///
/// Synchronous operations return errors to the caller; background work
/// (lease renewal, watches) never does.
#[async_trait]
pub trait Registry: Send + Sync + fmt::Debug {
    /// Register `info` under its registry key.
    async fn register_service(&self, info: &ServiceInfo) -> Result<()>;

    /// Remove `info` from the directory. On failure the key stays registered
    /// and is retried on [`Registry::close`].
    async fn unregister_service(&self, info: &ServiceInfo) -> Result<()>;

    /// Read the instance stored under `key`.
    async fn get_service(&self, key: &str) -> Result<ServiceInfo>;

    /// Every decodable instance under `prefix`; malformed entries are skipped.
    async fn list_services(&self, prefix: &str) -> Result<Vec<ServiceInfo>>;

    /// Live endpoint snapshots for `prefix`, starting with the current state.
    async fn watch_services(&self, prefix: &str) -> Result<mpsc::Receiver<Endpoints>>;

    /// Stop background work and unregister every held key.
    async fn close(&self) -> Result<()>;

    fn kind(&self) -> &'static str;
}
