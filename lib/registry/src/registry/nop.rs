// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{KIND_LOCAL, Registry};
use crate::error::RegistryError;
use crate::{Endpoints, Result, ServiceInfo};

/// Registry that registers nothing. Installed as the default until a real
/// backend is configured.
#[derive(Debug, Clone, Default)]
pub struct LocalRegistry;

impl LocalRegistry {
    pub fn new() -> Self {
        Self
    }

    fn unsupported(op: &'static str) -> crate::Error {
        RegistryError::Unsupported {
            kind: KIND_LOCAL,
            op,
        }
        .into()
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    async fn register_service(&self, info: &ServiceInfo) -> Result<()> {
        tracing::trace!(key = %info.registry_key(), "local registry ignores registration");
        Ok(())
    }

    async fn unregister_service(&self, _info: &ServiceInfo) -> Result<()> {
        Ok(())
    }

    async fn get_service(&self, _key: &str) -> Result<ServiceInfo> {
        Err(Self::unsupported("get_service"))
    }

    async fn list_services(&self, _prefix: &str) -> Result<Vec<ServiceInfo>> {
        Err(Self::unsupported("list_services"))
    }

    async fn watch_services(&self, _prefix: &str) -> Result<mpsc::Receiver<Endpoints>> {
        Err(Self::unsupported("watch_services"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        KIND_LOCAL
    }
}
