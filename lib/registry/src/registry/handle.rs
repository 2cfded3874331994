// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, OnceLock};

use super::{LocalRegistry, Registry};
use crate::Result;
use crate::config::RegistriesConfig;

static GLOBAL: OnceLock<RegistryHandle> = OnceLock::new();

/// Shared, replaceable handle to the active [`Registry`].
///
/// Starts out holding a [`LocalRegistry`]. Clones share the same slot, so a
/// replacement is seen by every holder. A process-wide instance is available
/// through [`RegistryHandle::global`]; components can equally be handed an
/// explicit handle.
#[derive(Clone)]
pub struct RegistryHandle {
    slot: Arc<RwLock<Arc<dyn Registry>>>,
}

impl Default for RegistryHandle {
    fn default() -> Self {
        Self::new(Arc::new(LocalRegistry::new()))
    }
}

impl fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("kind", &self.get().kind())
            .finish()
    }
}

impl RegistryHandle {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            slot: Arc::new(RwLock::new(registry)),
        }
    }

    /// The process-wide handle.
    pub fn global() -> &'static RegistryHandle {
        GLOBAL.get_or_init(RegistryHandle::default)
    }

    pub fn get(&self) -> Arc<dyn Registry> {
        self.slot.read().clone()
    }

    /// Install `registry`, returning the one it replaces.
    pub fn replace(&self, registry: Arc<dyn Registry>) -> Arc<dyn Registry> {
        std::mem::replace(&mut *self.slot.write(), registry)
    }

    /// Build every configured registry and install the last one that builds.
    ///
    /// Entries that fail to build are logged and skipped. With no buildable
    /// entry the current registry stays in place.
    pub async fn init_from_config(&self, config: &RegistriesConfig) -> Result<()> {
        let mut selected = None;
        for (name, entry) in &config.registry {
            match entry.build().await {
                Ok(registry) => {
                    tracing::info!(name = %name, kind = registry.kind(), "registry configured");
                    selected = Some(registry);
                }
                Err(e) => {
                    tracing::error!(name = %name, kind = %entry.kind, error = %e, "failed to build registry");
                }
            }
        }

        if let Some(registry) = selected {
            self.replace(registry);
        }
        Ok(())
    }
}
